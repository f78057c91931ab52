/// OAuth sign-in: flow preparation, provider exchange and callback resolution
pub mod callback;
pub mod flow;
pub mod pkce;
pub mod provider;
pub mod redirect;

pub use callback::{handle_oauth_callback, CallbackEnv, CallbackQuery};
pub use flow::{
    handle_oauth_initiation, FlowEnv, FlowKind, OAuthFlowPayload, OAuthQuery, OAuthStart,
};
pub use provider::{HttpOAuthClient, OAuthExchange, ProviderProfile};
pub use redirect::{is_valid_redirect_path, resolve_oauth_redirect};
