/// OAuth initiation: per-flow preparation of the state payload cookie
///
/// An attempt moves `initiated -> redirected -> callback-resolved | callback-failed`.
/// Initiation picks a preparer by flow kind, stores the resulting payload in
/// an `oauth-<state>` cookie and redirects the browser to the provider.
use super::pkce::{generate_code_verifier, generate_state};
use super::provider::{authorization_url, callback_url, client_config, endpoints};
use super::redirect::resolve_oauth_redirect;
use crate::{
    config::ServerConfig,
    db::models::{AuthStrategy, TokenType},
    error::{AppError, AppResult},
    session::{get_parsed_session_cookie, SessionCookieOptions, SessionManager},
    token::{TokenLookup, TokenManager},
};
use async_trait::async_trait;
use axum_extra::extract::cookie::{Cookie, SameSite, SignedCookieJar};
use serde::{Deserialize, Serialize};

/// Lifetime of the payload cookie
pub const OAUTH_COOKIE_MAX_AGE_SECS: i64 = 5 * 60;

pub fn oauth_cookie_name(state: &str) -> String {
    format!("oauth-{}", state)
}

/// Sub-flow an OAuth attempt belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowKind {
    Auth = 0,
    Invite = 1,
    Connect = 2,
    Verify = 3,
}

impl FlowKind {
    /// Absent type means plain sign-in
    pub fn parse(value: Option<&str>) -> AppResult<Self> {
        match value {
            None | Some("") | Some("auth") | Some("default") => Ok(FlowKind::Auth),
            Some("invite") => Ok(FlowKind::Invite),
            Some("connect") => Ok(FlowKind::Connect),
            Some("verify") => Ok(FlowKind::Verify),
            Some(other) => Err(AppError::invalid_request(format!(
                "Unknown OAuth flow type: {}",
                other
            ))
            .redirect()),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FlowKind::Auth => "auth",
            FlowKind::Invite => "invite",
            FlowKind::Connect => "connect",
            FlowKind::Verify => "verify",
        }
    }
}

/// Query parameters accepted by the OAuth entry point
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OAuthQuery {
    #[serde(rename = "type")]
    pub flow_type: Option<String>,
    pub redirect: Option<String>,
    pub token: Option<String>,
    #[serde(rename = "tokenId")]
    pub token_id: Option<String>,
    #[serde(alias = "connectUserId")]
    pub connect: Option<String>,
}

/// Normalized outcome of a preparer; every field is always serialized
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowContext {
    pub redirect_path: String,
    pub invite_token_id: Option<String>,
    pub connect_user_id: Option<String>,
    pub verify_token_id: Option<String>,
}

impl FlowContext {
    fn redirect_only(redirect_path: String) -> Self {
        FlowContext {
            redirect_path,
            invite_token_id: None,
            connect_user_id: None,
            verify_token_id: None,
        }
    }

    pub fn kind(&self) -> FlowKind {
        if self.connect_user_id.is_some() {
            FlowKind::Connect
        } else if self.invite_token_id.is_some() {
            FlowKind::Invite
        } else if self.verify_token_id.is_some() {
            FlowKind::Verify
        } else {
            FlowKind::Auth
        }
    }
}

/// JSON stored in the `oauth-<state>` cookie
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OAuthFlowPayload {
    #[serde(flatten)]
    pub context: FlowContext,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_verifier: Option<String>,
}

/// Collaborators a preparer may consult
pub struct FlowEnv<'a> {
    pub config: &'a ServerConfig,
    pub tokens: &'a TokenManager,
    pub sessions: &'a SessionManager,
    pub jar: &'a SignedCookieJar,
}

impl FlowEnv<'_> {
    fn default_redirect_path(&self) -> &str {
        &self.config.authentication.default_redirect_path
    }
}

/// Validates the query of one flow kind and produces its context
#[async_trait]
pub trait FlowPreparer: Send + Sync {
    async fn prepare(&self, env: &FlowEnv<'_>, query: &OAuthQuery) -> AppResult<FlowContext>;
}

struct AuthPreparer;

/// Invite and verify flows differ only in the token type they peek
struct TokenFlowPreparer {
    token_type: TokenType,
}

struct ConnectPreparer;

/// Indexed by `FlowKind as usize`
static PREPARERS: [&dyn FlowPreparer; 4] = [
    &AuthPreparer,
    &TokenFlowPreparer {
        token_type: TokenType::Invitation,
    },
    &ConnectPreparer,
    &TokenFlowPreparer {
        token_type: TokenType::EmailVerification,
    },
];

pub fn preparer(kind: FlowKind) -> &'static dyn FlowPreparer {
    PREPARERS[kind as usize]
}

#[async_trait]
impl FlowPreparer for AuthPreparer {
    async fn prepare(&self, env: &FlowEnv<'_>, query: &OAuthQuery) -> AppResult<FlowContext> {
        Ok(FlowContext::redirect_only(resolve_oauth_redirect(
            query.redirect.as_deref(),
            env.default_redirect_path(),
        )))
    }
}

#[async_trait]
impl FlowPreparer for TokenFlowPreparer {
    async fn prepare(&self, env: &FlowEnv<'_>, query: &OAuthQuery) -> AppResult<FlowContext> {
        let raw_token = query
            .token
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| AppError::invalid_request("token is required"))?;

        let record = env
            .tokens
            .get_valid_token(self.token_type, TokenLookup::Token(raw_token), false)
            .await?;

        if let Some(token_id) = query.token_id.as_deref() {
            if token_id != record.id {
                return Err(AppError::invalid_request("tokenId does not match token"));
            }
        }

        let redirect_path = if record.entity_type.is_some() {
            format!("/invitation/{}", urlencoding::encode(raw_token))
        } else {
            env.default_redirect_path().to_string()
        };

        let mut context = FlowContext::redirect_only(redirect_path);
        match self.token_type {
            TokenType::Invitation => context.invite_token_id = Some(record.id),
            _ => context.verify_token_id = Some(record.id),
        }
        Ok(context)
    }
}

#[async_trait]
impl FlowPreparer for ConnectPreparer {
    async fn prepare(&self, env: &FlowEnv<'_>, query: &OAuthQuery) -> AppResult<FlowContext> {
        let (_, parsed) =
            get_parsed_session_cookie(env.jar.clone(), &SessionCookieOptions::default());
        let (_, user) = env.sessions.validate_session(&parsed?.session_token).await?;

        let connect_user_id = query
            .connect
            .as_deref()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| AppError::invalid_request("connect user id is required"))?;

        if user.id != connect_user_id {
            return Err(AppError::user_mismatch()
                .with_message("Cannot connect an account on behalf of another user"));
        }

        let mut context = FlowContext::redirect_only(resolve_oauth_redirect(
            query.redirect.as_deref(),
            env.default_redirect_path(),
        ));
        context.connect_user_id = Some(user.id);
        Ok(context)
    }
}

/// Everything the entry handler needs to redirect the browser
#[derive(Debug)]
pub struct OAuthStart {
    pub kind: FlowKind,
    pub state: String,
    pub authorization_url: String,
    pub cookie: Cookie<'static>,
}

/// Prepare the flow, build the payload cookie and the provider URL.
///
/// Failures are redirect-flagged; no cookie is produced for a failed attempt.
pub async fn handle_oauth_initiation(
    env: &FlowEnv<'_>,
    provider: AuthStrategy,
    query: &OAuthQuery,
) -> AppResult<OAuthStart> {
    let kind = FlowKind::parse(query.flow_type.as_deref())?;
    let client = client_config(&env.config.authentication.oauth, provider)?;

    let context = preparer(kind)
        .prepare(env, query)
        .await
        .map_err(AppError::redirect)?;

    let state = generate_state();
    let code_verifier = endpoints(provider)
        .uses_pkce
        .then(generate_code_verifier);

    let payload = OAuthFlowPayload {
        context,
        code_verifier,
    };
    let value = serde_json::to_string(&payload).map_err(|e| {
        AppError::internal(format!("Failed to encode OAuth state: {}", e)).redirect()
    })?;

    let cookie = Cookie::build((oauth_cookie_name(&state), value))
        .path("/")
        .http_only(true)
        .secure(env.config.authentication.secure_cookies)
        .same_site(SameSite::Lax)
        .max_age(time::Duration::seconds(OAUTH_COOKIE_MAX_AGE_SECS))
        .build();

    let authorization_url = authorization_url(
        provider,
        client,
        &callback_url(&env.config.service.backend_url, provider),
        &state,
        payload.code_verifier.as_deref(),
    )
    .map_err(AppError::redirect)?;

    tracing::info!(
        strategy = "oauth",
        provider = %provider,
        flow_type = kind.as_str(),
        "OAuth flow initiated"
    );

    Ok(OAuthStart {
        kind,
        state,
        authorization_url,
        cookie,
    })
}
