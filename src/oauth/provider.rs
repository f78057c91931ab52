/// OAuth provider endpoints, authorization URLs and the code exchange client
use super::pkce::generate_code_challenge;
use crate::{
    config::{OAuthClientConfig, OAuthProvidersConfig},
    db::models::AuthStrategy,
    error::{AppError, AppResult},
};
use async_trait::async_trait;
use serde::Deserialize;

/// Static endpoint description of a provider
#[derive(Debug, Clone, Copy)]
pub struct ProviderEndpoints {
    pub auth_url: &'static str,
    pub token_url: &'static str,
    pub userinfo_url: &'static str,
    pub scopes: &'static str,
    /// Whether the authorization request carries a PKCE challenge
    pub uses_pkce: bool,
}

pub fn endpoints(provider: AuthStrategy) -> ProviderEndpoints {
    match provider {
        AuthStrategy::Github => ProviderEndpoints {
            auth_url: "https://github.com/login/oauth/authorize",
            token_url: "https://github.com/login/oauth/access_token",
            userinfo_url: "https://api.github.com/user",
            scopes: "read:user user:email",
            uses_pkce: false,
        },
        AuthStrategy::Google => ProviderEndpoints {
            auth_url: "https://accounts.google.com/o/oauth2/v2/auth",
            token_url: "https://oauth2.googleapis.com/token",
            userinfo_url: "https://openidconnect.googleapis.com/v1/userinfo",
            scopes: "openid email profile",
            uses_pkce: true,
        },
        AuthStrategy::Microsoft => ProviderEndpoints {
            auth_url: "https://login.microsoftonline.com/common/oauth2/v2.0/authorize",
            token_url: "https://login.microsoftonline.com/common/oauth2/v2.0/token",
            userinfo_url: "https://graph.microsoft.com/oidc/userinfo",
            scopes: "openid email profile User.Read",
            uses_pkce: true,
        },
    }
}

/// Client credentials of a configured provider
pub fn client_config(
    providers: &OAuthProvidersConfig,
    provider: AuthStrategy,
) -> AppResult<&OAuthClientConfig> {
    let client = match provider {
        AuthStrategy::Github => providers.github.as_ref(),
        AuthStrategy::Google => providers.google.as_ref(),
        AuthStrategy::Microsoft => providers.microsoft.as_ref(),
    };

    client.ok_or_else(|| {
        AppError::invalid_request(format!("OAuth provider {} is not enabled", provider)).redirect()
    })
}

pub fn callback_url(backend_url: &str, provider: AuthStrategy) -> String {
    format!(
        "{}/auth/{}/callback",
        backend_url.trim_end_matches('/'),
        provider
    )
}

/// Provider authorization URL for one attempt
pub fn authorization_url(
    provider: AuthStrategy,
    client: &OAuthClientConfig,
    redirect_uri: &str,
    state: &str,
    code_verifier: Option<&str>,
) -> AppResult<String> {
    let endpoints = endpoints(provider);
    let mut params = vec![
        ("response_type", "code".to_string()),
        ("client_id", client.client_id.clone()),
        ("redirect_uri", redirect_uri.to_string()),
        ("scope", endpoints.scopes.to_string()),
        ("state", state.to_string()),
    ];

    if let Some(verifier) = code_verifier {
        params.push(("code_challenge", generate_code_challenge(verifier)));
        params.push(("code_challenge_method", "S256".to_string()));
    }

    let url = reqwest::Url::parse_with_params(endpoints.auth_url, &params)
        .map_err(|e| AppError::internal(format!("Invalid authorization URL: {}", e)))?;

    Ok(url.into())
}

/// Identity returned by a provider after a successful exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderProfile {
    pub provider_user_id: String,
    pub email: String,
    pub email_verified: bool,
    pub name: Option<String>,
    pub avatar_url: Option<String>,
}

/// Exchanges an authorization code for the provider's view of the user
#[async_trait]
pub trait OAuthExchange: Send + Sync {
    async fn fetch_profile(
        &self,
        provider: AuthStrategy,
        code: &str,
        code_verifier: Option<&str>,
    ) -> AppResult<ProviderProfile>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct GithubUser {
    id: u64,
    login: String,
    name: Option<String>,
    email: Option<String>,
    avatar_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GithubEmail {
    email: String,
    primary: bool,
    verified: bool,
}

#[derive(Debug, Deserialize)]
struct OidcUserInfo {
    sub: String,
    email: Option<String>,
    #[serde(default)]
    email_verified: Option<bool>,
    name: Option<String>,
    picture: Option<String>,
}

/// reqwest-backed provider client
pub struct HttpOAuthClient {
    http: reqwest::Client,
    providers: OAuthProvidersConfig,
    backend_url: String,
}

impl HttpOAuthClient {
    pub fn new(providers: OAuthProvidersConfig, backend_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            providers,
            backend_url: backend_url.into(),
        }
    }

    async fn exchange_code(
        &self,
        provider: AuthStrategy,
        code: &str,
        code_verifier: Option<&str>,
    ) -> AppResult<String> {
        let client = client_config(&self.providers, provider)?;
        let redirect_uri = callback_url(&self.backend_url, provider);

        let mut params = vec![
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri.as_str()),
            ("client_id", client.client_id.as_str()),
            ("client_secret", client.client_secret.as_str()),
        ];
        if let Some(verifier) = code_verifier {
            params.push(("code_verifier", verifier));
        }

        let response = self
            .http
            .post(endpoints(provider).token_url)
            .header(reqwest::header::ACCEPT, "application/json")
            .form(&params)
            .send()
            .await
            .map_err(|e| oauth_error("token exchange", e))?;

        let token = ensure_success(response, "token exchange")
            .await?
            .json::<TokenResponse>()
            .await
            .map_err(|e| oauth_error("token exchange", e))?;

        Ok(token.access_token)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        access_token: &str,
        operation: &'static str,
    ) -> AppResult<T> {
        let response = self
            .http
            .get(url)
            .bearer_auth(access_token)
            .header(reqwest::header::USER_AGENT, "saas-backend")
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| oauth_error(operation, e))?;

        ensure_success(response, operation)
            .await?
            .json::<T>()
            .await
            .map_err(|e| oauth_error(operation, e))
    }

    async fn github_profile(&self, access_token: &str) -> AppResult<ProviderProfile> {
        let user: GithubUser = self
            .get_json(endpoints(AuthStrategy::Github).userinfo_url, access_token, "github user")
            .await?;
        let emails: Vec<GithubEmail> = self
            .get_json("https://api.github.com/user/emails", access_token, "github emails")
            .await?;

        let (email, email_verified) = match emails.into_iter().find(|e| e.primary) {
            Some(primary) => (primary.email, primary.verified),
            None => (
                user.email.ok_or_else(|| {
                    AppError::oauth_failed("GitHub account has no email").redirect()
                })?,
                false,
            ),
        };

        Ok(ProviderProfile {
            provider_user_id: user.id.to_string(),
            email,
            email_verified,
            name: user.name.or(Some(user.login)),
            avatar_url: user.avatar_url,
        })
    }

    async fn oidc_profile(
        &self,
        provider: AuthStrategy,
        access_token: &str,
    ) -> AppResult<ProviderProfile> {
        let info: OidcUserInfo = self
            .get_json(endpoints(provider).userinfo_url, access_token, "userinfo")
            .await?;

        let email = info
            .email
            .ok_or_else(|| AppError::oauth_failed("Provider returned no email").redirect())?;

        Ok(ProviderProfile {
            provider_user_id: info.sub,
            email,
            email_verified: info.email_verified.unwrap_or(false),
            name: info.name,
            avatar_url: info.picture,
        })
    }
}

#[async_trait]
impl OAuthExchange for HttpOAuthClient {
    async fn fetch_profile(
        &self,
        provider: AuthStrategy,
        code: &str,
        code_verifier: Option<&str>,
    ) -> AppResult<ProviderProfile> {
        let access_token = self.exchange_code(provider, code, code_verifier).await?;

        match provider {
            AuthStrategy::Github => self.github_profile(&access_token).await,
            AuthStrategy::Google | AuthStrategy::Microsoft => {
                self.oidc_profile(provider, &access_token).await
            }
        }
    }
}

fn oauth_error(operation: &'static str, err: reqwest::Error) -> AppError {
    AppError::oauth_failed(format!("OAuth {} failed", operation))
        .with_source(err)
        .redirect()
}

async fn ensure_success(
    response: reqwest::Response,
    operation: &'static str,
) -> AppResult<reqwest::Response> {
    if response.status().is_success() {
        return Ok(response);
    }

    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    tracing::warn!(operation, status, body = %body, "OAuth provider request failed");
    Err(
        AppError::oauth_failed(format!("OAuth {} failed with status {}", operation, status))
            .redirect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> OAuthClientConfig {
        OAuthClientConfig {
            client_id: "client-1".to_string(),
            client_secret: "secret".to_string(),
        }
    }

    #[test]
    fn test_google_authorization_url_carries_pkce() {
        let url = authorization_url(
            AuthStrategy::Google,
            &client(),
            "http://api.test/auth/google/callback",
            "state-1",
            Some("verifier"),
        )
        .unwrap();

        assert!(url.starts_with("https://accounts.google.com/o/oauth2/v2/auth?"));
        assert!(url.contains("client_id=client-1"));
        assert!(url.contains("state=state-1"));
        assert!(url.contains("code_challenge_method=S256"));
        assert!(url.contains("redirect_uri=http%3A%2F%2Fapi.test%2Fauth%2Fgoogle%2Fcallback"));
    }

    #[test]
    fn test_github_authorization_url_without_pkce() {
        let url =
            authorization_url(AuthStrategy::Github, &client(), "http://cb", "s", None).unwrap();
        assert!(!url.contains("code_challenge"));
        assert!(!endpoints(AuthStrategy::Github).uses_pkce);
    }

    #[test]
    fn test_unconfigured_provider_is_invalid_request() {
        let err = client_config(&OAuthProvidersConfig::default(), AuthStrategy::Microsoft)
            .unwrap_err();
        assert!(err.is_redirect);
    }

    #[test]
    fn test_callback_url() {
        assert_eq!(
            callback_url("http://api.test/", AuthStrategy::Github),
            "http://api.test/auth/github/callback"
        );
    }
}
