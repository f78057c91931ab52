/// OAuth callback: resolve the state payload into a signed-in user
use super::flow::{oauth_cookie_name, OAuthFlowPayload};
use super::provider::{OAuthExchange, ProviderProfile};
use crate::{
    account::{AccountManager, NewUser},
    db::models::{AuthStrategy, SessionType, TokenType, User},
    error::{AppError, AppResult},
    session::{removal_cookie, SessionManager, SessionRequest},
    token::{TokenLookup, TokenManager},
};
use axum_extra::extract::cookie::{Cookie, SignedCookieJar};
use serde::Deserialize;

/// Query parameters the provider sends back
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallbackQuery {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
}

/// Collaborators of the callback
pub struct CallbackEnv<'a> {
    pub frontend_url: &'a str,
    pub accounts: &'a AccountManager,
    pub sessions: &'a SessionManager,
    pub tokens: &'a TokenManager,
    pub oauth: &'a dyn OAuthExchange,
}

/// Resolve a provider callback.
///
/// The `oauth-<state>` cookie is removed whatever the outcome. On success the
/// jar also carries the new session cookie and the result is the frontend URL
/// to send the browser to. Every failure is redirect-flagged.
pub async fn handle_oauth_callback(
    env: &CallbackEnv<'_>,
    provider: AuthStrategy,
    query: &CallbackQuery,
    request: &SessionRequest,
    jar: SignedCookieJar,
) -> (SignedCookieJar, AppResult<String>) {
    let state = match query.state.as_deref().filter(|s| !s.is_empty()) {
        Some(state) => state,
        None => return (jar, Err(AppError::invalid_state().redirect())),
    };

    let cookie_name = oauth_cookie_name(state);
    let payload = jar
        .get(&cookie_name)
        .and_then(|cookie| serde_json::from_str::<OAuthFlowPayload>(cookie.value()).ok());
    let jar = jar.remove(removal_cookie(cookie_name));

    let payload = match payload {
        Some(payload) => payload,
        None => return (jar, Err(AppError::invalid_state().redirect())),
    };

    match resolve(env, provider, query, request, &payload).await {
        Ok((session_cookie, location)) => {
            let jar = match session_cookie {
                Some(cookie) => jar.add(cookie),
                None => jar,
            };
            (jar, Ok(location))
        }
        Err(err) => (jar, Err(err.redirect())),
    }
}

async fn resolve(
    env: &CallbackEnv<'_>,
    provider: AuthStrategy,
    query: &CallbackQuery,
    request: &SessionRequest,
    payload: &OAuthFlowPayload,
) -> AppResult<(Option<Cookie<'static>>, String)> {
    if let Some(error) = &query.error {
        return Err(AppError::oauth_failed(format!("Provider returned an error: {}", error)));
    }

    let code = query
        .code
        .as_deref()
        .filter(|c| !c.is_empty())
        .ok_or_else(|| AppError::invalid_request("Missing authorization code"))?;

    let context = &payload.context;
    let location = format!(
        "{}{}",
        env.frontend_url.trim_end_matches('/'),
        context.redirect_path
    );

    let profile = env
        .oauth
        .fetch_profile(provider, code, payload.code_verifier.as_deref())
        .await?;

    // Connecting an extra provider to the signed-in user: no new session
    if let Some(connect_user_id) = &context.connect_user_id {
        let user = env.accounts.get_user(connect_user_id).await?;
        env.accounts
            .link_oauth_account(&user.id, provider, &profile.provider_user_id, Some(&profile.email))
            .await?;

        tracing::info!(
            user_id = %user.id,
            provider = %provider,
            flow_type = context.kind().as_str(),
            "OAuth callback resolved"
        );
        return Ok((None, location));
    }

    let user = resolve_user(env.accounts, provider, &profile).await?;

    if let Some(token_id) = &context.verify_token_id {
        let token = env
            .tokens
            .get_valid_token(TokenType::EmailVerification, TokenLookup::Id(token_id), true)
            .await?;
        if !token.email.eq_ignore_ascii_case(&user.email) {
            return Err(AppError::user_mismatch()
                .with_message("Verification token belongs to another email address"));
        }
        env.accounts.mark_email_verified(&user.id).await?;
    }

    if let Some(token_id) = &context.invite_token_id {
        let token = env
            .tokens
            .get_valid_token(TokenType::Invitation, TokenLookup::Id(token_id), false)
            .await?;
        if token.email.eq_ignore_ascii_case(&user.email) {
            env.accounts.mark_email_verified(&user.id).await?;
        }
    }

    let issued = env
        .sessions
        .set_user_session(request, &user, provider, SessionType::Regular)
        .await?;

    tracing::info!(
        user_id = %user.id,
        provider = %provider,
        flow_type = context.kind().as_str(),
        "OAuth callback resolved"
    );

    Ok((Some(issued.cookie), location))
}

/// Find or create the user behind a provider profile
async fn resolve_user(
    accounts: &AccountManager,
    provider: AuthStrategy,
    profile: &ProviderProfile,
) -> AppResult<User> {
    if let Some(user) = accounts
        .find_by_oauth(provider, &profile.provider_user_id)
        .await?
    {
        return Ok(user);
    }

    if let Some(user) = accounts.find_by_email(&profile.email).await? {
        if !profile.email_verified {
            return Err(AppError::unverified_email());
        }
        accounts
            .link_oauth_account(&user.id, provider, &profile.provider_user_id, Some(&profile.email))
            .await?;
        return Ok(user);
    }

    let user = accounts
        .create_user(NewUser {
            email: profile.email.clone(),
            name: profile.name.clone(),
            avatar_url: profile.avatar_url.clone(),
            email_verified: profile.email_verified,
        })
        .await?;
    accounts
        .link_oauth_account(&user.id, provider, &profile.provider_user_id, Some(&profile.email))
        .await?;

    Ok(user)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::IpAllowList;
    use crate::db::models::{EntityType, UserRole};
    use crate::db::testing::{count_rows, insert_organization, insert_user, test_pool};
    use crate::error::ErrorType;
    use crate::oauth::flow::FlowContext;
    use crate::session::{DeviceInfo, ParsedSessionCookie, SESSION_COOKIE};
    use crate::token::NewToken;
    use async_trait::async_trait;
    use axum_extra::extract::cookie::Key;
    use chrono::Duration;
    use sqlx::SqlitePool;

    /// Provider double returning a fixed profile
    pub(crate) struct FakeProvider(pub ProviderProfile);

    #[async_trait]
    impl OAuthExchange for FakeProvider {
        async fn fetch_profile(
            &self,
            _provider: AuthStrategy,
            code: &str,
            _code_verifier: Option<&str>,
        ) -> AppResult<ProviderProfile> {
            if code == "bad" {
                return Err(AppError::oauth_failed("exchange failed"));
            }
            Ok(self.0.clone())
        }
    }

    pub(crate) fn profile(id: &str, email: &str, verified: bool) -> ProviderProfile {
        ProviderProfile {
            provider_user_id: id.to_string(),
            email: email.to_string(),
            email_verified: verified,
            name: Some("Test".to_string()),
            avatar_url: None,
        }
    }

    struct Fixture {
        pool: SqlitePool,
        accounts: AccountManager,
        sessions: SessionManager,
        tokens: TokenManager,
        provider: FakeProvider,
    }

    impl Fixture {
        async fn new(profile: ProviderProfile) -> Self {
            Self::with_admins(profile, vec![]).await
        }

        async fn with_admins(profile: ProviderProfile, admin_emails: Vec<String>) -> Self {
            let pool = test_pool().await;
            Fixture {
                accounts: AccountManager::new(pool.clone(), admin_emails),
                sessions: SessionManager::new(pool.clone(), IpAllowList::Any, false),
                tokens: TokenManager::new(pool.clone()),
                provider: FakeProvider(profile),
                pool,
            }
        }

        fn env(&self) -> CallbackEnv<'_> {
            CallbackEnv {
                frontend_url: "http://app.test",
                accounts: &self.accounts,
                sessions: &self.sessions,
                tokens: &self.tokens,
                oauth: &self.provider,
            }
        }
    }

    fn request() -> SessionRequest {
        SessionRequest {
            client_ip: "127.0.0.1".to_string(),
            device: DeviceInfo::default(),
            acting_admin_id: None,
        }
    }

    fn jar_with_payload(state: &str, context: FlowContext) -> SignedCookieJar {
        let payload = OAuthFlowPayload {
            context,
            code_verifier: None,
        };
        SignedCookieJar::new(Key::generate()).add(Cookie::new(
            oauth_cookie_name(state),
            serde_json::to_string(&payload).unwrap(),
        ))
    }

    fn context(redirect_path: &str) -> FlowContext {
        FlowContext {
            redirect_path: redirect_path.to_string(),
            invite_token_id: None,
            connect_user_id: None,
            verify_token_id: None,
        }
    }

    fn callback(code: &str, state: &str) -> CallbackQuery {
        CallbackQuery {
            code: Some(code.to_string()),
            state: Some(state.to_string()),
            error: None,
        }
    }

    #[tokio::test]
    async fn test_new_user_signs_in_and_state_cookie_is_removed() {
        let fx = Fixture::new(profile("gh-1", "alice@example.com", true)).await;
        let jar = jar_with_payload("s1", context("/dashboard"));

        let (jar, result) = handle_oauth_callback(
            &fx.env(),
            AuthStrategy::Github,
            &callback("code", "s1"),
            &request(),
            jar,
        )
        .await;

        assert_eq!(result.unwrap(), "http://app.test/dashboard");
        assert!(jar.get("oauth-s1").is_none());
        let session = jar.get(SESSION_COOKIE).unwrap();
        assert!(ParsedSessionCookie::parse(session.value()).is_some());
        assert_eq!(count_rows(&fx.pool, "users").await, 1);
        assert_eq!(count_rows(&fx.pool, "oauth_accounts").await, 1);
    }

    #[tokio::test]
    async fn test_unverified_provider_email_never_grants_admin() {
        let admins = vec!["admin@example.com".to_string()];
        let fx = Fixture::with_admins(profile("evil-1", "admin@example.com", false), admins).await;
        let jar = jar_with_payload("s1", context("/home"));

        let (_, result) = handle_oauth_callback(
            &fx.env(),
            AuthStrategy::Microsoft,
            &callback("code", "s1"),
            &request(),
            jar,
        )
        .await;
        result.unwrap();

        let user = fx.accounts.find_by_email("admin@example.com").await.unwrap().unwrap();
        assert_eq!(user.role, UserRole::User);
        assert!(!user.email_verified);
    }

    #[tokio::test]
    async fn test_verified_admin_email_becomes_admin() {
        let admins = vec!["admin@example.com".to_string()];
        let fx = Fixture::with_admins(profile("gh-9", "admin@example.com", true), admins).await;
        let jar = jar_with_payload("s1", context("/home"));

        let (_, result) = handle_oauth_callback(
            &fx.env(),
            AuthStrategy::Github,
            &callback("code", "s1"),
            &request(),
            jar,
        )
        .await;
        result.unwrap();

        let user = fx.accounts.find_by_email("admin@example.com").await.unwrap().unwrap();
        assert_eq!(user.role, UserRole::Admin);
    }

    #[tokio::test]
    async fn test_missing_state_cookie_is_invalid_state() {
        let fx = Fixture::new(profile("gh-1", "alice@example.com", true)).await;
        let jar = SignedCookieJar::new(Key::generate());

        let (_, result) = handle_oauth_callback(
            &fx.env(),
            AuthStrategy::Github,
            &callback("code", "s1"),
            &request(),
            jar,
        )
        .await;

        let err = result.unwrap_err();
        assert_eq!(err.kind, ErrorType::InvalidState);
        assert!(err.is_redirect);
    }

    #[tokio::test]
    async fn test_failed_exchange_still_removes_state_cookie() {
        let fx = Fixture::new(profile("gh-1", "alice@example.com", true)).await;
        let jar = jar_with_payload("s1", context("/home"));

        let (jar, result) = handle_oauth_callback(
            &fx.env(),
            AuthStrategy::Github,
            &callback("bad", "s1"),
            &request(),
            jar,
        )
        .await;

        assert_eq!(result.unwrap_err().kind, ErrorType::OauthFailed);
        assert!(jar.get("oauth-s1").is_none());
        assert!(jar.get(SESSION_COOKIE).is_none());
    }

    #[tokio::test]
    async fn test_existing_email_unverified_by_provider_is_rejected() {
        let fx = Fixture::new(profile("gh-1", "alice@example.com", false)).await;
        insert_user(&fx.pool, "alice@example.com", UserRole::User).await;

        let (_, result) = handle_oauth_callback(
            &fx.env(),
            AuthStrategy::Github,
            &callback("code", "s1"),
            &request(),
            jar_with_payload("s1", context("/home")),
        )
        .await;

        assert_eq!(result.unwrap_err().kind, ErrorType::UnverifiedEmail);
    }

    #[tokio::test]
    async fn test_connect_links_without_new_session() {
        let fx = Fixture::new(profile("google-1", "alice@gmail.com", true)).await;
        let alice = insert_user(&fx.pool, "alice@example.com", UserRole::User).await;
        let mut ctx = context("/settings");
        ctx.connect_user_id = Some(alice.id.clone());

        let (jar, result) = handle_oauth_callback(
            &fx.env(),
            AuthStrategy::Google,
            &callback("code", "s1"),
            &request(),
            jar_with_payload("s1", ctx),
        )
        .await;

        assert_eq!(result.unwrap(), "http://app.test/settings");
        assert!(jar.get(SESSION_COOKIE).is_none());
        let linked = fx
            .accounts
            .find_by_oauth(AuthStrategy::Google, "google-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(linked.id, alice.id);
        assert_eq!(count_rows(&fx.pool, "sessions").await, 0);
    }

    #[tokio::test]
    async fn test_verify_flow_consumes_token_and_marks_email() {
        let fx = Fixture::new(profile("gh-1", "alice@example.com", false)).await;
        let (record, _) = fx
            .tokens
            .create_token(NewToken::new(
                TokenType::EmailVerification,
                "alice@example.com",
                Duration::days(1),
            ))
            .await
            .unwrap();
        let mut ctx = context("/home");
        ctx.verify_token_id = Some(record.id.clone());

        let (_, result) = handle_oauth_callback(
            &fx.env(),
            AuthStrategy::Github,
            &callback("code", "s1"),
            &request(),
            jar_with_payload("s1", ctx),
        )
        .await;
        assert!(result.is_ok());

        let user = fx
            .accounts
            .find_by_email("alice@example.com")
            .await
            .unwrap()
            .unwrap();
        assert!(user.email_verified);

        let err = fx
            .tokens
            .get_valid_token(TokenType::EmailVerification, TokenLookup::Id(&record.id), false)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorType::InvalidToken);
    }

    #[tokio::test]
    async fn test_invite_flow_marks_matching_email_verified() {
        let fx = Fixture::new(profile("gh-1", "bob@example.com", false)).await;
        let org = insert_organization(&fx.pool, "acme").await;
        let mut new = NewToken::new(TokenType::Invitation, "bob@example.com", Duration::days(7));
        new.entity_type = Some(EntityType::Organization);
        new.organization_id = Some(org.id);
        let (record, raw) = fx.tokens.create_token(new).await.unwrap();

        let mut ctx = context(&format!("/invitation/{}", raw));
        ctx.invite_token_id = Some(record.id);

        let (_, result) = handle_oauth_callback(
            &fx.env(),
            AuthStrategy::Github,
            &callback("code", "s1"),
            &request(),
            jar_with_payload("s1", ctx),
        )
        .await;

        assert_eq!(result.unwrap(), format!("http://app.test/invitation/{}", raw));
        let user = fx
            .accounts
            .find_by_email("bob@example.com")
            .await
            .unwrap()
            .unwrap();
        assert!(user.email_verified);
    }
}
