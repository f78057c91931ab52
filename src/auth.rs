/// Authentication extractors backed by the session cookie
use crate::{
    api::middleware::RequestScope,
    context::AppContext,
    db::models::{Session, User},
    error::AppError,
    session::{get_parsed_session_cookie, ParsedSessionCookie, SessionCookieOptions},
};
use axum::{async_trait, extract::FromRequestParts, http::request::Parts};
use axum_extra::extract::cookie::SignedCookieJar;

/// Authenticated context - validates the session cookie
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub user: User,
    pub session: Session,
    pub cookie: ParsedSessionCookie,
}

#[async_trait]
impl FromRequestParts<AppContext> for AuthContext {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppContext,
    ) -> Result<Self, Self::Rejection> {
        let jar = SignedCookieJar::from_headers(&parts.headers, state.cookie_key.clone());
        let (_, cookie) = get_parsed_session_cookie(jar, &SessionCookieOptions::default());
        let cookie = cookie?;

        let (session, user) = state.sessions.validate_session(&cookie.session_token).await?;

        if let Some(scope) = parts.extensions.get::<RequestScope>() {
            scope.set_user(&user.id);
        }

        Ok(AuthContext {
            user,
            session,
            cookie,
        })
    }
}

/// Admin authentication context - requires the system admin role
#[derive(Debug, Clone)]
pub struct AdminAuthContext(pub AuthContext);

#[async_trait]
impl FromRequestParts<AppContext> for AdminAuthContext {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppContext,
    ) -> Result<Self, Self::Rejection> {
        let auth = AuthContext::from_request_parts(parts, state).await?;

        if !auth.user.is_admin() {
            tracing::warn!(user_id = %auth.user.id, "Non-admin attempted an admin action");
            return Err(AppError::forbidden().with_message("System admin role required"));
        }

        Ok(AdminAuthContext(auth))
    }
}
