/// Current user endpoints: profile, sessions and email verification
use crate::{
    auth::AuthContext,
    context::AppContext,
    db::models::{Session, TokenType, User},
    error::{AppError, AppResult},
    session::{removal_cookie, SESSION_COOKIE},
    token::NewToken,
};
use axum::{
    extract::State,
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use axum_extra::extract::cookie::SignedCookieJar;
use chrono::Duration;
use serde::{Deserialize, Serialize};

const VERIFICATION_TTL_HOURS: i64 = 24;

pub fn routes() -> Router<AppContext> {
    Router::new()
        .route("/me", get(get_me))
        .route("/me/sessions", get(list_sessions).delete(delete_sessions))
        .route("/me/verify-email", post(request_email_verification))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MeResponse {
    user: User,
    session: Session,
    /// Admin driving this session, when impersonating
    acting_admin_id: Option<String>,
}

/// GET /me
async fn get_me(auth: AuthContext) -> Json<MeResponse> {
    Json(MeResponse {
        user: auth.user,
        session: auth.session,
        acting_admin_id: auth.cookie.admin_user_id,
    })
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionView {
    #[serde(flatten)]
    session: Session,
    is_current: bool,
}

/// GET /me/sessions
async fn list_sessions(
    State(ctx): State<AppContext>,
    auth: AuthContext,
) -> AppResult<Json<Vec<SessionView>>> {
    let sessions = ctx.sessions.list_sessions(&auth.user.id).await?;

    Ok(Json(
        sessions
            .into_iter()
            .map(|session| SessionView {
                is_current: session.id == auth.session.id,
                session,
            })
            .collect(),
    ))
}

#[derive(Debug, Deserialize)]
struct DeleteSessionsRequest {
    ids: Vec<String>,
}

#[derive(Debug, Serialize)]
struct DeleteSessionsResponse {
    deleted: u64,
}

/// DELETE /me/sessions
///
/// Deleting the current session also clears the cookie.
async fn delete_sessions(
    State(ctx): State<AppContext>,
    auth: AuthContext,
    jar: SignedCookieJar,
    Json(body): Json<DeleteSessionsRequest>,
) -> AppResult<(SignedCookieJar, Json<DeleteSessionsResponse>)> {
    let deleted = ctx.sessions.delete_sessions(&auth.user.id, &body.ids).await?;
    tracing::info!(user_id = %auth.user.id, deleted, "Deleted sessions");

    let jar = if body.ids.contains(&auth.session.id) {
        jar.remove(removal_cookie(SESSION_COOKIE))
    } else {
        jar
    };

    Ok((jar, Json(DeleteSessionsResponse { deleted })))
}

/// POST /me/verify-email
///
/// Mails a link that starts the `verify` OAuth flow with the provider the
/// user signed in with.
async fn request_email_verification(
    State(ctx): State<AppContext>,
    auth: AuthContext,
) -> AppResult<StatusCode> {
    if auth.user.email_verified {
        return Err(AppError::invalid_request("Email is already verified"));
    }

    let mut new = NewToken::new(
        TokenType::EmailVerification,
        &auth.user.email,
        Duration::hours(VERIFICATION_TTL_HOURS),
    );
    new.user_id = Some(auth.user.id.clone());
    let (token, raw) = ctx.tokens.create_token(new).await?;

    let verify_url = format!(
        "{}/auth/{}?type=verify&token={}&tokenId={}",
        ctx.config.service.backend_url.trim_end_matches('/'),
        auth.session.auth_strategy,
        urlencoding::encode(&raw),
        token.id
    );
    ctx.mailer
        .send_verification_email(&auth.user.email, &verify_url)
        .await?;

    tracing::info!(user_id = %auth.user.id, token_id = %token.id, "Sent email verification");
    Ok(StatusCode::ACCEPTED)
}
