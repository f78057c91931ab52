/// OAuth sign-in, sign-out and impersonation endpoints
use super::{
    found,
    middleware::{session_request, ClientIp},
};
use crate::{
    auth::{AdminAuthContext, AuthContext},
    context::AppContext,
    db::models::{AuthStrategy, Session, SessionType, User},
    error::{AppError, AppResult},
    oauth::{
        handle_oauth_callback, handle_oauth_initiation, CallbackEnv, CallbackQuery, FlowEnv,
        OAuthQuery,
    },
    session::{get_parsed_session_cookie, removal_cookie, SessionCookieOptions, SESSION_COOKIE},
};
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    middleware,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use axum_extra::extract::cookie::SignedCookieJar;
use serde::{Deserialize, Serialize};

/// Build auth routes; every route is rate limited per client IP
pub fn routes(ctx: AppContext) -> Router<AppContext> {
    Router::new()
        .route("/auth/sign-out", post(sign_out))
        .route("/auth/impersonation/start", post(start_impersonation))
        .route("/auth/impersonation/stop", post(stop_impersonation))
        .route("/auth/:provider", get(oauth_start))
        .route("/auth/:provider/callback", get(oauth_callback))
        .route_layer(middleware::from_fn_with_state(
            ctx,
            crate::rate_limit::limit_auth_requests,
        ))
}

fn parse_provider(raw: &str) -> AppResult<AuthStrategy> {
    AuthStrategy::parse(raw).ok_or_else(|| {
        AppError::invalid_request(format!("Unsupported OAuth provider: {}", raw)).redirect()
    })
}

/// GET /auth/:provider
async fn oauth_start(
    State(ctx): State<AppContext>,
    Path(provider): Path<String>,
    Query(query): Query<OAuthQuery>,
    jar: SignedCookieJar,
) -> AppResult<(SignedCookieJar, Response)> {
    let provider = parse_provider(&provider)?;

    let env = FlowEnv {
        config: &ctx.config,
        tokens: &ctx.tokens,
        sessions: &ctx.sessions,
        jar: &jar,
    };
    let start = handle_oauth_initiation(&env, provider, &query).await?;

    let response = found(&start.authorization_url)?;
    Ok((jar.add(start.cookie), response))
}

/// GET /auth/:provider/callback
async fn oauth_callback(
    State(ctx): State<AppContext>,
    Path(provider): Path<String>,
    Query(query): Query<CallbackQuery>,
    ClientIp(client_ip): ClientIp,
    headers: HeaderMap,
    jar: SignedCookieJar,
) -> (SignedCookieJar, AppResult<Response>) {
    let provider = match parse_provider(&provider) {
        Ok(provider) => provider,
        Err(e) => return (jar, Err(e)),
    };

    let env = CallbackEnv {
        frontend_url: &ctx.config.service.frontend_url,
        accounts: &ctx.accounts,
        sessions: &ctx.sessions,
        tokens: &ctx.tokens,
        oauth: ctx.oauth_client.as_ref(),
    };
    let request = session_request(&headers, client_ip, None);

    let (jar, location) = handle_oauth_callback(&env, provider, &query, &request, jar).await;
    (jar, location.and_then(|location| found(&location)))
}

/// POST /auth/sign-out
///
/// Always clears the cookie; a missing or stale session is not an error.
async fn sign_out(
    State(ctx): State<AppContext>,
    jar: SignedCookieJar,
) -> (SignedCookieJar, AppResult<StatusCode>) {
    let options = SessionCookieOptions {
        delete_after_attempt: true,
        ..Default::default()
    };
    let (jar, parsed) = get_parsed_session_cookie(jar, &options);

    let Ok(parsed) = parsed else {
        return (jar, Ok(StatusCode::NO_CONTENT));
    };

    let result = ctx
        .sessions
        .delete_session(&parsed.session_token)
        .await
        .map(|deleted| {
            if deleted {
                tracing::info!("User signed out");
            }
            StatusCode::NO_CONTENT
        });

    (jar, result)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImpersonationQuery {
    target_user_id: String,
}

#[derive(Debug, Serialize)]
struct SessionResponse {
    user: User,
    session: Session,
}

/// POST /auth/impersonation/start?targetUserId=
async fn start_impersonation(
    State(ctx): State<AppContext>,
    AdminAuthContext(admin): AdminAuthContext,
    Query(query): Query<ImpersonationQuery>,
    ClientIp(client_ip): ClientIp,
    headers: HeaderMap,
    jar: SignedCookieJar,
) -> AppResult<(SignedCookieJar, Json<SessionResponse>)> {
    if query.target_user_id == admin.user.id {
        return Err(AppError::invalid_request("Cannot impersonate yourself"));
    }

    let target = ctx.accounts.get_user(&query.target_user_id).await?;
    if target.is_admin() {
        return Err(AppError::forbidden().with_message("Admins cannot be impersonated"));
    }

    let request = session_request(&headers, client_ip, Some(admin.user.id.clone()));
    let issued = ctx
        .sessions
        .set_user_session(
            &request,
            &target,
            admin.session.auth_strategy,
            SessionType::Impersonation,
        )
        .await?;

    // The admin gets a fresh session when impersonation stops
    ctx.sessions.delete_session(&admin.session.token).await?;

    tracing::info!(
        admin_id = %admin.user.id,
        target_user_id = %target.id,
        "Impersonation started"
    );

    Ok((
        jar.add(issued.cookie),
        Json(SessionResponse {
            user: target,
            session: issued.session,
        }),
    ))
}

/// POST /auth/impersonation/stop
async fn stop_impersonation(
    State(ctx): State<AppContext>,
    auth: AuthContext,
    ClientIp(client_ip): ClientIp,
    headers: HeaderMap,
    jar: SignedCookieJar,
) -> AppResult<(SignedCookieJar, Response)> {
    if auth.session.session_type != SessionType::Impersonation {
        return Err(AppError::invalid_request("Not impersonating"));
    }

    ctx.sessions.delete_session(&auth.session.token).await?;
    tracing::info!(
        target_user_id = %auth.user.id,
        admin_id = auth.cookie.admin_user_id.as_deref(),
        "Impersonation stopped"
    );

    let Some(admin_id) = auth.cookie.admin_user_id.as_deref() else {
        return Ok((
            jar.remove(removal_cookie(SESSION_COOKIE)),
            StatusCode::NO_CONTENT.into_response(),
        ));
    };

    let admin = ctx.accounts.get_user(admin_id).await?;
    if !admin.is_admin() {
        return Err(AppError::forbidden().with_message("Acting admin lost the admin role"));
    }

    let request = session_request(&headers, client_ip, None);
    let issued = ctx
        .sessions
        .set_user_session(&request, &admin, auth.session.auth_strategy, SessionType::Regular)
        .await?;

    Ok((
        jar.add(issued.cookie),
        Json(SessionResponse {
            user: admin,
            session: issued.session,
        })
        .into_response(),
    ))
}
