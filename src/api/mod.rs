/// API routes and handlers
pub mod auth;
pub mod health;
pub mod me;
pub mod middleware;
pub mod organizations;

use crate::{
    context::AppContext,
    error::{AppError, AppResult},
};
use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Router,
};

/// Build API routes
pub fn routes(ctx: AppContext) -> Router<AppContext> {
    Router::new()
        .merge(health::routes())
        .merge(auth::routes(ctx))
        .merge(me::routes())
        .merge(organizations::routes())
}

/// `302 Found` to `location`
pub fn found(location: &str) -> AppResult<Response> {
    let value = HeaderValue::from_str(location)
        .map_err(|_| AppError::internal("Redirect location is not a valid header value"))?;
    Ok((StatusCode::FOUND, [(header::LOCATION, value)]).into_response())
}

#[cfg(test)]
mod tests {
    use crate::{
        context::AppContext,
        crypto::hash_token,
        db::models::{AuthStrategy, SessionType, User, UserRole},
        db::testing::insert_user,
        oauth::callback::tests::{profile, FakeProvider},
        server::build_router,
        session::{device_info, ParsedSessionCookie, SessionRequest, SESSION_COOKIE},
    };
    use axum::{
        body::{to_bytes, Body},
        extract::ConnectInfo,
        http::{header, HeaderMap, Request, StatusCode},
        response::IntoResponse,
        Router,
    };
    use axum_extra::extract::cookie::{Cookie, SignedCookieJar};
    use std::{net::SocketAddr, sync::Arc};
    use tower::ServiceExt;

    async fn app() -> (AppContext, Router) {
        let ctx =
            AppContext::for_tests(Arc::new(FakeProvider(profile("gh-1", "new@example.com", true))))
                .await;
        let router = build_router(ctx.clone());
        (ctx, router)
    }

    /// `Cookie` header value carrying `value` signed with the server key
    fn cookie_header(ctx: &AppContext, name: &str, value: &str) -> String {
        let response = SignedCookieJar::new(ctx.cookie_key.clone())
            .add(Cookie::new(name.to_string(), value.to_string()))
            .into_response();
        let set_cookie = response.headers()[header::SET_COOKIE].to_str().unwrap();
        set_cookie.split(';').next().unwrap().to_string()
    }

    async fn signed_in(ctx: &AppContext, user: &User, client_ip: &str) -> String {
        let request = SessionRequest {
            client_ip: client_ip.to_string(),
            device: device_info(&HeaderMap::new()),
            acting_admin_id: None,
        };
        let issued = ctx
            .sessions
            .set_user_session(&request, user, AuthStrategy::Github, SessionType::Regular)
            .await
            .unwrap();
        cookie_header(ctx, SESSION_COOKIE, issued.cookie.value())
    }

    /// Attach the TCP peer address the server would see
    fn from_peer(mut request: Request<Body>, ip: [u8; 4]) -> Request<Body> {
        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from((ip, 5555))));
        request
    }

    async fn json_body(response: axum::response::Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let (_, router) = app().await;
        let response = router
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_missing_session_renders_json_error() {
        let (_, router) = app().await;
        let response = router
            .oneshot(Request::get("/me").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = json_body(response).await;
        assert_eq!(body["type"], "unauthorized");
        assert_eq!(body["severity"], "warn");
        assert_eq!(body["path"], "/me");
        assert_eq!(body["method"], "GET");
        assert!(body["logId"].is_string());
    }

    #[tokio::test]
    async fn test_me_with_session_cookie() {
        let (ctx, router) = app().await;
        let alice = insert_user(&ctx.db, "alice@example.com", UserRole::User).await;
        let cookie = signed_in(&ctx, &alice, "10.0.0.1").await;

        let response = router
            .oneshot(
                Request::get("/me")
                    .header(header::COOKIE, cookie)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["user"]["email"], "alice@example.com");
        assert!(body["session"].get("token").is_none());
    }

    #[tokio::test]
    async fn test_unknown_flow_type_redirects_to_error_page() {
        let (_, router) = app().await;
        let response = router
            .oneshot(
                Request::get("/auth/github?type=bogus")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::FOUND);
        let location = response.headers()[header::LOCATION].to_str().unwrap();
        assert_eq!(
            location,
            "http://localhost:3000/error?error=invalid_request&severity=warn"
        );
    }

    #[tokio::test]
    async fn test_oauth_start_sets_state_cookie_and_redirects_to_provider() {
        let (_, router) = app().await;
        let response = router
            .oneshot(
                Request::get("/auth/github?redirect=%2Fsettings")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::FOUND);
        let location = response.headers()[header::LOCATION].to_str().unwrap();
        assert!(location.starts_with("https://github.com/login/oauth/authorize"));
        let set_cookie = response.headers()[header::SET_COOKIE].to_str().unwrap();
        assert!(set_cookie.starts_with("oauth-"));
    }

    #[tokio::test]
    async fn test_callback_without_state_cookie_redirects() {
        let (_, router) = app().await;
        let response = router
            .oneshot(
                Request::get("/auth/github/callback?code=abc&state=nope")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::FOUND);
        let location = response.headers()[header::LOCATION].to_str().unwrap();
        assert!(location.contains("error=invalid_state"));
    }

    #[tokio::test]
    async fn test_full_oauth_round_trip_creates_session() {
        let (ctx, router) = app().await;

        let start = router
            .clone()
            .oneshot(
                Request::get("/auth/github?redirect=%2Fsettings")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let set_cookie = start.headers()[header::SET_COOKIE].to_str().unwrap();
        let state_cookie = set_cookie.split(';').next().unwrap().to_string();
        let state = state_cookie
            .split('=')
            .next()
            .unwrap()
            .trim_start_matches("oauth-")
            .to_string();

        let response = router
            .oneshot(
                Request::get(format!("/auth/github/callback?code=abc&state={}", state))
                    .header(header::COOKIE, state_cookie)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(
            response.headers()[header::LOCATION],
            "http://localhost:3000/settings"
        );
        let user = ctx
            .accounts
            .find_by_email("new@example.com")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ctx.sessions.list_sessions(&user.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_sign_out_deletes_session() {
        let (ctx, router) = app().await;
        let alice = insert_user(&ctx.db, "alice@example.com", UserRole::User).await;
        let cookie = signed_in(&ctx, &alice, "10.0.0.1").await;

        let response = router
            .oneshot(
                Request::post("/auth/sign-out")
                    .header(header::COOKIE, cookie)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert!(ctx.sessions.list_sessions(&alice.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_impersonation_start_and_stop() {
        let (ctx, router) = app().await;
        let admin = insert_user(&ctx.db, "admin@example.com", UserRole::Admin).await;
        let bob = insert_user(&ctx.db, "bob@example.com", UserRole::User).await;
        let admin_cookie = signed_in(&ctx, &admin, "127.0.0.1").await;

        let response = router
            .clone()
            .oneshot(from_peer(
                Request::post(format!("/auth/impersonation/start?targetUserId={}", bob.id))
                    .header(header::COOKIE, admin_cookie)
                    .body(Body::empty())
                    .unwrap(),
                [127, 0, 0, 1],
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let sessions = ctx.sessions.list_sessions(&bob.id).await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].session_type, SessionType::Impersonation);
        assert!(ctx.sessions.list_sessions(&admin.id).await.unwrap().is_empty());

        let impersonation_cookie = cookie_header(
            &ctx,
            SESSION_COOKIE,
            &ParsedSessionCookie::encode(&sessions[0].token, Some(&admin.id)),
        );
        let response = router
            .oneshot(from_peer(
                Request::post("/auth/impersonation/stop")
                    .header(header::COOKIE, impersonation_cookie)
                    .body(Body::empty())
                    .unwrap(),
                [127, 0, 0, 1],
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(ctx.sessions.list_sessions(&bob.id).await.unwrap().is_empty());
        assert_eq!(ctx.sessions.list_sessions(&admin.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_spoofed_forwarded_for_cannot_pass_ip_allow_list() {
        let (ctx, router) = app().await;
        let admin = insert_user(&ctx.db, "admin@example.com", UserRole::Admin).await;
        let bob = insert_user(&ctx.db, "bob@example.com", UserRole::User).await;
        let admin_cookie = signed_in(&ctx, &admin, "127.0.0.1").await;

        let response = router
            .oneshot(from_peer(
                Request::post(format!("/auth/impersonation/start?targetUserId={}", bob.id))
                    .header(header::COOKIE, admin_cookie)
                    .header("x-forwarded-for", "127.0.0.1")
                    .body(Body::empty())
                    .unwrap(),
                [9, 9, 9, 9],
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert!(ctx.sessions.list_sessions(&bob.id).await.unwrap().is_empty());
        assert_eq!(ctx.sessions.list_sessions(&admin.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_impersonation_requires_admin() {
        let (ctx, router) = app().await;
        let alice = insert_user(&ctx.db, "alice@example.com", UserRole::User).await;
        let bob = insert_user(&ctx.db, "bob@example.com", UserRole::User).await;
        let cookie = signed_in(&ctx, &alice, "10.0.0.1").await;

        let response = router
            .oneshot(
                Request::post(format!("/auth/impersonation/start?targetUserId={}", bob.id))
                    .header(header::COOKIE, cookie)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let body = json_body(response).await;
        assert_eq!(body["type"], "forbidden");
        assert_eq!(body["userId"], alice.id.as_str());
    }

    #[tokio::test]
    async fn test_organization_lifecycle_over_http() {
        let (ctx, router) = app().await;
        let alice = insert_user(&ctx.db, "alice@example.com", UserRole::User).await;
        let bob = insert_user(&ctx.db, "bob@example.com", UserRole::User).await;
        let alice_cookie = signed_in(&ctx, &alice, "10.0.0.1").await;
        let bob_cookie = signed_in(&ctx, &bob, "10.0.0.2").await;

        let response = router
            .clone()
            .oneshot(
                Request::post("/organizations")
                    .header(header::COOKIE, alice_cookie.clone())
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"name":"Acme","slug":"acme"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = router
            .clone()
            .oneshot(
                Request::get("/organizations/acme/memberships")
                    .header(header::COOKIE, alice_cookie)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body.as_array().unwrap().len(), 1);

        let response = router
            .oneshot(
                Request::get("/organizations/acme")
                    .header(header::COOKIE, bob_cookie)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let body = json_body(response).await;
        assert!(body["organizationId"].is_string());
    }

    #[tokio::test]
    async fn test_tampered_cookie_is_unauthorized() {
        let (_, router) = app().await;
        let forged = format!("{}={}.", SESSION_COOKIE, hash_token("forged"));

        let response = router
            .oneshot(
                Request::get("/me")
                    .header(header::COOKIE, forged)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
