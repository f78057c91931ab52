/// Request-scoped state, client IP extraction and the global error middleware
use crate::{
    config::IpAllowList,
    context::AppContext,
    error::{render_error, ErrorReport, RequestInfo},
    session::{device_info, SessionRequest},
};
use axum::{
    async_trait,
    extract::{ConnectInfo, FromRequestParts, Request, State},
    http::{request::Parts, HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::{
    any::Any,
    convert::Infallible,
    net::{IpAddr, SocketAddr},
    sync::{Arc, Mutex},
};

#[derive(Debug, Default)]
struct ScopeInfo {
    user_id: Option<String>,
    organization_id: Option<String>,
}

/// Who the current request acts as, filled in by extractors and read by the
/// error middleware after the handler returns
#[derive(Debug, Clone, Default)]
pub struct RequestScope(Arc<Mutex<ScopeInfo>>);

impl RequestScope {
    pub fn set_user(&self, user_id: &str) {
        if let Ok(mut scope) = self.0.lock() {
            scope.user_id = Some(user_id.to_string());
        }
    }

    pub fn set_organization(&self, organization_id: &str) {
        if let Ok(mut scope) = self.0.lock() {
            scope.organization_id = Some(organization_id.to_string());
        }
    }

    fn snapshot(&self) -> (Option<String>, Option<String>) {
        match self.0.lock() {
            Ok(scope) => (scope.user_id.clone(), scope.organization_id.clone()),
            Err(_) => (None, None),
        }
    }
}

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for RequestScope {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(parts
            .extensions
            .get::<RequestScope>()
            .cloned()
            .unwrap_or_default())
    }
}

/// Client IP of the request.
///
/// The peer address is used unless that peer is a trusted proxy, in which case
/// the right-most `X-Forwarded-For` hop that is not itself a trusted proxy wins.
#[derive(Debug, Clone)]
pub struct ClientIp(pub String);

#[async_trait]
impl FromRequestParts<AppContext> for ClientIp {
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        ctx: &AppContext,
    ) -> Result<Self, Self::Rejection> {
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip());

        Ok(ClientIp(resolve_client_ip(
            &parts.headers,
            peer,
            &ctx.config.authentication.trusted_proxies,
        )))
    }
}

pub fn resolve_client_ip(
    headers: &HeaderMap,
    peer: Option<IpAddr>,
    trusted_proxies: &IpAllowList,
) -> String {
    let Some(peer) = peer.map(|ip| ip.to_string()) else {
        return "unknown".to_string();
    };
    if !trusted_proxies.allows(&peer) {
        return peer;
    }

    let hops: Vec<&str> = headers
        .get_all("x-forwarded-for")
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .filter(|hop| !hop.is_empty())
        .collect();

    hops.iter()
        .rev()
        .find(|hop| !trusted_proxies.allows(hop))
        .or_else(|| hops.first())
        .map(|hop| hop.to_string())
        .unwrap_or(peer)
}

/// Caller facts for issuing a session
pub fn session_request(
    headers: &HeaderMap,
    client_ip: String,
    acting_admin_id: Option<String>,
) -> SessionRequest {
    SessionRequest {
        client_ip,
        device: device_info(headers),
        acting_admin_id,
    }
}

/// Render every error response in one place.
///
/// Handlers return [`crate::error::AppError`]s, which leave an
/// [`ErrorReport`] in the response extensions; this middleware turns it into
/// the final JSON body or redirect.
pub async fn handle_errors(
    State(ctx): State<AppContext>,
    mut request: Request,
    next: Next,
) -> Response {
    let scope = RequestScope::default();
    request.extensions_mut().insert(scope.clone());
    let method = request.method().to_string();
    let path = request.uri().path().to_string();

    let mut response = next.run(request).await;
    let Some(report) = response.extensions_mut().remove::<ErrorReport>() else {
        return response;
    };

    let (user_id, organization_id) = scope.snapshot();
    let info = RequestInfo {
        method,
        path,
        user_id,
        organization_id,
    };

    render_error(
        &report,
        &info,
        &ctx.config.service.frontend_url,
        ctx.config.is_development(),
        response.headers(),
    )
}

/// Panic handler for `CatchPanicLayer`; the error middleware renders the report
pub fn handle_panic(err: Box<dyn Any + Send + 'static>) -> Response {
    let message = if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = err.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "Handler panicked".to_string()
    };

    let mut response = StatusCode::INTERNAL_SERVER_ERROR.into_response();
    response
        .extensions_mut()
        .insert(ErrorReport::panic(format!("Handler panicked: {}", message)));
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    fn forwarded(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", value.parse().unwrap());
        headers
    }

    fn peer(ip: &str) -> Option<IpAddr> {
        Some(ip.parse().unwrap())
    }

    #[test]
    fn test_forwarded_for_ignored_from_untrusted_peer() {
        let headers = forwarded("127.0.0.1");
        let ip = resolve_client_ip(&headers, peer("9.9.9.9"), &IpAllowList::parse(""));
        assert_eq!(ip, "9.9.9.9");
    }

    #[test]
    fn test_trusted_proxy_yields_rightmost_untrusted_hop() {
        let trusted = IpAllowList::parse("10.0.0.1,10.0.0.2");
        let headers = forwarded("127.0.0.1, 203.0.113.7, 10.0.0.2");
        let ip = resolve_client_ip(&headers, peer("10.0.0.1"), &trusted);
        assert_eq!(ip, "203.0.113.7");

        let headers = forwarded("10.0.0.2");
        assert_eq!(resolve_client_ip(&headers, peer("10.0.0.1"), &trusted), "10.0.0.2");
    }

    #[test]
    fn test_trusted_proxy_without_header_is_the_client() {
        let trusted = IpAllowList::parse("10.0.0.1");
        let ip = resolve_client_ip(&HeaderMap::new(), peer("10.0.0.1"), &trusted);
        assert_eq!(ip, "10.0.0.1");
    }

    #[test]
    fn test_missing_peer_is_unknown() {
        let headers = forwarded("127.0.0.1");
        assert_eq!(resolve_client_ip(&headers, None, &IpAllowList::Any), "unknown");
    }

    #[test]
    fn test_scope_records_user_and_organization() {
        let scope = RequestScope::default();
        let shared = scope.clone();
        shared.set_user("u1");
        shared.set_organization("o1");
        assert_eq!(
            scope.snapshot(),
            (Some("u1".to_string()), Some("o1".to_string()))
        );
    }

    #[test]
    fn test_panic_response_carries_fatal_report() {
        let response = handle_panic(Box::new("boom"));
        let report = response.extensions().get::<ErrorReport>().unwrap();
        assert_eq!(report.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(report.message.contains("boom"));
    }
}
