/// Per-IP rate limiting for the sign-in routes
use crate::{
    api::middleware::ClientIp,
    config::RateLimitConfig,
    context::AppContext,
    error::{AppError, AppResult},
};
use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use governor::{DefaultKeyedRateLimiter, Quota};
use std::{num::NonZeroU32, sync::Arc};

const DEFAULT_AUTH_REQUESTS_PER_MINUTE: NonZeroU32 = match NonZeroU32::new(30) {
    Some(n) => n,
    None => unreachable!(),
};

/// Rate limiter manager; disabled limiters let everything through
#[derive(Clone)]
pub struct RateLimiter {
    auth: Option<Arc<DefaultKeyedRateLimiter<String>>>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        if !config.enabled {
            return Self { auth: None };
        }

        let per_minute = NonZeroU32::new(config.auth_requests_per_minute)
            .unwrap_or(DEFAULT_AUTH_REQUESTS_PER_MINUTE);

        Self {
            auth: Some(Arc::new(DefaultKeyedRateLimiter::keyed(Quota::per_minute(
                per_minute,
            )))),
        }
    }

    /// Check the sign-in limit for a client IP
    pub fn check_auth(&self, client_ip: &str) -> AppResult<()> {
        let Some(limiter) = &self.auth else {
            return Ok(());
        };

        limiter
            .check_key(&client_ip.to_string())
            .map_err(|_| AppError::too_many_requests())?;

        // Keep the keyed state from growing with every IP ever seen
        if limiter.len() > 10_000 {
            limiter.retain_recent();
        }
        Ok(())
    }
}

/// Rate limiting middleware for `/auth` routes
pub async fn limit_auth_requests(
    State(ctx): State<AppContext>,
    ClientIp(client_ip): ClientIp,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    if let Err(e) = ctx.rate_limiter.check_auth(&client_ip) {
        tracing::warn!(
            client_ip = %client_ip,
            path = %request.uri().path(),
            "Auth rate limit exceeded"
        );
        return Err(e);
    }

    Ok(next.run(request).await)
}
