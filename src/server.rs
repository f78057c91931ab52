/// HTTP server setup and routing
use crate::{
    api::middleware::{handle_errors, handle_panic},
    context::AppContext,
    error::{AppError, AppResult},
};
use axum::{
    http::{header, HeaderValue, Method},
    middleware,
    Router,
};
use std::net::SocketAddr;
use tower_http::{
    catch_panic::CatchPanicLayer,
    compression::CompressionLayer,
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;

/// Build the main application router
/// Returns Router<()> because state is already provided
pub fn build_router(ctx: AppContext) -> Router {
    let origins: Vec<HeaderValue> = ctx
        .config
        .service
        .cors_origins
        .iter()
        .filter_map(|origin| HeaderValue::from_str(origin).ok())
        .collect();

    // Cookies need credentialed CORS, which rules out a wildcard origin
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_credentials(true)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .merge(crate::api::routes(ctx.clone()))
        .fallback(not_found)
        .with_state(ctx.clone())
        // Panics become error reports before the error middleware sees them
        .layer(CatchPanicLayer::custom(handle_panic))
        .layer(middleware::from_fn_with_state(ctx, handle_errors))
        .layer(cors)
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
}

/// 404 handler
async fn not_found() -> AppError {
    AppError::not_found("route").with_message("Endpoint not found")
}

/// Start the HTTP server
pub async fn serve(ctx: AppContext) -> AppResult<()> {
    let addr = format!("{}:{}", ctx.config.service.hostname, ctx.config.service.port);

    info!("{} listening on {}", ctx.config.service.app_name, addr);
    info!("   Frontend URL: {}", ctx.config.service.frontend_url);
    info!("   Backend URL: {}", ctx.config.service.backend_url);

    let app = build_router(ctx);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| AppError::internal(format!("Failed to bind to {}: {}", addr, e)))?;

    // Connect info feeds the client IP extractor
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .map_err(|e| AppError::internal(format!("Server error: {}", e)))?;

    Ok(())
}
