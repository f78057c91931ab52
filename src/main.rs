/// SaaS backend - multi-tenant sessions, OAuth sign-in and organizations
///
/// Cookie sessions issued through OAuth providers, organizations with
/// invitation-based memberships, and a change feed that streams enriched
/// membership activity to clients.

mod account;
mod api;
mod auth;
mod cdc;
mod config;
mod context;
mod crypto;
mod db;
mod error;
mod mailer;
mod oauth;
mod organization;
// Client-side cache reconciliation; no route calls into it
#[allow(dead_code)]
mod query;
mod rate_limit;
mod server;
mod session;
mod token;

use config::{Mode, ServerConfig};
use context::AppContext;
use error::AppResult;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> AppResult<()> {
    // Load configuration (reads .env first)
    let config = ServerConfig::from_env()?;

    init_tracing(&config);

    // Exception reporting stays a no-op without a DSN
    let _sentry = config.sentry_dsn.as_deref().filter(|dsn| !dsn.is_empty()).map(|dsn| {
        sentry::init((
            dsn,
            sentry::ClientOptions {
                release: sentry::release_name!(),
                environment: Some(
                    match config.service.mode {
                        Mode::Development => "development",
                        Mode::Production => "production",
                    }
                    .into(),
                ),
                ..Default::default()
            },
        ))
    });

    let ctx = AppContext::new(config).await?;

    server::serve(ctx).await?;

    Ok(())
}

fn init_tracing(config: &ServerConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone()));

    let registry = tracing_subscriber::registry().with(filter);
    if config.logging.json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
