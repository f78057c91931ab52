/// Application context and dependency injection
use crate::{
    account::AccountManager,
    cdc::{ChangeFeed, MembershipEnricher},
    config::ServerConfig,
    db,
    error::{AppError, AppResult},
    mailer::Mailer,
    oauth::{HttpOAuthClient, OAuthExchange},
    organization::OrganizationManager,
    rate_limit::RateLimiter,
    session::SessionManager,
    token::TokenManager,
};
use axum::extract::FromRef;
use axum_extra::extract::cookie::Key;
use sqlx::SqlitePool;
use std::{sync::Arc, time::Duration};

/// Application context holding all shared services
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<ServerConfig>,
    pub db: SqlitePool,
    pub cookie_key: Key,
    pub accounts: Arc<AccountManager>,
    pub sessions: Arc<SessionManager>,
    pub tokens: Arc<TokenManager>,
    pub organizations: Arc<OrganizationManager>,
    pub oauth_client: Arc<dyn OAuthExchange>,
    // Membership change feed
    pub change_feed: ChangeFeed,
    pub rate_limiter: RateLimiter,
    pub mailer: Arc<Mailer>,
}

impl AppContext {
    /// Create a new application context from configuration
    pub async fn new(config: ServerConfig) -> AppResult<Self> {
        config.validate()?;

        if !config.storage.data_directory.exists() {
            tokio::fs::create_dir_all(&config.storage.data_directory).await?;
        }

        let db = db::create_pool(&config.storage.database, db::DatabaseOptions::default()).await?;
        db::run_migrations(&db).await?;
        db::test_connection(&db).await?;

        let oauth_client = Arc::new(HttpOAuthClient::new(
            config.authentication.oauth.clone(),
            config.service.backend_url.clone(),
        ));

        Self::from_parts(config, db, oauth_client)
    }

    /// Wire services around an existing pool; spawns the CDC worker
    pub fn from_parts(
        config: ServerConfig,
        db: SqlitePool,
        oauth_client: Arc<dyn OAuthExchange>,
    ) -> AppResult<Self> {
        let cookie_key = Key::try_from(config.authentication.cookie_secret.as_bytes())
            .map_err(|e| AppError::config(format!("Invalid cookie secret: {}", e)))?;

        let mailer = Mailer::new(config.email.clone(), config.service.app_name.clone())?;
        if !mailer.is_configured() {
            tracing::warn!("SMTP not configured, invitation emails will not be sent");
        }

        let enricher = Arc::new(MembershipEnricher::new(
            db.clone(),
            config.cdc.cache_max_size,
            Duration::from_secs(config.cdc.cache_ttl_secs),
        ));
        let change_feed = ChangeFeed::start(enricher);

        let accounts = Arc::new(AccountManager::new(
            db.clone(),
            config.authentication.admin_emails.clone(),
        ));
        let sessions = Arc::new(SessionManager::new(
            db.clone(),
            config.authentication.remote_system_access_ips.clone(),
            config.authentication.secure_cookies,
        ));
        let tokens = Arc::new(TokenManager::new(db.clone()));
        let organizations = Arc::new(OrganizationManager::new(
            db.clone(),
            tokens.clone(),
            mailer.clone(),
            change_feed.clone(),
            config.service.frontend_url.clone(),
        ));

        Ok(Self {
            rate_limiter: RateLimiter::new(&config.rate_limit),
            config: Arc::new(config),
            db,
            cookie_key,
            accounts,
            sessions,
            tokens,
            organizations,
            oauth_client,
            change_feed,
            mailer: Arc::new(mailer),
        })
    }
}

impl FromRef<AppContext> for Key {
    fn from_ref(ctx: &AppContext) -> Self {
        ctx.cookie_key.clone()
    }
}

#[cfg(test)]
impl AppContext {
    /// Context over an in-memory database with a fake OAuth provider
    pub async fn for_tests(oauth_client: Arc<dyn OAuthExchange>) -> Self {
        let db = crate::db::testing::test_pool().await;
        Self::from_parts(ServerConfig::for_tests(), db, oauth_client).unwrap()
    }
}
