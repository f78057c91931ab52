/// Configuration management for the SaaS backend
use crate::error::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;

/// Main server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub service: ServiceConfig,
    pub storage: StorageConfig,
    pub authentication: AuthConfig,
    pub email: Option<EmailConfig>,
    pub cdc: CdcConfig,
    pub rate_limit: RateLimitConfig,
    pub logging: LoggingConfig,
    pub sentry_dsn: Option<String>,
}

/// Runtime mode, controls how much detail error bodies expose
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Development,
    Production,
}

/// Service-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub hostname: String,
    pub port: u16,
    pub mode: Mode,
    pub app_name: String,
    /// Public URL of the single-page frontend, used for browser redirects
    pub frontend_url: String,
    /// Public URL of this API, used to build OAuth callback URLs
    pub backend_url: String,
    pub cors_origins: Vec<String>,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub data_directory: PathBuf,
    pub database: PathBuf,
}

/// Authentication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Secret used to sign cookies (at least 64 bytes)
    pub cookie_secret: String,
    pub secure_cookies: bool,
    /// IPs allowed to open admin and impersonation sessions
    pub remote_system_access_ips: IpAllowList,
    /// Peers whose `X-Forwarded-For` header is honoured; empty trusts nobody
    pub trusted_proxies: IpAllowList,
    /// Emails that become system admins on sign-up
    pub admin_emails: Vec<String>,
    pub default_redirect_path: String,
    pub oauth: OAuthProvidersConfig,
}

/// Credentials for the supported OAuth providers
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OAuthProvidersConfig {
    pub github: Option<OAuthClientConfig>,
    pub google: Option<OAuthClientConfig>,
    pub microsoft: Option<OAuthClientConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthClientConfig {
    pub client_id: String,
    pub client_secret: String,
}

/// List of IPs, used for system access and trusted proxies
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IpAllowList {
    Any,
    Only(Vec<String>),
}

impl IpAllowList {
    /// Parse a comma-separated list; `*` anywhere in the list allows every IP
    pub fn parse(raw: &str) -> Self {
        let entries: Vec<String> = raw
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        if entries.iter().any(|e| e == "*") {
            IpAllowList::Any
        } else {
            IpAllowList::Only(entries)
        }
    }

    pub fn allows(&self, ip: &str) -> bool {
        match self {
            IpAllowList::Any => true,
            IpAllowList::Only(ips) => ips.iter().any(|allowed| allowed == ip),
        }
    }
}

/// Email configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailConfig {
    pub smtp_url: String,
    pub from_address: String,
}

/// Change-data-capture enrichment cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CdcConfig {
    pub cache_max_size: usize,
    pub cache_ttl_secs: u64,
}

/// Rate limiting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub auth_requests_per_minute: u32,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl ServerConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> AppResult<Self> {
        dotenv::dotenv().ok();

        let hostname = env::var("HOSTNAME").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = env::var("PORT")
            .unwrap_or_else(|_| "4000".to_string())
            .parse()
            .map_err(|_| AppError::config("Invalid port number"))?;
        let mode = match env::var("NODE_ENV")
            .or_else(|_| env::var("APP_MODE"))
            .unwrap_or_else(|_| "development".to_string())
            .as_str()
        {
            "production" => Mode::Production,
            _ => Mode::Development,
        };
        let app_name = env::var("APP_NAME").unwrap_or_else(|_| "SaaS".to_string());
        let frontend_url =
            env::var("FRONTEND_URL").unwrap_or_else(|_| "http://localhost:3000".to_string());
        let backend_url =
            env::var("BACKEND_URL").unwrap_or_else(|_| format!("http://localhost:{}", port));
        let cors_origins = env::var("CORS_ORIGINS")
            .unwrap_or_else(|_| frontend_url.clone())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let data_directory: PathBuf = env::var("DATA_DIRECTORY")
            .unwrap_or_else(|_| "./data".to_string())
            .into();
        let database = env::var("DATABASE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_directory.join("app.sqlite"));

        let cookie_secret = env::var("COOKIE_SECRET")
            .map_err(|_| AppError::config("COOKIE_SECRET required"))?;
        let secure_cookies = env::var("SECURE_COOKIES")
            .map(|v| v == "true")
            .unwrap_or(mode == Mode::Production);
        let remote_system_access_ips =
            IpAllowList::parse(&env::var("REMOTE_SYSTEM_ACCESS_IP").unwrap_or_default());
        let trusted_proxies =
            IpAllowList::parse(&env::var("TRUSTED_PROXIES").unwrap_or_default());
        let admin_emails = env::var("ADMIN_EMAILS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .collect();
        let default_redirect_path =
            env::var("DEFAULT_REDIRECT_PATH").unwrap_or_else(|_| "/home".to_string());

        let oauth = OAuthProvidersConfig {
            github: oauth_client_from_env("GITHUB"),
            google: oauth_client_from_env("GOOGLE"),
            microsoft: oauth_client_from_env("MICROSOFT"),
        };

        let email = if let Ok(smtp_url) = env::var("EMAIL_SMTP_URL") {
            Some(EmailConfig {
                smtp_url,
                from_address: env::var("EMAIL_FROM_ADDRESS")
                    .unwrap_or_else(|_| "noreply@localhost".to_string()),
            })
        } else {
            None
        };

        let cache_max_size = env::var("CDC_CACHE_MAX_SIZE")
            .unwrap_or_else(|_| "1000".to_string())
            .parse()
            .unwrap_or(1000);
        let cache_ttl_secs = env::var("CDC_CACHE_TTL")
            .unwrap_or_else(|_| "300".to_string())
            .parse()
            .unwrap_or(300);

        let rate_limit_enabled = env::var("RATE_LIMITS_ENABLED")
            .unwrap_or_else(|_| "true".to_string())
            .parse()
            .unwrap_or(true);
        let auth_requests_per_minute = env::var("RATE_LIMIT_AUTH_REQUESTS_PER_MINUTE")
            .unwrap_or_else(|_| "30".to_string())
            .parse()
            .unwrap_or(30);

        let log_level = env::var("RUST_LOG")
            .unwrap_or_else(|_| "saas_backend=debug,tower_http=info".to_string());
        let log_json = env::var("LOG_FORMAT").map(|v| v == "json").unwrap_or(false);

        Ok(ServerConfig {
            service: ServiceConfig {
                hostname,
                port,
                mode,
                app_name,
                frontend_url,
                backend_url,
                cors_origins,
            },
            storage: StorageConfig {
                data_directory,
                database,
            },
            authentication: AuthConfig {
                cookie_secret,
                secure_cookies,
                remote_system_access_ips,
                trusted_proxies,
                admin_emails,
                default_redirect_path,
                oauth,
            },
            email,
            cdc: CdcConfig {
                cache_max_size,
                cache_ttl_secs,
            },
            rate_limit: RateLimitConfig {
                enabled: rate_limit_enabled,
                auth_requests_per_minute,
            },
            logging: LoggingConfig {
                level: log_level,
                json: log_json,
            },
            sentry_dsn: env::var("SENTRY_DSN").ok().filter(|s| !s.is_empty()),
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> AppResult<()> {
        if self.service.hostname.is_empty() {
            return Err(AppError::config("Hostname cannot be empty"));
        }

        if self.authentication.cookie_secret.len() < 64 {
            return Err(AppError::config(
                "COOKIE_SECRET must be at least 64 characters",
            ));
        }

        for url in [&self.service.frontend_url, &self.service.backend_url] {
            reqwest::Url::parse(url)
                .map_err(|e| AppError::config(format!("Invalid URL {}: {}", url, e)))?;
        }

        if !self.authentication.default_redirect_path.starts_with('/') {
            return Err(AppError::config("DEFAULT_REDIRECT_PATH must start with '/'"));
        }

        Ok(())
    }

    pub fn is_development(&self) -> bool {
        self.service.mode == Mode::Development
    }
}

fn oauth_client_from_env(prefix: &str) -> Option<OAuthClientConfig> {
    let client_id = env::var(format!("{}_CLIENT_ID", prefix)).ok()?;
    let client_secret = env::var(format!("{}_CLIENT_SECRET", prefix)).ok()?;
    Some(OAuthClientConfig {
        client_id,
        client_secret,
    })
}

#[cfg(test)]
impl ServerConfig {
    /// Minimal configuration used by unit tests
    pub fn for_tests() -> Self {
        ServerConfig {
            service: ServiceConfig {
                hostname: "localhost".to_string(),
                port: 4000,
                mode: Mode::Development,
                app_name: "Test".to_string(),
                frontend_url: "http://localhost:3000".to_string(),
                backend_url: "http://localhost:4000".to_string(),
                cors_origins: vec!["http://localhost:3000".to_string()],
            },
            storage: StorageConfig {
                data_directory: PathBuf::from("./data"),
                database: PathBuf::from(":memory:"),
            },
            authentication: AuthConfig {
                cookie_secret: "test-cookie-secret-".repeat(4),
                secure_cookies: false,
                remote_system_access_ips: IpAllowList::parse("127.0.0.1"),
                trusted_proxies: IpAllowList::parse(""),
                admin_emails: vec!["admin@example.com".to_string()],
                default_redirect_path: "/home".to_string(),
                oauth: OAuthProvidersConfig {
                    github: Some(OAuthClientConfig {
                        client_id: "github-client".to_string(),
                        client_secret: "github-secret".to_string(),
                    }),
                    google: Some(OAuthClientConfig {
                        client_id: "google-client".to_string(),
                        client_secret: "google-secret".to_string(),
                    }),
                    microsoft: None,
                },
            },
            email: None,
            cdc: CdcConfig {
                cache_max_size: 100,
                cache_ttl_secs: 60,
            },
            rate_limit: RateLimitConfig {
                enabled: false,
                auth_requests_per_minute: 30,
            },
            logging: LoggingConfig {
                level: "debug".to_string(),
                json: false,
            },
            sentry_dsn: None,
        }
    }
}
