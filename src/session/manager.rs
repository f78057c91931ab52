/// Session manager: issues, validates and revokes cookie sessions
use super::cookie::{session_cookie, ParsedSessionCookie};
use super::device::DeviceInfo;
use crate::{
    config::IpAllowList,
    crypto::{generate_id, generate_token, hash_token, SESSION_TOKEN_LENGTH},
    db::models::{AuthStrategy, Session, SessionType, User},
    error::{AppError, AppResult},
};
use axum_extra::extract::cookie::Cookie;
use chrono::{Duration, Utc};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};

/// Caller facts needed to issue a session
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub client_ip: String,
    pub device: DeviceInfo,
    /// Admin driving an impersonation session
    pub acting_admin_id: Option<String>,
}

/// A freshly stored session and the cookie that carries it
#[derive(Debug)]
pub struct IssuedSession {
    pub session: Session,
    pub cookie: Cookie<'static>,
}

/// Session manager service
pub struct SessionManager {
    db: SqlitePool,
    allow_list: IpAllowList,
    secure_cookies: bool,
}

impl SessionManager {
    pub fn new(db: SqlitePool, allow_list: IpAllowList, secure_cookies: bool) -> Self {
        Self {
            db,
            allow_list,
            secure_cookies,
        }
    }

    /// Lifetime of a session of the given type
    pub fn lifetime(session_type: SessionType) -> Duration {
        match session_type {
            SessionType::Impersonation => Duration::hours(1),
            _ => Duration::weeks(1),
        }
    }

    /// Create a session for `user` and build its cookie
    pub async fn set_user_session(
        &self,
        request: &SessionRequest,
        user: &User,
        strategy: AuthStrategy,
        session_type: SessionType,
    ) -> AppResult<IssuedSession> {
        let impersonating = session_type == SessionType::Impersonation;

        if (user.is_admin() || impersonating) && !self.allow_list.allows(&request.client_ip) {
            tracing::warn!(
                user_id = %user.id,
                client_ip = %request.client_ip,
                session_type = ?session_type,
                "System access denied for client IP"
            );
            return Err(AppError::forbidden()
                .with_message("System access is not allowed from this IP address"));
        }

        let acting_admin_id = if impersonating {
            Some(request.acting_admin_id.as_deref().ok_or_else(|| {
                AppError::forbidden().with_message("Impersonation requires an acting admin")
            })?)
        } else {
            None
        };

        let hashed_token = hash_token(&generate_token(SESSION_TOKEN_LENGTH));
        let created_at = Utc::now();
        let lifetime = Self::lifetime(session_type);

        let session = Session {
            id: generate_id(),
            token: hashed_token,
            user_id: user.id.clone(),
            session_type,
            device_name: request.device.name.clone(),
            device_type: request.device.device_type,
            device_os: request.device.os.clone(),
            browser: request.device.browser.clone(),
            auth_strategy: strategy,
            created_at,
            expires_at: created_at + lifetime,
        };

        sqlx::query(
            "INSERT INTO sessions
                 (id, token, user_id, type, device_name, device_type, device_os, browser,
                  auth_strategy, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        )
        .bind(&session.id)
        .bind(&session.token)
        .bind(&session.user_id)
        .bind(session.session_type)
        .bind(&session.device_name)
        .bind(session.device_type)
        .bind(&session.device_os)
        .bind(&session.browser)
        .bind(session.auth_strategy)
        .bind(session.created_at)
        .bind(session.expires_at)
        .execute(&self.db)
        .await?;

        let cookie = session_cookie(
            ParsedSessionCookie::encode(&session.token, acting_admin_id),
            lifetime,
            self.secure_cookies,
        );

        if impersonating {
            return Ok(IssuedSession { session, cookie });
        }

        sqlx::query("UPDATE users SET last_sign_in_at = ?1 WHERE id = ?2")
            .bind(created_at)
            .bind(&user.id)
            .execute(&self.db)
            .await?;

        tracing::info!(
            user_id = %user.id,
            strategy = %strategy,
            device = session.device_name.as_deref(),
            "User signed in"
        );

        Ok(IssuedSession { session, cookie })
    }

    /// Look up a session and its user by hashed token.
    ///
    /// Expired sessions fail; there is no sliding renewal.
    pub async fn validate_session(&self, hashed_token: &str) -> AppResult<(Session, User)> {
        let row = sqlx::query(
            "SELECT s.id, s.token, s.user_id, s.type, s.device_name, s.device_type, s.device_os,
                    s.browser, s.auth_strategy, s.created_at, s.expires_at,
                    u.email, u.name, u.avatar_url, u.role, u.email_verified,
                    u.last_sign_in_at, u.created_at AS user_created_at
             FROM sessions s
             JOIN users u ON u.id = s.user_id
             WHERE s.token = ?1",
        )
        .bind(hashed_token)
        .fetch_optional(&self.db)
        .await?
        .ok_or_else(AppError::no_session)?;

        let session = Session {
            id: row.try_get("id")?,
            token: row.try_get("token")?,
            user_id: row.try_get("user_id")?,
            session_type: row.try_get("type")?,
            device_name: row.try_get("device_name")?,
            device_type: row.try_get("device_type")?,
            device_os: row.try_get("device_os")?,
            browser: row.try_get("browser")?,
            auth_strategy: row.try_get("auth_strategy")?,
            created_at: row.try_get("created_at")?,
            expires_at: row.try_get("expires_at")?,
        };

        if session.expires_at < Utc::now() {
            return Err(AppError::session_expired());
        }

        let user = User {
            id: session.user_id.clone(),
            email: row.try_get("email")?,
            name: row.try_get("name")?,
            avatar_url: row.try_get("avatar_url")?,
            role: row.try_get("role")?,
            email_verified: row.try_get("email_verified")?,
            last_sign_in_at: row.try_get("last_sign_in_at")?,
            created_at: row.try_get("user_created_at")?,
        };

        Ok((session, user))
    }

    /// Delete a session by hashed token; returns whether one existed
    pub async fn delete_session(&self, hashed_token: &str) -> AppResult<bool> {
        let result = sqlx::query("DELETE FROM sessions WHERE token = ?1")
            .bind(hashed_token)
            .execute(&self.db)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// All sessions of a user, newest first
    pub async fn list_sessions(&self, user_id: &str) -> AppResult<Vec<Session>> {
        let sessions = sqlx::query_as::<_, Session>(
            "SELECT * FROM sessions WHERE user_id = ?1 ORDER BY created_at DESC",
        )
        .bind(user_id)
        .fetch_all(&self.db)
        .await?;

        Ok(sessions)
    }

    /// Delete the given sessions of one user; ids of other users' sessions are ignored
    pub async fn delete_sessions(&self, user_id: &str, ids: &[String]) -> AppResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut query: QueryBuilder<Sqlite> =
            QueryBuilder::new("DELETE FROM sessions WHERE user_id = ");
        query.push_bind(user_id).push(" AND id IN (");
        let mut separated = query.separated(", ");
        for id in ids {
            separated.push_bind(id);
        }
        separated.push_unseparated(")");

        let result = query.build().execute(&self.db).await?;
        Ok(result.rows_affected())
    }
}
