/// Account manager implementation using runtime queries
use crate::{
    crypto::generate_id,
    db::models::{AuthStrategy, User, UserRole},
    error::{AppError, AppResult},
};
use chrono::Utc;
use sqlx::SqlitePool;

/// Profile facts needed to create a user
#[derive(Debug, Clone)]
pub struct NewUser {
    pub email: String,
    pub name: Option<String>,
    pub avatar_url: Option<String>,
    pub email_verified: bool,
}

/// Account manager service
pub struct AccountManager {
    db: SqlitePool,
    admin_emails: Vec<String>,
}

impl AccountManager {
    pub fn new(db: SqlitePool, admin_emails: Vec<String>) -> Self {
        Self { db, admin_emails }
    }

    pub async fn get_user(&self, id: &str) -> AppResult<User> {
        sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.db)
            .await?
            .ok_or_else(|| AppError::not_found("user"))
    }

    pub async fn find_by_email(&self, email: &str) -> AppResult<Option<User>> {
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE email = ?1")
            .bind(email.to_lowercase())
            .fetch_optional(&self.db)
            .await?;

        Ok(user)
    }

    /// User linked to a provider account, if any
    pub async fn find_by_oauth(
        &self,
        provider: AuthStrategy,
        provider_user_id: &str,
    ) -> AppResult<Option<User>> {
        let user = sqlx::query_as::<_, User>(
            "SELECT u.* FROM users u
             JOIN oauth_accounts o ON o.user_id = u.id
             WHERE o.provider = ?1 AND o.provider_user_id = ?2",
        )
        .bind(provider)
        .bind(provider_user_id)
        .fetch_optional(&self.db)
        .await?;

        Ok(user)
    }

    /// Link a provider account to a user.
    ///
    /// Linking an account that already belongs to another user fails with
    /// `oauth_conflict`; relinking to the same user is a no-op.
    pub async fn link_oauth_account(
        &self,
        user_id: &str,
        provider: AuthStrategy,
        provider_user_id: &str,
        email: Option<&str>,
    ) -> AppResult<()> {
        let owner: Option<String> = sqlx::query_scalar(
            "SELECT user_id FROM oauth_accounts WHERE provider = ?1 AND provider_user_id = ?2",
        )
        .bind(provider)
        .bind(provider_user_id)
        .fetch_optional(&self.db)
        .await?;

        match owner {
            Some(owner) if owner == user_id => return Ok(()),
            Some(_) => return Err(AppError::oauth_conflict().redirect()),
            None => {}
        }

        sqlx::query(
            "INSERT INTO oauth_accounts (provider, provider_user_id, user_id, email, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(provider)
        .bind(provider_user_id)
        .bind(user_id)
        .bind(email)
        .bind(Utc::now())
        .execute(&self.db)
        .await?;

        tracing::info!(user_id = %user_id, provider = %provider, "Linked OAuth account");
        Ok(())
    }

    /// Create a user; verified emails on the admin list become system admins
    pub async fn create_user(&self, new: NewUser) -> AppResult<User> {
        let email = new.email.to_lowercase();
        let listed = self.admin_emails.iter().any(|e| *e == email);
        let role = if listed && new.email_verified {
            UserRole::Admin
        } else {
            if listed {
                tracing::warn!(
                    email = %email,
                    "Admin email is unverified, creating a regular user"
                );
            }
            UserRole::User
        };

        let user = User {
            id: generate_id(),
            email,
            name: new.name,
            avatar_url: new.avatar_url,
            role,
            email_verified: new.email_verified,
            last_sign_in_at: None,
            created_at: Utc::now(),
        };

        sqlx::query(
            "INSERT INTO users (id, email, name, avatar_url, role, email_verified, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(&user.id)
        .bind(&user.email)
        .bind(&user.name)
        .bind(&user.avatar_url)
        .bind(user.role)
        .bind(user.email_verified)
        .bind(user.created_at)
        .execute(&self.db)
        .await?;

        tracing::info!(user_id = %user.id, role = ?user.role, "Created user");
        Ok(user)
    }

    pub async fn mark_email_verified(&self, user_id: &str) -> AppResult<()> {
        sqlx::query("UPDATE users SET email_verified = 1 WHERE id = ?1")
            .bind(user_id)
            .execute(&self.db)
            .await?;

        Ok(())
    }
}
