/// One-time tokens: invitations, email verification and password reset
///
/// Raw tokens are handed out once; the database only keeps their hash.
use crate::{
    crypto::{generate_id, generate_token, hash_token},
    db::models::{EntityType, MembershipRole, Token, TokenType},
    error::{AppError, AppResult},
};
use chrono::{Duration, Utc};
use sqlx::SqlitePool;

const TOKEN_LENGTH: usize = 40;

/// How to find a token record
#[derive(Debug, Clone, Copy)]
pub enum TokenLookup<'a> {
    Id(&'a str),
    /// The raw token as sent to the user
    Token(&'a str),
}

/// Parameters of a token to create
#[derive(Debug, Clone)]
pub struct NewToken {
    pub token_type: TokenType,
    pub email: String,
    pub user_id: Option<String>,
    pub entity_type: Option<EntityType>,
    pub organization_id: Option<String>,
    pub role: Option<MembershipRole>,
    pub created_by: Option<String>,
    pub expires_in: Duration,
}

impl NewToken {
    pub fn new(token_type: TokenType, email: impl Into<String>, expires_in: Duration) -> Self {
        NewToken {
            token_type,
            email: email.into().to_lowercase(),
            user_id: None,
            entity_type: None,
            organization_id: None,
            role: None,
            created_by: None,
            expires_in,
        }
    }
}

pub struct TokenManager {
    db: SqlitePool,
}

impl TokenManager {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// Store a new token; returns the record and the raw token
    pub async fn create_token(&self, new: NewToken) -> AppResult<(Token, String)> {
        let raw = generate_token(TOKEN_LENGTH);
        let now = Utc::now();

        let token = Token {
            id: generate_id(),
            token: hash_token(&raw),
            token_type: new.token_type,
            email: new.email,
            user_id: new.user_id,
            entity_type: new.entity_type,
            organization_id: new.organization_id,
            role: new.role,
            created_by: new.created_by,
            created_at: now,
            expires_at: now + new.expires_in,
            consumed_at: None,
        };

        sqlx::query(
            "INSERT INTO tokens
                 (id, token, type, email, user_id, entity_type, organization_id, role,
                  created_by, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        )
        .bind(&token.id)
        .bind(&token.token)
        .bind(token.token_type)
        .bind(&token.email)
        .bind(&token.user_id)
        .bind(token.entity_type)
        .bind(&token.organization_id)
        .bind(token.role)
        .bind(&token.created_by)
        .bind(token.created_at)
        .bind(token.expires_at)
        .execute(&self.db)
        .await?;

        Ok((token, raw))
    }

    /// Fetch a usable token of `required_type`, optionally consuming it
    pub async fn get_valid_token(
        &self,
        required_type: TokenType,
        lookup: TokenLookup<'_>,
        consume: bool,
    ) -> AppResult<Token> {
        let query = match lookup {
            TokenLookup::Id(id) => sqlx::query_as::<_, Token>("SELECT * FROM tokens WHERE id = ?1")
                .bind(id.to_string()),
            TokenLookup::Token(raw) => {
                sqlx::query_as::<_, Token>("SELECT * FROM tokens WHERE token = ?1")
                    .bind(hash_token(raw))
            }
        };

        let mut token = query.fetch_optional(&self.db).await?.ok_or_else(|| {
            if required_type == TokenType::Invitation {
                AppError::invitation_not_found()
            } else {
                AppError::token_not_found()
            }
        })?;

        if token.token_type != required_type || token.consumed_at.is_some() {
            return Err(AppError::invalid_token());
        }

        let now = Utc::now();
        if token.expires_at < now {
            return Err(AppError::expired_token());
        }

        if consume {
            mark_consumed(&self.db, &token.id).await?;
            token.consumed_at = Some(now);
        }

        Ok(token)
    }

    pub async fn delete_token(&self, id: &str) -> AppResult<()> {
        sqlx::query("DELETE FROM tokens WHERE id = ?1")
            .bind(id)
            .execute(&self.db)
            .await?;

        Ok(())
    }
}

/// Burn a token so it cannot be used again.
///
/// Takes any executor so the consume can share a transaction with the write
/// it authorizes. Fails with `invalid_token` when another request got there
/// first.
pub async fn mark_consumed<'e, E>(executor: E, token_id: &str) -> AppResult<()>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let result = sqlx::query(
        "UPDATE tokens SET consumed_at = ?1 WHERE id = ?2 AND consumed_at IS NULL",
    )
    .bind(Utc::now())
    .bind(token_id)
    .execute(executor)
    .await?;

    if result.rows_affected() == 0 {
        return Err(AppError::invalid_token());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing::{insert_organization, test_pool};
    use crate::error::ErrorType;
    use axum::http::StatusCode;

    async fn invitation(
        tokens: &TokenManager,
        org_id: &str,
        expires_in: Duration,
    ) -> (Token, String) {
        let mut new = NewToken::new(TokenType::Invitation, "Bob@Example.com", expires_in);
        new.entity_type = Some(EntityType::Organization);
        new.organization_id = Some(org_id.to_string());
        new.role = Some(MembershipRole::Member);
        tokens.create_token(new).await.unwrap()
    }

    #[tokio::test]
    async fn test_token_is_stored_hashed() {
        let pool = test_pool().await;
        let org = insert_organization(&pool, "acme").await;
        let tokens = TokenManager::new(pool);
        let (record, raw) = invitation(&tokens, &org.id, Duration::days(7)).await;

        assert_eq!(record.token, hash_token(&raw));
        assert_eq!(record.email, "bob@example.com");
    }

    #[tokio::test]
    async fn test_peek_then_consume() {
        let pool = test_pool().await;
        let org = insert_organization(&pool, "acme").await;
        let tokens = TokenManager::new(pool);
        let (record, raw) = invitation(&tokens, &org.id, Duration::days(7)).await;

        let peeked = tokens
            .get_valid_token(TokenType::Invitation, TokenLookup::Token(&raw), false)
            .await
            .unwrap();
        assert_eq!(peeked.id, record.id);
        assert_eq!(peeked.entity_type, Some(EntityType::Organization));

        let consumed = tokens
            .get_valid_token(TokenType::Invitation, TokenLookup::Id(&record.id), true)
            .await
            .unwrap();
        assert!(consumed.consumed_at.is_some());

        let err = tokens
            .get_valid_token(TokenType::Invitation, TokenLookup::Token(&raw), false)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorType::InvalidToken);
    }

    #[tokio::test]
    async fn test_missing_invitation_and_missing_token_differ() {
        let pool = test_pool().await;
        let tokens = TokenManager::new(pool);

        let err = tokens
            .get_valid_token(TokenType::Invitation, TokenLookup::Token("missing"), false)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorType::InvitationNotFound);
        assert_eq!(err.status, StatusCode::NOT_FOUND);

        let err = tokens
            .get_valid_token(TokenType::EmailVerification, TokenLookup::Id("missing"), false)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorType::TokenNotFound);
    }

    #[tokio::test]
    async fn test_wrong_type_is_invalid() {
        let pool = test_pool().await;
        let org = insert_organization(&pool, "acme").await;
        let tokens = TokenManager::new(pool);
        let (_, raw) = invitation(&tokens, &org.id, Duration::days(7)).await;

        let err = tokens
            .get_valid_token(TokenType::EmailVerification, TokenLookup::Token(&raw), false)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorType::InvalidToken);
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_expired_token() {
        let pool = test_pool().await;
        let org = insert_organization(&pool, "acme").await;
        let tokens = TokenManager::new(pool);
        let (_, raw) = invitation(&tokens, &org.id, Duration::seconds(-1)).await;

        let err = tokens
            .get_valid_token(TokenType::Invitation, TokenLookup::Token(&raw), true)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorType::ExpiredToken);
        assert_eq!(err.status, StatusCode::UNAUTHORIZED);
    }
}
