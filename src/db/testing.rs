/// Test helpers: in-memory database with migrations applied, plus fixtures
use super::models::{Organization, User, UserRole};
use crate::crypto::generate_id;
use chrono::Utc;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};

/// Single-connection in-memory pool so every query sees the same database
pub async fn test_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .unwrap();

    super::run_migrations(&pool).await.unwrap();
    pool
}

pub async fn insert_user(pool: &SqlitePool, email: &str, role: UserRole) -> User {
    let user = User {
        id: generate_id(),
        email: email.to_string(),
        name: Some(email.split('@').next().unwrap_or(email).to_string()),
        avatar_url: None,
        role,
        email_verified: true,
        last_sign_in_at: None,
        created_at: Utc::now(),
    };

    sqlx::query(
        "INSERT INTO users
             (id, email, name, avatar_url, role, email_verified, last_sign_in_at, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
    )
    .bind(&user.id)
    .bind(&user.email)
    .bind(&user.name)
    .bind(&user.avatar_url)
    .bind(user.role)
    .bind(user.email_verified)
    .bind(user.last_sign_in_at)
    .bind(user.created_at)
    .execute(pool)
    .await
    .unwrap();

    user
}

pub async fn insert_organization(pool: &SqlitePool, slug: &str) -> Organization {
    let organization = Organization {
        id: generate_id(),
        name: slug.to_string(),
        slug: slug.to_string(),
        created_by: None,
        created_at: Utc::now(),
    };

    sqlx::query(
        "INSERT INTO organizations (id, name, slug, created_by, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
    )
    .bind(&organization.id)
    .bind(&organization.name)
    .bind(&organization.slug)
    .bind(&organization.created_by)
    .bind(organization.created_at)
    .execute(pool)
    .await
    .unwrap();

    organization
}

pub async fn count_rows(pool: &SqlitePool, table: &str) -> i64 {
    sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table))
        .fetch_one(pool)
        .await
        .unwrap()
}
