/// Membership change enrichment with cached user and entity projections
use super::cache::LruCache;
use crate::{
    db::models::{EntityType, Membership},
    error::AppResult,
};
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use std::time::Duration;
use tokio::sync::Mutex;

/// Display fields of the member
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProjection {
    pub id: String,
    pub email: String,
    pub name: Option<String>,
    pub avatar_url: Option<String>,
}

/// Display fields of the entity the membership belongs to
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityProjection {
    pub id: String,
    pub entity_type: EntityType,
    pub name: String,
    pub slug: String,
}

/// A membership row joined with its user and entity
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrichedMembership {
    #[serde(flatten)]
    pub membership: Membership,
    pub user: Option<UserProjection>,
    pub entity: Option<EntityProjection>,
}

pub struct MembershipEnricher {
    db: SqlitePool,
    users: Mutex<LruCache<UserProjection>>,
    entities: Mutex<LruCache<EntityProjection>>,
}

impl MembershipEnricher {
    pub fn new(db: SqlitePool, max_size: usize, ttl: Duration) -> Self {
        Self {
            db,
            users: Mutex::new(LruCache::new(max_size, ttl)),
            entities: Mutex::new(LruCache::new(max_size, ttl)),
        }
    }

    /// Resolve user and entity concurrently
    pub async fn enrich(&self, membership: &Membership) -> AppResult<EnrichedMembership> {
        let (user, entity) = tokio::join!(
            self.user(&membership.user_id),
            self.entity(&membership.context_type, &membership.organization_id),
        );

        Ok(EnrichedMembership {
            membership: membership.clone(),
            user: user?,
            entity: entity?,
        })
    }

    async fn user(&self, user_id: &str) -> AppResult<Option<UserProjection>> {
        if let Some(hit) = self.users.lock().await.get(user_id) {
            return Ok(Some(hit));
        }

        let row = sqlx::query("SELECT id, email, name, avatar_url FROM users WHERE id = ?1")
            .bind(user_id)
            .fetch_optional(&self.db)
            .await?;

        let projection = match row {
            Some(row) => UserProjection {
                id: row.try_get("id")?,
                email: row.try_get("email")?,
                name: row.try_get("name")?,
                avatar_url: row.try_get("avatar_url")?,
            },
            None => return Ok(None),
        };

        self.users
            .lock()
            .await
            .set(user_id, projection.clone());
        Ok(Some(projection))
    }

    async fn entity(
        &self,
        context_type: &str,
        entity_id: &str,
    ) -> AppResult<Option<EntityProjection>> {
        let entity_type = match context_type {
            "organization" => EntityType::Organization,
            // Other membership contexts are not resolvable yet
            _ => return Ok(None),
        };

        let key = format!("{}:{}", entity_type.as_str(), entity_id);
        if let Some(hit) = self.entities.lock().await.get(&key) {
            return Ok(Some(hit));
        }

        let row = sqlx::query("SELECT id, name, slug FROM organizations WHERE id = ?1")
            .bind(entity_id)
            .fetch_optional(&self.db)
            .await?;

        let projection = match row {
            Some(row) => EntityProjection {
                id: row.try_get("id")?,
                entity_type,
                name: row.try_get("name")?,
                slug: row.try_get("slug")?,
            },
            None => return Ok(None),
        };

        self.entities.lock().await.set(key, projection.clone());
        Ok(Some(projection))
    }
}
