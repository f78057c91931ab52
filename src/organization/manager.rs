/// Organization manager: organizations, memberships and invitations
use crate::{
    cdc::{ChangeFeed, ChangeOp},
    crypto::generate_id,
    db::models::{EntityType, Membership, MembershipRole, Organization, Token, TokenType, User},
    error::{AppError, AppResult, ErrorType, Severity},
    mailer::Mailer,
    token::{mark_consumed, NewToken, TokenLookup, TokenManager},
};
use axum::http::StatusCode;
use chrono::{Duration, Utc};
use sqlx::SqlitePool;
use std::sync::Arc;

const INVITATION_TTL_DAYS: i64 = 7;
const MAX_SLUG_LENGTH: usize = 64;

/// Membership context for organization memberships
pub const ORGANIZATION_CONTEXT: &str = "organization";

pub struct OrganizationManager {
    db: SqlitePool,
    tokens: Arc<TokenManager>,
    mailer: Mailer,
    change_feed: ChangeFeed,
    frontend_url: String,
}

impl OrganizationManager {
    pub fn new(
        db: SqlitePool,
        tokens: Arc<TokenManager>,
        mailer: Mailer,
        change_feed: ChangeFeed,
        frontend_url: impl Into<String>,
    ) -> Self {
        Self {
            db,
            tokens,
            mailer,
            change_feed,
            frontend_url: frontend_url.into(),
        }
    }

    /// Create an organization with `creator` as its first admin
    pub async fn create_organization(
        &self,
        creator: &User,
        name: &str,
        slug: &str,
    ) -> AppResult<(Organization, Membership)> {
        let name = name.trim();
        if name.is_empty() {
            return Err(AppError::invalid_request("Organization name is required"));
        }
        let slug = validate_slug(slug)?;

        let now = Utc::now();
        let organization = Organization {
            id: generate_id(),
            name: name.to_string(),
            slug,
            created_by: Some(creator.id.clone()),
            created_at: now,
        };
        let membership = Membership {
            id: generate_id(),
            user_id: creator.id.clone(),
            organization_id: organization.id.clone(),
            context_type: ORGANIZATION_CONTEXT.to_string(),
            role: MembershipRole::Admin,
            created_by: Some(creator.id.clone()),
            created_at: now,
        };

        let mut tx = self.db.begin().await?;

        sqlx::query(
            "INSERT INTO organizations (id, name, slug, created_by, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(&organization.id)
        .bind(&organization.name)
        .bind(&organization.slug)
        .bind(&organization.created_by)
        .bind(organization.created_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| AppError::from(e).with_entity("organization"))?;

        insert_membership(&mut tx, &membership).await?;

        tx.commit().await?;

        tracing::info!(
            organization_id = %organization.id,
            slug = %organization.slug,
            user_id = %creator.id,
            "Created organization"
        );
        self.change_feed.publish(ChangeOp::Insert, membership.clone());

        Ok((organization, membership))
    }

    /// Look up by id, falling back to slug
    pub async fn get_organization(&self, id_or_slug: &str) -> AppResult<Organization> {
        sqlx::query_as::<_, Organization>("SELECT * FROM organizations WHERE id = ?1 OR slug = ?1")
            .bind(id_or_slug)
            .fetch_optional(&self.db)
            .await?
            .ok_or_else(|| AppError::not_found("organization"))
    }

    pub async fn get_membership(
        &self,
        organization_id: &str,
        user_id: &str,
    ) -> AppResult<Option<Membership>> {
        let membership = sqlx::query_as::<_, Membership>(
            "SELECT * FROM memberships WHERE organization_id = ?1 AND user_id = ?2",
        )
        .bind(organization_id)
        .bind(user_id)
        .fetch_optional(&self.db)
        .await?;

        Ok(membership)
    }

    pub async fn list_memberships(&self, organization_id: &str) -> AppResult<Vec<Membership>> {
        let memberships = sqlx::query_as::<_, Membership>(
            "SELECT * FROM memberships WHERE organization_id = ?1 ORDER BY created_at ASC",
        )
        .bind(organization_id)
        .fetch_all(&self.db)
        .await?;

        Ok(memberships)
    }

    /// Members and system admins may read an organization
    pub async fn require_member(&self, organization_id: &str, user: &User) -> AppResult<()> {
        if user.is_admin() {
            return Ok(());
        }
        match self.get_membership(organization_id, &user.id).await? {
            Some(_) => Ok(()),
            None => Err(AppError::forbidden().with_entity("organization")),
        }
    }

    /// Organization admins and system admins may write
    pub async fn require_admin(&self, organization_id: &str, user: &User) -> AppResult<()> {
        if user.is_admin() {
            return Ok(());
        }
        match self.get_membership(organization_id, &user.id).await? {
            Some(membership) if membership.role == MembershipRole::Admin => Ok(()),
            _ => Err(AppError::forbidden().with_entity("organization")),
        }
    }

    /// Create an invitation token and mail the link to `email`
    pub async fn invite_member(
        &self,
        inviter: &User,
        organization_id: &str,
        email: &str,
        role: MembershipRole,
    ) -> AppResult<Token> {
        let organization = self.get_organization(organization_id).await?;
        self.require_admin(&organization.id, inviter).await?;

        let email = email.trim().to_lowercase();
        if !email.contains('@') {
            return Err(AppError::invalid_request("Invalid email address"));
        }

        let already_member: Option<String> = sqlx::query_scalar(
            "SELECT m.id FROM memberships m JOIN users u ON u.id = m.user_id
             WHERE m.organization_id = ?1 AND u.email = ?2",
        )
        .bind(&organization.id)
        .bind(&email)
        .fetch_optional(&self.db)
        .await?;
        if already_member.is_some() {
            return Err(
                AppError::new(StatusCode::CONFLICT, ErrorType::Conflict, Severity::Warn)
                    .with_message("User is already a member")
                    .with_entity("membership"),
            );
        }

        let mut new = NewToken::new(
            TokenType::Invitation,
            &email,
            Duration::days(INVITATION_TTL_DAYS),
        );
        new.entity_type = Some(EntityType::Organization);
        new.organization_id = Some(organization.id.clone());
        new.role = Some(role);
        new.created_by = Some(inviter.id.clone());

        let (token, raw) = self.tokens.create_token(new).await?;

        let accept_url = format!(
            "{}/invitation/{}?tokenId={}",
            self.frontend_url.trim_end_matches('/'),
            raw,
            token.id
        );
        let inviter_name = inviter.name.as_deref().unwrap_or(&inviter.email);
        if let Err(e) = self
            .mailer
            .send_invitation_email(&email, &organization.name, inviter_name, &accept_url)
            .await
        {
            // Nobody holds the raw token of an unsent invitation
            self.tokens.delete_token(&token.id).await?;
            return Err(e);
        }

        tracing::info!(
            organization_id = %organization.id,
            token_id = %token.id,
            inviter_id = %inviter.id,
            "Created invitation"
        );
        Ok(token)
    }

    /// Consume an invitation for `user` and create the membership.
    ///
    /// The invitation email must match the user's email. Accepting when
    /// already a member returns the existing membership. The token is only
    /// burned when the membership write commits.
    pub async fn accept_invitation(&self, user: &User, raw_token: &str) -> AppResult<Membership> {
        let invitation = self
            .tokens
            .get_valid_token(TokenType::Invitation, TokenLookup::Token(raw_token), false)
            .await?;

        if !invitation.email.eq_ignore_ascii_case(&user.email) {
            return Err(AppError::user_mismatch());
        }
        let organization_id = invitation
            .organization_id
            .clone()
            .ok_or_else(|| {
                AppError::invalid_token().with_message("Invitation has no organization")
            })?;

        let mut tx = self.db.begin().await?;
        mark_consumed(&mut *tx, &invitation.id).await?;

        let existing = sqlx::query_as::<_, Membership>(
            "SELECT * FROM memberships WHERE organization_id = ?1 AND user_id = ?2",
        )
        .bind(&organization_id)
        .bind(&user.id)
        .fetch_optional(&mut *tx)
        .await?;
        if let Some(existing) = existing {
            tx.commit().await?;
            return Ok(existing);
        }

        let membership = Membership {
            id: generate_id(),
            user_id: user.id.clone(),
            organization_id,
            context_type: ORGANIZATION_CONTEXT.to_string(),
            role: invitation.role.unwrap_or_default(),
            created_by: invitation.created_by.clone(),
            created_at: Utc::now(),
        };

        insert_membership(&mut tx, &membership).await?;
        tx.commit().await?;

        tracing::info!(
            organization_id = %membership.organization_id,
            user_id = %user.id,
            token_id = %invitation.id,
            "Accepted invitation"
        );
        self.change_feed.publish(ChangeOp::Insert, membership.clone());

        Ok(membership)
    }

    /// Change a member's role; the last admin cannot be demoted
    pub async fn update_role(
        &self,
        actor: &User,
        organization_id: &str,
        membership_id: &str,
        role: MembershipRole,
    ) -> AppResult<Membership> {
        self.require_admin(organization_id, actor).await?;
        let mut membership = self.membership_by_id(organization_id, membership_id).await?;

        let updated =
            update_role_keeping_admin(&self.db, organization_id, &membership.id, role).await?;
        if updated == 0 {
            return Err(last_admin_error());
        }
        membership.role = role;

        tracing::info!(
            membership_id = %membership.id,
            role = ?role,
            actor_id = %actor.id,
            "Updated membership role"
        );
        self.change_feed.publish(ChangeOp::Update, membership.clone());

        Ok(membership)
    }

    /// Remove a membership; members may remove themselves
    pub async fn delete_membership(
        &self,
        actor: &User,
        organization_id: &str,
        membership_id: &str,
    ) -> AppResult<()> {
        let membership = self.membership_by_id(organization_id, membership_id).await?;
        if membership.user_id != actor.id {
            self.require_admin(organization_id, actor).await?;
        }
        if delete_keeping_admin(&self.db, organization_id, &membership.id).await? == 0 {
            return Err(last_admin_error());
        }

        tracing::info!(
            membership_id = %membership.id,
            actor_id = %actor.id,
            "Deleted membership"
        );
        self.change_feed.publish(ChangeOp::Delete, membership);

        Ok(())
    }

    async fn membership_by_id(
        &self,
        organization_id: &str,
        membership_id: &str,
    ) -> AppResult<Membership> {
        sqlx::query_as::<_, Membership>(
            "SELECT * FROM memberships WHERE id = ?1 AND organization_id = ?2",
        )
        .bind(membership_id)
        .bind(organization_id)
        .fetch_optional(&self.db)
        .await?
        .ok_or_else(|| AppError::not_found("membership"))
    }
}

fn last_admin_error() -> AppError {
    AppError::invalid_request("An organization needs at least one admin")
}

/// Set a membership's role unless that demotes the organization's last admin.
///
/// The admin count is checked by the write itself, so concurrent demotions
/// cannot both pass. Returns the number of rows changed.
async fn update_role_keeping_admin(
    db: &SqlitePool,
    organization_id: &str,
    membership_id: &str,
    role: MembershipRole,
) -> AppResult<u64> {
    let result = sqlx::query(
        "UPDATE memberships SET role = ?1
         WHERE id = ?2 AND organization_id = ?3
           AND (role != 'admin' OR ?1 = 'admin' OR EXISTS (
               SELECT 1 FROM memberships
               WHERE organization_id = ?3 AND role = 'admin' AND id != ?2))",
    )
    .bind(role)
    .bind(membership_id)
    .bind(organization_id)
    .execute(db)
    .await?;

    Ok(result.rows_affected())
}

/// Delete a membership unless it is the organization's last admin
async fn delete_keeping_admin(
    db: &SqlitePool,
    organization_id: &str,
    membership_id: &str,
) -> AppResult<u64> {
    let result = sqlx::query(
        "DELETE FROM memberships
         WHERE id = ?1 AND organization_id = ?2
           AND (role != 'admin' OR EXISTS (
               SELECT 1 FROM memberships
               WHERE organization_id = ?2 AND role = 'admin' AND id != ?1))",
    )
    .bind(membership_id)
    .bind(organization_id)
    .execute(db)
    .await?;

    Ok(result.rows_affected())
}

async fn insert_membership(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    membership: &Membership,
) -> AppResult<()> {
    sqlx::query(
        "INSERT INTO memberships
             (id, user_id, organization_id, context_type, role, created_by, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
    )
    .bind(&membership.id)
    .bind(&membership.user_id)
    .bind(&membership.organization_id)
    .bind(&membership.context_type)
    .bind(membership.role)
    .bind(&membership.created_by)
    .bind(membership.created_at)
    .execute(&mut **tx)
    .await
    .map_err(|e| AppError::from(e).with_entity("membership"))?;

    Ok(())
}

/// Lowercase letters, digits and inner hyphens
fn validate_slug(slug: &str) -> AppResult<String> {
    let slug = slug.trim().to_lowercase();
    let valid = !slug.is_empty()
        && slug.len() <= MAX_SLUG_LENGTH
        && !slug.starts_with('-')
        && !slug.ends_with('-')
        && slug
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');

    if valid {
        Ok(slug)
    } else {
        Err(AppError::invalid_request(format!("Invalid slug: {}", slug)))
    }
}
