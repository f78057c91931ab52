/// Organization, membership and invitation endpoints
use super::middleware::RequestScope;
use crate::{
    auth::AuthContext,
    cdc::{ChangeOp, EnrichedChange},
    context::AppContext,
    db::models::{Membership, MembershipRole, Organization, Token},
    error::AppResult,
};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive},
        Json, Sse,
    },
    routing::{get, post, put},
    Router,
};
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::{self, error::RecvError};

pub fn routes() -> Router<AppContext> {
    Router::new()
        .route("/organizations", post(create_organization))
        .route("/organizations/:id_or_slug", get(get_organization))
        .route("/organizations/:id_or_slug/memberships", get(list_memberships))
        .route(
            "/organizations/:id_or_slug/memberships/invite",
            post(invite_member),
        )
        .route(
            "/organizations/:id_or_slug/memberships/:membership_id",
            put(update_membership).delete(delete_membership),
        )
        .route("/organizations/:id_or_slug/activity", get(activity))
        .route("/invitation/:token/accept", post(accept_invitation))
}

#[derive(Debug, Deserialize)]
struct CreateOrganizationRequest {
    name: String,
    slug: String,
}

#[derive(Debug, Serialize)]
struct CreateOrganizationResponse {
    organization: Organization,
    membership: Membership,
}

/// POST /organizations
async fn create_organization(
    State(ctx): State<AppContext>,
    auth: AuthContext,
    Json(body): Json<CreateOrganizationRequest>,
) -> AppResult<(StatusCode, Json<CreateOrganizationResponse>)> {
    let (organization, membership) = ctx
        .organizations
        .create_organization(&auth.user, &body.name, &body.slug)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(CreateOrganizationResponse {
            organization,
            membership,
        }),
    ))
}

/// Resolve the path organization and check the caller belongs to it
async fn member_organization(
    ctx: &AppContext,
    auth: &AuthContext,
    scope: &RequestScope,
    id_or_slug: &str,
) -> AppResult<Organization> {
    let organization = ctx.organizations.get_organization(id_or_slug).await?;
    scope.set_organization(&organization.id);
    ctx.organizations
        .require_member(&organization.id, &auth.user)
        .await?;
    Ok(organization)
}

/// GET /organizations/:id_or_slug
async fn get_organization(
    State(ctx): State<AppContext>,
    auth: AuthContext,
    scope: RequestScope,
    Path(id_or_slug): Path<String>,
) -> AppResult<Json<Organization>> {
    let organization = member_organization(&ctx, &auth, &scope, &id_or_slug).await?;
    Ok(Json(organization))
}

/// GET /organizations/:id_or_slug/memberships
async fn list_memberships(
    State(ctx): State<AppContext>,
    auth: AuthContext,
    scope: RequestScope,
    Path(id_or_slug): Path<String>,
) -> AppResult<Json<Vec<Membership>>> {
    let organization = member_organization(&ctx, &auth, &scope, &id_or_slug).await?;
    let memberships = ctx.organizations.list_memberships(&organization.id).await?;
    Ok(Json(memberships))
}

#[derive(Debug, Deserialize)]
struct InviteRequest {
    email: String,
    #[serde(default)]
    role: MembershipRole,
}

/// POST /organizations/:id_or_slug/memberships/invite
async fn invite_member(
    State(ctx): State<AppContext>,
    auth: AuthContext,
    scope: RequestScope,
    Path(id_or_slug): Path<String>,
    Json(body): Json<InviteRequest>,
) -> AppResult<(StatusCode, Json<Token>)> {
    let organization = ctx.organizations.get_organization(&id_or_slug).await?;
    scope.set_organization(&organization.id);

    let invitation = ctx
        .organizations
        .invite_member(&auth.user, &organization.id, &body.email, body.role)
        .await?;

    Ok((StatusCode::CREATED, Json(invitation)))
}

#[derive(Debug, Deserialize)]
struct UpdateMembershipRequest {
    role: MembershipRole,
}

/// PUT /organizations/:id_or_slug/memberships/:membership_id
async fn update_membership(
    State(ctx): State<AppContext>,
    auth: AuthContext,
    scope: RequestScope,
    Path((id_or_slug, membership_id)): Path<(String, String)>,
    Json(body): Json<UpdateMembershipRequest>,
) -> AppResult<Json<Membership>> {
    let organization = ctx.organizations.get_organization(&id_or_slug).await?;
    scope.set_organization(&organization.id);

    let membership = ctx
        .organizations
        .update_role(&auth.user, &organization.id, &membership_id, body.role)
        .await?;

    Ok(Json(membership))
}

/// DELETE /organizations/:id_or_slug/memberships/:membership_id
async fn delete_membership(
    State(ctx): State<AppContext>,
    auth: AuthContext,
    scope: RequestScope,
    Path((id_or_slug, membership_id)): Path<(String, String)>,
) -> AppResult<StatusCode> {
    let organization = ctx.organizations.get_organization(&id_or_slug).await?;
    scope.set_organization(&organization.id);

    ctx.organizations
        .delete_membership(&auth.user, &organization.id, &membership_id)
        .await?;

    Ok(StatusCode::NO_CONTENT)
}

/// POST /invitation/:token/accept
async fn accept_invitation(
    State(ctx): State<AppContext>,
    auth: AuthContext,
    scope: RequestScope,
    Path(token): Path<String>,
) -> AppResult<Json<Membership>> {
    let membership = ctx.organizations.accept_invitation(&auth.user, &token).await?;
    scope.set_organization(&membership.organization_id);
    Ok(Json(membership))
}

/// GET /organizations/:id_or_slug/activity
///
/// Server-sent stream of enriched membership changes of one organization.
async fn activity(
    State(ctx): State<AppContext>,
    auth: AuthContext,
    scope: RequestScope,
    Path(id_or_slug): Path<String>,
) -> AppResult<Sse<impl Stream<Item = Result<Event, axum::Error>>>> {
    let organization = member_organization(&ctx, &auth, &scope, &id_or_slug).await?;
    let receiver = ctx.change_feed.subscribe();

    tracing::debug!(
        organization_id = %organization.id,
        user_id = %auth.user.id,
        "Activity stream opened"
    );

    Ok(Sse::new(activity_stream(receiver, organization.id)).keep_alive(KeepAlive::default()))
}

fn activity_stream(
    receiver: broadcast::Receiver<EnrichedChange>,
    organization_id: String,
) -> impl Stream<Item = Result<Event, axum::Error>> {
    stream::unfold(
        (receiver, organization_id),
        |(mut receiver, organization_id)| async move {
            loop {
                match receiver.recv().await {
                    Ok(change) if change.data.membership.organization_id == organization_id => {
                        let event = Event::default()
                            .event(op_name(change.op))
                            .json_data(&change);
                        return Some((event, (receiver, organization_id)));
                    }
                    Ok(_) => continue,
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Activity stream lagged, events dropped");
                        continue;
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
        },
    )
}

fn op_name(op: ChangeOp) -> &'static str {
    match op {
        ChangeOp::Insert => "insert",
        ChangeOp::Update => "update",
        ChangeOp::Delete => "delete",
    }
}
