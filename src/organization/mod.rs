/// Organizations, memberships and invitations
pub mod manager;

pub use manager::{OrganizationManager, ORGANIZATION_CONTEXT};
