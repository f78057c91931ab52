/// Change-data-capture for memberships
///
/// Writers publish raw membership changes; a worker task enriches them with
/// user and entity display data and broadcasts the result to subscribers.
pub mod cache;
pub mod enrich;

pub use cache::LruCache;
pub use enrich::{EnrichedMembership, EntityProjection, MembershipEnricher, UserProjection};

use crate::db::models::Membership;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

/// Capacity of the enriched broadcast channel
const BROADCAST_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
}

/// Raw change as seen by the database writer
#[derive(Debug, Clone)]
pub struct MembershipChange {
    pub op: ChangeOp,
    pub row: Membership,
}

/// Change after enrichment
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrichedChange {
    pub op: ChangeOp,
    pub data: EnrichedMembership,
}

/// Handle to the change pipeline
#[derive(Clone)]
pub struct ChangeFeed {
    raw: mpsc::UnboundedSender<MembershipChange>,
    enriched: broadcast::Sender<EnrichedChange>,
}

impl ChangeFeed {
    /// Spawn the enrichment worker; must be called inside a tokio runtime
    pub fn start(enricher: Arc<MembershipEnricher>) -> Self {
        let (raw, raw_rx) = mpsc::unbounded_channel();
        let (enriched, _) = broadcast::channel(BROADCAST_CAPACITY);

        tokio::spawn(run_worker(raw_rx, enricher, enriched.clone()));

        Self { raw, enriched }
    }

    pub fn publish(&self, op: ChangeOp, row: Membership) {
        if self.raw.send(MembershipChange { op, row }).is_err() {
            tracing::warn!("CDC worker stopped, dropping membership change");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EnrichedChange> {
        self.enriched.subscribe()
    }
}

async fn run_worker(
    mut raw: mpsc::UnboundedReceiver<MembershipChange>,
    enricher: Arc<MembershipEnricher>,
    enriched: broadcast::Sender<EnrichedChange>,
) {
    while let Some(change) = raw.recv().await {
        match enricher.enrich(&change.row).await {
            Ok(data) => {
                // No subscribers is not an error
                let _ = enriched.send(EnrichedChange { op: change.op, data });
            }
            Err(e) => {
                tracing::warn!(
                    membership_id = %change.row.id,
                    error = %e,
                    "Failed to enrich membership change"
                );
            }
        }
    }

    tracing::debug!("CDC worker finished");
}
