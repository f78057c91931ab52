/// Keyed query cache with optimistic mutation lifecycle
///
/// A mutation goes through `on_mutate` (cancel fetches, snapshot, apply), then
/// either `on_error` (restore snapshots) or `on_success` (reconcile confirmed
/// records onto the optimistic placeholders).
use super::data::{format_updated_data, CachedQuery};
use std::collections::{HashMap, HashSet};
use tokio::task::AbortHandle;

/// Number of leading key segments that identify a list, e.g. `["attachments", "list"]`
const BASE_KEY_LEN: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryKey(Vec<String>);

impl QueryKey {
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(segments.into_iter().map(Into::into).collect())
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    fn base(&self) -> &[String] {
        &self.0[..self.0.len().min(BASE_KEY_LEN)]
    }

    /// True for the same list under any filter or pagination arguments
    pub fn is_similar(&self, other: &QueryKey) -> bool {
        other.0.starts_with(self.base())
    }
}

/// Records that can live in an optimistic list
pub trait QueryItem: Clone {
    fn id(&self) -> &str;

    /// Temporary id given to a record before the server has seen it
    fn client_id(&self) -> Option<&str>;

    /// Take the server's fields from `confirmed`, keeping client-only ones
    fn reconcile(&mut self, confirmed: &Self);
}

#[derive(Debug, Clone)]
pub enum OptimisticOp<T> {
    /// Prepend new records
    Create(Vec<T>),
    /// Replace records by id
    Update(Vec<T>),
    /// Remove records by id
    Delete(Vec<String>),
}

/// Snapshots taken by `on_mutate`, used for rollback and reconciliation
#[derive(Debug, Clone)]
pub struct MutationContext<T> {
    snapshots: Vec<(QueryKey, CachedQuery<T>)>,
}

impl<T> MutationContext<T> {
    pub fn keys(&self) -> impl Iterator<Item = &QueryKey> {
        self.snapshots.iter().map(|(key, _)| key)
    }
}

pub struct QueryCache<T> {
    entries: HashMap<QueryKey, CachedQuery<T>>,
    in_flight: HashMap<QueryKey, Vec<AbortHandle>>,
}

impl<T: QueryItem> Default for QueryCache<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: QueryItem> QueryCache<T> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            in_flight: HashMap::new(),
        }
    }

    pub fn get_query_data(&self, key: &QueryKey) -> Option<&CachedQuery<T>> {
        self.entries.get(key)
    }

    pub fn set_query_data(&mut self, key: QueryKey, data: CachedQuery<T>) {
        self.entries.insert(key, data);
    }

    /// Track a running fetch so a mutation can cancel it
    pub fn register_fetch(&mut self, key: QueryKey, handle: AbortHandle) {
        self.in_flight.entry(key).or_default().push(handle);
    }

    /// Abort every fetch for `key` or a similar key; returns how many were aborted
    pub fn cancel_queries(&mut self, key: &QueryKey) -> usize {
        let mut cancelled = 0;
        self.in_flight.retain(|candidate, handles| {
            if !key.is_similar(candidate) {
                return true;
            }
            for handle in handles.drain(..) {
                if !handle.is_finished() {
                    handle.abort();
                    cancelled += 1;
                }
            }
            false
        });

        if cancelled > 0 {
            tracing::debug!(key = ?key.segments(), cancelled, "Cancelled in-flight queries");
        }
        cancelled
    }

    /// Apply `op` to every cached list matching `key`.
    ///
    /// Fetches are cancelled first so a late response cannot overwrite the
    /// optimistic write.
    pub fn on_mutate(
        &mut self,
        key: &QueryKey,
        op: &OptimisticOp<T>,
        limit: Option<usize>,
    ) -> MutationContext<T> {
        self.cancel_queries(key);

        let mut snapshots = Vec::new();
        for (candidate, data) in self.entries.iter_mut() {
            if !key.is_similar(candidate) {
                continue;
            }
            snapshots.push((candidate.clone(), data.clone()));

            let (items, add_to_total) = apply_op(data.flatten(), op);
            *data = format_updated_data(data, items, limit, add_to_total);
        }

        MutationContext { snapshots }
    }

    /// Put every snapshot back exactly as it was
    pub fn on_error(&mut self, context: MutationContext<T>) {
        for (key, data) in context.snapshots {
            self.entries.insert(key, data);
        }
    }

    /// Reconcile confirmed records onto placeholders with the same client id
    pub fn on_success(&mut self, context: &MutationContext<T>, confirmed: &[T]) {
        let by_client_id: HashMap<&str, &T> = confirmed
            .iter()
            .filter_map(|item| item.client_id().map(|client_id| (client_id, item)))
            .collect();
        if by_client_id.is_empty() {
            return;
        }

        let keys: HashSet<&QueryKey> = context.keys().collect();
        for (key, data) in self.entries.iter_mut() {
            if !keys.contains(key) {
                continue;
            }
            for item in data.items_mut() {
                let matched = item
                    .client_id()
                    .and_then(|client_id| by_client_id.get(client_id).copied());
                if let Some(server) = matched {
                    item.reconcile(server);
                }
            }
        }
    }
}

fn apply_op<T: QueryItem>(items: Vec<T>, op: &OptimisticOp<T>) -> (Vec<T>, i64) {
    match op {
        OptimisticOp::Create(created) => {
            let mut next = created.clone();
            next.extend(items);
            (next, created.len() as i64)
        }
        OptimisticOp::Update(updated) => {
            let by_id: HashMap<&str, &T> = updated.iter().map(|item| (item.id(), item)).collect();
            let next = items
                .into_iter()
                .map(|item| match by_id.get(item.id()) {
                    Some(replacement) => (*replacement).clone(),
                    None => item,
                })
                .collect();
            (next, 0)
        }
        OptimisticOp::Delete(ids) => {
            let before = items.len();
            let next: Vec<T> = items
                .into_iter()
                .filter(|item| !ids.iter().any(|id| id == item.id()))
                .collect();
            let removed = (before - next.len()) as i64;
            (next, -removed)
        }
    }
}
