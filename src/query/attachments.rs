use super::cache::QueryItem;
use crate::crypto::generate_id;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub id: String,
    pub client_id: Option<String>,
    pub organization_id: String,
    pub filename: String,
    pub name: Option<String>,
    pub content_type: Option<String>,
    pub size: Option<u64>,
    pub url: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

impl Attachment {
    /// Placeholder shown while the upload is still pending
    pub fn optimistic(
        organization_id: impl Into<String>,
        filename: impl Into<String>,
        content_type: Option<String>,
        size: Option<u64>,
    ) -> Self {
        let id = generate_id();
        let filename = filename.into();
        Self {
            client_id: Some(id.clone()),
            id,
            organization_id: organization_id.into(),
            name: Some(name_from_filename(&filename)),
            filename,
            content_type,
            size,
            url: None,
            created_at: None,
        }
    }
}

/// Display name for a file: the filename without its final extension
pub fn name_from_filename(filename: &str) -> String {
    match filename.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem.to_string(),
        _ => filename.to_string(),
    }
}

impl QueryItem for Attachment {
    fn id(&self) -> &str {
        &self.id
    }

    fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    fn reconcile(&mut self, confirmed: &Self) {
        self.id = confirmed.id.clone();
        self.url = confirmed.url.clone().or(self.url.take());
        self.created_at = confirmed.created_at.or(self.created_at);
        self.size = confirmed.size.or(self.size);
        self.content_type = confirmed.content_type.clone().or(self.content_type.take());
        self.name = confirmed.name.clone().or(self.name.take());
    }
}
