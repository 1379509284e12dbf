use std::future::Future;
use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;
use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::ident::stored_key;
use crate::storage::{BlobStore, DeleteOutcome, INDEX_KEY};

pub const PUBLIC_PATH_PREFIX: &str = "/uploads/";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionRecord {
    pub nickname: String,
    pub submitted_at: DateTime<FixedOffset>,
    pub original_filename: String,
    pub public_path: String,
    pub filename_length: usize,
    pub hashed_numeric: u64,
    pub backend_locator: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_handle: Option<String>,
}

impl SubmissionRecord {
    pub fn id(&self) -> &str {
        self.public_path
            .strip_prefix(PUBLIC_PATH_PREFIX)
            .unwrap_or(&self.public_path)
    }

    pub fn stored_key(&self) -> String {
        stored_key(self.id(), &self.original_filename)
    }

    /// Whether `needle` names this record by id, sanitized filename, or
    /// stored blob name.
    pub fn matches(&self, needle: &str) -> bool {
        self.id() == needle || self.original_filename == needle || self.stored_key() == needle
    }
}

/// Ordered list of every submission, kept as one JSON document in the blob
/// store next to the blobs themselves.
///
/// Each mutation rewrites the whole document. Mutations go through `write_lock`
/// so two requests in this process can never interleave their read and write
/// halves; separate processes sharing a backend can still race.
pub struct MetadataIndex {
    store: Arc<dyn BlobStore>,
    write_lock: Mutex<()>,
}

impl MetadataIndex {
    pub fn new(store: Arc<dyn BlobStore>) -> Self {
        Self {
            store,
            write_lock: Mutex::new(()),
        }
    }

    /// Current records in submission order. A missing, unreadable or
    /// unparsable index reads as empty.
    pub async fn read_all(&self) -> Vec<SubmissionRecord> {
        let raw = match self.store.get(INDEX_KEY).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return Vec::new(),
            Err(err) => {
                warn!(?err, "failed to read submission index; treating as empty");
                return Vec::new();
            }
        };
        match serde_json::from_slice::<Vec<SubmissionRecord>>(&raw) {
            Ok(records) => records,
            Err(err) => {
                warn!(
                    index_corrupt = true,
                    %err,
                    bytes = raw.len(),
                    "submission index is not valid JSON; treating as empty"
                );
                Vec::new()
            }
        }
    }

    pub async fn append(&self, record: SubmissionRecord) -> anyhow::Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut records = self.read_all().await;
        records.push(record);
        self.write(&records).await?;
        debug!(total = records.len(), "appended submission record");
        Ok(())
    }

    /// Drop every record matching `predicate`, returning the removed ones.
    /// Nothing is written when no record matches.
    pub async fn remove<F>(&self, predicate: F) -> anyhow::Result<Vec<SubmissionRecord>>
    where
        F: Fn(&SubmissionRecord) -> bool,
    {
        let _guard = self.write_lock.lock().await;
        let (removed, kept): (Vec<_>, Vec<_>) =
            self.read_all().await.into_iter().partition(|r| predicate(r));
        if removed.is_empty() {
            return Ok(removed);
        }
        self.write(&kept).await?;
        debug!(
            removed = removed.len(),
            total = kept.len(),
            "removed submission records"
        );
        Ok(removed)
    }

    /// Runs `cleanup` for a blob whose record never made it into the index,
    /// unless an existing record still points at `key`. Returns whether
    /// `cleanup` ran. An unreadable index counts as referenced.
    pub async fn release_unreferenced<F, Fut>(
        &self,
        key: &str,
        cleanup: F,
    ) -> anyhow::Result<bool>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<DeleteOutcome>>,
    {
        let _guard = self.write_lock.lock().await;
        let records = match self
            .store
            .get(INDEX_KEY)
            .await
            .context("reading submission index")?
        {
            Some(raw) => serde_json::from_slice::<Vec<SubmissionRecord>>(&raw).unwrap_or_default(),
            None => Vec::new(),
        };
        if records.iter().any(|r| r.stored_key() == key) {
            return Ok(false);
        }
        cleanup().await?;
        Ok(true)
    }

    async fn write(&self, records: &[SubmissionRecord]) -> anyhow::Result<()> {
        let body = serde_json::to_vec_pretty(records).context("serializing submission index")?;
        self.store
            .put(INDEX_KEY, Bytes::from(body), "application/json")
            .await
            .context("writing submission index")?;
        Ok(())
    }
}
