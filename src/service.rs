use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use bytes::Bytes;
use chrono::{DateTime, FixedOffset, Local};
use thiserror::Error;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::ident::{IdentifierGenerator, sanitize_filename};
use crate::meta::{MetadataIndex, PUBLIC_PATH_PREFIX, SubmissionRecord};
use crate::storage::{BackendKind, BlobStore, DeleteOutcome, INDEX_KEY, Locator};

pub const DEFAULT_NICKNAME: &str = "anonymous";

const ALLOWED_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp"];
const ALLOWED_MIME_TYPES: &[&str] = &["image/jpeg", "image/jpg", "image/png", "image/webp"];

pub type Clock = Arc<dyn Fn() -> DateTime<FixedOffset> + Send + Sync>;

pub fn system_clock() -> Clock {
    Arc::new(|| Local::now().fixed_offset())
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{0}")]
    Validation(String),
    #[error("storage backend unavailable: {0:#}")]
    BackendUnavailable(anyhow::Error),
    #[error("not found")]
    NotFound,
}

pub type Result<T> = std::result::Result<T, ServiceError>;

#[derive(Clone, Debug)]
pub struct ServiceSettings {
    pub max_upload_bytes: Option<u64>,
    pub backend_timeout: Duration,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            max_upload_bytes: None,
            backend_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Clone, Debug)]
pub struct NewSubmission {
    pub bytes: Bytes,
    pub mime_type: Option<String>,
    pub filename: String,
    pub nickname: Option<String>,
}

#[derive(Clone, Debug)]
pub struct Submitted {
    pub id: String,
    pub locator: Locator,
    pub public_url: String,
    pub record: SubmissionRecord,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Retrieved {
    Blob {
        bytes: Bytes,
        content_type: &'static str,
    },
    Redirect(String),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeleteSummary {
    pub records_removed: usize,
    pub blobs_removed: usize,
    pub blob_failures: usize,
}

/// Upload, list, retrieve and delete submissions against one configured
/// backend.
pub struct UploadService {
    store: Arc<dyn BlobStore>,
    index: MetadataIndex,
    ids: IdentifierGenerator,
    settings: ServiceSettings,
    clock: Clock,
}

impl UploadService {
    pub fn new(store: Arc<dyn BlobStore>, ids: IdentifierGenerator, settings: ServiceSettings) -> Self {
        Self::with_clock(store, ids, settings, system_clock())
    }

    pub fn with_clock(
        store: Arc<dyn BlobStore>,
        ids: IdentifierGenerator,
        settings: ServiceSettings,
        clock: Clock,
    ) -> Self {
        Self {
            index: MetadataIndex::new(store.clone()),
            store,
            ids,
            settings,
            clock,
        }
    }

    pub fn backend(&self) -> BackendKind {
        self.store.kind()
    }

    pub fn settings(&self) -> &ServiceSettings {
        &self.settings
    }

    pub async fn submit(&self, submission: NewSubmission) -> Result<Submitted> {
        let NewSubmission {
            bytes,
            mime_type,
            filename,
            nickname,
        } = submission;

        let sanitized = sanitize_filename(filename.trim());
        if sanitized.is_empty() {
            return Err(ServiceError::Validation("no file provided".into()));
        }
        let content_type = validate_type(&sanitized, mime_type.as_deref())?;
        if let Some(limit) = self.settings.max_upload_bytes {
            if bytes.len() as u64 > limit {
                return Err(ServiceError::Validation(format!(
                    "file exceeds maximum size of {limit} bytes"
                )));
            }
        }

        let now = (self.clock)();
        let generated = self.ids.generate(&sanitized, now.date_naive());
        let key = generated.stored_key();
        let size = bytes.len();

        let locator = self
            .bounded("storing blob", self.store.put(&key, bytes, content_type))
            .await?;

        let record = SubmissionRecord {
            nickname: normalize_nickname(nickname.as_deref()),
            submitted_at: now,
            original_filename: generated.sanitized.clone(),
            public_path: format!("{PUBLIC_PATH_PREFIX}{}", generated.id),
            filename_length: generated.length,
            hashed_numeric: generated.hashed_numeric,
            backend_locator: locator.url.clone(),
            backend_handle: locator.handle.clone(),
        };

        if let Err(err) = self
            .bounded("appending submission record", self.index.append(record.clone()))
            .await
        {
            // Without a record nobody can reach or delete the blob, unless an
            // earlier same-day submission of this name already owns the key.
            let cleanup = self.index.release_unreferenced(&key, || {
                self.store.delete(&key, locator.handle.as_deref())
            });
            match timeout(self.settings.backend_timeout, cleanup).await {
                Ok(Ok(true)) => {}
                Ok(Ok(false)) => {
                    warn!(%key, "blob shared with an indexed submission; leaving it in place");
                }
                Ok(Err(cleanup_err)) => {
                    warn!(%key, ?cleanup_err, "failed to remove blob after index write failure");
                }
                Err(_) => warn!(%key, "removing blob after index write failure timed out"),
            }
            return Err(err);
        }

        info!(
            id = %generated.id,
            %key,
            size,
            backend = ?self.store.kind(),
            "stored submission"
        );

        let public_url = locator
            .url
            .clone()
            .unwrap_or_else(|| record.public_path.clone());
        Ok(Submitted {
            id: generated.id,
            locator,
            public_url,
            record,
        })
    }

    /// Every record in submission order. Never fails; an unavailable index
    /// reads as empty.
    pub async fn list(&self) -> Vec<SubmissionRecord> {
        match timeout(self.settings.backend_timeout, self.index.read_all()).await {
            Ok(records) => records,
            Err(_) => {
                warn!(
                    timeout = ?self.settings.backend_timeout,
                    "reading submission index timed out; treating as empty"
                );
                Vec::new()
            }
        }
    }

    pub async fn retrieve(&self, id: &str) -> Result<Retrieved> {
        let record = self
            .list()
            .await
            .into_iter()
            .rev()
            .find(|r| r.matches(id))
            .ok_or(ServiceError::NotFound)?;

        if let Some(url) = self.store.redirect_target(record.backend_locator.as_deref()) {
            return Ok(Retrieved::Redirect(url));
        }

        let key = record.stored_key();
        let bytes = self
            .bounded("reading blob", self.store.get(&key))
            .await?
            .ok_or(ServiceError::NotFound)?;
        Ok(Retrieved::Blob {
            bytes,
            content_type: content_type_for(&record.original_filename),
        })
    }

    /// Remove every submission named by `target` (id, sanitized filename or
    /// stored key). Blob removal is best-effort so an unreachable backend
    /// never leaves a record undeletable.
    pub async fn delete(&self, target: &str) -> Result<DeleteSummary> {
        if target.is_empty() || target == INDEX_KEY {
            return Err(ServiceError::NotFound);
        }

        let targets: Vec<SubmissionRecord> = self
            .list()
            .await
            .into_iter()
            .filter(|r| r.matches(target))
            .collect();

        let mut summary = DeleteSummary::default();

        if targets.is_empty() {
            // No record, but a stray blob may still be lying around. Only a
            // full `{id}_{name}` key is tried, never a bare id or filename.
            if !is_stored_key(target) {
                return Err(ServiceError::NotFound);
            }
            return match self
                .bounded("deleting blob", self.store.delete(target, None))
                .await
            {
                Ok(DeleteOutcome::Deleted) => {
                    info!(%target, "removed blob without submission record");
                    summary.blobs_removed = 1;
                    Ok(summary)
                }
                Ok(DeleteOutcome::Missing) => Err(ServiceError::NotFound),
                Err(err) => {
                    warn!(%target, %err, "orphan blob delete failed");
                    Err(ServiceError::NotFound)
                }
            };
        }

        for record in &targets {
            let key = record.stored_key();
            match self
                .bounded(
                    "deleting blob",
                    self.store.delete(&key, record.backend_handle.as_deref()),
                )
                .await
            {
                Ok(DeleteOutcome::Deleted) => summary.blobs_removed += 1,
                Ok(DeleteOutcome::Missing) => {
                    warn!(%key, "blob already missing while deleting submission");
                }
                Err(err) => {
                    summary.blob_failures += 1;
                    warn!(%key, %err, "blob delete failed; removing submission record anyway");
                }
            }
        }

        let removed = self
            .bounded(
                "removing submission records",
                self.index.remove(|r| r.matches(target)),
            )
            .await?;
        summary.records_removed = removed.len();

        info!(
            %target,
            records = summary.records_removed,
            blobs = summary.blobs_removed,
            failures = summary.blob_failures,
            "deleted submission"
        );
        Ok(summary)
    }

    async fn bounded<T, F>(&self, what: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        match timeout(self.settings.backend_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(ServiceError::BackendUnavailable(err.context(what))),
            Err(_) => Err(ServiceError::BackendUnavailable(anyhow!(
                "{what} timed out after {:?}",
                self.settings.backend_timeout
            ))),
        }
    }
}

fn normalize_nickname(nickname: Option<&str>) -> String {
    nickname
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .unwrap_or(DEFAULT_NICKNAME)
        .to_string()
}

/// `{digits}_{name}`, the shape every blob we write is stored under.
fn is_stored_key(target: &str) -> bool {
    match target.split_once('_') {
        Some((id, name)) => {
            !id.is_empty() && id.bytes().all(|b| b.is_ascii_digit()) && !name.is_empty()
        }
        None => false,
    }
}

fn extension(name: &str) -> Option<String> {
    Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
}

/// Checks the name and declared type against the image allow-list and
/// returns the content type to store the blob with.
fn validate_type(sanitized: &str, mime_type: Option<&str>) -> Result<&'static str> {
    let ext = extension(sanitized).unwrap_or_default();
    if !ALLOWED_EXTENSIONS.contains(&ext.as_str()) {
        return Err(ServiceError::Validation("invalid file extension".into()));
    }
    if let Some(mime) = mime_type {
        let essence = mime
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        if !essence.is_empty() && !ALLOWED_MIME_TYPES.contains(&essence.as_str()) {
            return Err(ServiceError::Validation(format!(
                "unsupported content type {essence}"
            )));
        }
    }
    Ok(content_type_for(sanitized))
}

pub fn content_type_for(name: &str) -> &'static str {
    match extension(name).as_deref() {
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("webp") => "image/webp",
        _ => "application/octet-stream",
    }
}
