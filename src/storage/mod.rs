use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;

pub mod drive;
pub mod fs;
pub mod gcs;
pub mod s3;

/// Name of the resource holding the submission index inside a store.
pub const INDEX_KEY: &str = "submissions.json";

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Fs,
    Gcs,
    S3,
    Drive,
}

/// Where a blob ended up after [`BlobStore::put`].
///
/// `url` is a link a client can follow directly (object-store public URL or
/// remote-drive link). `handle` is an opaque node reference only the remote
/// drive hands out.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Locator {
    pub key: String,
    pub url: Option<String>,
    pub handle: Option<String>,
}

impl Locator {
    pub fn local(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            url: None,
            handle: None,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DeleteOutcome {
    Deleted,
    Missing,
}

/// Object stores keep every blob under an optional `{prefix}/`.
pub(crate) fn object_name(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}/{key}")
    }
}

/// Content type recorded on an object-store write; blank falls back to
/// `application/octet-stream`.
pub(crate) fn object_content_type(content_type: &str) -> &str {
    match content_type.trim() {
        "" => "application/octet-stream",
        declared => declared,
    }
}

#[async_trait]
pub trait BlobStore: Send + Sync + 'static {
    fn kind(&self) -> BackendKind;

    /// Store `body` under `key`, replacing any previous blob with that key.
    ///
    /// Retrying after a transient failure is safe; a retry simply overwrites.
    async fn put(&self, key: &str, body: Bytes, content_type: &str) -> anyhow::Result<Locator>;

    /// Fetch the blob stored under `key`. `Ok(None)` means the store answered
    /// and the blob does not exist.
    async fn get(&self, key: &str) -> anyhow::Result<Option<Bytes>>;

    /// Remove a blob. `handle` is the backend handle recorded at upload time,
    /// when the backend hands one out.
    async fn delete(&self, key: &str, handle: Option<&str>) -> anyhow::Result<DeleteOutcome>;

    /// Link clients should be redirected to instead of streaming through us.
    fn redirect_target(&self, _locator: Option<&str>) -> Option<String> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_name_applies_prefix() {
        assert_eq!(object_name("uploads", "1_a.png"), "uploads/1_a.png");
        assert_eq!(object_name("", "1_a.png"), "1_a.png");
    }

    #[test]
    fn object_content_type_keeps_declared_type() {
        assert_eq!(object_content_type("image/webp"), "image/webp");
        assert_eq!(object_content_type(" image/png "), "image/png");
        assert_eq!(object_content_type(""), "application/octet-stream");
    }
}
