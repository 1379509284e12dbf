use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use bytes::Bytes;

use crate::storage::{BackendKind, BlobStore, DeleteOutcome, INDEX_KEY, Locator};

/// In-memory [`BlobStore`] with switches for injecting backend failures.
#[derive(Default)]
pub struct MemoryStore {
    blobs: Mutex<BTreeMap<String, Bytes>>,
    puts: AtomicUsize,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    fail_index_writes: AtomicBool,
    fail_deletes: AtomicBool,
    latency: Option<Duration>,
    link_base: Option<String>,
}

impl MemoryStore {
    /// Every read and write sleeps for `latency` first, which widens the
    /// window between an index read and its write-back.
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            ..Self::default()
        }
    }

    /// Behaves like a remote drive: uploads get an external link and reads of
    /// that link redirect.
    pub fn with_links(base: &str) -> Self {
        Self {
            link_base: Some(base.trim_end_matches('/').to_string()),
            ..Self::default()
        }
    }

    pub fn insert(&self, key: &str, body: impl Into<Bytes>) {
        self.blobs
            .lock()
            .expect("memory store poisoned")
            .insert(key.to_string(), body.into());
    }

    pub fn contains(&self, key: &str) -> bool {
        self.blobs
            .lock()
            .expect("memory store poisoned")
            .contains_key(key)
    }

    /// Keys of stored blobs, excluding the submission index.
    pub fn blob_keys(&self) -> Vec<String> {
        self.blobs
            .lock()
            .expect("memory store poisoned")
            .keys()
            .filter(|k| k.as_str() != INDEX_KEY)
            .cloned()
            .collect()
    }

    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn fail_index_writes(&self, fail: bool) {
        self.fail_index_writes.store(fail, Ordering::SeqCst);
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    async fn delay(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl BlobStore for MemoryStore {
    fn kind(&self) -> BackendKind {
        if self.link_base.is_some() {
            BackendKind::Drive
        } else {
            BackendKind::Fs
        }
    }

    async fn put(&self, key: &str, body: Bytes, _content_type: &str) -> anyhow::Result<Locator> {
        self.delay().await;
        if self.fail_writes.load(Ordering::SeqCst)
            || (key == INDEX_KEY && self.fail_index_writes.load(Ordering::SeqCst))
        {
            bail!("injected write failure for {key}");
        }
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.insert(key, body);
        Ok(Locator {
            key: key.to_string(),
            url: self.link_base.as_ref().map(|base| format!("{base}/{key}")),
            handle: self.link_base.as_ref().map(|_| format!("node-{key}")),
        })
    }

    async fn get(&self, key: &str) -> anyhow::Result<Option<Bytes>> {
        self.delay().await;
        if self.fail_reads.load(Ordering::SeqCst) {
            bail!("injected read failure for {key}");
        }
        Ok(self
            .blobs
            .lock()
            .expect("memory store poisoned")
            .get(key)
            .cloned())
    }

    async fn delete(&self, key: &str, _handle: Option<&str>) -> anyhow::Result<DeleteOutcome> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            bail!("injected delete failure for {key}");
        }
        let removed = self
            .blobs
            .lock()
            .expect("memory store poisoned")
            .remove(key);
        Ok(match removed {
            Some(_) => DeleteOutcome::Deleted,
            None => DeleteOutcome::Missing,
        })
    }

    fn redirect_target(&self, locator: Option<&str>) -> Option<String> {
        self.link_base.as_ref().and(locator.map(str::to_string))
    }
}
