use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::storage::{BackendKind, BlobStore, DeleteOutcome, INDEX_KEY, Locator};

/// Keeps every blob as a flat file directly under `root`.
#[derive(Clone)]
pub struct FsStore {
    root: PathBuf,
    file_mode: Option<u32>,
    dir_mode: Option<u32>,
}

impl FsStore {
    pub async fn new(root: PathBuf, file_mode: Option<u32>, dir_mode: Option<u32>) -> Result<Self> {
        if !root.as_path().exists() {
            fs::create_dir_all(&root)
                .await
                .with_context(|| format!("failed to create data directory at {}", root.display()))?;
        }

        let canonical_root = fs::canonicalize(&root).await.with_context(|| {
            format!(
                "failed to resolve absolute path for data directory at {}",
                root.display()
            )
        })?;

        let store = Self {
            root: canonical_root,
            file_mode,
            dir_mode,
        };

        store
            .ensure_dir_mode(&store.root)
            .await
            .context("applying permissions to data directory")?;

        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn destination_path(&self, key: &str) -> Result<PathBuf> {
        let name = Self::sanitize_key(key)?;
        Ok(self.root.join(name))
    }

    fn staging_path(&self, key: &str) -> PathBuf {
        self.root.join(format!(".{key}.{}.tmp", Uuid::new_v4()))
    }

    /// Keys must name a single file inside the data directory.
    fn sanitize_key(key: &str) -> Result<PathBuf> {
        let mut components = Path::new(key).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(part)), None) => Ok(PathBuf::from(part)),
            (None, _) => anyhow::bail!("key may not be empty"),
            _ => anyhow::bail!("key contains invalid path segments"),
        }
    }

    /// Callers usually only know the bare id, while the file on disk is
    /// `{id}_{filename}`. Try the exact name first, then scan.
    async fn resolve(&self, key: &str) -> Result<Option<PathBuf>> {
        let exact = self.destination_path(key)?;
        if fs::try_exists(&exact)
            .await
            .with_context(|| format!("failed to stat {}", exact.display()))?
        {
            return Ok(Some(exact));
        }

        let prefix = format!("{key}_");
        let suffix = format!("_{key}");
        let mut entries = fs::read_dir(&self.root)
            .await
            .with_context(|| format!("failed to list {}", self.root.display()))?;
        let mut matches = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if name.starts_with('.') || name == INDEX_KEY {
                continue;
            }
            if name.starts_with(&prefix) || name.ends_with(&suffix) {
                matches.push(name);
            }
        }
        matches.sort();
        Ok(matches.into_iter().next().map(|name| self.root.join(name)))
    }

    async fn ensure_dir_mode<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        #[cfg(unix)]
        {
            if let Some(mode) = self.dir_mode {
                use std::os::unix::fs::PermissionsExt;
                let perms = std::fs::Permissions::from_mode(mode);
                fs::set_permissions(path.as_ref(), perms).await?;
            }
        }
        #[cfg(not(unix))]
        {
            let _ = (&self.dir_mode, path);
        }
        Ok(())
    }

    async fn ensure_file_mode<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        #[cfg(unix)]
        {
            if let Some(mode) = self.file_mode {
                use std::os::unix::fs::PermissionsExt;
                let perms = std::fs::Permissions::from_mode(mode);
                fs::set_permissions(path.as_ref(), perms).await?;
            }
        }
        #[cfg(not(unix))]
        {
            let _ = (&self.file_mode, path);
        }
        Ok(())
    }
}

#[async_trait]
impl BlobStore for FsStore {
    fn kind(&self) -> BackendKind {
        BackendKind::Fs
    }

    async fn put(&self, key: &str, body: Bytes, _content_type: &str) -> Result<Locator> {
        let destination = self.destination_path(key)?;
        let staging = self.staging_path(key);

        let mut file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&staging)
            .await
            .with_context(|| format!("failed to create staging file {}", staging.display()))?;
        file.write_all(&body).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        if let Err(err) = fs::rename(&staging, &destination).await {
            fs::remove_file(&staging).await.ok();
            return Err(err)
                .with_context(|| format!("failed to move blob into {}", destination.display()));
        }
        self.ensure_file_mode(&destination).await?;

        Ok(Locator::local(key))
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let Some(path) = self.resolve(key).await? else {
            return Ok(None);
        };
        match fs::read(&path).await {
            Ok(contents) => Ok(Some(Bytes::from(contents))),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => {
                Err(err).with_context(|| format!("failed to read blob at {}", path.display()))
            }
        }
    }

    /// Exact names only; the id/filename scan is for reads.
    async fn delete(&self, key: &str, _handle: Option<&str>) -> Result<DeleteOutcome> {
        let path = self.destination_path(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(DeleteOutcome::Deleted),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(DeleteOutcome::Missing),
            Err(err) => {
                Err(err).with_context(|| format!("failed to remove blob at {}", path.display()))
            }
        }
    }
}
