//! Remote drive backend.
//!
//! The drive API addresses files by display name and hands out an opaque node
//! handle per upload. Uploads finish asynchronously on the drive side: the
//! node starts out `pending` and only counts as stored once it reports
//! `complete`, so [`DriveStore::put`] polls until it does.
//!
//! Endpoints used, relative to the configured base URL:
//!
//! - `POST   files` multipart `name` + `file`, returns the new node
//! - `GET    files?name=..` nodes with that display name, oldest first
//! - `GET    files/{handle}` node status
//! - `GET    files/{handle}/content` raw bytes
//! - `DELETE files/{handle}`
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, RequestBuilder, StatusCode, multipart};
use serde::Deserialize;
use tokio::time::{Instant, sleep};
use tracing::{debug, warn};
use url::Url;

use crate::config::DriveConfig;
use crate::storage::{BackendKind, BlobStore, DeleteOutcome, Locator};

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    Pending,
    Complete,
    Failed,
}

#[derive(Clone, Debug, Deserialize)]
pub struct DriveNode {
    pub handle: String,
    pub name: String,
    pub state: NodeState,
    #[serde(default)]
    pub link: Option<String>,
}

#[derive(Clone)]
pub struct DriveStore {
    client: Client,
    base: Url,
    token: Option<String>,
    poll_interval: Duration,
    upload_timeout: Duration,
}

impl DriveStore {
    pub fn new(config: DriveConfig) -> Result<Self> {
        if config.base_url.cannot_be_a_base() {
            bail!("REMOTE_DRIVE_URL must be a hierarchical http(s) URL");
        }
        let client = Client::builder()
            .build()
            .context("failed to build remote drive HTTP client")?;
        Ok(Self {
            client,
            base: config.base_url,
            token: config.token,
            poll_interval: config.poll_interval,
            upload_timeout: config.upload_timeout,
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow!("remote drive URL cannot be a base"))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn upload(&self, key: &str, body: Bytes, content_type: &str) -> Result<DriveNode> {
        let part = multipart::Part::bytes(body.to_vec())
            .file_name(key.to_string())
            .mime_str(content_type)
            .with_context(|| format!("invalid content type {content_type}"))?;
        let form = multipart::Form::new()
            .text("name", key.to_string())
            .part("file", part);
        let response = self
            .authorize(self.client.post(self.endpoint(&["files"])?))
            .multipart(form)
            .send()
            .await
            .with_context(|| format!("remote drive upload of {key} failed"))?
            .error_for_status()
            .with_context(|| format!("remote drive rejected upload of {key}"))?;
        response
            .json::<DriveNode>()
            .await
            .context("remote drive returned an invalid upload response")
    }

    async fn node(&self, handle: &str) -> Result<Option<DriveNode>> {
        let response = self
            .authorize(self.client.get(self.endpoint(&["files", handle])?))
            .send()
            .await
            .with_context(|| format!("remote drive status request for {handle} failed"))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let node = response
            .error_for_status()
            .with_context(|| format!("remote drive status request for {handle} failed"))?
            .json::<DriveNode>()
            .await
            .context("remote drive returned an invalid node")?;
        Ok(Some(node))
    }

    /// Nodes carrying `name`, oldest first.
    async fn nodes_named(&self, name: &str) -> Result<Vec<DriveNode>> {
        let mut url = self.endpoint(&["files"])?;
        url.query_pairs_mut().append_pair("name", name);
        self.authorize(self.client.get(url))
            .send()
            .await
            .with_context(|| format!("remote drive lookup of {name} failed"))?
            .error_for_status()
            .with_context(|| format!("remote drive lookup of {name} failed"))?
            .json::<Vec<DriveNode>>()
            .await
            .context("remote drive returned an invalid node listing")
    }

    async fn wait_for_completion(&self, mut node: DriveNode) -> Result<DriveNode> {
        let deadline = Instant::now() + self.upload_timeout;
        loop {
            match node.state {
                NodeState::Complete => return Ok(node),
                NodeState::Failed => bail!("remote drive reported upload of {} failed", node.name),
                NodeState::Pending => {}
            }
            if Instant::now() >= deadline {
                bail!(
                    "upload of {} did not complete within {:?}",
                    node.name,
                    self.upload_timeout
                );
            }
            sleep(self.poll_interval).await;
            node = self
                .node(&node.handle)
                .await?
                .ok_or_else(|| anyhow!("node {} vanished during upload", node.handle))?;
        }
    }

    async fn remove_node(&self, handle: &str) -> Result<DeleteOutcome> {
        let response = self
            .authorize(self.client.delete(self.endpoint(&["files", handle])?))
            .send()
            .await
            .with_context(|| format!("remote drive delete of {handle} failed"))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(DeleteOutcome::Missing);
        }
        response
            .error_for_status()
            .with_context(|| format!("remote drive delete of {handle} failed"))?;
        Ok(DeleteOutcome::Deleted)
    }
}

#[async_trait]
impl BlobStore for DriveStore {
    fn kind(&self) -> BackendKind {
        BackendKind::Drive
    }

    async fn put(&self, key: &str, body: Bytes, content_type: &str) -> Result<Locator> {
        let node = self.upload(key, body, content_type).await?;
        let node = self.wait_for_completion(node).await?;
        debug!(key, handle = %node.handle, "remote drive upload complete");

        // Display names are not unique on the drive; drop older copies so a
        // name keeps pointing at exactly one node.
        for stale in self.nodes_named(key).await? {
            if stale.handle == node.handle {
                continue;
            }
            if let Err(err) = self.remove_node(&stale.handle).await {
                warn!(key, handle = %stale.handle, ?err, "failed to remove superseded drive node");
            }
        }

        Ok(Locator {
            key: key.to_string(),
            url: node.link,
            handle: Some(node.handle),
        })
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let newest = self
            .nodes_named(key)
            .await?
            .into_iter()
            .rev()
            .find(|node| node.state == NodeState::Complete);
        let Some(node) = newest else {
            return Ok(None);
        };

        let response = self
            .authorize(
                self.client
                    .get(self.endpoint(&["files", node.handle.as_str(), "content"])?),
            )
            .send()
            .await
            .with_context(|| format!("remote drive download of {key} failed"))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let bytes = response
            .error_for_status()
            .with_context(|| format!("remote drive download of {key} failed"))?
            .bytes()
            .await
            .with_context(|| format!("failed to read {key} from remote drive"))?;
        Ok(Some(bytes))
    }

    async fn delete(&self, key: &str, handle: Option<&str>) -> Result<DeleteOutcome> {
        if let Some(handle) = handle {
            return self.remove_node(handle).await;
        }
        let nodes = self.nodes_named(key).await?;
        if nodes.is_empty() {
            return Ok(DeleteOutcome::Missing);
        }
        let mut outcome = DeleteOutcome::Missing;
        for node in nodes {
            if self.remove_node(&node.handle).await? == DeleteOutcome::Deleted {
                outcome = DeleteOutcome::Deleted;
            }
        }
        Ok(outcome)
    }

    fn redirect_target(&self, locator: Option<&str>) -> Option<String> {
        locator
            .filter(|link| link.starts_with("https://") || link.starts_with("http://"))
            .map(str::to_string)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(base: &str) -> DriveStore {
        DriveStore::new(DriveConfig {
            base_url: Url::parse(base).unwrap(),
            token: None,
            poll_interval: Duration::from_millis(10),
            upload_timeout: Duration::from_secs(1),
        })
        .unwrap()
    }

    #[test]
    fn endpoint_appends_encoded_segments() {
        let s = store("https://drive.example.com/api/");
        assert_eq!(
            s.endpoint(&["files", "a b"]).unwrap().as_str(),
            "https://drive.example.com/api/files/a%20b"
        );
        let s = store("https://drive.example.com/api");
        assert_eq!(
            s.endpoint(&["files"]).unwrap().as_str(),
            "https://drive.example.com/api/files"
        );
    }

    #[test]
    fn redirect_target_only_follows_http_links() {
        let store = store("https://drive.example.com/");
        assert_eq!(
            store.redirect_target(Some("https://drive.example.com/s/abc")),
            Some("https://drive.example.com/s/abc".to_string())
        );
        assert_eq!(store.redirect_target(Some("node:abc")), None);
        assert_eq!(store.redirect_target(None), None);
    }

    #[test]
    fn node_state_parses_lowercase() {
        let node: DriveNode =
            serde_json::from_str(r#"{"handle":"h1","name":"n","state":"pending"}"#).unwrap();
        assert_eq!(node.state, NodeState::Pending);
        assert!(node.link.is_none());
    }
}
