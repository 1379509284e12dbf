use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use google_cloud_auth::credentials::{Credentials, service_account};
use google_cloud_gax::error::rpc::Code;
use google_cloud_storage::client::{Storage, StorageControl};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use url::Url;

use crate::config::GcsConfig;
use crate::storage::{
    BackendKind, BlobStore, DeleteOutcome, Locator, object_content_type, object_name,
};

const DEFAULT_ENDPOINT: &str = "https://storage.googleapis.com";

const OBJECT_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

#[derive(Clone)]
pub struct GcsStore {
    storage: Storage,
    control: StorageControl,
    bucket_resource: String,
    bucket_name: String,
    prefix: String,
    base_url: Url,
}

impl GcsStore {
    pub async fn new(config: GcsConfig) -> Result<Self> {
        let mut storage_builder = Storage::builder();
        let mut control_builder = StorageControl::builder();
        if let Some(raw_json) = &config.credentials_json {
            let credentials = build_credentials(raw_json)?;
            storage_builder = storage_builder.with_credentials(credentials.clone());
            control_builder = control_builder.with_credentials(credentials);
        }
        if let Some(endpoint) = &config.endpoint {
            storage_builder = storage_builder.with_endpoint(endpoint.clone());
            control_builder = control_builder.with_endpoint(endpoint.clone());
        }
        let storage = storage_builder
            .build()
            .await
            .context("failed to build GCS storage client")?;
        let control = control_builder
            .build()
            .await
            .context("failed to build GCS control client")?;

        let base_url = public_base_url(config.endpoint.as_deref())?;

        Ok(Self {
            storage,
            control,
            bucket_resource: format!("projects/_/buckets/{}", config.bucket),
            bucket_name: config.bucket,
            prefix: config.prefix,
            base_url,
        })
    }

    fn object_name(&self, key: &str) -> String {
        object_name(&self.prefix, key)
    }

    fn public_url(&self, key: &str) -> String {
        public_url(&self.base_url, &self.bucket_name, &self.prefix, key)
    }
}

fn build_credentials(raw_json: &serde_json::Value) -> Result<Credentials> {
    service_account::Builder::new(raw_json.clone())
        .build()
        .map_err(|e| anyhow!("invalid GCS service account credentials: {e}"))
}

fn public_base_url(endpoint: Option<&str>) -> Result<Url> {
    let base_url = match endpoint {
        Some(endpoint) => Url::parse(endpoint).context("invalid GCS endpoint URL")?,
        None => Url::parse(DEFAULT_ENDPOINT)?,
    };
    if base_url.path() != "/" {
        bail!("GCS endpoint URL must not include a path component");
    }
    Ok(base_url)
}

/// Public objects are served at `{endpoint}/{bucket}/{object}`. The URL is
/// built locally; nothing checks that the object exists.
fn public_url(base: &Url, bucket: &str, prefix: &str, key: &str) -> String {
    let encoded = utf8_percent_encode(key, OBJECT_ENCODE_SET).to_string();
    let origin = base.as_str().trim_end_matches('/');
    format!("{origin}/{bucket}/{}", object_name(prefix, &encoded))
}

#[async_trait]
impl BlobStore for GcsStore {
    fn kind(&self) -> BackendKind {
        BackendKind::Gcs
    }

    async fn put(&self, key: &str, body: Bytes, content_type: &str) -> Result<Locator> {
        let object_name = self.object_name(key);
        self.storage
            .write_object(self.bucket_resource.clone(), object_name.clone(), body)
            .set_content_type(object_content_type(content_type))
            .send_buffered()
            .await
            .with_context(|| {
                format!(
                    "failed to write object {object_name} to bucket {}",
                    self.bucket_name
                )
            })?;
        Ok(Locator {
            key: key.to_string(),
            url: Some(self.public_url(key)),
            handle: None,
        })
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let object_name = self.object_name(key);
        let mut response = match self
            .storage
            .read_object(self.bucket_resource.clone(), object_name.clone())
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => {
                if err.http_status_code() == Some(404) {
                    return Ok(None);
                }
                return Err(anyhow!(
                    "failed to read object {object_name} from bucket {}: {err}",
                    self.bucket_name
                ));
            }
        };

        let mut buffer = BytesMut::new();
        while let Some(chunk) = response.next().await {
            let chunk = chunk.map_err(|err| anyhow!("failed to stream {object_name}: {err}"))?;
            buffer.extend_from_slice(&chunk);
        }
        Ok(Some(buffer.freeze()))
    }

    async fn delete(&self, key: &str, _handle: Option<&str>) -> Result<DeleteOutcome> {
        let object_name = self.object_name(key);
        match self
            .control
            .delete_object()
            .set_bucket(self.bucket_resource.clone())
            .set_object(object_name.clone())
            .send()
            .await
        {
            Ok(_) => Ok(DeleteOutcome::Deleted),
            Err(err) => {
                if err.status().map(|s| s.code) == Some(Code::NotFound) {
                    return Ok(DeleteOutcome::Missing);
                }
                if err.http_status_code() == Some(404) {
                    return Ok(DeleteOutcome::Missing);
                }
                Err(anyhow!(
                    "failed to delete object {object_name} from bucket {}: {err}",
                    self.bucket_name
                ))
            }
        }
    }
}
