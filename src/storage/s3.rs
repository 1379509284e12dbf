use anyhow::{Context, anyhow};
use aws_config::BehaviorVersion;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::{
    Client,
    config::{Builder as S3ConfigBuilder, Region},
};
use bytes::Bytes;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};

use crate::config::S3Config;
use crate::storage::{
    BackendKind, BlobStore, DeleteOutcome, Locator, object_content_type, object_name,
};

const KEY_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

#[derive(Clone)]
pub struct S3Store {
    client: Client,
    bucket: String,
    prefix: String,
    public_base: String,
}

impl S3Store {
    pub async fn new(config: S3Config) -> anyhow::Result<Self> {
        let mut loader =
            aws_config::defaults(BehaviorVersion::latest()).region(Region::new(config.region.clone()));
        if let Some(ep) = &config.endpoint_url {
            loader = loader.endpoint_url(ep);
        }
        let shared = loader.load().await;
        let mut b = S3ConfigBuilder::from(&shared);
        if config.force_path_style {
            b = b.force_path_style(true);
        }
        let client = Client::from_conf(b.build());
        let public_base = public_base(&config);
        Ok(Self {
            client,
            bucket: config.bucket,
            prefix: config.prefix,
            public_base,
        })
    }

    fn object_key(&self, key: &str) -> String {
        object_name(&self.prefix, key)
    }

    async fn exists(&self, object_key: &str) -> anyhow::Result<bool> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(object_key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(SdkError::ServiceError(err)) if err.err().is_not_found() => Ok(false),
            Err(err) => Err(anyhow!("head object {object_key} failed: {err}")),
        }
    }
}

/// Base URL objects are publicly reachable under, without a trailing slash.
fn public_base(config: &S3Config) -> String {
    if let Some(base) = &config.public_url_base {
        return base.trim_end_matches('/').to_string();
    }
    match &config.endpoint_url {
        Some(endpoint) if config.force_path_style => {
            format!("{}/{}", endpoint.trim_end_matches('/'), config.bucket)
        }
        Some(endpoint) => {
            let (scheme, host) = endpoint
                .split_once("://")
                .unwrap_or(("https", endpoint.as_str()));
            format!("{scheme}://{}.{}", config.bucket, host.trim_end_matches('/'))
        }
        None => format!("https://{}.s3.{}.amazonaws.com", config.bucket, config.region),
    }
}

#[async_trait::async_trait]
impl BlobStore for S3Store {
    fn kind(&self) -> BackendKind {
        BackendKind::S3
    }

    async fn put(&self, key: &str, body: Bytes, content_type: &str) -> anyhow::Result<Locator> {
        let object_key = self.object_key(key);
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&object_key)
            .content_type(object_content_type(content_type))
            .body(ByteStream::from(body))
            .send()
            .await
            .with_context(|| format!("put object {object_key} failed"))?;
        let encoded = utf8_percent_encode(key, KEY_ENCODE_SET).to_string();
        Ok(Locator {
            key: key.to_string(),
            url: Some(format!(
                "{}/{}",
                self.public_base,
                object_name(&self.prefix, &encoded)
            )),
            handle: None,
        })
    }

    async fn get(&self, key: &str) -> anyhow::Result<Option<Bytes>> {
        let object_key = self.object_key(key);
        match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&object_key)
            .send()
            .await
        {
            Ok(output) => {
                let data = output
                    .body
                    .collect()
                    .await
                    .with_context(|| format!("failed to read body of {object_key}"))?;
                Ok(Some(data.into_bytes()))
            }
            Err(SdkError::ServiceError(err)) => {
                if err.err().is_no_such_key() {
                    return Ok(None);
                }
                Err(anyhow::Error::msg(format!("get object failed: {err:?}")))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn delete(&self, key: &str, _handle: Option<&str>) -> anyhow::Result<DeleteOutcome> {
        let object_key = self.object_key(key);
        // S3 reports success for missing keys, so ask first.
        if !self.exists(&object_key).await? {
            return Ok(DeleteOutcome::Missing);
        }
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(&object_key)
            .send()
            .await
            .with_context(|| format!("delete object {object_key} failed"))?;
        Ok(DeleteOutcome::Deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> S3Config {
        S3Config {
            bucket: "flowers".into(),
            region: "eu-west-1".into(),
            endpoint_url: None,
            force_path_style: false,
            public_url_base: None,
            prefix: "uploads".into(),
        }
    }

    #[test]
    fn public_base_defaults_to_virtual_host_aws_url() {
        assert_eq!(
            public_base(&config()),
            "https://flowers.s3.eu-west-1.amazonaws.com"
        );
    }

    #[test]
    fn public_base_uses_path_style_endpoint() {
        let mut cfg = config();
        cfg.endpoint_url = Some("http://minio:9000/".into());
        cfg.force_path_style = true;
        assert_eq!(public_base(&cfg), "http://minio:9000/flowers");
    }

    #[test]
    fn public_base_prefers_explicit_override() {
        let mut cfg = config();
        cfg.endpoint_url = Some("http://minio:9000".into());
        cfg.public_url_base = Some("https://cdn.example.com/".into());
        assert_eq!(public_base(&cfg), "https://cdn.example.com");
    }
}
