use std::time::Duration;

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, StatusCode, multipart};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// Multipart field the prediction service reads the image from.
pub const IMAGE_FIELD: &str = "flower_image";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub prediction: String,
    pub confidence: f64,
}

#[derive(Debug, Error)]
pub enum PredictionError {
    /// The service looked at the request and refused it.
    #[error("{0}")]
    Rejected(String),
    #[error("prediction service unavailable: {0:#}")]
    Upstream(anyhow::Error),
}

#[async_trait]
pub trait PredictionClient: Send + Sync + 'static {
    async fn predict(
        &self,
        image: Bytes,
        filename: &str,
        content_type: Option<&str>,
    ) -> Result<Prediction, PredictionError>;
}

#[derive(Clone)]
pub struct HttpPredictionClient {
    client: Client,
    endpoint: Url,
}

impl HttpPredictionClient {
    pub fn new(endpoint: Url, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build prediction HTTP client")?;
        Ok(Self { client, endpoint })
    }
}

#[async_trait]
impl PredictionClient for HttpPredictionClient {
    async fn predict(
        &self,
        image: Bytes,
        filename: &str,
        content_type: Option<&str>,
    ) -> Result<Prediction, PredictionError> {
        let mut part = multipart::Part::bytes(image.to_vec()).file_name(filename.to_string());
        if let Some(content_type) = content_type {
            part = part
                .mime_str(content_type)
                .map_err(|_| PredictionError::Rejected(format!("invalid content type {content_type}")))?;
        }
        let form = multipart::Form::new().part(IMAGE_FIELD, part);

        let response = self
            .client
            .post(self.endpoint.clone())
            .multipart(form)
            .send()
            .await
            .with_context(|| format!("request to {} failed", self.endpoint))
            .map_err(PredictionError::Upstream)?;
        let status = response.status();
        let body = response
            .bytes()
            .await
            .context("failed to read prediction response")
            .map_err(PredictionError::Upstream)?;

        let result = interpret(status, &body);
        if let Err(err) = &result {
            tracing::warn!(%status, %err, "prediction failed");
        }
        result
    }
}

#[derive(Deserialize)]
struct UpstreamReply {
    #[serde(default)]
    success: bool,
    prediction: Option<String>,
    confidence: Option<f64>,
    error: Option<String>,
}

fn interpret(status: StatusCode, body: &[u8]) -> Result<Prediction, PredictionError> {
    let reply = serde_json::from_slice::<UpstreamReply>(body).ok();
    match reply {
        Some(UpstreamReply {
            success: true,
            prediction: Some(prediction),
            confidence: Some(confidence),
            ..
        }) if status.is_success() => Ok(Prediction {
            prediction,
            confidence,
        }),
        Some(UpstreamReply {
            error: Some(error), ..
        }) if status.is_success() || status.is_client_error() => {
            Err(PredictionError::Rejected(error))
        }
        _ => Err(PredictionError::Upstream(anyhow!(
            "prediction service answered {status} with an unusable body"
        ))),
    }
}
