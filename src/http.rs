use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{delete, get, post},
};
use std::sync::Arc;
use std::time::Duration;
use tower_http::{cors::CorsLayer, timeout::TimeoutLayer, trace::TraceLayer};

use crate::api::{download, predict, submissions, upload};
use crate::config::Config;
use crate::predict::PredictionClient;
use crate::service::UploadService;

/// Room for multipart boundaries and the nickname field on top of the file.
const FORM_OVERHEAD_BYTES: u64 = 64 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<UploadService>,
    pub predictor: Option<Arc<dyn PredictionClient>>,
}

#[derive(Clone, Copy, Debug)]
pub struct HttpSettings {
    pub request_timeout: Duration,
    pub max_upload_bytes: Option<u64>,
}

impl HttpSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            request_timeout: cfg.request_timeout,
            max_upload_bytes: cfg.max_upload_bytes,
        }
    }

    /// Largest accepted request body. JSON uploads carry the file as base64,
    /// which inflates it by a third.
    fn body_limit(&self) -> Option<usize> {
        self.max_upload_bytes.map(|max| {
            let limit = max.saturating_mul(4).div_ceil(3).saturating_add(FORM_OVERHEAD_BYTES);
            usize::try_from(limit).unwrap_or(usize::MAX)
        })
    }
}

pub fn build_router(state: AppState, settings: HttpSettings) -> Router {
    let body_limit = match settings.body_limit() {
        Some(limit) => DefaultBodyLimit::max(limit),
        None => DefaultBodyLimit::disable(),
    };

    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/upload", post(upload::upload))
        .route("/submissions", get(submissions::list_submissions))
        .route("/uploads/:id", get(download::download))
        .route("/delete/:filename", delete(crate::api::delete::delete_submission))
        .route("/predict", post(predict::predict))
        .layer(body_limit)
        .layer(TimeoutLayer::new(settings.request_timeout))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
