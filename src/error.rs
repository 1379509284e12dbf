use axum::{Json, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use thiserror::Error;

use crate::service::ServiceError;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("not found")]
    NotFound,
    #[error("backend: {0}")]
    Backend(String),
    #[error("unavailable: {0}")]
    Unavailable(String),
    #[error("internal: {0}")]
    Internal(String),
}

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Validation(msg) => ApiError::BadRequest(msg),
            ServiceError::NotFound => ApiError::NotFound,
            ServiceError::BackendUnavailable(e) => ApiError::Backend(format!("{e:#}")),
        }
    }
}

#[derive(Serialize)]
struct Problem {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let (code, msg) = match &self {
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m.clone()),
            ApiError::NotFound => (StatusCode::NOT_FOUND, "not found".into()),
            ApiError::Backend(e) => {
                tracing::warn!(error = %e, "storage backend failure");
                (StatusCode::BAD_GATEWAY, format!("storage backend unavailable: {e}"))
            }
            ApiError::Unavailable(e) => (StatusCode::SERVICE_UNAVAILABLE, e.clone()),
            ApiError::Internal(e) => {
                tracing::error!(error = %e, "internal error");
                (StatusCode::INTERNAL_SERVER_ERROR, e.clone())
            }
        };
        (code, Json(Problem { error: msg })).into_response()
    }
}

pub type Result<T> = std::result::Result<T, ApiError>;
