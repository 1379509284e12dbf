use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use serde::Serialize;

use crate::http::AppState;
use crate::service::ServiceError;

#[derive(Debug, Serialize)]
pub struct DeleteStatus {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// DELETE /delete/{filename}
pub async fn delete_submission(
    State(st): State<AppState>,
    Path(filename): Path<String>,
) -> (StatusCode, Json<DeleteStatus>) {
    match st.service.delete(&filename).await {
        Ok(_) => (
            StatusCode::OK,
            Json(DeleteStatus {
                status: "success",
                error: None,
            }),
        ),
        Err(err) => {
            let status = match &err {
                ServiceError::NotFound => StatusCode::NOT_FOUND,
                ServiceError::Validation(_) => StatusCode::BAD_REQUEST,
                ServiceError::BackendUnavailable(_) => {
                    tracing::warn!(%filename, %err, "delete failed");
                    StatusCode::BAD_GATEWAY
                }
            };
            (
                status,
                Json(DeleteStatus {
                    status: "error",
                    error: Some(err.to_string()),
                }),
            )
        }
    }
}
