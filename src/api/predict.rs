use axum::{
    Json,
    extract::{Multipart, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;

use crate::http::AppState;
use crate::predict::{IMAGE_FIELD, PredictionError};

fn failure(status: StatusCode, error: impl Into<String>) -> Response {
    (
        status,
        Json(json!({ "success": false, "error": error.into() })),
    )
        .into_response()
}

// POST /predict
// Relays the image to the prediction service without looking at the answer.
pub async fn predict(State(st): State<AppState>, mut multipart: Multipart) -> Response {
    let Some(predictor) = st.predictor.clone() else {
        return failure(
            StatusCode::SERVICE_UNAVAILABLE,
            "prediction service is not configured",
        );
    };

    let mut image = None;
    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(err) => return failure(StatusCode::BAD_REQUEST, err.body_text()),
        };
        let name = field.name().map(str::to_string);
        if !matches!(name.as_deref(), Some(IMAGE_FIELD) | Some("file")) {
            continue;
        }
        let filename = field.file_name().unwrap_or("image").to_string();
        let content_type = field.content_type().map(str::to_string);
        match field.bytes().await {
            Ok(bytes) => image = Some((filename, content_type, bytes)),
            Err(err) => return failure(StatusCode::BAD_REQUEST, err.body_text()),
        }
    }

    let Some((filename, content_type, bytes)) = image else {
        return failure(StatusCode::BAD_REQUEST, "No file uploaded");
    };
    if bytes.is_empty() {
        return failure(StatusCode::BAD_REQUEST, "No file selected");
    }

    match predictor
        .predict(bytes, &filename, content_type.as_deref())
        .await
    {
        Ok(prediction) => Json(json!({
            "success": true,
            "prediction": prediction.prediction,
            "confidence": prediction.confidence,
        }))
        .into_response(),
        Err(PredictionError::Rejected(msg)) => failure(StatusCode::BAD_REQUEST, msg),
        Err(err @ PredictionError::Upstream(_)) => {
            failure(StatusCode::BAD_GATEWAY, err.to_string())
        }
    }
}
