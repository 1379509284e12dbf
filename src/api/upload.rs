use axum::{
    Json,
    extract::{FromRequest, Multipart, Request, State},
    http::header::CONTENT_TYPE,
};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{ApiError, Result};
use crate::http::AppState;
use crate::meta::SubmissionRecord;
use crate::service::NewSubmission;

/// Alternate upload body: the file travels inline as base64.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JsonUpload {
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub mimetype: Option<String>,
    #[serde(default)]
    pub data_base64: String,
    #[serde(default)]
    pub nickname: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    pub success: bool,
    pub metadata: SubmissionRecord,
    pub public_url: String,
}

// POST /upload
pub async fn upload(State(st): State<AppState>, request: Request) -> Result<Json<UploadResponse>> {
    let submission = if is_json(&request) {
        let Json(body) = Json::<JsonUpload>::from_request(request, &st)
            .await
            .map_err(|e| ApiError::BadRequest(e.body_text()))?;
        from_json(body)?
    } else {
        let multipart = Multipart::from_request(request, &st)
            .await
            .map_err(|e| ApiError::BadRequest(e.body_text()))?;
        from_multipart(multipart).await?
    };

    let submitted = st.service.submit(submission).await?;
    Ok(Json(UploadResponse {
        success: true,
        metadata: submitted.record,
        public_url: submitted.public_url,
    }))
}

fn is_json(request: &Request) -> bool {
    request
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim_start().to_ascii_lowercase().starts_with("application/json"))
        .unwrap_or(false)
}

async fn from_multipart(mut multipart: Multipart) -> Result<NewSubmission> {
    let mut file: Option<(String, Option<String>, Bytes)> = None;
    let mut nickname = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(e.body_text()))?
    {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("file") => {
                let filename = field.file_name().unwrap_or_default().to_string();
                let mime = field.content_type().map(str::to_string);
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::BadRequest(e.body_text()))?;
                file = Some((filename, mime, bytes));
            }
            Some("nickname") => {
                nickname = Some(
                    field
                        .text()
                        .await
                        .map_err(|e| ApiError::BadRequest(e.body_text()))?,
                );
            }
            _ => {}
        }
    }

    let (filename, mime_type, bytes) =
        file.ok_or_else(|| ApiError::BadRequest("no file provided".into()))?;
    Ok(NewSubmission {
        bytes,
        mime_type,
        filename,
        nickname,
    })
}

fn from_json(body: JsonUpload) -> Result<NewSubmission> {
    if body.filename.trim().is_empty() || body.data_base64.trim().is_empty() {
        return Err(ApiError::BadRequest("missing fields".into()));
    }
    // Browsers hand out data URLs; keep only the payload.
    let encoded = match body.data_base64.split_once("base64,") {
        Some((_, payload)) => payload,
        None => body.data_base64.as_str(),
    };
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|_| ApiError::BadRequest("dataBase64 is not valid base64".into()))?;
    Ok(NewSubmission {
        bytes: Bytes::from(bytes),
        mime_type: body.mimetype.filter(|m| !m.trim().is_empty()),
        filename: body.filename,
        nickname: body.nickname,
    })
}
