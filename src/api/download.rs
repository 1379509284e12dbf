use axum::{
    extract::{Path, State},
    http::header::CONTENT_TYPE,
    response::{IntoResponse, Redirect, Response},
};

use crate::error::Result;
use crate::http::AppState;
use crate::service::Retrieved;

// GET /uploads/{id}
// Local and object-store backends stream the bytes back; the remote drive
// answers with a redirect to its own link.
pub async fn download(State(st): State<AppState>, Path(id): Path<String>) -> Result<Response> {
    let response = match st.service.retrieve(&id).await? {
        Retrieved::Blob {
            bytes,
            content_type,
        } => ([(CONTENT_TYPE, content_type)], bytes).into_response(),
        Retrieved::Redirect(url) => Redirect::temporary(&url).into_response(),
    };
    Ok(response)
}
