use axum::{Json, extract::State};

use crate::http::AppState;
use crate::meta::SubmissionRecord;

// GET /submissions
pub async fn list_submissions(State(st): State<AppState>) -> Json<Vec<SubmissionRecord>> {
    Json(st.service.list().await)
}
