//! HTTP handlers for the submission endpoints.
//!
//! Each submodule maps one route onto [`crate::service::UploadService`] (or the
//! prediction client) and shapes the JSON the browser client expects.
pub mod delete;
pub mod download;
pub mod predict;
pub mod submissions;
pub mod upload;
