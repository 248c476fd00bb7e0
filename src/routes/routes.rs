//! Defines routes for the chunked upload API.
//!
//! ## Structure
//! - `PUT /uploads`              — first chunk, creates the upload
//! - `PUT /uploads/{upload_id}`  — next chunk of an existing upload
//! - `GET /uploads/{upload_id}`  — upload progress
//! - `GET /healthz`, `GET /readyz` — probes

use crate::{
    config::UploadSettings,
    handlers::{
        health_handlers::{healthz, readyz},
        upload_handlers::{get_upload, resume_upload, start_upload},
    },
    services::upload_service::UploadService,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, put},
};

/// Room for multipart boundaries and the `filename` field on top of a
/// full-size chunk.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

/// Build the router. Carries `UploadService` as shared state.
///
/// The body limit lets a chunk of `max_chunk_size` through multipart
/// parsing; the service enforces the exact chunk limit itself.
pub fn routes(settings: &UploadSettings) -> Router<UploadService> {
    let body_limit = usize::try_from(settings.max_chunk_size)
        .unwrap_or(usize::MAX)
        .saturating_add(MULTIPART_OVERHEAD);

    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/uploads", put(start_upload))
        .route("/uploads/{upload_id}", put(resume_upload).get(get_upload))
        .layer(DefaultBodyLimit::max(body_limit))
}

/// Router with `service` attached, ready to serve.
pub fn app(service: UploadService) -> Router {
    let settings = service.settings.clone();
    routes(&settings).with_state(service)
}
