//! Resumable chunked file uploads over HTTP.
//!
//! A client PUTs a file as a sequence of byte ranges. `UploadService` tracks
//! each upload's progress in SQLite, appends chunks to a content file on disk
//! strictly in order, and publishes an `UploadCompleted` event when the last
//! byte arrives.

pub mod config;
pub mod db;
pub mod errors;
pub mod events;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;

pub use config::{AppConfig, UploadSettings};
pub use events::{CompletionEvents, CompletionSubscriber, UploadCompleted};
pub use models::chunked_upload::{ChunkedUpload, UploadRecord, UploadStatus};
pub use routes::routes::app;
pub use services::upload_service::{UploadError, UploadService};
