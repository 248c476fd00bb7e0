//! Core data models for the chunked upload service.
//!
//! `ChunkedUpload` maps onto the `chunked_uploads` table via `sqlx::FromRow`
//! and serializes as JSON via `serde`. `ContentRange` is the parsed form of
//! the per-chunk range declaration.

pub mod chunked_upload;
pub mod content_range;
