//! Represents one resumable upload and its progress.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Lifecycle state of an upload. `Uploading` moves to `Complete` once and
/// never back.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum UploadStatus {
    Uploading,
    Complete,
}

/// A chunked upload session.
///
/// The record tracks metadata only; the bytes live in the file referenced by
/// `file_path`, whose length always equals `offset`.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct ChunkedUpload {
    /// Opaque identifier handed to the client for resuming.
    pub upload_id: Uuid,

    /// Original filename supplied by the client.
    pub filename: String,

    /// Content file path, relative to the service storage directory.
    pub file_path: String,

    /// Number of bytes persisted so far.
    pub offset: i64,

    /// Total size declared by the first chunk's `Content-Range`.
    pub total_size: Option<i64>,

    pub status: UploadStatus,

    pub created_on: DateTime<Utc>,

    /// Set when the upload transitions to `Complete`.
    pub completed_on: Option<DateTime<Utc>>,

    /// Identity of the requester that created the upload, if known.
    pub owner: Option<String>,
}

/// Fields every upload session exposes, whatever extra data the embedding
/// application keeps next to it.
///
/// Applications that need more columns wrap `ChunkedUpload` in their own type
/// and implement this trait by delegation.
pub trait UploadRecord {
    fn upload_id(&self) -> Uuid;
    fn offset(&self) -> i64;
    fn status(&self) -> UploadStatus;
    fn created_on(&self) -> DateTime<Utc>;
    fn completed_on(&self) -> Option<DateTime<Utc>>;
    fn content_ref(&self) -> &str;

    /// `created_on + window`, saturating at the maximum representable time.
    fn expires_on(&self, window: TimeDelta) -> DateTime<Utc> {
        self.created_on()
            .checked_add_signed(window)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Whether the upload is past its expiration window at `now`.
    fn expired_at(&self, window: TimeDelta, now: DateTime<Utc>) -> bool {
        now > self.expires_on(window)
    }

    fn expired(&self, window: TimeDelta) -> bool {
        self.expired_at(window, Utc::now())
    }

    fn is_complete(&self) -> bool {
        self.status() == UploadStatus::Complete
    }
}

impl UploadRecord for ChunkedUpload {
    fn upload_id(&self) -> Uuid {
        self.upload_id
    }

    fn offset(&self) -> i64 {
        self.offset
    }

    fn status(&self) -> UploadStatus {
        self.status
    }

    fn created_on(&self) -> DateTime<Utc> {
        self.created_on
    }

    fn completed_on(&self) -> Option<DateTime<Utc>> {
        self.completed_on
    }

    fn content_ref(&self) -> &str {
        &self.file_path
    }
}
