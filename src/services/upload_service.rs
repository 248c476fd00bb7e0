//! src/services/upload_service.rs
//!
//! UploadService — chunked upload sessions backed by SQLite for metadata and
//! local disk for content. Content for an upload lives beneath
//! `base_path/{shard}/{shard}/{upload_id}.part` and its length always matches
//! the recorded `offset`.

use crate::{
    config::UploadSettings,
    events::{CompletionEvents, UploadCompleted},
    models::{
        chunked_upload::{ChunkedUpload, UploadRecord, UploadStatus},
        content_range::ContentRangeError,
    },
    services::locks::UploadLocks,
};
use bytes::Bytes;
use chrono::Utc;
use futures::{Stream, StreamExt, pin_mut};
use md5::Context;
use sqlx::SqlitePool;
use std::{
    io::{self, ErrorKind, SeekFrom},
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;
use tokio::{
    fs::{self, File, OpenOptions},
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
};
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Columns of `chunked_uploads`, in `ChunkedUpload` field order.
const UPLOAD_COLUMNS: &str = r#"upload_id, filename, file_path, "offset", total_size, status,
    created_on, completed_on, owner"#;

const CONTENT_EXTENSION: &str = "part";

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("Content-Range header is required")]
    MissingContentRange,
    #[error(transparent)]
    InvalidContentRange(#[from] ContentRangeError),
    #[error("invalid Content-MD5 header: {0}")]
    InvalidContentMd5(String),
    #[error("request carries no chunk data")]
    MissingChunk,
    #[error("chunk exceeds the {limit} byte chunk size limit")]
    ChunkTooLarge { limit: u64 },
    #[error("declared size {total} exceeds the {limit} byte upload limit")]
    TotalTooLarge { total: u64, limit: u64 },
    #[error("declared size {declared} does not match the size {recorded} declared earlier")]
    TotalMismatch { declared: u64, recorded: i64 },
    #[error("chunk runs past the declared size of {total} bytes")]
    ChunkOverflowsTotal { total: i64 },
    #[error("chunk does not match its Content-MD5 digest")]
    ChunkDigestMismatch,
    #[error("chunk starts at offset {declared}, expected offset {expected}")]
    OffsetMismatch { expected: i64, declared: u64 },
    #[error("upload `{0}` is already complete")]
    AlreadyComplete(Uuid),
    #[error("upload `{0}` was modified concurrently")]
    ConcurrentModification(Uuid),
    #[error("upload `{0}` not found")]
    UploadNotFound(String),
    #[error("upload `{0}` has expired")]
    UploadExpired(Uuid),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Who is at fault for an `UploadError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadErrorKind {
    Validation,
    Conflict,
    NotFound,
    Storage,
}

impl UploadError {
    pub fn kind(&self) -> UploadErrorKind {
        match self {
            Self::MissingContentRange
            | Self::InvalidContentRange(_)
            | Self::InvalidContentMd5(_)
            | Self::MissingChunk
            | Self::ChunkTooLarge { .. }
            | Self::TotalTooLarge { .. }
            | Self::TotalMismatch { .. }
            | Self::ChunkOverflowsTotal { .. }
            | Self::ChunkDigestMismatch => UploadErrorKind::Validation,
            Self::OffsetMismatch { .. }
            | Self::AlreadyComplete(_)
            | Self::ConcurrentModification(_) => UploadErrorKind::Conflict,
            Self::UploadNotFound(_) | Self::UploadExpired(_) => UploadErrorKind::NotFound,
            Self::Sqlx(_) | Self::Io(_) => UploadErrorKind::Storage,
        }
    }
}

pub type UploadResult<T> = Result<T, UploadError>;

/// UploadService owns the session lifecycle:
/// - create an upload (empty content file + metadata row)
/// - append a chunk at the current offset
/// - mark an upload complete and notify subscribers
/// - compute the content checksum
/// - reap expired, unfinished uploads
///
/// Appends to one upload must run under `locks().acquire(upload_id)`; the
/// request state machine in `protocol.rs` takes care of that.
#[derive(Clone)]
pub struct UploadService {
    /// Shared SQLite connection pool used for metadata operations.
    pub db: Arc<SqlitePool>,

    /// Base directory on disk where upload content is stored.
    pub base_path: PathBuf,

    pub settings: UploadSettings,

    locks: UploadLocks,
    events: CompletionEvents,
}

impl UploadService {
    pub fn new(db: Arc<SqlitePool>, base_path: impl Into<PathBuf>, settings: UploadSettings) -> Self {
        Self {
            db,
            base_path: base_path.into(),
            settings,
            locks: UploadLocks::new(),
            events: CompletionEvents::new(),
        }
    }

    /// Registry that receives `UploadCompleted` events.
    pub fn events(&self) -> &CompletionEvents {
        &self.events
    }

    pub fn locks(&self) -> &UploadLocks {
        &self.locks
    }

    /// Generate two-level shard identifiers for an upload.
    ///
    /// Uses MD5 of the id and returns the first two bytes as lowercase hex.
    fn upload_shards(upload_id: Uuid) -> (String, String) {
        let digest = md5::compute(upload_id.as_bytes());
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    /// Content path relative to `base_path`, as stored in `file_path`.
    fn relative_content_path(upload_id: Uuid) -> String {
        let (shard_a, shard_b) = Self::upload_shards(upload_id);
        format!("{shard_a}/{shard_b}/{upload_id}.{CONTENT_EXTENSION}")
    }

    /// Absolute location of an upload's content.
    pub fn content_path(&self, upload: &impl UploadRecord) -> PathBuf {
        self.base_path.join(upload.content_ref())
    }

    /// Start a new upload with empty content.
    ///
    /// `total_size` is the size declared by the first chunk; later chunks must
    /// agree with it.
    pub async fn create_upload(
        &self,
        filename: &str,
        owner: Option<String>,
        total_size: Option<u64>,
    ) -> UploadResult<ChunkedUpload> {
        let upload_id = Uuid::new_v4();
        let file_path = Self::relative_content_path(upload_id);
        let absolute = self.base_path.join(&file_path);
        if let Some(parent) = absolute.parent() {
            fs::create_dir_all(parent).await?;
        }
        File::create(&absolute).await?;

        let total_size = total_size.map(to_db_size).transpose()?;
        let insert = sqlx::query_as::<_, ChunkedUpload>(&format!(
            r#"INSERT INTO chunked_uploads ({UPLOAD_COLUMNS})
               VALUES (?, ?, ?, 0, ?, ?, ?, NULL, ?)
               RETURNING {UPLOAD_COLUMNS}"#
        ))
        .bind(upload_id)
        .bind(filename)
        .bind(&file_path)
        .bind(total_size)
        .bind(UploadStatus::Uploading)
        .bind(Utc::now())
        .bind(owner)
        .fetch_one(&*self.db)
        .await;

        match insert {
            Ok(upload) => {
                info!("created upload {} for `{}`", upload.upload_id, filename);
                Ok(upload)
            }
            Err(err) => {
                let _ = fs::remove_file(&absolute).await;
                Err(UploadError::Sqlx(err))
            }
        }
    }

    /// Fetch an upload regardless of its expiry.
    pub async fn fetch_upload(&self, upload_id: Uuid) -> UploadResult<ChunkedUpload> {
        sqlx::query_as::<_, ChunkedUpload>(&format!(
            "SELECT {UPLOAD_COLUMNS} FROM chunked_uploads WHERE upload_id = ?"
        ))
        .bind(upload_id)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => UploadError::UploadNotFound(upload_id.to_string()),
            other => UploadError::Sqlx(other),
        })
    }

    /// Fetch an upload that may still receive chunks.
    ///
    /// Expired uploads are reported as missing even though the record exists.
    pub async fn fetch_active_upload(&self, upload_id: Uuid) -> UploadResult<ChunkedUpload> {
        let upload = self.fetch_upload(upload_id).await?;
        if upload.expired(self.settings.expiration_window) {
            debug!("upload {} looked up after expiry", upload_id);
            return Err(UploadError::UploadExpired(upload_id));
        }
        Ok(upload)
    }

    /// Record the declared total on an upload that has none yet.
    pub async fn set_total_size(
        &self,
        upload: &ChunkedUpload,
        total_size: u64,
    ) -> UploadResult<ChunkedUpload> {
        let total = to_db_size(total_size)?;
        sqlx::query("UPDATE chunked_uploads SET total_size = ? WHERE upload_id = ?")
            .bind(total)
            .bind(upload.upload_id)
            .execute(&*self.db)
            .await?;
        Ok(ChunkedUpload {
            total_size: Some(total),
            ..upload.clone()
        })
    }

    /// Append a chunk to the end of an upload's content.
    ///
    /// - `declared_start` must equal the current offset.
    /// - The chunk may not exceed `settings.max_chunk_size` (rejected, never
    ///   truncated) nor run past the recorded total size.
    /// - `expected_md5`, when given, must match the chunk bytes.
    ///
    /// Bytes are written at `offset`, synced, and the file is cut to the new
    /// length before the offset row is updated. Any failure truncates the
    /// content back to the previous offset, so the record is unchanged and a
    /// retry of the same chunk is safe.
    pub async fn append_chunk<S>(
        &self,
        upload: &ChunkedUpload,
        declared_start: u64,
        expected_md5: Option<[u8; 16]>,
        stream: S,
    ) -> UploadResult<ChunkedUpload>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        if upload.is_complete() {
            return Err(UploadError::AlreadyComplete(upload.upload_id));
        }
        let start_offset = upload.offset;
        if i64::try_from(declared_start).ok() != Some(start_offset) {
            return Err(UploadError::OffsetMismatch {
                expected: start_offset,
                declared: declared_start,
            });
        }

        let path = self.content_path(upload);
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .await?;
        let on_disk = file.metadata().await?.len();
        if on_disk < start_offset as u64 {
            return Err(UploadError::Io(io::Error::new(
                ErrorKind::UnexpectedEof,
                format!(
                    "content of upload {} is {} bytes, shorter than offset {}",
                    upload.upload_id, on_disk, start_offset
                ),
            )));
        }

        match self
            .write_chunk(upload, &mut file, expected_md5, stream)
            .await
        {
            Ok(written) => {
                let new_offset = start_offset + written;
                match self.commit_offset(upload, new_offset).await {
                    Ok(updated) => {
                        debug!(
                            "upload {} appended {} bytes, offset {} -> {}",
                            upload.upload_id, written, start_offset, new_offset
                        );
                        Ok(updated)
                    }
                    Err(err) => {
                        rollback(&file, &path, start_offset).await;
                        Err(err)
                    }
                }
            }
            Err(err) => {
                rollback(&file, &path, start_offset).await;
                Err(err)
            }
        }
    }

    /// Stream the chunk into `file` at the upload's offset. Returns the number
    /// of bytes written.
    async fn write_chunk<S>(
        &self,
        upload: &ChunkedUpload,
        file: &mut File,
        expected_md5: Option<[u8; 16]>,
        stream: S,
    ) -> UploadResult<i64>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        let limit = self.settings.max_chunk_size;
        file.seek(SeekFrom::Start(upload.offset as u64)).await?;

        let mut written: u64 = 0;
        let mut digest = Context::new();
        pin_mut!(stream);
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            written += chunk.len() as u64;
            if written > limit {
                return Err(UploadError::ChunkTooLarge { limit });
            }
            if let Some(total) = upload.total_size {
                if upload.offset as u64 + written > total as u64 {
                    return Err(UploadError::ChunkOverflowsTotal { total });
                }
            }
            digest.consume(&chunk);
            file.write_all(&chunk).await?;
        }

        if let Some(expected) = expected_md5 {
            if digest.compute().0 != expected {
                return Err(UploadError::ChunkDigestMismatch);
            }
        }

        let written = written as i64;
        file.flush().await?;
        file.set_len((upload.offset + written) as u64).await?;
        file.sync_all().await?;
        Ok(written)
    }

    /// Persist the new offset, guarded on the old one so a stale writer can
    /// never move it.
    async fn commit_offset(
        &self,
        upload: &ChunkedUpload,
        new_offset: i64,
    ) -> UploadResult<ChunkedUpload> {
        let result = sqlx::query(
            r#"UPDATE chunked_uploads SET "offset" = ?
               WHERE upload_id = ? AND "offset" = ? AND status = ?"#,
        )
        .bind(new_offset)
        .bind(upload.upload_id)
        .bind(upload.offset)
        .bind(UploadStatus::Uploading)
        .execute(&*self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Err(UploadError::ConcurrentModification(upload.upload_id));
        }

        Ok(ChunkedUpload {
            offset: new_offset,
            ..upload.clone()
        })
    }

    /// Mark an upload complete and publish `UploadCompleted`.
    ///
    /// Not idempotent: a second call re-stamps `completed_on` and publishes
    /// again, so callers complete each upload once. Subscriber failures are
    /// logged by the event registry and never surface here.
    pub async fn complete_upload(&self, upload: &ChunkedUpload) -> UploadResult<ChunkedUpload> {
        let completed_on = Utc::now();
        let result = sqlx::query(
            "UPDATE chunked_uploads SET status = ?, completed_on = ? WHERE upload_id = ?",
        )
        .bind(UploadStatus::Complete)
        .bind(completed_on)
        .bind(upload.upload_id)
        .execute(&*self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Err(UploadError::UploadNotFound(upload.upload_id.to_string()));
        }

        let completed = ChunkedUpload {
            status: UploadStatus::Complete,
            completed_on: Some(completed_on),
            ..upload.clone()
        };
        info!(
            "upload {} complete at {} bytes",
            completed.upload_id, completed.offset
        );

        let report = self.events.publish(&UploadCompleted::from(&completed));
        if report.failed > 0 {
            warn!(
                "{} of {} completion subscribers failed for upload {}",
                report.failed,
                report.failed + report.delivered,
                completed.upload_id
            );
        }

        Ok(completed)
    }

    /// MD5 of the upload's content, as lowercase hex.
    ///
    /// Reads the first `offset` bytes start to end on every call.
    pub async fn checksum(&self, upload: &impl UploadRecord) -> UploadResult<String> {
        let file = File::open(self.content_path(upload)).await?;
        let mut reader = ReaderStream::new(file.take(upload.offset().max(0) as u64));

        let mut digest = Context::new();
        while let Some(chunk) = reader.next().await {
            digest.consume(&chunk?);
        }
        Ok(format!("{:x}", digest.compute()))
    }

    /// Delete every unfinished upload past its expiration window, content
    /// included. Returns how many were removed.
    pub async fn delete_expired_uploads(&self) -> UploadResult<usize> {
        let candidates = sqlx::query_as::<_, ChunkedUpload>(&format!(
            "SELECT {UPLOAD_COLUMNS} FROM chunked_uploads WHERE status = ?"
        ))
        .bind(UploadStatus::Uploading)
        .fetch_all(&*self.db)
        .await?;

        let window = self.settings.expiration_window;
        let now = Utc::now();
        let mut removed = 0;
        for upload in candidates
            .into_iter()
            .filter(|upload| upload.expired_at(window, now))
        {
            let _guard = self.locks.acquire(upload.upload_id).await;
            if self.delete_upload(&upload).await? {
                removed += 1;
            }
        }

        if removed > 0 {
            info!("deleted {} expired uploads", removed);
        }
        Ok(removed)
    }

    /// Remove an unfinished upload's record and content.
    ///
    /// Returns false when the upload completed or vanished in the meantime.
    pub(crate) async fn delete_upload(&self, upload: &ChunkedUpload) -> UploadResult<bool> {
        let result = sqlx::query("DELETE FROM chunked_uploads WHERE upload_id = ? AND status = ?")
            .bind(upload.upload_id)
            .bind(UploadStatus::Uploading)
            .execute(&*self.db)
            .await?;
        if result.rows_affected() == 0 {
            return Ok(false);
        }

        let path = self.content_path(upload);
        match fs::remove_file(&path).await {
            Ok(_) => debug!("removed content file {}", path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("content file {} already missing", path.display());
            }
            Err(err) => return Err(UploadError::Io(err)),
        }

        if let Some(parent) = path.parent() {
            self.prune_empty_dirs(parent, &self.base_path).await;
        }
        Ok(true)
    }

    /// Recursively remove empty shard directories up to the storage root.
    async fn prune_empty_dirs(&self, start: &Path, stop: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => {
                    if let Some(parent) = current.parent() {
                        current = parent.to_path_buf();
                    } else {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

/// Cut content back to `offset` after a failed append.
async fn rollback(file: &File, path: &Path, offset: i64) {
    if let Err(err) = file.set_len(offset as u64).await {
        warn!(
            "failed to roll back {} to {} bytes: {}",
            path.display(),
            offset,
            err
        );
    }
}

fn to_db_size(size: u64) -> UploadResult<i64> {
    i64::try_from(size).map_err(|_| {
        UploadError::TotalTooLarge {
            total: size,
            limit: i64::MAX as u64,
        }
    })
}
