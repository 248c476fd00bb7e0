//! Request-level state machine for chunk uploads.
//!
//! One PUT carries one chunk. The request resolves (or creates) its upload,
//! checks the declared range against the upload's state, appends the bytes
//! under the upload's lock, and completes the upload once the offset reaches
//! the declared total.

use crate::{
    models::{
        chunked_upload::{ChunkedUpload, UploadRecord},
        content_range::ContentRange,
    },
    services::upload_service::{UploadError, UploadResult, UploadService},
};
use base64::{Engine as _, engine::general_purpose};
use bytes::Bytes;
use futures::Stream;
use serde::Serialize;
use std::io;
use tracing::{debug, warn};
use uuid::Uuid;

/// Filename recorded when the client sends none.
pub const DEFAULT_FILENAME: &str = "upload";

/// How a chunk request relates to its upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestKind {
    /// No identifier: the client starts a new upload.
    New,
    /// Identifier supplied, range ends before the declared total.
    Resume,
    /// Range ends at the declared total.
    Final,
}

impl RequestKind {
    pub fn classify(upload_id: Option<Uuid>, range: &ContentRange) -> Self {
        if range.is_final() {
            Self::Final
        } else if upload_id.is_none() {
            Self::New
        } else {
            Self::Resume
        }
    }
}

/// Parsed form of one chunk PUT.
pub struct ChunkRequest<S> {
    /// Identifier from the path, absent when starting an upload.
    pub upload_id: Option<Uuid>,
    /// Raw `Content-Range` header value.
    pub content_range: Option<String>,
    /// Raw `Content-MD5` header value (base64 MD5 of the chunk).
    pub content_md5: Option<String>,
    pub filename: Option<String>,
    pub owner: Option<String>,
    pub body: S,
}

/// Result of an accepted chunk.
#[derive(Debug, Clone)]
pub struct ChunkOutcome {
    pub upload: ChunkedUpload,
    pub kind: RequestKind,
    /// MD5 of the full content, present once the upload is complete.
    pub checksum: Option<String>,
}

impl ChunkOutcome {
    pub fn is_complete(&self) -> bool {
        self.upload.is_complete()
    }
}

impl UploadService {
    /// Process one chunk request from start to finish.
    pub async fn handle_chunk<S>(&self, request: ChunkRequest<S>) -> UploadResult<ChunkOutcome>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        let range: ContentRange = request
            .content_range
            .as_deref()
            .ok_or(UploadError::MissingContentRange)?
            .parse()?;
        if let Some(limit) = self.settings.max_total_size {
            if range.total > limit {
                return Err(UploadError::TotalTooLarge {
                    total: range.total,
                    limit,
                });
            }
        }
        let expected_md5 = request
            .content_md5
            .as_deref()
            .map(decode_content_md5)
            .transpose()?;
        let kind = RequestKind::classify(request.upload_id, &range);
        let creating = request.upload_id.is_none();

        let (upload, _guard) = match request.upload_id {
            Some(upload_id) => {
                let guard = self.locks().acquire(upload_id).await;
                let upload = self.fetch_active_upload(upload_id).await?;
                let upload = match upload.total_size {
                    Some(recorded) if recorded as u64 != range.total => {
                        return Err(UploadError::TotalMismatch {
                            declared: range.total,
                            recorded,
                        });
                    }
                    Some(_) => upload,
                    None => self.set_total_size(&upload, range.total).await?,
                };
                (upload, guard)
            }
            None => {
                if range.start != 0 {
                    return Err(UploadError::OffsetMismatch {
                        expected: 0,
                        declared: range.start,
                    });
                }
                let filename = request
                    .filename
                    .as_deref()
                    .filter(|name| !name.trim().is_empty())
                    .unwrap_or(DEFAULT_FILENAME);
                let upload = self
                    .create_upload(filename, request.owner, Some(range.total))
                    .await?;
                let guard = self.locks().acquire(upload.upload_id).await;
                (upload, guard)
            }
        };

        debug!("upload {} {:?} chunk {}", upload.upload_id, kind, range);

        let upload = match self
            .append_chunk(&upload, range.start, expected_md5, request.body)
            .await
        {
            Ok(upload) => upload,
            Err(err) => {
                if creating {
                    // Nobody knows this id yet; drop the empty upload.
                    if let Err(cleanup) = self.delete_upload(&upload).await {
                        debug!("failed to discard upload {}: {}", upload.upload_id, cleanup);
                    }
                }
                return Err(err);
            }
        };

        if upload.offset as u64 == range.total {
            let upload = self.complete_upload(&upload).await?;
            // The upload is complete either way; GET reports the checksum later.
            let checksum = match self.checksum(&upload).await {
                Ok(checksum) => Some(checksum),
                Err(err) => {
                    warn!("checksum of completed upload {} failed: {}", upload.upload_id, err);
                    None
                }
            };
            return Ok(ChunkOutcome {
                upload,
                kind,
                checksum,
            });
        }

        Ok(ChunkOutcome {
            upload,
            kind,
            checksum: None,
        })
    }
}

/// Decode an RFC 1864 `Content-MD5` value.
fn decode_content_md5(value: &str) -> UploadResult<[u8; 16]> {
    let bytes = general_purpose::STANDARD
        .decode(value.trim())
        .map_err(|err| UploadError::InvalidContentMd5(err.to_string()))?;
    <[u8; 16]>::try_from(bytes.as_slice())
        .map_err(|_| UploadError::InvalidContentMd5(format!("expected 16 bytes, got {}", bytes.len())))
}
