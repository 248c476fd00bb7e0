//! HTTP handlers for chunked uploads.
//!
//! Handlers translate requests into `ChunkRequest`s and map outcomes onto
//! status codes; the upload rules live in `UploadService`.

use crate::{
    errors::AppError,
    models::chunked_upload::{ChunkedUpload, UploadRecord, UploadStatus},
    services::{
        protocol::{ChunkOutcome, ChunkRequest},
        upload_service::{UploadError, UploadService},
    },
};
use axum::{
    Json,
    extract::{FromRequest, Multipart, Path, Request, State},
    http::{HeaderMap, HeaderName, StatusCode, header},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{StreamExt, stream};
use serde::Serialize;
use std::io;
use uuid::Uuid;

/// Multipart field carrying the chunk bytes.
const FILE_FIELD: &str = "file";
/// Multipart field carrying the client's filename.
const FILENAME_FIELD: &str = "filename";

static CONTENT_MD5: HeaderName = HeaderName::from_static("content-md5");

/// Identity of the requester, inserted as a request extension by whatever
/// authentication layer fronts the service.
#[derive(Debug, Clone)]
pub struct UploadOwner(pub String);

/// Upload progress as reported to clients.
#[derive(Debug, Serialize)]
pub struct UploadStatusResponse {
    pub upload_id: Uuid,
    pub filename: String,
    pub offset: i64,
    pub total: Option<i64>,
    pub status: UploadStatus,
    pub completed: bool,
    pub created_on: DateTime<Utc>,
    pub completed_on: Option<DateTime<Utc>>,
    pub expires_on: DateTime<Utc>,
    pub expired: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl UploadStatusResponse {
    fn new(service: &UploadService, upload: &ChunkedUpload, checksum: Option<String>) -> Self {
        let window = service.settings.expiration_window;
        Self {
            upload_id: upload.upload_id,
            filename: upload.filename.clone(),
            offset: upload.offset,
            total: upload.total_size,
            status: upload.status,
            completed: upload.is_complete(),
            created_on: upload.created_on,
            completed_on: upload.completed_on,
            expires_on: upload.expires_on(window),
            expired: upload.expired(window),
            checksum,
        }
    }
}

/// `PUT /uploads` — first chunk of a new upload.
pub async fn start_upload(
    State(service): State<UploadService>,
    request: Request,
) -> Result<Response, AppError> {
    put_chunk(service, None, request).await
}

/// `PUT /uploads/{upload_id}` — next chunk of an existing upload.
pub async fn resume_upload(
    State(service): State<UploadService>,
    Path(upload_id): Path<String>,
    request: Request,
) -> Result<Response, AppError> {
    let upload_id = parse_upload_id(&upload_id)?;
    put_chunk(service, Some(upload_id), request).await
}

/// `GET /uploads/{upload_id}` — current progress, checksum once complete.
///
/// Expired uploads are still reported so clients learn to start over.
pub async fn get_upload(
    State(service): State<UploadService>,
    Path(upload_id): Path<String>,
) -> Result<Json<UploadStatusResponse>, AppError> {
    let upload = service.fetch_upload(parse_upload_id(&upload_id)?).await?;
    let checksum = if upload.is_complete() {
        Some(service.checksum(&upload).await?)
    } else {
        None
    };
    Ok(Json(UploadStatusResponse::new(&service, &upload, checksum)))
}

async fn put_chunk(
    service: UploadService,
    upload_id: Option<Uuid>,
    request: Request,
) -> Result<Response, AppError> {
    let headers = request.headers();
    let content_range = header_string(headers, &header::CONTENT_RANGE);
    let content_md5 = header_string(headers, &CONTENT_MD5);
    let owner = request
        .extensions()
        .get::<UploadOwner>()
        .map(|owner| owner.0.clone());

    let outcome = if is_multipart(headers) {
        let multipart = Multipart::from_request(request, &service).await?;
        let (filename, data) = read_multipart(multipart).await?;
        let body = stream::once(async move { Ok::<_, io::Error>(data) }).boxed();
        service
            .handle_chunk(ChunkRequest {
                upload_id,
                content_range,
                content_md5,
                filename,
                owner,
                body,
            })
            .await?
    } else {
        let filename = headers
            .get(header::CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok())
            .and_then(disposition_filename);
        let body = request
            .into_body()
            .into_data_stream()
            .map(|chunk| chunk.map_err(|err| io::Error::new(io::ErrorKind::Other, err)))
            .boxed();
        service
            .handle_chunk(ChunkRequest {
                upload_id,
                content_range,
                content_md5,
                filename,
                owner,
                body,
            })
            .await?
    };

    Ok(chunk_response(&service, outcome))
}

/// 200 once the upload is complete, 202 while more chunks are expected.
fn chunk_response(service: &UploadService, outcome: ChunkOutcome) -> Response {
    let status = if outcome.is_complete() {
        StatusCode::OK
    } else {
        StatusCode::ACCEPTED
    };
    let body = UploadStatusResponse::new(service, &outcome.upload, outcome.checksum);
    (status, Json(body)).into_response()
}

/// Pull the chunk bytes and optional filename out of a multipart body.
async fn read_multipart(mut multipart: Multipart) -> Result<(Option<String>, Bytes), AppError> {
    let mut filename = None;
    let mut data = None;

    while let Some(field) = multipart.next_field().await? {
        match field.name() {
            Some(FILE_FIELD) => {
                if filename.is_none() {
                    filename = field.file_name().map(str::to_string);
                }
                data = Some(field.bytes().await?);
            }
            Some(FILENAME_FIELD) => {
                filename = Some(field.text().await?);
            }
            _ => {}
        }
    }

    let data = data.ok_or(UploadError::MissingChunk)?;
    Ok((filename, data))
}

fn parse_upload_id(raw: &str) -> Result<Uuid, AppError> {
    Uuid::parse_str(raw).map_err(|_| UploadError::UploadNotFound(raw.to_string()).into())
}

fn header_string(headers: &HeaderMap, name: &HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn is_multipart(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim_start().starts_with("multipart/form-data"))
}

/// Extract `filename` from a `Content-Disposition` value such as
/// `attachment; filename="simplefile.txt"`.
fn disposition_filename(value: &str) -> Option<String> {
    value
        .split(';')
        .map(str::trim)
        .find_map(|param| param.strip_prefix("filename="))
        .map(|name| name.trim_matches('"').to_string())
        .filter(|name| !name.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_quoted_and_bare_disposition_filenames() {
        assert_eq!(
            disposition_filename(r#"attachment; filename="simplefile.txt""#).as_deref(),
            Some("simplefile.txt")
        );
        assert_eq!(
            disposition_filename("attachment; filename=data.bin").as_deref(),
            Some("data.bin")
        );
        assert_eq!(disposition_filename("attachment"), None);
        assert_eq!(disposition_filename(r#"attachment; filename="""#), None);
    }

    #[test]
    fn detects_multipart_content_type() {
        let mut headers = HeaderMap::new();
        assert!(!is_multipart(&headers));
        headers.insert(
            header::CONTENT_TYPE,
            "multipart/form-data; boundary=xyz".parse().unwrap(),
        );
        assert!(is_multipart(&headers));
    }

    #[test]
    fn malformed_upload_id_is_not_found() {
        let err = parse_upload_id("not-a-uuid").unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
    }
}
