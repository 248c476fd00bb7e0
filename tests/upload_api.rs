//! Router-level tests for the chunked upload API.

use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode, header},
};
use base64::{Engine as _, engine::general_purpose};
use chrono::TimeDelta;
use chunked_upload::{UploadService, UploadSettings, app, db};
use http_body_util::BodyExt;
use serde_json::Value;
use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};
use tempfile::TempDir;
use tower::ServiceExt;

const BOUNDARY: &str = "chunked-upload-test-boundary";

async fn setup(settings: UploadSettings) -> (Router, UploadService, TempDir) {
    let dir = TempDir::new().unwrap();
    let pool = db::connect_file(&dir.path().join("meta.db")).await.unwrap();
    db::run_migrations(&pool).await.unwrap();
    let service = UploadService::new(Arc::new(pool), dir.path().join("uploads"), settings);
    (app(service.clone()), service, dir)
}

fn multipart_body(filename: &str, data: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(
        format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"filename\"\r\n\r\n{filename}\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(
        format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{filename}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(data);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
    body
}

fn multipart_put(uri: &str, range: &str, data: &[u8]) -> Request<Body> {
    Request::builder()
        .method("PUT")
        .uri(uri)
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .header(header::CONTENT_RANGE, range)
        .body(Body::from(multipart_body("simplefile.txt", data)))
        .unwrap()
}

fn raw_put(uri: &str, range: &str, data: &'static [u8]) -> Request<Body> {
    Request::builder()
        .method("PUT")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(
            header::CONTENT_DISPOSITION,
            r#"attachment; filename="simplefile.txt""#,
        )
        .header(header::CONTENT_RANGE, range)
        .body(Body::from(data))
        .unwrap()
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, json)
}

fn md5_hex(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}

#[tokio::test]
async fn initial_chunk_completes_small_file() {
    let (app, _service, _dir) = setup(UploadSettings::default()).await;

    let (status, body) = send(&app, multipart_put("/uploads", "0-9/9", b"test file")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["offset"], 9);
    assert_eq!(body["status"], "complete");
    assert_eq!(body["completed"], true);
    assert_eq!(body["filename"], "simplefile.txt");
    assert_eq!(body["checksum"], md5_hex(b"test file"));
}

#[tokio::test]
async fn additional_chunk_appends_to_existing_upload() {
    let (app, service, _dir) = setup(UploadSettings::default()).await;

    let (status, first) = send(&app, multipart_put("/uploads", "0-9/28", b"test file")).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(first["offset"], 9);
    assert_eq!(first["completed"], false);
    assert!(first.get("checksum").is_none());
    let upload_id = first["upload_id"].as_str().unwrap().to_string();

    let (status, second) = send(
        &app,
        multipart_put(
            &format!("/uploads/{upload_id}"),
            "9-28/28",
            b" new test file data",
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["upload_id"], upload_id.as_str());
    assert_eq!(second["offset"], 28);
    assert_eq!(second["status"], "complete");

    let upload = service
        .fetch_upload(upload_id.parse().unwrap())
        .await
        .unwrap();
    let content = tokio::fs::read(service.content_path(&upload)).await.unwrap();
    assert_eq!(content, b"test file new test file data");
}

#[tokio::test]
async fn raw_body_chunks_are_accepted() {
    let (app, _service, _dir) = setup(UploadSettings::default()).await;

    let (status, first) = send(&app, raw_put("/uploads", "bytes 0-4/8", b"AAAA")).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(first["filename"], "simplefile.txt");
    let upload_id = first["upload_id"].as_str().unwrap().to_string();

    let (status, second) = send(
        &app,
        raw_put(&format!("/uploads/{upload_id}"), "bytes 4-8/8", b"BBBB"),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["checksum"], md5_hex(b"AAAABBBB"));
}

#[tokio::test]
async fn offset_mismatch_is_conflict_naming_expected_offset() {
    let (app, _service, _dir) = setup(UploadSettings::default()).await;
    let (_, first) = send(&app, multipart_put("/uploads", "0-9/20", b"test file")).await;
    let upload_id = first["upload_id"].as_str().unwrap().to_string();
    let uri = format!("/uploads/{upload_id}");

    let (status, body) = send(&app, multipart_put(&uri, "5-16/20", b"test file d")).await;

    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["error"].as_str().unwrap().contains("expected offset 9"));

    let (status, progress) = send(
        &app,
        Request::get(&uri).body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(progress["offset"], 9);
}

#[tokio::test]
async fn missing_content_range_is_bad_request() {
    let (app, _service, _dir) = setup(UploadSettings::default()).await;
    let request = Request::builder()
        .method("PUT")
        .uri("/uploads")
        .body(Body::from("test file"))
        .unwrap();

    let (status, body) = send(&app, request).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["status"], 400);
}

#[tokio::test]
async fn malformed_content_range_is_bad_request() {
    let (app, _service, _dir) = setup(UploadSettings::default()).await;
    let (status, _) = send(&app, multipart_put("/uploads", "zero-9/9", b"test file")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn multipart_without_file_is_bad_request() {
    let (app, _service, _dir) = setup(UploadSettings::default()).await;
    let body = format!(
        "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"filename\"\r\n\r\nx.txt\r\n--{BOUNDARY}--\r\n"
    );
    let request = Request::builder()
        .method("PUT")
        .uri("/uploads")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .header(header::CONTENT_RANGE, "0-0/0")
        .body(Body::from(body))
        .unwrap();

    let (status, _) = send(&app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unknown_upload_is_not_found() {
    let (app, _service, _dir) = setup(UploadSettings::default()).await;

    let (status, _) = send(
        &app,
        multipart_put(
            "/uploads/7f3b0c1e-2a44-4a55-9a9b-0d7f3b6c2e11",
            "0-9/9",
            b"test file",
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(&app, multipart_put("/uploads/not-a-uuid", "0-9/9", b"test file")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn expired_upload_is_not_found_but_still_reported() {
    let (app, service, _dir) = setup(UploadSettings::default()).await;
    let (_, first) = send(&app, multipart_put("/uploads", "0-4/8", b"AAAA")).await;
    let upload_id = first["upload_id"].as_str().unwrap().to_string();

    let upload = service
        .fetch_upload(upload_id.parse().unwrap())
        .await
        .unwrap();
    sqlx::query("UPDATE chunked_uploads SET created_on = ? WHERE upload_id = ?")
        .bind(upload.created_on - TimeDelta::days(2))
        .bind(upload.upload_id)
        .execute(&*service.db)
        .await
        .unwrap();

    let uri = format!("/uploads/{upload_id}");
    let (status, _) = send(&app, multipart_put(&uri, "4-8/8", b"BBBB")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, progress) = send(&app, Request::get(&uri).body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(progress["expired"], true);
    assert_eq!(progress["offset"], 4);
}

#[tokio::test]
async fn chunk_over_limit_is_bad_request() {
    let settings = UploadSettings {
        max_chunk_size: 4,
        ..UploadSettings::default()
    };
    let (app, _service, _dir) = setup(settings).await;

    let (status, body) = send(&app, multipart_put("/uploads", "0-9/9", b"test file")).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("chunk size limit"));
}

#[tokio::test]
async fn content_md5_mismatch_is_bad_request() {
    let (app, _service, _dir) = setup(UploadSettings::default()).await;
    let mut request = multipart_put("/uploads", "0-9/9", b"test file");
    request.headers_mut().insert(
        "content-md5",
        general_purpose::STANDARD
            .encode(md5::compute(b"tampered").0)
            .parse()
            .unwrap(),
    );

    let (status, _) = send(&app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn completion_subscribers_fire_once_and_failures_are_isolated() {
    let (app, service, _dir) = setup(UploadSettings::default()).await;
    let fired = Arc::new(AtomicUsize::new(0));
    let counter = fired.clone();
    service.events().subscribe(Arc::new(
        |_: &chunked_upload::UploadCompleted| -> anyhow::Result<()> {
            anyhow::bail!("downstream pipeline offline")
        },
    ));
    service.events().subscribe(Arc::new(
        move |_: &chunked_upload::UploadCompleted| -> anyhow::Result<()> {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        },
    ));

    let (status, _) = send(&app, multipart_put("/uploads", "0-9/9", b"test file")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn health_probes_report_ok() {
    let (app, _service, _dir) = setup(UploadSettings::default()).await;

    let (status, body) = send(&app, Request::get("/healthz").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");

    let (status, body) = send(&app, Request::get("/readyz").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["checks"]["sqlite"]["ok"], true);
    assert_eq!(body["checks"]["disk"]["ok"], true);
}
