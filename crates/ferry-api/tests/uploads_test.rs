//! Resumable upload endpoint tests.
//!
//! Run with: `cargo test -p ferry-api --test uploads_test`

mod helpers;

use axum::http::Method;
use bytes::Bytes;
use helpers::{create_upload, metadata_header, routed_metadata, setup_test_app};
use serde_json::Value;

#[tokio::test]
async fn test_options_advertises_protocol() {
    let app = setup_test_app().await;
    let response = app.client().method(Method::OPTIONS, "/files").await;

    assert_eq!(response.status_code(), 204);
    assert_eq!(response.header("tus-resumable"), "1.0.0");
    assert_eq!(response.header("tus-version"), "1.0.0");
    assert_eq!(response.header("tus-max-size"), "1048576");
}

#[tokio::test]
async fn test_two_chunks_seal_upload() {
    let app = setup_test_app().await;
    let client = app.client();
    let tguid = create_upload(client, 100).await;

    let first = client
        .patch(&format!("/files/{}", tguid))
        .add_header("Upload-Offset", "0")
        .add_header("Content-Type", "application/offset+octet-stream")
        .bytes(Bytes::from(vec![1u8; 60]))
        .await;
    assert_eq!(first.status_code(), 204);
    assert_eq!(first.header("upload-offset"), "60");

    let head = client
        .method(Method::HEAD, &format!("/files/{}", tguid))
        .await;
    assert_eq!(head.status_code(), 200);
    assert_eq!(head.header("upload-offset"), "60");
    assert_eq!(head.header("upload-length"), "100");

    let last = client
        .patch(&format!("/files/{}", tguid))
        .add_header("Upload-Offset", "60")
        .add_header("Content-Type", "application/offset+octet-stream")
        .bytes(Bytes::from(vec![2u8; 40]))
        .await;
    assert_eq!(last.status_code(), 200);
    let receipt: Value = last.json();
    assert_eq!(receipt["tguid"], tguid.as_str());
    assert_eq!(receipt["status"], "ACCEPTED");
    assert_eq!(receipt["etag"].as_str().unwrap().len(), 64);

    let info: Value = client.get(&format!("/upload/{}", tguid)).await.json();
    assert_eq!(info["state"], "completed");
    assert_eq!(info["offset"], 100);
    assert_eq!(info["meta_destination_id"], "dextesting");
}

#[tokio::test]
async fn test_offset_mismatch_returns_error_receipt() {
    let app = setup_test_app().await;
    let client = app.client();
    let tguid = create_upload(client, 100).await;

    let response = client
        .patch(&format!("/files/{}", tguid))
        .add_header("Upload-Offset", "60")
        .bytes(Bytes::from(vec![0u8; 40]))
        .await;

    assert_eq!(response.status_code(), 409);
    let body: Value = response.json();
    assert_eq!(body["code"], "OFFSET_MISMATCH");
    assert_eq!(body["status"], 409);
    assert_eq!(body["kind"], "OffsetMismatch");
    assert_eq!(body["path"], format!("/files/{}", tguid));
    assert!(response.maybe_header("x-request-id").is_some());
}

#[tokio::test]
async fn test_chunk_past_declared_length_is_rejected() {
    let app = setup_test_app().await;
    let client = app.client();
    let tguid = create_upload(client, 10).await;

    let response = client
        .patch(&format!("/files/{}", tguid))
        .add_header("Upload-Offset", "0")
        .bytes(Bytes::from(vec![0u8; 11]))
        .await;
    assert_eq!(response.status_code(), 400);
    let body: Value = response.json();
    assert_eq!(body["code"], "LENGTH_EXCEEDED");
}

#[tokio::test]
async fn test_create_requires_routing_metadata() {
    let app = setup_test_app().await;
    let client = app.client();

    let missing = client
        .post("/files")
        .add_header("Upload-Length", "10")
        .add_header(
            "Upload-Metadata",
            metadata_header(&[("meta_destination_id", "dextesting"), ("filename", "a.csv")]),
        )
        .await;
    assert_eq!(missing.status_code(), 400);
    let body: Value = missing.json();
    assert_eq!(body["code"], "INVALID_METADATA");
    assert_eq!(body["path"], "/files");
    assert!(body["description"].as_str().unwrap().contains("meta_ext_event"));

    let unrouted = client
        .post("/files")
        .add_header("Upload-Length", "10")
        .add_header(
            "Upload-Metadata",
            metadata_header(&[
                ("meta_destination_id", "dextesting"),
                ("meta_ext_event", "no-such-event"),
                ("filename", "a.csv"),
            ]),
        )
        .await;
    assert_eq!(unrouted.status_code(), 400);

    let not_base64 = client
        .post("/files")
        .add_header("Upload-Length", "10")
        .add_header("Upload-Metadata", "filename %%%")
        .await;
    assert_eq!(not_base64.status_code(), 400);
}

#[tokio::test]
async fn test_create_rejects_bad_lengths() {
    let app = setup_test_app().await;
    let client = app.client();

    let empty = client
        .post("/files")
        .add_header("Upload-Length", "0")
        .add_header("Upload-Metadata", routed_metadata("a.csv"))
        .await;
    assert_eq!(empty.status_code(), 400);

    let missing = client
        .post("/files")
        .add_header("Upload-Metadata", routed_metadata("a.csv"))
        .await;
    assert_eq!(missing.status_code(), 400);

    let too_large = client
        .post("/files")
        .add_header("Upload-Length", (2 * 1024 * 1024).to_string())
        .add_header("Upload-Metadata", routed_metadata("a.csv"))
        .await;
    assert_eq!(too_large.status_code(), 413);
    let body: Value = too_large.json();
    assert_eq!(body["kind"], "PayloadTooLarge");
}

#[tokio::test]
async fn test_unknown_upload_is_not_found() {
    let app = setup_test_app().await;
    let response = app
        .client()
        .patch("/files/doesnotexist")
        .add_header("Upload-Offset", "0")
        .bytes(Bytes::from_static(b"abc"))
        .await;
    assert_eq!(response.status_code(), 404);

    let info = app.client().get("/upload/doesnotexist").await;
    assert_eq!(info.status_code(), 404);
}
