//! Resumable upload endpoints (tus 1.0 core + creation).
//!
//! The handlers only translate headers; offsets, sealing and abandonment are decided by
//! [`ferry_services::UploadIntake`].

use crate::constants::*;
use crate::error::HttpAppError;
use crate::state::AppState;
use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::IntoResponse,
    Json,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use ferry_core::models::{FileReceipt, Tguid, UploadInfo, UploadState};
use ferry_core::AppError;
use ferry_infra::ErrorReceipt;
use ferry_services::ChunkOutcome;
use std::collections::HashMap;
use std::sync::Arc;

/// Parse a tus `Upload-Metadata` header: comma separated `key base64(value)` pairs.
/// A key without a value maps to the empty string.
pub fn parse_upload_metadata(raw: &str) -> Result<HashMap<String, String>, AppError> {
    let mut fields = HashMap::new();
    for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let mut parts = pair.splitn(2, ' ');
        let key = parts.next().unwrap_or_default().trim();
        if key.is_empty() {
            return Err(AppError::InvalidMetadata(format!("Malformed metadata pair '{}'", pair)));
        }
        let value = match parts.next().map(str::trim).filter(|v| !v.is_empty()) {
            Some(encoded) => {
                let decoded = STANDARD.decode(encoded).map_err(|_| {
                    AppError::InvalidMetadata(format!("Metadata value for '{}' is not base64", key))
                })?;
                String::from_utf8(decoded).map_err(|_| {
                    AppError::InvalidMetadata(format!("Metadata value for '{}' is not UTF-8", key))
                })?
            }
            None => String::new(),
        };
        if fields.insert(key.to_string(), value).is_some() {
            return Err(AppError::InvalidMetadata(format!("Duplicate metadata key '{}'", key)));
        }
    }
    Ok(fields)
}

pub(crate) fn parse_tguid(raw: &str) -> Result<Tguid, HttpAppError> {
    raw.parse::<Tguid>()
        .map_err(|e| HttpAppError(AppError::InvalidInput(e.to_string())))
}

fn header_u64(headers: &HeaderMap, name: &str) -> Result<Option<u64>, AppError> {
    match headers.get(name) {
        None => Ok(None),
        Some(value) => value
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Some)
            .ok_or_else(|| AppError::InvalidInput(format!("{} must be a non-negative integer", name))),
    }
}

fn insert(headers: &mut HeaderMap, name: &'static str, value: HeaderValue) {
    headers.insert(HeaderName::from_static(name), value);
}

fn tus_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    insert(&mut headers, HEADER_TUS_RESUMABLE, HeaderValue::from_static(TUS_VERSION));
    headers
}

/// Advertise protocol support
#[utoipa::path(
    options,
    path = "/files",
    tag = "uploads",
    responses((status = 204, description = "Supported protocol version, extensions and max size"))
)]
pub async fn upload_options(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mut headers = tus_headers();
    insert(&mut headers, HEADER_TUS_VERSION, HeaderValue::from_static(TUS_VERSION));
    insert(&mut headers, HEADER_TUS_EXTENSION, HeaderValue::from_static(TUS_EXTENSIONS));
    insert(
        &mut headers,
        HEADER_TUS_MAX_SIZE,
        HeaderValue::from(state.intake.max_upload_size()),
    );
    (StatusCode::NO_CONTENT, headers)
}

/// Create an upload
#[utoipa::path(
    post,
    path = "/files",
    tag = "uploads",
    params(
        ("Upload-Length" = u64, Header, description = "Declared total size in bytes"),
        ("Upload-Metadata" = String, Header, description = "Comma separated `key base64value` pairs; requires meta_destination_id, meta_ext_event and filename"),
    ),
    responses(
        (status = 201, description = "Upload created", body = UploadInfo),
        (status = 400, description = "Invalid length or metadata", body = ErrorReceipt),
        (status = 413, description = "Declared length too large", body = ErrorReceipt)
    )
)]
pub async fn create_upload(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, HttpAppError> {
    let length = header_u64(&headers, HEADER_UPLOAD_LENGTH)?;
    let metadata = match headers.get(HEADER_UPLOAD_METADATA) {
        Some(raw) => parse_upload_metadata(raw.to_str().map_err(|_| {
            AppError::InvalidMetadata("Upload-Metadata is not valid ASCII".to_string())
        })?)?,
        None => HashMap::new(),
    };

    let info = state.intake.create(length, metadata).await?;

    let mut response_headers = tus_headers();
    let location = format!("{}/{}", FILES_PATH, info.tguid);
    if let Ok(value) = HeaderValue::from_str(&location) {
        response_headers.insert(header::LOCATION, value);
    }
    if let Ok(value) = HeaderValue::from_str(info.tguid.as_str()) {
        insert(&mut response_headers, HEADER_TGUID, value);
    }
    insert(&mut response_headers, HEADER_UPLOAD_OFFSET, HeaderValue::from(0u64));

    Ok((StatusCode::CREATED, response_headers, Json(info)))
}

/// Current offset of an upload
#[utoipa::path(
    head,
    path = "/files/{tguid}",
    tag = "uploads",
    params(("tguid" = String, Path, description = "Upload identifier")),
    responses(
        (status = 200, description = "Upload-Offset and Upload-Length headers"),
        (status = 404, description = "Unknown upload"),
        (status = 410, description = "Upload abandoned")
    )
)]
pub async fn upload_offset(
    State(state): State<Arc<AppState>>,
    Path(tguid): Path<String>,
) -> Result<impl IntoResponse, HttpAppError> {
    let tguid = parse_tguid(&tguid)?;
    let info = state.intake.info(&tguid).await?;
    if info.state == UploadState::Abandoned {
        return Err(AppError::Gone(format!("Upload {} was abandoned", tguid)).into());
    }

    let mut headers = tus_headers();
    insert(&mut headers, HEADER_UPLOAD_OFFSET, HeaderValue::from(info.offset));
    insert(&mut headers, HEADER_UPLOAD_LENGTH, HeaderValue::from(info.length));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    Ok((StatusCode::OK, headers))
}

/// Append a chunk
#[utoipa::path(
    patch,
    path = "/files/{tguid}",
    tag = "uploads",
    params(
        ("tguid" = String, Path, description = "Upload identifier"),
        ("Upload-Offset" = u64, Header, description = "Offset the chunk starts at"),
    ),
    request_body(content = Vec<u8>, content_type = "application/offset+octet-stream"),
    responses(
        (status = 200, description = "Final chunk accepted, upload sealed", body = FileReceipt),
        (status = 204, description = "Chunk accepted"),
        (status = 404, description = "Unknown upload", body = ErrorReceipt),
        (status = 409, description = "Offset does not match the current offset", body = ErrorReceipt),
        (status = 410, description = "Upload abandoned", body = ErrorReceipt)
    )
)]
pub async fn append_chunk(
    State(state): State<Arc<AppState>>,
    Path(tguid): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, HttpAppError> {
    let tguid = parse_tguid(&tguid)?;
    let offset = header_u64(&headers, HEADER_UPLOAD_OFFSET)?
        .ok_or_else(|| AppError::InvalidInput("Upload-Offset is required".to_string()))?;

    let outcome = state.intake.append_chunk(&tguid, offset, body).await?;

    let mut response_headers = tus_headers();
    let response = match outcome {
        ChunkOutcome::Progress { offset } => {
            insert(&mut response_headers, HEADER_UPLOAD_OFFSET, HeaderValue::from(offset));
            (StatusCode::NO_CONTENT, response_headers).into_response()
        }
        ChunkOutcome::Completed(receipt) => {
            let info = state.intake.info(&tguid).await?;
            insert(&mut response_headers, HEADER_UPLOAD_OFFSET, HeaderValue::from(info.offset));
            (StatusCode::OK, response_headers, Json(receipt)).into_response()
        }
    };
    Ok(response)
}

/// Progress of an upload
#[utoipa::path(
    get,
    path = "/upload/{tguid}",
    tag = "uploads",
    params(("tguid" = String, Path, description = "Upload identifier")),
    responses(
        (status = 200, description = "Upload progress", body = UploadInfo),
        (status = 404, description = "Unknown upload", body = ErrorReceipt)
    )
)]
pub async fn get_upload(
    State(state): State<Arc<AppState>>,
    Path(tguid): Path<String>,
) -> Result<Json<UploadInfo>, HttpAppError> {
    let tguid = parse_tguid(&tguid)?;
    Ok(Json(state.intake.info(&tguid).await?))
}
