//! Route configuration and setup.

use crate::constants::{
    HEADER_TGUID, HEADER_TUS_EXTENSION, HEADER_TUS_MAX_SIZE, HEADER_TUS_RESUMABLE,
    HEADER_TUS_VERSION, HEADER_UPLOAD_LENGTH, HEADER_UPLOAD_OFFSET,
};
use crate::error::error_receipt_middleware;
use crate::handlers::{copy_status, health, trace, uploads};
use crate::state::AppState;
use axum::{
    extract::DefaultBodyLimit,
    http::{header, HeaderName, Method},
    routing::{get, head, post},
    Json, Router,
};
use ferry_core::Config;
use ferry_infra::{request_id_middleware, REQUEST_ID_HEADER};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

/// Build the application router
pub fn setup_routes(config: &Config, state: Arc<AppState>) -> Router<()> {
    let body_limit = usize::try_from(config.intake.max_upload_size_bytes).unwrap_or(usize::MAX);

    Router::new()
        .route(
            "/files",
            post(uploads::create_upload).options(uploads::upload_options),
        )
        .route(
            "/files/{tguid}",
            head(uploads::upload_offset).patch(uploads::append_chunk),
        )
        .route("/upload/{tguid}", get(uploads::get_upload))
        .route("/trace/{upload_id}", get(trace::get_trace))
        .route("/copy-status/{tguid}", get(copy_status::get_copy_status))
        .route("/health", get(health::health_check))
        .route(
            "/api/openapi.json",
            get(|| async { Json(crate::api_doc::get_openapi_spec()) }),
        )
        .merge(utoipa_rapidoc::RapiDoc::new("/api/openapi.json").path("/docs"))
        .layer(axum::middleware::from_fn(error_receipt_middleware))
        .layer(RequestBodyLimitLayer::new(body_limit))
        .layer(DefaultBodyLimit::disable())
        .layer(setup_cors())
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(request_id_middleware))
        .with_state(state)
}

fn setup_cors() -> CorsLayer {
    let exposed = [
        HEADER_TUS_RESUMABLE,
        HEADER_TUS_VERSION,
        HEADER_TUS_MAX_SIZE,
        HEADER_TUS_EXTENSION,
        HEADER_UPLOAD_OFFSET,
        HEADER_UPLOAD_LENGTH,
        HEADER_TGUID,
        REQUEST_ID_HEADER,
    ]
    .map(HeaderName::from_static);

    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::HEAD,
            Method::PATCH,
            Method::OPTIONS,
        ])
        .allow_headers(Any)
        .expose_headers(
            exposed
                .into_iter()
                .chain([header::LOCATION])
                .collect::<Vec<_>>(),
        )
}
