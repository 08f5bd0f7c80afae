//! OpenAPI documentation.

use utoipa::OpenApi;

use crate::handlers;
use ferry_core::models;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Ferry API",
        version = "0.1.0",
        description = "Resumable upload intake with fan-out replication to destination stores, per-upload traces and reconciled copy status."
    ),
    paths(
        handlers::uploads::upload_options,
        handlers::uploads::create_upload,
        handlers::uploads::upload_offset,
        handlers::uploads::append_chunk,
        handlers::uploads::get_upload,
        handlers::trace::get_trace,
        handlers::copy_status::get_copy_status,
        handlers::health::health_check,
    ),
    components(schemas(
        models::FileReceipt,
        models::ReceiptStatus,
        models::UploadInfo,
        models::UploadState,
        models::Trace,
        models::Span,
        models::SpanStatus,
        models::Item,
        models::ItemCopyStatus,
        ferry_infra::ErrorReceipt,
        handlers::health::HealthCheckResponse,
    )),
    tags(
        (name = "uploads", description = "Resumable upload protocol"),
        (name = "status", description = "Traces and copy status"),
        (name = "health", description = "Health checks")
    )
)]
pub struct ApiDoc;

pub fn get_openapi_spec() -> utoipa::openapi::OpenApi {
    ApiDoc::openapi()
}
