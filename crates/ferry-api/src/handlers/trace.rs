use crate::error::HttpAppError;
use crate::handlers::uploads::parse_tguid;
use crate::state::AppState;
use axum::{
    extract::{Path, State},
    Json,
};
use ferry_core::models::Trace;
use ferry_infra::ErrorReceipt;
use std::sync::Arc;

/// Spans recorded for an upload, ordered by timestamp
#[utoipa::path(
    get,
    path = "/trace/{upload_id}",
    tag = "status",
    params(("upload_id" = String, Path, description = "Upload identifier (tguid)")),
    responses(
        (status = 200, description = "Trace with every span recorded so far", body = Trace),
        (status = 404, description = "No span recorded yet", body = ErrorReceipt)
    )
)]
pub async fn get_trace(
    State(state): State<Arc<AppState>>,
    Path(upload_id): Path<String>,
) -> Result<Json<Trace>, HttpAppError> {
    let upload_id = parse_tguid(&upload_id)?;
    Ok(Json(state.traces.get_trace(&upload_id).await?))
}
