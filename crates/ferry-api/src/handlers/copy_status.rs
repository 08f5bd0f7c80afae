use crate::error::HttpAppError;
use crate::handlers::uploads::parse_tguid;
use crate::state::AppState;
use axum::{
    extract::{Path, State},
    Json,
};
use ferry_core::models::ItemCopyStatus;
use ferry_infra::ErrorReceipt;
use std::sync::Arc;

/// Reconciled per-destination copy status
///
/// Eventually consistent: a status update can take a poll interval to show up.
#[utoipa::path(
    get,
    path = "/copy-status/{tguid}",
    tag = "status",
    params(("tguid" = String, Path, description = "Upload identifier")),
    responses(
        (status = 200, description = "Reconciled copy-status document", body = ItemCopyStatus),
        (status = 404, description = "No status message reconciled yet", body = ErrorReceipt)
    )
)]
pub async fn get_copy_status(
    State(state): State<Arc<AppState>>,
    Path(tguid): Path<String>,
) -> Result<Json<ItemCopyStatus>, HttpAppError> {
    let tguid = parse_tguid(&tguid)?;
    Ok(Json(state.copy_status.get_copy_status(&tguid).await?))
}
