//! Application state shared by every handler.

use ferry_core::Config;
use ferry_services::{CopyStatusQueryService, TraceQueryService, UploadIntake};
use ferry_storage::Storage;
use ferry_worker::CopyStatusQueue;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub intake: Arc<UploadIntake>,
    pub traces: TraceQueryService,
    pub copy_status: CopyStatusQueryService,
    /// Held for health checks only
    pub queue: Arc<dyn CopyStatusQueue>,
    pub staging: Arc<dyn Storage>,
}
