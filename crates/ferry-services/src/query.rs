//! Read-side services behind `GET /trace/{id}` and `GET /copy-status/{tguid}`.

use ferry_core::models::{ItemCopyStatus, Tguid, Trace};
use ferry_core::AppError;
use ferry_db::{CopyStatusStore, TraceStore};
use std::sync::Arc;

#[derive(Clone)]
pub struct TraceQueryService {
    traces: Arc<dyn TraceStore>,
}

impl TraceQueryService {
    pub fn new(traces: Arc<dyn TraceStore>) -> Self {
        Self { traces }
    }

    /// Every span recorded so far for an upload, oldest first.
    ///
    /// Not found until the first span has been recorded.
    #[tracing::instrument(skip(self))]
    pub async fn get_trace(&self, upload_id: &Tguid) -> Result<Trace, AppError> {
        let mut trace = self
            .traces
            .get_trace(upload_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("No trace for upload {}", upload_id)))?;
        trace.spans.sort_by_key(|span| span.timestamp);
        Ok(trace)
    }

    pub async fn ping(&self) -> Result<(), AppError> {
        Ok(self.traces.ping().await?)
    }
}

#[derive(Clone)]
pub struct CopyStatusQueryService {
    store: Arc<dyn CopyStatusStore>,
}

impl CopyStatusQueryService {
    pub fn new(store: Arc<dyn CopyStatusStore>) -> Self {
        Self { store }
    }

    /// Reconciled document for a tguid. Lags the last status message slightly.
    #[tracing::instrument(skip(self))]
    pub async fn get_copy_status(&self, tguid: &Tguid) -> Result<ItemCopyStatus, AppError> {
        self.store
            .get(tguid)
            .await?
            .map(|versioned| versioned.document)
            .ok_or_else(|| AppError::NotFound(format!("No copy status for {}", tguid)))
    }

    pub async fn ping(&self) -> Result<(), AppError> {
        Ok(self.store.ping().await?)
    }
}
