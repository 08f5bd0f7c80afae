//! Health check handler and response type.

use crate::state::AppState;
use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use utoipa::ToSchema;

const CHECK_TIMEOUT: Duration = Duration::from_secs(5);
const HEALTHY: &str = "healthy";

/// Run an async check with timeout; returns "healthy", "timeout", or "{prefix}: {error}".
async fn run_check<F, E>(f: F, error_prefix: &str) -> String
where
    F: Future<Output = Result<(), E>>,
    E: Display,
{
    match tokio::time::timeout(CHECK_TIMEOUT, f).await {
        Ok(Ok(())) => HEALTHY.to_string(),
        Ok(Err(e)) => format!("{}: {}", error_prefix, e),
        Err(_) => "timeout".to_string(),
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct HealthCheckResponse {
    pub status: String,
    pub trace_store: String,
    pub copy_status_store: String,
    pub queue: String,
    pub staging: String,
}

impl HealthCheckResponse {
    fn is_healthy(&self) -> bool {
        [&self.trace_store, &self.copy_status_store, &self.queue, &self.staging]
            .iter()
            .all(|check| check.as_str() == HEALTHY)
    }
}

/// Store and queue reachability
#[utoipa::path(
    get,
    path = "/health",
    tag = "health",
    responses(
        (status = 200, description = "All dependencies reachable", body = HealthCheckResponse),
        (status = 503, description = "At least one dependency failing", body = HealthCheckResponse)
    )
)]
pub async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let (trace_store, copy_status_store, queue, staging) = tokio::join!(
        run_check(state.traces.ping(), "error"),
        run_check(state.copy_status.ping(), "error"),
        run_check(state.queue.ping(), "error"),
        run_check(
            async { state.staging.exists("health-check").await.map(|_| ()) },
            "error"
        ),
    );

    let mut response = HealthCheckResponse {
        status: "healthy".to_string(),
        trace_store,
        copy_status_store,
        queue,
        staging,
    };

    let status = if response.is_healthy() {
        StatusCode::OK
    } else {
        tracing::warn!(?response, "Health check failed");
        response.status = "unhealthy".to_string();
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status, Json(response))
}
