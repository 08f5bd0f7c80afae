//! HTTP error response conversion
//!
//! Handlers return `Result<impl IntoResponse, HttpAppError>`; any `AppError` converts
//! with `?` and renders as an [`ErrorReceipt`]. The request path is filled in by
//! [`error_receipt_middleware`], which sees the request the handler does not.

use axum::{
    extract::Request,
    http::{header, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use ferry_core::{AppError, ErrorMetadata, LogLevel};
use ferry_infra::ErrorReceipt;
use ferry_storage::StorageError;

/// Wrapper needed because both `IntoResponse` and `AppError` are foreign to this crate
#[derive(Debug)]
pub struct HttpAppError(pub AppError);

impl From<AppError> for HttpAppError {
    fn from(err: AppError) -> Self {
        HttpAppError(err)
    }
}

impl From<anyhow::Error> for HttpAppError {
    fn from(err: anyhow::Error) -> Self {
        HttpAppError(AppError::from(err))
    }
}

impl From<StorageError> for HttpAppError {
    fn from(err: StorageError) -> Self {
        let app = match err {
            StorageError::NotFound(msg) => AppError::NotFound(msg),
            StorageError::InvalidKey(msg) => AppError::InvalidInput(msg),
            other => AppError::Storage(other.to_string()),
        };
        HttpAppError(app)
    }
}

fn log_error(error: &AppError) {
    let error_type = error.error_type();
    match error.log_level() {
        LogLevel::Debug => {
            tracing::debug!(error = %error, error_type = error_type, "Request rejected");
        }
        LogLevel::Warn => {
            tracing::warn!(error = %error, error_type = error_type, "Request rejected");
        }
        LogLevel::Error => {
            tracing::error!(error = %error.detailed_message(), error_type = error_type, "Request failed");
        }
    }
}

impl HttpAppError {
    pub fn receipt(&self) -> ErrorReceipt {
        let error = &self.0;
        ErrorReceipt::new(
            error.error_code(),
            error.client_message(),
            error.http_status_code(),
            "",
            error.error_type(),
        )
    }
}

impl IntoResponse for HttpAppError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.http_status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        log_error(&self.0);

        let receipt = self.receipt();
        let mut response = (status, Json(receipt.clone())).into_response();
        response.extensions_mut().insert(receipt);
        response
    }
}

/// Stamp the request path onto error receipts produced further down the stack.
pub async fn error_receipt_middleware(request: Request, next: Next) -> Response {
    let path = request.uri().path().to_string();
    let mut response = next.run(request).await;

    let Some(mut receipt) = response.extensions_mut().remove::<ErrorReceipt>() else {
        return response;
    };
    receipt.path = path;

    let (mut parts, _) = response.into_parts();
    match serde_json::to_vec(&receipt) {
        Ok(body) => {
            parts.headers.remove(header::CONTENT_LENGTH);
            parts.headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            );
            Response::from_parts(parts, axum::body::Body::from(body))
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to serialize error receipt");
            Response::from_parts(parts, axum::body::Body::empty())
        }
    }
}
