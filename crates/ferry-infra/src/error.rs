//! Error receipt returned by every failed request.
//!
//! The `IntoResponse` conversion for `AppError` lives in ferry-api; this crate only owns
//! the wire shape so other HTTP surfaces can render the same body.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ErrorReceipt {
    /// Machine-readable error code, e.g. `OFFSET_MISMATCH`
    pub code: String,
    pub description: String,
    /// HTTP status code
    pub status: u16,
    /// Request path that failed
    pub path: String,
    /// Originating error kind
    pub kind: String,
}

impl ErrorReceipt {
    pub fn new(
        code: impl Into<String>,
        description: impl Into<String>,
        status: u16,
        path: impl Into<String>,
        kind: impl Into<String>,
    ) -> Self {
        Self {
            code: code.into(),
            description: description.into(),
            status,
            path: path.into(),
            kind: kind.into(),
        }
    }
}
