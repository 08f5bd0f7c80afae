//! Ferry Infrastructure Library
//!
//! Shared infrastructure used by the Ferry services:
//! - Telemetry initialization
//! - Request id middleware
//! - The error receipt rendered for failed requests

#[cfg(feature = "middleware")]
pub mod middleware;

pub mod error;
pub mod telemetry;

#[cfg(feature = "middleware")]
pub use middleware::{get_request_id, request_id_middleware, RequestId, REQUEST_ID_HEADER};

pub use error::ErrorReceipt;
pub use telemetry::init_telemetry;
