//! Ferry API Library
//!
//! HTTP handlers, application state and setup for the `ferry-api` binary.

mod api_doc;
pub mod constants;
pub mod error;
mod handlers;
pub mod setup;
pub mod state;

pub use api_doc::get_openapi_spec;
pub use error::HttpAppError;
pub use handlers::uploads::parse_upload_metadata;
