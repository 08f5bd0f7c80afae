//! Ferry Core Library
//!
//! This crate provides the domain models, error types, configuration and retry policy
//! shared across all Ferry components.

pub mod backoff;
pub mod config;
pub mod error;
pub mod models;
pub mod storage_types;

// Re-export commonly used types
pub use backoff::BackoffPolicy;
pub use config::{BaseConfig, Config, IntakeConfig, PipelineConfig};
pub use error::{AppError, ErrorMetadata, LogLevel};
pub use storage_types::StorageBackend;
