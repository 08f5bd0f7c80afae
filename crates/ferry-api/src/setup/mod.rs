//! Application setup and initialization

pub mod routes;
pub mod server;
pub mod services;

use anyhow::{Context, Result};
use ferry_core::Config;

pub use services::{build_pipeline, Backends, Pipeline};

/// Initialize telemetry, the upload pipeline and the router
pub async fn initialize_app(config: Config) -> Result<(Pipeline, axum::Router)> {
    config.validate().context("Configuration validation failed")?;

    ferry_infra::init_telemetry(config.base.log_json, &config.base.environment)
        .map_err(|e| anyhow::anyhow!("Failed to initialize telemetry: {}", e))?;

    tracing::info!("Configuration loaded and validated successfully");

    let pipeline = services::initialize_services(&config).await?;
    let router = routes::setup_routes(&config, pipeline.state.clone());

    Ok((pipeline, router))
}
