//! Configuration module
//!
//! Environment-driven settings for the HTTP server, staging area, replication,
//! status publication and the copy-status reconciler.

use crate::backoff::BackoffPolicy;
use std::env;
use std::str::FromStr;
use std::time::Duration;

const MAX_CONNECTIONS: u32 = 20;
const CONNECTION_TIMEOUT_SECS: u64 = 30;
const MAX_UPLOAD_SIZE_BYTES: u64 = 5 * 1024 * 1024 * 1024;
const UPLOAD_INACTIVITY_TIMEOUT_SECS: u64 = 3600;
const UPLOAD_SWEEP_INTERVAL_SECS: u64 = 60;
const COPY_MAX_ATTEMPTS: u32 = 5;
const COPY_BASE_DELAY_MS: u64 = 500;
const COPY_MAX_DELAY_MS: u64 = 30_000;
const COPY_ATTEMPT_TIMEOUT_SECS: u64 = 300;
const PUBLISH_MAX_ATTEMPTS: u32 = 5;
const RECONCILER_WORKERS: usize = 4;
const RECONCILER_POLL_INTERVAL_MS: u64 = 500;
const RECONCILER_VISIBILITY_TIMEOUT_SECS: u64 = 30;
const RECONCILER_MAX_CONFLICT_RETRIES: u32 = 8;

/// Server and persistence settings
#[derive(Clone, Debug)]
pub struct BaseConfig {
    pub server_port: u16,
    pub environment: String,
    pub database_url: Option<String>,
    pub db_max_connections: u32,
    pub db_timeout_seconds: u64,
    pub log_json: bool,
}

/// Upload intake settings
#[derive(Clone, Debug)]
pub struct IntakeConfig {
    pub staging_storage_path: String,
    pub max_upload_size_bytes: u64,
    pub inactivity_timeout: Duration,
    pub sweep_interval: Duration,
}

/// Replication and status pipeline settings
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub routing_config_path: String,
    pub copy_backoff: BackoffPolicy,
    pub copy_attempt_timeout: Duration,
    pub publish_backoff: BackoffPolicy,
    pub reconciler_workers: usize,
    pub reconciler_poll_interval: Duration,
    pub reconciler_visibility_timeout: Duration,
    pub reconciler_max_conflict_retries: u32,
}

/// Application configuration.
#[derive(Clone, Debug)]
pub struct Config {
    pub base: BaseConfig,
    pub intake: IntakeConfig,
    pub pipeline: PipelineConfig,
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Result<Self, anyhow::Error> {
        dotenvy::dotenv().ok();

        let environment = env::var("ENVIRONMENT")
            .or_else(|_| env::var("APP_ENV"))
            .unwrap_or_else(|_| "development".to_string());

        let base = BaseConfig {
            server_port: env::var("PORT")
                .unwrap_or_else(|_| "4000".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("PORT must be a valid number"))?,
            environment,
            database_url: env::var("DATABASE_URL").ok().filter(|s| !s.trim().is_empty()),
            db_max_connections: env_or("DB_MAX_CONNECTIONS", MAX_CONNECTIONS),
            db_timeout_seconds: env_or("DB_TIMEOUT_SECONDS", CONNECTION_TIMEOUT_SECS),
            log_json: env::var("LOG_FORMAT")
                .map(|v| v.eq_ignore_ascii_case("json"))
                .unwrap_or(false),
        };

        let intake = IntakeConfig {
            staging_storage_path: env::var("STAGING_STORAGE_PATH")
                .unwrap_or_else(|_| "./data/staging".to_string()),
            max_upload_size_bytes: env_or("MAX_UPLOAD_SIZE_BYTES", MAX_UPLOAD_SIZE_BYTES),
            inactivity_timeout: Duration::from_secs(env_or(
                "UPLOAD_INACTIVITY_TIMEOUT_SECS",
                UPLOAD_INACTIVITY_TIMEOUT_SECS,
            )),
            sweep_interval: Duration::from_secs(env_or(
                "UPLOAD_SWEEP_INTERVAL_SECS",
                UPLOAD_SWEEP_INTERVAL_SECS,
            )),
        };

        let copy_base_delay = Duration::from_millis(env_or("COPY_BASE_DELAY_MS", COPY_BASE_DELAY_MS));
        let copy_max_delay = Duration::from_millis(env_or("COPY_MAX_DELAY_MS", COPY_MAX_DELAY_MS));

        let pipeline = PipelineConfig {
            routing_config_path: env::var("ROUTING_CONFIG_PATH")
                .unwrap_or_else(|_| "./routing.json".to_string()),
            copy_backoff: BackoffPolicy {
                max_attempts: env_or("COPY_MAX_ATTEMPTS", COPY_MAX_ATTEMPTS),
                base_delay: copy_base_delay,
                max_delay: copy_max_delay,
            },
            copy_attempt_timeout: Duration::from_secs(env_or(
                "COPY_ATTEMPT_TIMEOUT_SECS",
                COPY_ATTEMPT_TIMEOUT_SECS,
            )),
            publish_backoff: BackoffPolicy {
                max_attempts: env_or("PUBLISH_MAX_ATTEMPTS", PUBLISH_MAX_ATTEMPTS),
                base_delay: copy_base_delay,
                max_delay: copy_max_delay,
            },
            reconciler_workers: env_or("RECONCILER_WORKERS", RECONCILER_WORKERS),
            reconciler_poll_interval: Duration::from_millis(env_or(
                "RECONCILER_POLL_INTERVAL_MS",
                RECONCILER_POLL_INTERVAL_MS,
            )),
            reconciler_visibility_timeout: Duration::from_secs(env_or(
                "RECONCILER_VISIBILITY_TIMEOUT_SECS",
                RECONCILER_VISIBILITY_TIMEOUT_SECS,
            )),
            reconciler_max_conflict_retries: env_or(
                "RECONCILER_MAX_CONFLICT_RETRIES",
                RECONCILER_MAX_CONFLICT_RETRIES,
            ),
        };

        Ok(Config {
            base,
            intake,
            pipeline,
        })
    }

    /// Fail fast on settings that would make a stage block forever or never run.
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        let pipeline = &self.pipeline;
        if pipeline.copy_backoff.max_attempts == 0 {
            anyhow::bail!("COPY_MAX_ATTEMPTS must be at least 1");
        }
        if pipeline.publish_backoff.max_attempts == 0 {
            anyhow::bail!("PUBLISH_MAX_ATTEMPTS must be at least 1");
        }
        if pipeline.copy_backoff.base_delay > pipeline.copy_backoff.max_delay {
            anyhow::bail!("COPY_BASE_DELAY_MS must not exceed COPY_MAX_DELAY_MS");
        }
        if pipeline.copy_attempt_timeout.is_zero() {
            anyhow::bail!("COPY_ATTEMPT_TIMEOUT_SECS must be greater than 0");
        }
        if self.intake.inactivity_timeout.is_zero() {
            anyhow::bail!("UPLOAD_INACTIVITY_TIMEOUT_SECS must be greater than 0");
        }
        if self.intake.sweep_interval.is_zero() {
            anyhow::bail!("UPLOAD_SWEEP_INTERVAL_SECS must be greater than 0");
        }
        if pipeline.reconciler_workers == 0 {
            anyhow::bail!("RECONCILER_WORKERS must be at least 1");
        }
        if pipeline.reconciler_visibility_timeout.is_zero() {
            anyhow::bail!("RECONCILER_VISIBILITY_TIMEOUT_SECS must be greater than 0");
        }
        if self.intake.max_upload_size_bytes == 0 {
            anyhow::bail!("MAX_UPLOAD_SIZE_BYTES must be greater than 0");
        }
        Ok(())
    }

    /// Check if the application is running in production mode
    pub fn is_production(&self) -> bool {
        let env = self.base.environment.to_lowercase();
        env == "production" || env == "prod"
    }

    pub fn server_port(&self) -> u16 {
        self.base.server_port
    }

    pub fn database_url(&self) -> Option<&str> {
        self.base.database_url.as_deref()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base: BaseConfig {
                server_port: 4000,
                environment: "development".to_string(),
                database_url: None,
                db_max_connections: MAX_CONNECTIONS,
                db_timeout_seconds: CONNECTION_TIMEOUT_SECS,
                log_json: false,
            },
            intake: IntakeConfig {
                staging_storage_path: "./data/staging".to_string(),
                max_upload_size_bytes: MAX_UPLOAD_SIZE_BYTES,
                inactivity_timeout: Duration::from_secs(UPLOAD_INACTIVITY_TIMEOUT_SECS),
                sweep_interval: Duration::from_secs(UPLOAD_SWEEP_INTERVAL_SECS),
            },
            pipeline: PipelineConfig {
                routing_config_path: "./routing.json".to_string(),
                copy_backoff: BackoffPolicy::new(
                    COPY_MAX_ATTEMPTS,
                    Duration::from_millis(COPY_BASE_DELAY_MS),
                    Duration::from_millis(COPY_MAX_DELAY_MS),
                ),
                copy_attempt_timeout: Duration::from_secs(COPY_ATTEMPT_TIMEOUT_SECS),
                publish_backoff: BackoffPolicy::new(
                    PUBLISH_MAX_ATTEMPTS,
                    Duration::from_millis(COPY_BASE_DELAY_MS),
                    Duration::from_millis(COPY_MAX_DELAY_MS),
                ),
                reconciler_workers: RECONCILER_WORKERS,
                reconciler_poll_interval: Duration::from_millis(RECONCILER_POLL_INTERVAL_MS),
                reconciler_visibility_timeout: Duration::from_secs(
                    RECONCILER_VISIBILITY_TIMEOUT_SECS,
                ),
                reconciler_max_conflict_retries: RECONCILER_MAX_CONFLICT_RETRIES,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert!(!config.is_production());
        assert!(config.database_url().is_none());
    }

    #[test]
    fn validate_rejects_inverted_backoff() {
        let mut config = Config::default();
        config.pipeline.copy_backoff.base_delay = Duration::from_secs(60);
        config.pipeline.copy_backoff.max_delay = Duration::from_secs(1);
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_timeouts() {
        let mut config = Config::default();
        config.pipeline.copy_attempt_timeout = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.intake.inactivity_timeout = Duration::ZERO;
        assert!(config.validate().is_err());
    }
}
