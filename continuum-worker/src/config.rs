//! Worker configuration, loaded from environment variables at startup.

use std::time::Duration;

use continuum_core::{PriorityBand, SandboxConfig};

use crate::error::ConfigError;

/// Runtime configuration for the worker process.
///
/// Database settings are required; everything else has a default tuned for a
/// single-worker deployment.
#[derive(Debug, Clone)]
pub struct Config {
    /// Task-store connection settings. TLS is always required.
    pub db_user: String,
    pub db_password: String,
    pub db_name: String,
    pub db_host: String,
    pub db_port: u16,

    /// Fallback polling interval (floor-clamped to 5 s by the worker loop).
    pub polling_interval: Duration,

    /// Priority band this worker claims from; `0` means unbounded.
    pub min_priority: i32,
    pub max_priority: i32,

    /// Sandbox container base image.
    pub container_image: String,
    /// Per-container memory cap in MiB.
    pub container_memory_mb: i64,
    /// Per-container CPU cap in fractional cores.
    pub container_cpu_limit: f64,
    /// Idle-reaper threshold, e.g. `5m` or `90s`.
    pub container_idle_timeout: Duration,

    /// TCP port of the status HTTP server.
    pub api_port: u16,

    /// `tracing` filter string, e.g. `"info"` or `"debug,sqlx=warn"`.
    pub log_level: String,
    /// When `true`, emit log records as newline-delimited JSON.
    pub log_json: bool,
}

impl Config {
    /// Build [`Config`] from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            db_user: require_env("DB_USER")?,
            db_password: require_env("DB_PASSWORD")?,
            db_name: require_env("DB_NAME")?,
            db_host: require_env("DB_HOST")?,
            db_port: parse_env("DB_PORT", 5432)?,
            polling_interval: Duration::from_secs(parse_env("POLLING_INTERVAL", 5u64)?),
            min_priority: parse_env("MIN_PRIORITY", 0)?,
            max_priority: parse_env("MAX_PRIORITY", 0)?,
            container_image: env_or("CONTAINER_IMAGE", "python:3.9-slim"),
            container_memory_mb: parse_env("CONTAINER_MEMORY_MB", 512)?,
            container_cpu_limit: parse_env("CONTAINER_CPU_LIMIT", 0.5)?,
            container_idle_timeout: parse_duration_env(
                "CONTAINER_IDLE_TIMEOUT",
                Duration::from_secs(5 * 60),
            )?,
            api_port: parse_env("API_PORT", 8080)?,
            log_level: env_or("LOG_LEVEL", "info"),
            log_json: std::env::var("LOG_JSON")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
        })
    }

    /// sqlx connection URL; TLS enforced.
    pub fn database_url(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}?sslmode=require",
            self.db_user, self.db_password, self.db_host, self.db_port, self.db_name
        )
    }

    pub fn priority_band(&self) -> PriorityBand {
        PriorityBand::new(self.min_priority, self.max_priority)
    }

    pub fn sandbox_config(&self) -> SandboxConfig {
        SandboxConfig {
            image: self.container_image.clone(),
            memory_mb: self.container_memory_mb,
            cpu_limit: self.container_cpu_limit,
            idle_timeout: self.container_idle_timeout,
        }
    }
}

// ── private helpers ──────────────────────────────────────────────────────────

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_owned())
}

fn require_env(key: &'static str) -> Result<String, ConfigError> {
    std::env::var(key).map_err(|_| ConfigError::MissingEnv(key))
}

fn parse_env<T: std::str::FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Err(_) => Ok(default),
        Ok(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue {
            name: key,
            value: raw,
        }),
    }
}

fn parse_duration_env(
    key: &'static str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    match std::env::var(key) {
        Err(_) => Ok(default),
        Ok(raw) => humantime::parse_duration(&raw).map_err(|_| ConfigError::InvalidValue {
            name: key,
            value: raw,
        }),
    }
}
