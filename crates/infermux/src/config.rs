//! Process-level configuration.
//!
//! All configuration comes from environment variables with defaults
//! suitable for container deployments. Invalid values are fatal at
//! startup rather than silently corrected.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration errors are fatal startup errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Text,
}

/// Runtime configuration loaded from the environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Unique runtime instance identifier.
    pub runtime_id: String,
    /// Filesystem root scanned for model packages.
    pub models_root: PathBuf,
    /// Global concurrent-inference cap.
    pub max_concurrent_inferences: u32,
    /// Whether GPU-capable contracts may load.
    pub enable_gpu: bool,
    /// Backend push base URL; unset means no backend.
    pub backend_url: Option<String>,
    pub backend_api_key: Option<String>,
    pub backend_service_token: Option<String>,
    /// Drain budget at shutdown.
    pub graceful_shutdown_timeout: Duration,
    /// Per-version load budget.
    pub model_load_timeout: Duration,
    /// Publisher heartbeat period.
    pub heartbeat_interval: Duration,
    pub metrics_enabled: bool,
    pub log_level: String,
    pub log_format: LogFormat,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            runtime_id: format!("infermux-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]),
            models_root: PathBuf::from("./models"),
            max_concurrent_inferences: 10,
            enable_gpu: true,
            backend_url: None,
            backend_api_key: None,
            backend_service_token: None,
            graceful_shutdown_timeout: Duration::from_secs(30),
            model_load_timeout: Duration::from_millis(60_000),
            heartbeat_interval: Duration::from_secs(30),
            metrics_enabled: true,
            log_level: "info".to_string(),
            log_format: LogFormat::Json,
        }
    }
}

impl RuntimeConfig {
    /// Load from the environment, falling back to defaults for unset
    /// variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            runtime_id: env_string("RUNTIME_ID").unwrap_or(defaults.runtime_id),
            models_root: env_string("MODELS_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.models_root),
            max_concurrent_inferences: env_parse(
                "MAX_CONCURRENT_INFERENCES",
                defaults.max_concurrent_inferences,
            )?,
            enable_gpu: env_bool("ENABLE_GPU", defaults.enable_gpu)?,
            backend_url: env_string("BACKEND_URL"),
            backend_api_key: env_string("BACKEND_API_KEY"),
            backend_service_token: env_string("BACKEND_SERVICE_TOKEN"),
            graceful_shutdown_timeout: Duration::from_secs(env_parse(
                "GRACEFUL_SHUTDOWN_TIMEOUT_SECONDS",
                defaults.graceful_shutdown_timeout.as_secs(),
            )?),
            model_load_timeout: Duration::from_millis(env_parse(
                "MODEL_LOAD_TIMEOUT_MS",
                defaults.model_load_timeout.as_millis() as u64,
            )?),
            heartbeat_interval: Duration::from_secs(env_parse(
                "HEARTBEAT_INTERVAL_SECONDS",
                defaults.heartbeat_interval.as_secs(),
            )?),
            metrics_enabled: env_bool("METRICS_ENABLED", defaults.metrics_enabled)?,
            log_level: env_string("LOG_LEVEL").unwrap_or(defaults.log_level),
            log_format: match env_string("LOG_FORMAT").as_deref() {
                None => defaults.log_format,
                Some("json") => LogFormat::Json,
                Some("text") => LogFormat::Text,
                Some(other) => {
                    return Err(ConfigError::Invalid {
                        key: "LOG_FORMAT",
                        value: other.to_string(),
                        reason: "expected 'json' or 'text'".to_string(),
                    })
                }
            },
        };
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.runtime_id.is_empty() {
            return Err(ConfigError::Invalid {
                key: "RUNTIME_ID",
                value: String::new(),
                reason: "must not be empty".to_string(),
            });
        }
        if self.max_concurrent_inferences == 0 {
            return Err(ConfigError::Invalid {
                key: "MAX_CONCURRENT_INFERENCES",
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.model_load_timeout.is_zero() {
            return Err(ConfigError::Invalid {
                key: "MODEL_LOAD_TIMEOUT_MS",
                value: "0".to_string(),
                reason: "must be greater than 0".to_string(),
            });
        }
        Ok(())
    }

    /// Small limits and a temp-friendly root for tests.
    #[must_use]
    pub fn for_testing(models_root: impl Into<PathBuf>) -> Self {
        Self {
            runtime_id: "infermux-test".to_string(),
            models_root: models_root.into(),
            graceful_shutdown_timeout: Duration::from_secs(2),
            model_load_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_millis(200),
            metrics_enabled: false,
            ..Self::default()
        }
    }
}

fn env_string(key: &'static str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match env_string(key) {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|_| ConfigError::Invalid {
            key,
            value: raw,
            reason: "not a valid number".to_string(),
        }),
    }
}

fn env_bool(key: &'static str, default: bool) -> Result<bool, ConfigError> {
    match env_string(key).as_deref() {
        None => Ok(default),
        Some("true") | Some("1") | Some("yes") => Ok(true),
        Some("false") | Some("0") | Some("no") => Ok(false),
        Some(other) => Err(ConfigError::Invalid {
            key,
            value: other.to_string(),
            reason: "expected true/false".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.max_concurrent_inferences, 10);
        assert_eq!(config.graceful_shutdown_timeout, Duration::from_secs(30));
        assert_eq!(config.model_load_timeout, Duration::from_millis(60_000));
        assert!(config.metrics_enabled);
        assert!(config.runtime_id.starts_with("infermux-"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_concurrency_invalid() {
        let config = RuntimeConfig {
            max_concurrent_inferences: 0,
            ..RuntimeConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_runtime_id_invalid() {
        let config = RuntimeConfig {
            runtime_id: String::new(),
            ..RuntimeConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
