//! Configuration loading
//!
//! Two sources, in priority order:
//! 1. Command-line arguments / environment variables (applied by the binary)
//! 2. TOML configuration file
//! 3. Built-in defaults (code constants)
//!
//! A missing TOML file is not an error: the service starts on defaults and
//! logs a warning. A TOML file that exists but does not parse is an error.

use crate::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Environment variable naming the provider account identifier
pub const ENV_PROVIDER_ACCOUNT_SID: &str = "CALLHUB_PROVIDER_ACCOUNT_SID";
/// Environment variable naming the provider auth token
pub const ENV_PROVIDER_AUTH_TOKEN: &str = "CALLHUB_PROVIDER_AUTH_TOKEN";

/// Complete service configuration
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ServiceConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub provider: ProviderConfig,
    pub hub: HubConfig,
    pub registry: RegistryConfig,
    pub recording: RecordingConfig,
    pub coaching: CoachingConfig,
    pub reprocess: ReprocessConfig,
    pub logging: LoggingConfig,
}

/// HTTP listener
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Socket address to bind (default: 127.0.0.1:5780)
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { bind: "127.0.0.1:5780".to_string() }
    }
}

/// Durable session storage
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { path: PathBuf::from("callhub.db") }
    }
}

/// Telephony provider credentials used for recording downloads
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub account_sid: Option<String>,
    pub auth_token: Option<String>,
    /// Extension appended to recording URLs that carry none (default: mp3)
    pub recording_extension: String,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            account_sid: None,
            auth_token: None,
            recording_extension: "mp3".to_string(),
        }
    }
}

/// Observer fan-out
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Messages buffered per observer before it counts as slow
    pub subscriber_buffer: usize,
    /// Longest a publish waits on one observer before dropping it
    pub publish_timeout_ms: u64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            subscriber_buffer: 256,
            publish_timeout_ms: 250,
        }
    }
}

impl HubConfig {
    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }
}

/// In-memory session registry eviction
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Active sessions with no event for this long are expired
    pub idle_timeout_secs: u64,
    /// Ended sessions stay resolvable in memory for this long
    pub ended_retention_secs: u64,
    /// Sweep period
    pub sweep_interval_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 1800,
            ended_retention_secs: 600,
            sweep_interval_secs: 60,
        }
    }
}

impl RegistryConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn ended_retention(&self) -> Duration {
        Duration::from_secs(self.ended_retention_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

/// Post-call recording pipeline
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    /// Directory recordings are written under
    pub storage_dir: PathBuf,
    /// Upper bound on one provider download
    pub download_timeout_secs: u64,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            storage_dir: PathBuf::from("recordings"),
            download_timeout_secs: 30,
        }
    }
}

impl RecordingConfig {
    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }
}

/// Coaching-analysis collaborator
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CoachingConfig {
    /// Analyzer endpoint; coaching is disabled when unset
    pub endpoint: Option<String>,
    /// Directory holding `<owner_id>.md` / `default.md` knowledge bases
    pub knowledge_base_dir: PathBuf,
    pub timeout_secs: u64,
}

impl Default for CoachingConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            knowledge_base_dir: PathBuf::from("knowledge"),
            timeout_secs: 20,
        }
    }
}

/// Downstream inbox reprocessing collaborator
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReprocessConfig {
    /// Reprocess endpoint; the step reports `skipped` when unset
    pub endpoint: Option<String>,
    pub timeout_secs: u64,
}

impl Default for ReprocessConfig {
    fn default() -> Self {
        Self { endpoint: None, timeout_secs: 30 }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error); RUST_LOG wins when set
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string() }
    }
}

impl ServiceConfig {
    /// Parse configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(format!("Invalid TOML: {}", e)))
    }

    /// Load configuration from an optional TOML file
    ///
    /// `None` or a path that does not exist yields defaults (with a warning
    /// for the latter).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) if path.exists() => {
                let content = std::fs::read_to_string(path)?;
                let config = Self::from_toml_str(&content)?;
                info!("Loaded configuration from {}", path.display());
                config
            }
            Some(path) => {
                warn!(
                    "Config file {} not found, using built-in defaults",
                    path.display()
                );
                Self::default()
            }
            None => {
                info!("No config file given, using built-in defaults");
                Self::default()
            }
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Provider credentials from the environment replace TOML values
    pub fn apply_env_overrides(&mut self) {
        if let Ok(sid) = std::env::var(ENV_PROVIDER_ACCOUNT_SID) {
            if !sid.is_empty() {
                self.provider.account_sid = Some(sid);
            }
        }
        if let Ok(token) = std::env::var(ENV_PROVIDER_AUTH_TOKEN) {
            if !token.is_empty() {
                self.provider.auth_token = Some(token);
            }
        }
    }
}
