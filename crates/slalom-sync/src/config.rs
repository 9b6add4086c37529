//! # Sync Configuration
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     SLALOM_DEVICE_ID=abc-123                                           │
//! │     SLALOM_API_URL=https://timing.example.com/api                      │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/slalom-sync/sync.toml (Linux)                            │
//! │     ~/Library/Application Support/com.slalom.sync/sync.toml (macOS)    │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! │     auto-generated device_id, 10s request timeout, 5 retries           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! [device]
//! id = "550e8400-e29b-41d4-a716-446655440000"
//! name = "Finish Timer"
//!
//! [cloud]
//! api_url = "https://timing.example.com/api"
//! request_timeout_ms = 10000
//!
//! [queue]
//! max_retries = 5
//! base_backoff_ms = 1000
//! max_backoff_ms = 300000
//! batch_size = 10
//! drain_interval_secs = 30
//!
//! [polling]
//! error_threshold = 3
//! error_interval_secs = 30
//! ```

use serde::{Deserialize, Serialize};
use slalom_core::polling::{ERROR_POLL_INTERVAL, ERROR_THRESHOLD};
use slalom_core::{RetryPolicy, MAX_BATCH_SIZE, MAX_RETRIES};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::error::{SyncError, SyncResult};

// =============================================================================
// Device Configuration
// =============================================================================

/// Configuration for this device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Unique device identifier (UUID v4).
    /// Auto-generated on first run if not provided.
    pub id: String,

    /// Human-readable device name (e.g., "Start Timer", "Gate 1-10").
    #[serde(default = "default_device_name")]
    pub name: String,
}

fn default_device_name() -> String {
    "Timer".to_string()
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            id: Uuid::new_v4().to_string(),
            name: default_device_name(),
        }
    }
}

// =============================================================================
// Cloud Settings
// =============================================================================

/// Where and how to reach the sync API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudSettings {
    /// Base URL of the sync API; `/sync` and `/faults` are resolved against it.
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Deadline for every request (milliseconds).
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
}

fn default_api_url() -> String {
    "http://localhost:3000/api/v1".to_string()
}

fn default_request_timeout() -> u64 {
    10_000
}

impl Default for CloudSettings {
    fn default() -> Self {
        CloudSettings {
            api_url: default_api_url(),
            request_timeout_ms: default_request_timeout(),
        }
    }
}

// =============================================================================
// Queue Settings
// =============================================================================

/// Retry and batching behaviour of the send queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSettings {
    /// Failed attempts before an item is dropped.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_base_backoff")]
    pub base_backoff_ms: u64,

    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,

    /// Items sent per batch request.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Interval of the drain timer (seconds).
    #[serde(default = "default_drain_interval")]
    pub drain_interval_secs: u64,
}

fn default_max_retries() -> u32 {
    MAX_RETRIES
}
fn default_base_backoff() -> u64 {
    1_000
}
fn default_max_backoff() -> u64 {
    300_000
}
fn default_batch_size() -> usize {
    MAX_BATCH_SIZE
}
fn default_drain_interval() -> u64 {
    30
}

impl Default for QueueSettings {
    fn default() -> Self {
        QueueSettings {
            max_retries: default_max_retries(),
            base_backoff_ms: default_base_backoff(),
            max_backoff_ms: default_max_backoff(),
            batch_size: default_batch_size(),
            drain_interval_secs: default_drain_interval(),
        }
    }
}

impl QueueSettings {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(self.base_backoff_ms),
            max_delay: Duration::from_millis(self.max_backoff_ms),
            max_retries: self.max_retries,
        }
    }

    pub fn drain_interval(&self) -> Duration {
        Duration::from_secs(self.drain_interval_secs)
    }
}

// =============================================================================
// Polling Settings
// =============================================================================

/// Error handling of the polling timer. Tier ladders are fixed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingSettings {
    /// Consecutive fetch errors before the error interval is forced.
    #[serde(default = "default_error_threshold")]
    pub error_threshold: u32,

    /// Minimum polling interval while erroring (seconds).
    #[serde(default = "default_error_interval")]
    pub error_interval_secs: u64,
}

fn default_error_threshold() -> u32 {
    ERROR_THRESHOLD
}

fn default_error_interval() -> u64 {
    ERROR_POLL_INTERVAL.as_secs()
}

impl Default for PollingSettings {
    fn default() -> Self {
        PollingSettings {
            error_threshold: default_error_threshold(),
            error_interval_secs: default_error_interval(),
        }
    }
}

impl PollingSettings {
    pub fn error_interval(&self) -> Duration {
        Duration::from_secs(self.error_interval_secs)
    }
}

// =============================================================================
// Main Sync Configuration
// =============================================================================

/// Complete sync configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub device: DeviceConfig,

    #[serde(default)]
    pub cloud: CloudSettings,

    #[serde(default)]
    pub queue: QueueSettings,

    #[serde(default)]
    pub polling: PollingSettings,
}

impl SyncConfig {
    /// Creates a new config with defaults and a generated device ID.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (sync.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading sync config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads config or returns default if load fails.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!("Failed to load sync config: {}. Using defaults.", e);
            Self::default()
        })
    }

    /// Saves configuration to file.
    pub fn save(&self, config_path: Option<PathBuf>) -> SyncResult<PathBuf> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| SyncError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents)?;

        info!(?path, "Sync config saved");
        Ok(path)
    }

    pub fn validate(&self) -> SyncResult<()> {
        if self.device.id.trim().is_empty() {
            return Err(SyncError::MissingDeviceId);
        }

        let url = Url::parse(&self.cloud.api_url)?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(SyncError::InvalidUrl(format!(
                "API URL must start with http:// or https://, got: {}",
                self.cloud.api_url
            )));
        }

        if self.cloud.request_timeout_ms == 0 {
            return Err(SyncError::InvalidConfig(
                "request_timeout_ms must be greater than 0".into(),
            ));
        }

        if self.queue.batch_size == 0 {
            return Err(SyncError::InvalidConfig("batch_size must be greater than 0".into()));
        }

        if self.queue.max_retries == 0 {
            return Err(SyncError::InvalidConfig("max_retries must be greater than 0".into()));
        }

        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(id) = std::env::var("SLALOM_DEVICE_ID") {
            debug!(device_id = %id, "Overriding device ID from environment");
            self.device.id = id;
        }

        if let Ok(name) = std::env::var("SLALOM_DEVICE_NAME") {
            self.device.name = name;
        }

        if let Ok(url) = std::env::var("SLALOM_API_URL") {
            debug!(url = %url, "Overriding API URL from environment");
            self.cloud.api_url = url;
        }

        if let Ok(timeout) = std::env::var("SLALOM_REQUEST_TIMEOUT_MS") {
            match timeout.parse::<u64>() {
                Ok(ms) => self.cloud.request_timeout_ms = ms,
                Err(_) => warn!(value = %timeout, "Ignoring invalid SLALOM_REQUEST_TIMEOUT_MS"),
            }
        }

        if let Ok(retries) = std::env::var("SLALOM_MAX_RETRIES") {
            match retries.parse::<u32>() {
                Ok(n) => self.queue.max_retries = n,
                Err(_) => warn!(value = %retries, "Ignoring invalid SLALOM_MAX_RETRIES"),
            }
        }

        if let Ok(size) = std::env::var("SLALOM_BATCH_SIZE") {
            match size.parse::<usize>() {
                Ok(n) => self.queue.batch_size = n,
                Err(_) => warn!(value = %size, "Ignoring invalid SLALOM_BATCH_SIZE"),
            }
        }
    }

    /// Returns the default config file path.
    pub fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "slalom", "sync")
            .map(|dirs| dirs.config_dir().join("sync.toml"))
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    pub fn device_id(&self) -> &str {
        &self.device.id
    }

    pub fn device_name(&self) -> &str {
        &self.device.name
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.cloud.request_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SyncConfig::default();
        assert!(!config.device.id.is_empty());
        assert_eq!(config.queue.max_retries, 5);
        assert_eq!(config.queue.batch_size, 10);
        assert_eq!(config.request_timeout(), Duration::from_secs(10));
        assert_eq!(config.polling.error_interval(), Duration::from_secs(30));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = SyncConfig::default();

        config.device.id = String::new();
        assert!(matches!(config.validate(), Err(SyncError::MissingDeviceId)));

        config.device.id = "test".to_string();
        config.cloud.api_url = "ws://localhost:8080".to_string();
        assert!(matches!(config.validate(), Err(SyncError::InvalidUrl(_))));

        config.cloud.api_url = "not a url".to_string();
        assert!(config.validate().is_err());

        config.cloud.api_url = "https://timing.example.com/api".to_string();
        assert!(config.validate().is_ok());

        config.queue.batch_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: SyncConfig = toml::from_str(
            r#"
            [device]
            id = "dev-1"

            [queue]
            max_retries = 3
            "#,
        )
        .unwrap();
        assert_eq!(config.device.name, "Timer");
        assert_eq!(config.queue.max_retries, 3);
        assert_eq!(config.queue.retry_policy().max_retries, 3);
        assert_eq!(config.queue.base_backoff_ms, 1_000);
    }

    #[test]
    fn test_toml_serialization() {
        let config = SyncConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("[device]"));
        assert!(toml_str.contains("[cloud]"));
        assert!(toml_str.contains("[queue]"));
    }
}
