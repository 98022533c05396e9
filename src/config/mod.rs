//! Configuration module for pktflow
//!
//! This module handles the persistent configuration of an ingestion
//! pipeline and the runtime settings derived from it:
//! - Framing limits (packet size bounds, alignment, flag strictness)
//! - Circular buffer sizing and wait timeouts
//! - Retry policy for incomplete framing
//! - Dispatch defaults (worker queue depth, subscriber stall threshold)
//! - Status monitor cadence
//!
//! # Config Location
//!
//! The default configuration file lives in the platform config directory:
//! - **Linux**: `~/.config/pktflow/pktflow.toml`
//! - **macOS**: `~/Library/Application Support/pktflow/pktflow.toml`
//! - **Windows**: `%APPDATA%\pktflow\pktflow.toml`
//!
//! # Example
//!
//! ```ignore
//! use pktflow::config::FlowConfig;
//!
//! let config = FlowConfig::load_or_default(FlowConfig::default_path());
//! let settings = config.runtime_settings();
//! config.save("/tmp/pktflow.toml")?;
//! ```

pub mod settings;

pub use settings::{RuntimeSettings, SharedSettings};

use crate::error::{FlowError, Result, ResultExt};
use crate::ingest::backoff::RetryPolicy;
use crate::pipeline::{FramingLimits, HEADER_SIZE};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application directory name under the platform config dir
pub const APP_DIR: &str = "pktflow";

/// Config filename
pub const CONFIG_FILE: &str = "pktflow.toml";

/// Default circular buffer capacity (4 MiB)
pub const DEFAULT_BUFFER_CAPACITY: usize = 4 * 1024 * 1024;

/// Default wait-for-data timeout in milliseconds
pub const DEFAULT_WAIT_TIMEOUT_MS: u64 = 1000;

/// Shortest status monitor interval accepted
pub const MIN_MONITOR_INTERVAL_MS: u64 = 100;

// ==================== Sections ====================

/// Circular buffer and copy thread configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Capacity in bytes
    pub capacity: usize,
    /// How long one wait for data may block
    pub wait_timeout_ms: u64,
    /// How long the copy thread retries against a full buffer before
    /// latching a `BufferFull` fault
    pub full_grace_ms: u64,
    /// Read size of the copy thread
    pub read_chunk: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_BUFFER_CAPACITY,
            wait_timeout_ms: DEFAULT_WAIT_TIMEOUT_MS,
            full_grace_ms: 500,
            read_chunk: 64 * 1024,
        }
    }
}

/// Retry policy for regions that end in a partial packet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1,
            max_delay_ms: 100,
            max_attempts: 8,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            max_attempts: self.max_attempts,
        }
    }
}

/// Dispatch graph defaults
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Queue depth for threaded nodes that do not pick their own
    pub default_queue_depth: usize,
    /// Waiting longer than this for subscribers counts as a stall
    pub stall_threshold_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            default_queue_depth: crate::pipeline::DEFAULT_QUEUE_DEPTH,
            stall_threshold_ms: 1000,
        }
    }
}

/// Status monitor configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub interval_ms: u64,
    /// Snapshots buffered for a slow receiver before new ones are dropped
    pub channel_depth: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            channel_depth: 16,
        }
    }
}

// ==================== FlowConfig ====================

/// Complete pipeline configuration, persisted as TOML
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct FlowConfig {
    #[serde(default)]
    pub framing: FramingLimits,

    #[serde(default)]
    pub buffer: BufferConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub dispatch: DispatchConfig,

    #[serde(default)]
    pub monitor: MonitorConfig,
}

impl FlowConfig {
    /// Create a new default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Default config file path, if the platform has a config directory
    pub fn default_path() -> Option<PathBuf> {
        dirs_next::config_dir().map(|p| p.join(APP_DIR).join(CONFIG_FILE))
    }

    /// Load and validate a config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;

        let config: Self = toml::from_str(&content).map_err(|e| {
            FlowError::Config(format!("Failed to parse config file {:?}: {}", path, e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load a config file, returning defaults on any error
    pub fn load_or_default(path: Option<impl AsRef<Path>>) -> Self {
        let Some(path) = path else {
            return Self::default();
        };
        if !path.as_ref().exists() {
            return Self::default();
        }
        Self::load(path).unwrap_or_else(|e| {
            tracing::warn!("Failed to load config, using defaults: {}", e);
            Self::default()
        })
    }

    /// Save the config as TOML
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| FlowError::Serialization(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file {:?}", path))
    }

    /// JSON rendering for `--print-config` and telemetry
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| FlowError::Serialization(format!("Failed to serialize config: {}", e)))
    }

    /// Reject combinations the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        let f = &self.framing;
        if (f.min_packet_size as usize) < HEADER_SIZE {
            return Err(FlowError::Config(format!(
                "framing.min_packet_size {} below header size {}",
                f.min_packet_size, HEADER_SIZE
            )));
        }
        if f.max_packet_size < f.min_packet_size {
            return Err(FlowError::Config(format!(
                "framing.max_packet_size {} below min_packet_size {}",
                f.max_packet_size, f.min_packet_size
            )));
        }
        if f.alignment == 0 {
            return Err(FlowError::Config("framing.alignment must be at least 1".into()));
        }
        if self.buffer.capacity < f.max_packet_size as usize {
            return Err(FlowError::Config(format!(
                "buffer.capacity {} cannot hold a {} byte packet",
                self.buffer.capacity, f.max_packet_size
            )));
        }
        if self.buffer.read_chunk == 0 {
            return Err(FlowError::Config("buffer.read_chunk must be non-zero".into()));
        }
        if self.retry.initial_delay_ms > self.retry.max_delay_ms {
            return Err(FlowError::Config(format!(
                "retry.initial_delay_ms {} above max_delay_ms {}",
                self.retry.initial_delay_ms, self.retry.max_delay_ms
            )));
        }
        if self.dispatch.default_queue_depth == 0 {
            return Err(FlowError::Config(
                "dispatch.default_queue_depth must be non-zero".into(),
            ));
        }
        if self.monitor.interval_ms < MIN_MONITOR_INTERVAL_MS {
            return Err(FlowError::Config(format!(
                "monitor.interval_ms {} below minimum {}",
                self.monitor.interval_ms, MIN_MONITOR_INTERVAL_MS
            )));
        }
        Ok(())
    }

    /// Per-cycle settings derived from this config
    pub fn runtime_settings(&self) -> RuntimeSettings {
        RuntimeSettings {
            limits: self.framing,
            retry: self.retry.policy(),
            wait_timeout: Duration::from_millis(self.buffer.wait_timeout_ms),
            stall_threshold: Duration::from_millis(self.dispatch.stall_threshold_ms),
        }
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor.interval_ms.max(MIN_MONITOR_INTERVAL_MS))
    }

    pub fn full_grace(&self) -> Duration {
        Duration::from_millis(self.buffer.full_grace_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config_is_valid() {
        let config = FlowConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.framing.max_packet_size, 4096);
        assert_eq!(config.retry.max_attempts, 8);
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join(CONFIG_FILE);

        let mut config = FlowConfig::default();
        config.framing.max_packet_size = 8192;
        config.retry.max_attempts = 3;
        config.save(&path).unwrap();

        let loaded = FlowConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: FlowConfig = toml::from_str(
            r#"
            [framing]
            max_packet_size = 1024

            [retry]
            max_attempts = 2
            "#,
        )
        .unwrap();
        assert_eq!(config.framing.max_packet_size, 1024);
        assert_eq!(config.framing.alignment, 4);
        assert_eq!(config.retry.max_attempts, 2);
        assert_eq!(config.retry.max_delay_ms, 100);
        assert_eq!(config.buffer, BufferConfig::default());
    }

    #[test]
    fn test_validate_rejects_bad_limits() {
        let mut config = FlowConfig::default();
        config.framing.min_packet_size = 8;
        assert!(config.validate().is_err());

        let mut config = FlowConfig::default();
        config.framing.max_packet_size = 8;
        config.framing.min_packet_size = 16;
        assert!(config.validate().is_err());

        let mut config = FlowConfig::default();
        config.buffer.capacity = 1024;
        assert!(config.validate().is_err());

        let mut config = FlowConfig::default();
        config.monitor.interval_ms = 10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, "[framing]\nalignment = 0\n").unwrap();
        assert!(matches!(FlowConfig::load(&path), Err(FlowError::Config(_))));
        assert_eq!(FlowConfig::load_or_default(Some(&path)), FlowConfig::default());
    }

    #[test]
    fn test_load_missing_file_keeps_io_cause() {
        let dir = tempdir().unwrap();
        let err = FlowConfig::load(dir.path().join("absent.toml")).unwrap_err();
        assert!(err.to_string().starts_with("Failed to read config file"));
        assert_eq!(err.fault_kind(), crate::types::FaultKind::Io);
    }

    #[test]
    fn test_load_or_default_missing() {
        let config = FlowConfig::load_or_default(Some("/nonexistent/pktflow.toml"));
        assert_eq!(config, FlowConfig::default());
        assert_eq!(FlowConfig::load_or_default(None::<&Path>), FlowConfig::default());
    }

    #[test]
    fn test_runtime_settings_derivation() {
        let mut config = FlowConfig::default();
        config.retry.initial_delay_ms = 5;
        config.dispatch.stall_threshold_ms = 250;
        let settings = config.runtime_settings();
        assert_eq!(settings.retry.initial_delay, Duration::from_millis(5));
        assert_eq!(settings.stall_threshold, Duration::from_millis(250));
        assert_eq!(settings.limits, config.framing);
    }

    #[test]
    fn test_json_export() {
        let json = FlowConfig::default().to_json().unwrap();
        assert!(json.contains("\"max_packet_size\": 4096"));
    }
}
