//! Configuration structures for BatchLoop
//!
//! This module defines the configuration surface of the batching scheduler.
//! Configurations are loaded from YAML files and can be overridden by
//! environment variables. Device/batch selection strings are parsed upstream;
//! only typed values arrive here.

use crate::error::{BatchLoopError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration for a BatchLoop scheduler
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchLoopConfig {
    /// Target backend identity (e.g. "CPU", "GPU.0")
    pub device_id: String,

    /// Batching behavior
    pub batching: BatchingConfig,

    /// Callback executor tuning
    #[serde(default)]
    pub callback: CallbackConfig,

    /// Observability configuration
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observability: Option<ObservabilityConfig>,
}

/// Batching configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchingConfig {
    /// Number of slots in one shared batch context
    pub batch_size: usize,

    /// Window for collecting a round, in milliseconds, counted from the
    /// first request of the round. A partial round is flushed when it ends.
    pub timeout_ms: u64,

    /// Per-request tolerance before the non-batched bypass runs, in
    /// milliseconds. Defaults to `timeout_ms`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_timeout_ms: Option<u64>,
}

/// Callback executor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackConfig {
    /// Number of callback threads (0 = CPU count)
    #[serde(default = "default_callback_threads")]
    pub threads: usize,
}

impl Default for CallbackConfig {
    fn default() -> Self {
        Self {
            threads: default_callback_threads(),
        }
    }
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable Prometheus metrics
    #[serde(default = "default_metrics")]
    pub enable_metrics: bool,
}

/// Default value functions
fn default_callback_threads() -> usize {
    0 // Means use CPU count
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics() -> bool {
    true
}

impl Default for BatchLoopConfig {
    fn default() -> Self {
        Self {
            device_id: "CPU".to_string(),
            batching: BatchingConfig {
                batch_size: 8,
                timeout_ms: 10,
                fallback_timeout_ms: None,
            },
            callback: CallbackConfig::default(),
            observability: None,
        }
    }
}

impl BatchLoopConfig {
    /// Load configuration from a YAML file
    pub fn from_file<P: Into<PathBuf>>(path: P) -> Result<Self> {
        let path = path.into();
        let content = std::fs::read_to_string(&path).map_err(|e| {
            BatchLoopError::Config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;

        let config: BatchLoopConfig = serde_yaml::from_str(&content).map_err(|e| {
            BatchLoopError::Config(format!("Failed to parse config file {}: {}", path.display(), e))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = BatchLoopConfig::default();

        if let Ok(device) = std::env::var("BATCHLOOP_DEVICE") {
            config.device_id = device;
        }
        if let Ok(size) = std::env::var("BATCHLOOP_BATCH_SIZE") {
            config.batching.batch_size = size
                .parse()
                .map_err(|_| BatchLoopError::Config("Invalid batch size".to_string()))?;
        }
        if let Ok(timeout) = std::env::var("BATCHLOOP_TIMEOUT_MS") {
            config.batching.timeout_ms = timeout
                .parse()
                .map_err(|_| BatchLoopError::Config("Invalid timeout".to_string()))?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.device_id.is_empty() {
            return Err(BatchLoopError::config("Device id must not be empty"));
        }
        if self.batching.batch_size < 1 {
            return Err(BatchLoopError::config(format!(
                "Batch size must be at least 1, got {}",
                self.batching.batch_size
            )));
        }
        Ok(())
    }

    /// Get the round-collection window as Duration
    pub fn batching_window(&self) -> Duration {
        Duration::from_millis(self.batching.timeout_ms)
    }

    /// Get the per-request fallback tolerance as Duration
    pub fn fallback_timeout(&self) -> Duration {
        Duration::from_millis(
            self.batching
                .fallback_timeout_ms
                .unwrap_or(self.batching.timeout_ms),
        )
    }
}
