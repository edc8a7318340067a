use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::provider::MetricsFlags;
use crate::writer::queue::MAX_CAPACITY;

/// Top-level configuration for an embedding agent.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (trace, debug, info, warn, error). Default: "info".
    ///
    /// Only validated here; the embedding binary installs the subscriber.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Metrics snapshot configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Metrics snapshot configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// Enable periodic metrics snapshots. Default: false.
    #[serde(default)]
    pub enabled: bool,

    /// Route snapshots through the rule-output channel. Default: true.
    #[serde(default = "default_true")]
    pub rule_output: bool,

    /// Append snapshots as NDJSON to this file. Empty disables the file sink.
    #[serde(default)]
    pub output_file: String,

    /// Handoff queue capacity between collectors and the dispatcher. Default: 1024.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Sampling interval. Default: 1h.
    #[serde(default = "default_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Metric categories requested from the provider.
    #[serde(default)]
    pub flags: MetricsFlags,

    /// Emit zero-valued counters. Default: false.
    #[serde(default)]
    pub include_empty_values: bool,

    /// Convert memory counters to megabytes. Default: true.
    #[serde(default = "default_true")]
    pub convert_memory_to_mb: bool,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_interval() -> Duration {
    Duration::from_secs(60 * 60)
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            rule_output: true,
            output_file: String::new(),
            queue_capacity: default_queue_capacity(),
            interval: default_interval(),
            flags: MetricsFlags::default(),
            include_empty_values: false,
            convert_memory_to_mb: true,
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg = Self::from_yaml(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        Ok(cfg)
    }

    /// Parse and validate configuration from a YAML string.
    pub fn from_yaml(data: &str) -> Result<Self> {
        let cfg: Config = serde_yaml::from_str(data)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Validate the configuration for consistency.
    pub fn validate(&self) -> Result<()> {
        if self.log_level.parse::<tracing::Level>().is_err() {
            bail!("log_level must be one of trace, debug, info, warn, error");
        }

        self.metrics.validate()
    }
}

impl MetricsConfig {
    /// Whether at least one sink would receive snapshots.
    pub fn has_output(&self) -> bool {
        self.enabled && (self.rule_output || !self.output_file.is_empty())
    }

    pub fn validate(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }

        if self.queue_capacity == 0 {
            bail!("metrics.queue_capacity must be positive");
        }

        if self.queue_capacity > MAX_CAPACITY {
            bail!("metrics.queue_capacity must be at most {MAX_CAPACITY}");
        }

        if self.interval.is_zero() {
            bail!("metrics.interval must be positive");
        }

        if self.interval < Duration::from_millis(1) {
            bail!("metrics.interval must be at least 1ms");
        }

        Ok(())
    }
}
