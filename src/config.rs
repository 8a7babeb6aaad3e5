//! Recorder configuration
//!
//! Loaded from a JSON file (`config.json` by default). Every field except
//! `symbols` has a default so a minimal file is just `{"symbols": ["BTCUSDT"]}`.

use crate::codec::OutputFormat;
use crate::error::{RecorderError, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// What to subscribe to and how to persist it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CaptureDepth {
    /// Incremental diff stream reconciled against REST snapshots
    #[default]
    Full,
    /// Top-N partial book frames, persisted as-is
    Levels(u16),
}

impl CaptureDepth {
    /// Stream channel for a symbol, e.g. `btcusdt@depth@100ms` or `btcusdt@depth10@100ms`
    pub fn channel(&self, symbol: &str) -> String {
        match self {
            CaptureDepth::Full => format!("{}@depth@100ms", symbol.to_lowercase()),
            CaptureDepth::Levels(n) => format!("{}@depth{}@100ms", symbol.to_lowercase(), n),
        }
    }
}

/// Reconnect backoff parameters
#[derive(Debug, Clone, Deserialize)]
pub struct BackoffConfig {
    #[serde(default = "default_backoff_base_ms")]
    pub base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub max_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub multiplier: f64,
    /// Fraction of the delay randomised, e.g. 0.3 = ±30%
    #[serde(default = "default_backoff_jitter")]
    pub jitter: f64,
    /// Consecutive failed attempts before giving up
    #[serde(default = "default_backoff_max_attempts")]
    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: default_backoff_base_ms(),
            max_ms: default_backoff_max_ms(),
            multiplier: default_backoff_multiplier(),
            jitter: default_backoff_jitter(),
            max_attempts: default_backoff_max_attempts(),
        }
    }
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_backoff_jitter() -> f64 {
    0.3
}

fn default_backoff_max_attempts() -> u32 {
    10
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecorderConfig {
    pub symbols: Vec<String>,
    #[serde(default = "default_data_directory")]
    pub data_directory: PathBuf,
    #[serde(default)]
    pub output_format: OutputFormat,
    #[serde(default)]
    pub capture_depth: CaptureDepth,
    #[serde(default = "default_ws_base_url")]
    pub ws_base_url: String,
    #[serde(default = "default_rest_base_url")]
    pub rest_base_url: String,
    #[serde(default = "default_depth_limit")]
    pub depth_limit: u32,
    #[serde(default = "default_batch_max_records")]
    pub batch_max_records: usize,
    #[serde(default = "default_batch_max_age_secs")]
    pub batch_max_age_secs: u64,
    #[serde(default = "default_snapshots_per_file")]
    pub snapshots_per_file: usize,
    #[serde(default = "default_snapshot_interval_secs")]
    pub snapshot_interval_secs: u64,
    #[serde(default = "default_snapshot_retry_attempts")]
    pub snapshot_retry_attempts: u32,
    #[serde(default = "default_snapshot_retry_delay_secs")]
    pub snapshot_retry_delay_secs: u64,
    #[serde(default)]
    pub reconnect: BackoffConfig,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    #[serde(default = "default_max_buffered_events")]
    pub max_buffered_events: usize,
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
    #[serde(default = "default_stats_interval_secs")]
    pub stats_interval_secs: u64,
}

fn default_data_directory() -> PathBuf {
    PathBuf::from("local-orderbook-data")
}

fn default_ws_base_url() -> String {
    "wss://stream.binance.com:9443/ws".to_string()
}

fn default_rest_base_url() -> String {
    "https://api.binance.com/api/v3".to_string()
}

fn default_depth_limit() -> u32 {
    1000
}

fn default_batch_max_records() -> usize {
    6000 // ~10 minutes at 100ms updates
}

fn default_batch_max_age_secs() -> u64 {
    600
}

fn default_snapshots_per_file() -> usize {
    1
}

fn default_snapshot_interval_secs() -> u64 {
    600
}

fn default_snapshot_retry_attempts() -> u32 {
    3
}

fn default_snapshot_retry_delay_secs() -> u64 {
    5
}

fn default_channel_capacity() -> usize {
    4096
}

fn default_max_buffered_events() -> usize {
    10_000
}

fn default_shutdown_timeout_secs() -> u64 {
    10
}

fn default_stats_interval_secs() -> u64 {
    60
}

impl RecorderConfig {
    /// Config with defaults for the given symbols
    pub fn for_symbols(symbols: Vec<String>) -> Self {
        Self {
            symbols,
            data_directory: default_data_directory(),
            output_format: OutputFormat::default(),
            capture_depth: CaptureDepth::default(),
            ws_base_url: default_ws_base_url(),
            rest_base_url: default_rest_base_url(),
            depth_limit: default_depth_limit(),
            batch_max_records: default_batch_max_records(),
            batch_max_age_secs: default_batch_max_age_secs(),
            snapshots_per_file: default_snapshots_per_file(),
            snapshot_interval_secs: default_snapshot_interval_secs(),
            snapshot_retry_attempts: default_snapshot_retry_attempts(),
            snapshot_retry_delay_secs: default_snapshot_retry_delay_secs(),
            reconnect: BackoffConfig::default(),
            channel_capacity: default_channel_capacity(),
            max_buffered_events: default_max_buffered_events(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            stats_interval_secs: default_stats_interval_secs(),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: RecorderConfig = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.symbols.is_empty() {
            return Err(RecorderError::Config("at least one symbol is required".to_string()));
        }
        if let Some(bad) = self.symbols.iter().find(|s| s.is_empty() || !s.chars().all(|c| c.is_ascii_alphanumeric())) {
            return Err(RecorderError::Config(format!("invalid symbol '{}'", bad)));
        }
        if self.batch_max_records == 0 || self.snapshots_per_file == 0 {
            return Err(RecorderError::Config("batch sizes must be positive".to_string()));
        }
        if self.batch_max_age_secs == 0 || self.snapshot_interval_secs == 0 {
            return Err(RecorderError::Config("intervals must be positive".to_string()));
        }
        if self.channel_capacity == 0 {
            return Err(RecorderError::Config("channel_capacity must be positive".to_string()));
        }
        if self.snapshot_retry_attempts == 0 || self.reconnect.max_attempts == 0 {
            return Err(RecorderError::Config("retry attempts must be positive".to_string()));
        }
        if let CaptureDepth::Levels(n) = self.capture_depth {
            if ![5, 10, 20].contains(&n) {
                return Err(RecorderError::Config(format!(
                    "partial depth must be 5, 10 or 20 levels, got {}",
                    n
                )));
            }
        }
        if !(0.0..1.0).contains(&self.reconnect.jitter) {
            return Err(RecorderError::Config("reconnect.jitter must be in [0, 1)".to_string()));
        }
        Ok(())
    }

    pub fn batch_max_age(&self) -> Duration {
        Duration::from_secs(self.batch_max_age_secs)
    }

    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_secs(self.snapshot_interval_secs)
    }

    pub fn snapshot_retry_delay(&self) -> Duration {
        Duration::from_secs(self.snapshot_retry_delay_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs)
    }
}
