//! Runtime configuration for the multi-layer cache.
//!
//! Configuration can be loaded from a JSON file or constructed programmatically.
//! All layer budgets, strategy knobs, scheduler intervals and alert thresholds
//! live here.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::cache::strategy::StrategyKind;

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "multi-layer-cache", about = "Multi-layer cache manager")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,

    /// Emit logs as JSON lines.
    #[arg(long)]
    pub json_logs: bool,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Manager-wide defaults.
    pub manager: ManagerConfig,

    /// In-memory layer.
    pub memory: MemoryLayerConfig,

    /// Networked key-value layer.
    pub remote: RemoteLayerConfig,

    /// On-disk layer.
    pub file: FileLayerConfig,

    /// Compression settings shared by all layers.
    pub compression: CompressionConfig,

    /// Strategy tuning.
    pub strategies: StrategyConfig,

    /// Background warming.
    pub warming: WarmingConfig,

    /// Metrics collection and alert thresholds.
    pub metrics: MetricsConfig,
}

/// Defaults applied when a call does not specify an option.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Strategy used when a call names none.
    pub default_strategy: StrategyKind,

    /// Compress values unless the call says otherwise.
    pub compress: bool,

    /// Capacity of the event broadcast channel.
    pub event_capacity: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            default_strategy: StrategyKind::Lru,
            compress: false,
            event_capacity: 256,
        }
    }
}

/// In-memory layer budgets.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryLayerConfig {
    /// Maximum bytes held (keys + payloads).
    pub max_size: usize,

    /// Maximum number of entries.
    pub max_items: usize,
}

impl Default for MemoryLayerConfig {
    fn default() -> Self {
        Self {
            max_size: 100 * 1024 * 1024, // 100 MB
            max_items: 10_000,
        }
    }
}

/// Remote key-value layer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteLayerConfig {
    /// Whether the remote layer participates.
    pub enabled: bool,

    /// Connection URL handed to the remote client.
    pub url: String,

    /// Prefix prepended to every key.
    pub key_prefix: String,
}

impl Default for RemoteLayerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "cache:".to_string(),
        }
    }
}

/// On-disk layer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FileLayerConfig {
    /// Whether the file layer participates.
    pub enabled: bool,

    /// Root cache directory.
    pub path: PathBuf,

    /// Entries older than this (by mtime) are treated as expired. None = never.
    pub ttl_ms: Option<u64>,
}

impl Default for FileLayerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: PathBuf::from("/tmp/multi-layer-cache"),
            ttl_ms: Some(24 * 60 * 60 * 1000), // 1 day
        }
    }
}

impl FileLayerConfig {
    pub fn ttl(&self) -> Option<Duration> {
        self.ttl_ms.map(Duration::from_millis)
    }
}

/// Compression settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    /// zstd compression level (1-22).
    pub zstd_level: i32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self { zstd_level: 3 }
    }
}

/// Strategy tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyConfig {
    /// TTL applied by the TTL strategy when the caller gives none.
    pub default_ttl_ms: u64,

    /// Minimum access frequency before LFU admits a key into faster layers.
    pub lfu_admission_threshold: u64,

    /// Number of deferred writes drained per write-behind batch.
    pub write_behind_batch_size: usize,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            default_ttl_ms: 60 * 60 * 1000, // 1 hour
            lfu_admission_threshold: 2,
            write_behind_batch_size: 10,
        }
    }
}

impl StrategyConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_millis(self.default_ttl_ms)
    }
}

/// Warming scheduler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WarmingConfig {
    /// Interval between warming ticks.
    pub interval_ms: u64,

    /// Items popped per tick.
    pub batch_size: usize,
}

impl Default for WarmingConfig {
    fn default() -> Self {
        Self {
            interval_ms: 60_000,
            batch_size: 10,
        }
    }
}

impl WarmingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Metrics collection and alert thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Interval between metric snapshots.
    pub interval_ms: u64,

    /// Snapshots retained per history buffer.
    pub history_size: usize,

    /// Operation durations retained for the average response time.
    pub response_time_window: usize,

    /// Alert when the hit rate (percent) drops below this.
    pub low_hit_rate_threshold: f64,

    /// Alert when the average response time exceeds this (milliseconds).
    pub high_response_time_ms: f64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            interval_ms: 30_000,
            history_size: 100,
            response_time_window: 1000,
            low_hit_rate_threshold: 80.0,
            high_response_time_ms: 100.0,
        }
    }
}

impl MetricsConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&data)?;
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }

    /// Names of the enabled layers, fastest first.
    pub fn layer_order(&self) -> Vec<&'static str> {
        let mut order = vec!["memory"];
        if self.remote.enabled {
            order.push("remote");
        }
        if self.file.enabled {
            order.push("file");
        }
        order
    }
}
