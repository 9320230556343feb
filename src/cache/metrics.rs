//! Manager metrics, bounded histories and threshold alerts.
//!
//! Counters live behind one lock and are mirrored into a prometheus registry
//! for export. Alerts are delivered as [`CacheEvent`]s on a broadcast channel;
//! they never influence cache operations.

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use parking_lot::Mutex;
use prometheus::{Histogram, HistogramOpts, IntCounterVec, Opts, Registry};
use serde::Serialize;

use crate::cache::entry::LayerStats;
use crate::config::MetricsConfig;
use crate::error::CacheResult;

/// Fixed-capacity buffer that drops its oldest element when full.
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> RingBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, item: T) {
        if self.items.len() == self.capacity {
            self.items.pop_front();
        }
        self.items.push_back(item);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    /// Oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }
}

/// Global counters reported by `get_stats`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ManagerMetrics {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    pub evictions: u64,
    pub errors: u64,
    pub total_size: usize,
    /// Mean of the recent operation durations, in milliseconds.
    pub avg_response_time: f64,
    /// hits / (hits + misses) * 100, or 0 before any lookup.
    pub hit_rate: f64,
}

impl ManagerMetrics {
    pub fn lookups(&self) -> u64 {
        self.hits + self.misses
    }
}

/// Snapshot returned by `get_stats`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub global: ManagerMetrics,
    pub layers: BTreeMap<String, LayerStats>,
}

/// Notifications published by the manager.
#[derive(Debug, Clone)]
pub enum CacheEvent {
    Set { key: String, layers: Vec<String> },
    Delete { key: String },
    Clear,
    Metrics(CacheStats),
    LowHitRate(CacheStats),
    HighResponseTime(CacheStats),
}

impl CacheEvent {
    pub fn name(&self) -> &'static str {
        match self {
            CacheEvent::Set { .. } => "set",
            CacheEvent::Delete { .. } => "delete",
            CacheEvent::Clear => "clear",
            CacheEvent::Metrics(_) => "metrics",
            CacheEvent::LowHitRate(_) => "lowHitRate",
            CacheEvent::HighResponseTime(_) => "highResponseTime",
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits: u64,
    misses: u64,
    sets: u64,
    deletes: u64,
    errors: u64,
}

#[derive(Debug)]
struct State {
    counters: Counters,
    response_times: RingBuffer<Duration>,
    hit_rate_history: RingBuffer<f64>,
    response_time_history: RingBuffer<f64>,
}

/// Prometheus mirrors of the counters.
struct Exported {
    registry: Registry,
    operations: IntCounterVec,
    layer_errors: IntCounterVec,
    duration: Histogram,
}

impl Exported {
    fn new() -> CacheResult<Self> {
        let registry = Registry::new();
        let operations = IntCounterVec::new(
            Opts::new("cache_operations_total", "Cache operations by outcome"),
            &["op", "outcome"],
        )?;
        let layer_errors = IntCounterVec::new(
            Opts::new("cache_layer_errors_total", "Per-layer failures"),
            &["layer"],
        )?;
        let duration = Histogram::with_opts(HistogramOpts::new(
            "cache_operation_duration_seconds",
            "Duration of cache operations",
        ))?;
        registry.register(Box::new(operations.clone()))?;
        registry.register(Box::new(layer_errors.clone()))?;
        registry.register(Box::new(duration.clone()))?;
        Ok(Self {
            registry,
            operations,
            layer_errors,
            duration,
        })
    }
}

/// Records operation outcomes and evaluates alert thresholds.
pub struct MetricsRecorder {
    config: MetricsConfig,
    state: Mutex<State>,
    exported: Exported,
}

impl MetricsRecorder {
    pub fn new(config: MetricsConfig) -> CacheResult<Self> {
        let state = State {
            counters: Counters::default(),
            response_times: RingBuffer::new(config.response_time_window),
            hit_rate_history: RingBuffer::new(config.history_size),
            response_time_history: RingBuffer::new(config.history_size),
        };
        Ok(Self {
            config,
            state: Mutex::new(state),
            exported: Exported::new()?,
        })
    }

    pub fn record_hit(&self) {
        self.state.lock().counters.hits += 1;
        self.exported.operations.with_label_values(&["get", "hit"]).inc();
    }

    pub fn record_miss(&self) {
        self.state.lock().counters.misses += 1;
        self.exported.operations.with_label_values(&["get", "miss"]).inc();
    }

    pub fn record_set(&self) {
        self.state.lock().counters.sets += 1;
        self.exported.operations.with_label_values(&["set", "ok"]).inc();
    }

    pub fn record_delete(&self) {
        self.state.lock().counters.deletes += 1;
        self.exported.operations.with_label_values(&["delete", "ok"]).inc();
    }

    pub fn record_error(&self, layer: &str) {
        self.state.lock().counters.errors += 1;
        self.exported.layer_errors.with_label_values(&[layer]).inc();
    }

    pub fn record_duration(&self, elapsed: Duration) {
        self.state.lock().response_times.push(elapsed);
        self.exported.duration.observe(elapsed.as_secs_f64());
    }

    /// Current counters. Layer-derived fields are filled by the manager.
    pub fn snapshot(&self) -> ManagerMetrics {
        let state = self.state.lock();
        let c = &state.counters;
        let lookups = c.hits + c.misses;
        let hit_rate = if lookups == 0 {
            0.0
        } else {
            c.hits as f64 / lookups as f64 * 100.0
        };
        let avg_response_time = if state.response_times.is_empty() {
            0.0
        } else {
            let total: f64 = state
                .response_times
                .iter()
                .map(|d| d.as_secs_f64() * 1000.0)
                .sum();
            total / state.response_times.len() as f64
        };
        ManagerMetrics {
            hits: c.hits,
            misses: c.misses,
            sets: c.sets,
            deletes: c.deletes,
            errors: c.errors,
            avg_response_time,
            hit_rate,
            ..Default::default()
        }
    }

    /// Zero every counter and history.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.counters = Counters::default();
        state.response_times.clear();
        state.hit_rate_history.clear();
        state.response_time_history.clear();
    }

    /// Append a snapshot to the histories and return the alerts it triggers.
    pub fn evaluate(&self, stats: &CacheStats) -> Vec<CacheEvent> {
        {
            let mut state = self.state.lock();
            state.hit_rate_history.push(stats.global.hit_rate);
            state
                .response_time_history
                .push(stats.global.avg_response_time);
        }

        let mut alerts = Vec::new();
        if stats.global.lookups() > 0 && stats.global.hit_rate < self.config.low_hit_rate_threshold {
            alerts.push(CacheEvent::LowHitRate(stats.clone()));
        }
        if stats.global.avg_response_time > self.config.high_response_time_ms {
            alerts.push(CacheEvent::HighResponseTime(stats.clone()));
        }
        alerts
    }

    /// Hit rates recorded by [`evaluate`](Self::evaluate), oldest first.
    pub fn hit_rate_history(&self) -> Vec<f64> {
        self.state.lock().hit_rate_history.iter().copied().collect()
    }

    pub fn response_time_history(&self) -> Vec<f64> {
        self.state.lock().response_time_history.iter().copied().collect()
    }

    pub fn registry(&self) -> &Registry {
        &self.exported.registry
    }
}
