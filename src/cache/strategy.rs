//! Retention strategies.
//!
//! Strategies hook into hits and sets but never own storage; eviction stays
//! with each layer. The manager keeps one instance of every strategy and picks
//! one per call.

use std::collections::{HashMap, VecDeque};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use crate::config::StrategyConfig;
use crate::error::CacheError;
use crate::layers::{Layer, WriteOptions};

/// Strategy names accepted in options and configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StrategyKind {
    #[serde(rename = "lru")]
    Lru,
    #[serde(rename = "lfu")]
    Lfu,
    #[serde(rename = "ttl")]
    Ttl,
    #[serde(rename = "write-through")]
    WriteThrough,
    #[serde(rename = "write-behind")]
    WriteBehind,
}

impl StrategyKind {
    pub const ALL: [StrategyKind; 5] = [
        StrategyKind::Lru,
        StrategyKind::Lfu,
        StrategyKind::Ttl,
        StrategyKind::WriteThrough,
        StrategyKind::WriteBehind,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::Lru => "lru",
            StrategyKind::Lfu => "lfu",
            StrategyKind::Ttl => "ttl",
            StrategyKind::WriteThrough => "write-through",
            StrategyKind::WriteBehind => "write-behind",
        }
    }
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StrategyKind {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StrategyKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| CacheError::config(format!("unknown strategy: {s}")))
    }
}

/// How the manager should dispatch a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritePlan {
    /// Write every named layer now.
    AllLayers,
    /// Write the fastest named layer now, defer the rest.
    FastestThenDeferred,
}

/// A write postponed by the write-behind strategy.
pub struct DeferredWrite {
    pub key: String,
    pub value: Bytes,
    pub options: WriteOptions,
    pub layer: Arc<dyn Layer>,
}

/// Access frequencies for LFU admission.
#[derive(Debug, Default)]
pub struct FrequencyCounter {
    counts: Mutex<HashMap<String, u64>>,
}

impl FrequencyCounter {
    pub fn increment(&self, key: &str) -> u64 {
        let mut counts = self.counts.lock();
        let count = counts.entry(key.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    pub fn get(&self, key: &str) -> u64 {
        self.counts.lock().get(key).copied().unwrap_or(0)
    }

    pub fn reset(&self) {
        self.counts.lock().clear();
    }
}

/// FIFO of deferred writes, drained in batches off the caller's path.
///
/// At most one write per key and layer is pending: a newer deferred write
/// replaces an older one. Direct writes and deletes cancel pending writes for
/// the layers they touch, after any batch already being written has landed.
pub struct WriteBehindQueue {
    pending: Mutex<VecDeque<DeferredWrite>>,
    batch_size: usize,
    flushing: AtomicBool,
    /// Held while a batch is being written. Flushes, cancellations and
    /// discards wait for it.
    drain_lock: tokio::sync::Mutex<()>,
}

impl WriteBehindQueue {
    pub fn new(batch_size: usize) -> Self {
        Self {
            pending: Mutex::new(VecDeque::new()),
            batch_size: batch_size.max(1),
            flushing: AtomicBool::new(false),
            drain_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn push(&self, write: DeferredWrite) {
        let mut pending = self.pending.lock();
        pending.retain(|w| !(w.key == write.key && w.layer.name() == write.layer.name()));
        pending.push_back(write);
    }

    /// Drop pending writes of `key` to any of `layers`, waiting for an
    /// in-flight batch first. Returns how many writes were dropped.
    pub async fn cancel(&self, key: &str, layers: &[&str]) -> usize {
        let _drain = self.drain_lock.lock().await;
        let mut pending = self.pending.lock();
        let before = pending.len();
        pending.retain(|w| w.key != key || !layers.contains(&w.layer.name()));
        before - pending.len()
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop everything not yet written, waiting for an in-flight batch
    /// first. Returns how many writes were dropped.
    pub async fn discard(&self) -> usize {
        let _drain = self.drain_lock.lock().await;
        let mut pending = self.pending.lock();
        let dropped = pending.len();
        pending.clear();
        dropped
    }

    fn next_batch(&self) -> Vec<DeferredWrite> {
        let mut pending = self.pending.lock();
        let n = self.batch_size.min(pending.len());
        pending.drain(..n).collect()
    }

    /// Drain the queue in batches. Returns (written, failed).
    pub async fn flush(&self) -> (usize, usize) {
        let _drain = self.drain_lock.lock().await;
        let mut written = 0;
        let mut failed = 0;
        loop {
            let batch = self.next_batch();
            if batch.is_empty() {
                break;
            }
            let results = join_all(batch.iter().map(|w| async move {
                let result = w.layer.set(&w.key, w.value.clone(), &w.options).await;
                (w, result)
            }))
            .await;
            for (w, result) in results {
                match result {
                    Ok(()) => written += 1,
                    Err(e) => {
                        failed += 1;
                        warn!(key = %w.key, layer = w.layer.name(), error = %e, "Deferred write failed");
                    }
                }
            }
        }
        if written + failed > 0 {
            debug!(written, failed, "Write-behind flush complete");
        }
        (written, failed)
    }

    /// Flush on the next idle tick unless a flush is already running.
    pub fn schedule_flush(self: &Arc<Self>) {
        if self.flushing.swap(true, Ordering::AcqRel) {
            return;
        }
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            loop {
                queue.flush().await;
                queue.flushing.store(false, Ordering::Release);
                // Pushes that raced with the end of the flush.
                if queue.is_empty() || queue.flushing.swap(true, Ordering::AcqRel) {
                    break;
                }
            }
        });
    }
}

/// A retention strategy.
pub enum Strategy {
    Lru,
    Lfu {
        frequencies: FrequencyCounter,
        admission_threshold: u64,
    },
    Ttl {
        default_ttl: Duration,
    },
    WriteThrough,
    WriteBehind(Arc<WriteBehindQueue>),
}

impl Strategy {
    pub fn new(kind: StrategyKind, config: &StrategyConfig) -> Self {
        match kind {
            StrategyKind::Lru => Strategy::Lru,
            StrategyKind::Lfu => Strategy::Lfu {
                frequencies: FrequencyCounter::default(),
                admission_threshold: config.lfu_admission_threshold,
            },
            StrategyKind::Ttl => Strategy::Ttl {
                default_ttl: config.default_ttl(),
            },
            StrategyKind::WriteThrough => Strategy::WriteThrough,
            StrategyKind::WriteBehind => {
                Strategy::WriteBehind(Arc::new(WriteBehindQueue::new(config.write_behind_batch_size)))
            }
        }
    }

    pub fn kind(&self) -> StrategyKind {
        match self {
            Strategy::Lru => StrategyKind::Lru,
            Strategy::Lfu { .. } => StrategyKind::Lfu,
            Strategy::Ttl { .. } => StrategyKind::Ttl,
            Strategy::WriteThrough => StrategyKind::WriteThrough,
            Strategy::WriteBehind(_) => StrategyKind::WriteBehind,
        }
    }

    pub fn on_hit(&self, key: &str, _value: &serde_json::Value, layer: &str) {
        match self {
            Strategy::Lfu { frequencies, .. } => {
                let count = frequencies.increment(key);
                trace!(key, layer, count, "LFU hit");
            }
            // Recency is tracked by the memory layer itself.
            Strategy::Lru => trace!(key, layer, "LRU hit"),
            _ => {}
        }
    }

    /// Adjust write options and decide how the write is dispatched.
    pub fn on_set(&self, key: &str, value: &Bytes, options: &mut WriteOptions) -> WritePlan {
        match self {
            Strategy::Lfu { frequencies, .. } => {
                frequencies.increment(key);
                WritePlan::AllLayers
            }
            Strategy::Ttl { default_ttl } => {
                if options.ttl.is_none() {
                    options.ttl = Some(*default_ttl);
                }
                WritePlan::AllLayers
            }
            Strategy::WriteBehind(_) => {
                trace!(key, size = value.len(), "Write-behind set");
                WritePlan::FastestThenDeferred
            }
            Strategy::Lru | Strategy::WriteThrough => WritePlan::AllLayers,
        }
    }

    /// Whether a hit on a slower layer may be copied into faster layers.
    /// Only LFU gates this, counting the hit being served.
    pub fn admits_promotion(&self, key: &str) -> bool {
        match self {
            Strategy::Lfu {
                frequencies,
                admission_threshold,
            } => frequencies.get(key) + 1 >= *admission_threshold,
            _ => true,
        }
    }

    /// TTL applied when the caller gives none.
    pub fn default_ttl(&self) -> Option<Duration> {
        match self {
            Strategy::Ttl { default_ttl } => Some(*default_ttl),
            _ => None,
        }
    }

    pub fn frequency(&self, key: &str) -> Option<u64> {
        match self {
            Strategy::Lfu { frequencies, .. } => Some(frequencies.get(key)),
            _ => None,
        }
    }

    pub fn write_behind_queue(&self) -> Option<&Arc<WriteBehindQueue>> {
        match self {
            Strategy::WriteBehind(queue) => Some(queue),
            _ => None,
        }
    }

    /// Forget bookkeeping. Pending write-behind items are dropped.
    pub async fn reset(&self) {
        match self {
            Strategy::Lfu { frequencies, .. } => frequencies.reset(),
            Strategy::WriteBehind(queue) => {
                let dropped = queue.discard().await;
                if dropped > 0 {
                    info!(dropped, "Discarded pending write-behind items");
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::codec::Codec;
    use crate::config::MemoryLayerConfig;
    use crate::layers::memory::MemoryLayer;

    #[test]
    fn test_parse_names() {
        assert_eq!("lfu".parse::<StrategyKind>().unwrap(), StrategyKind::Lfu);
        assert_eq!(
            "write-behind".parse::<StrategyKind>().unwrap(),
            StrategyKind::WriteBehind
        );
        assert!(matches!(
            "mru".parse::<StrategyKind>(),
            Err(CacheError::Configuration(_))
        ));
        for kind in StrategyKind::ALL {
            assert_eq!(kind.to_string().parse::<StrategyKind>().unwrap(), kind);
        }
    }

    #[test]
    fn test_ttl_strategy_fills_default() {
        let strategy = Strategy::new(StrategyKind::Ttl, &StrategyConfig::default());
        let mut opts = WriteOptions::default();
        strategy.on_set("k", &Bytes::new(), &mut opts);
        assert_eq!(opts.ttl, Some(Duration::from_secs(3600)));

        let mut explicit = WriteOptions {
            ttl: Some(Duration::from_secs(1)),
            compress: false,
        };
        strategy.on_set("k", &Bytes::new(), &mut explicit);
        assert_eq!(explicit.ttl, Some(Duration::from_secs(1)));
    }

    #[tokio::test]
    async fn test_lfu_admission() {
        let config = StrategyConfig {
            lfu_admission_threshold: 3,
            ..Default::default()
        };
        let strategy = Strategy::new(StrategyKind::Lfu, &config);
        let value = serde_json::json!(1);

        assert!(!strategy.admits_promotion("k"));
        strategy.on_hit("k", &value, "file");
        assert!(!strategy.admits_promotion("k"));
        strategy.on_hit("k", &value, "file");
        assert!(strategy.admits_promotion("k"));
        assert_eq!(strategy.frequency("k"), Some(2));

        strategy.reset().await;
        assert_eq!(strategy.frequency("k"), Some(0));
    }

    #[test]
    fn test_write_behind_plan() {
        let strategy = Strategy::new(StrategyKind::WriteBehind, &StrategyConfig::default());
        let mut opts = WriteOptions::default();
        assert_eq!(
            strategy.on_set("k", &Bytes::new(), &mut opts),
            WritePlan::FastestThenDeferred
        );
        assert!(strategy.write_behind_queue().is_some());
    }

    #[tokio::test]
    async fn test_write_behind_flush_in_batches() {
        let queue = WriteBehindQueue::new(2);
        let layer: Arc<dyn Layer> = Arc::new(MemoryLayer::new(
            MemoryLayerConfig::default(),
            Codec::default(),
        ));
        for i in 0..5 {
            queue.push(DeferredWrite {
                key: format!("k{i}"),
                value: Bytes::from_static(b"1"),
                options: WriteOptions::default(),
                layer: layer.clone(),
            });
        }

        assert_eq!(queue.flush().await, (5, 0));
        assert!(queue.is_empty());
        assert_eq!(layer.stats().await.unwrap().item_count, 5);
    }

    #[tokio::test]
    async fn test_write_behind_failure_does_not_stop_batch() {
        let queue = WriteBehindQueue::new(10);
        let tiny: Arc<dyn Layer> = Arc::new(MemoryLayer::new(
            MemoryLayerConfig {
                max_size: 8,
                max_items: 10,
            },
            Codec::default(),
        ));
        queue.push(DeferredWrite {
            key: "big".to_string(),
            value: Bytes::from(vec![0u8; 64]),
            options: WriteOptions::default(),
            layer: tiny.clone(),
        });
        queue.push(DeferredWrite {
            key: "ok".to_string(),
            value: Bytes::from_static(b"1"),
            options: WriteOptions::default(),
            layer: tiny.clone(),
        });

        assert_eq!(queue.flush().await, (1, 1));
        assert!(tiny.get("ok").await.unwrap().is_some());
    }

    fn deferred(key: &str, value: &'static [u8], layer: &Arc<dyn Layer>) -> DeferredWrite {
        DeferredWrite {
            key: key.to_string(),
            value: Bytes::from_static(value),
            options: WriteOptions::default(),
            layer: layer.clone(),
        }
    }

    #[tokio::test]
    async fn test_newer_deferred_write_replaces_older() {
        let queue = WriteBehindQueue::new(10);
        let layer: Arc<dyn Layer> = Arc::new(MemoryLayer::new(
            MemoryLayerConfig::default(),
            Codec::default(),
        ));
        queue.push(deferred("k", b"\"old\"", &layer));
        queue.push(deferred("other", b"1", &layer));
        queue.push(deferred("k", b"\"new\"", &layer));
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.flush().await, (2, 0));
        let hit = layer.get("k").await.unwrap().unwrap();
        assert_eq!(hit.value, Bytes::from_static(b"\"new\""));
    }

    #[tokio::test]
    async fn test_cancel_only_touches_named_layers() {
        let queue = WriteBehindQueue::new(10);
        let a: Arc<dyn Layer> = Arc::new(MemoryLayer::named(
            "a",
            MemoryLayerConfig::default(),
            Codec::default(),
        ));
        let b: Arc<dyn Layer> = Arc::new(MemoryLayer::named(
            "b",
            MemoryLayerConfig::default(),
            Codec::default(),
        ));
        queue.push(deferred("k", b"1", &a));
        queue.push(deferred("k", b"1", &b));
        queue.push(deferred("j", b"1", &a));

        assert_eq!(queue.cancel("k", &["a"]).await, 1);
        assert_eq!(queue.cancel("k", &["a"]).await, 0);
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.flush().await, (2, 0));
        assert!(a.get("k").await.unwrap().is_none());
        assert!(a.get("j").await.unwrap().is_some());
        assert!(b.get("k").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_discard_empties_queue() {
        let queue = WriteBehindQueue::new(10);
        let layer: Arc<dyn Layer> = Arc::new(MemoryLayer::new(
            MemoryLayerConfig::default(),
            Codec::default(),
        ));
        queue.push(deferred("k", b"1", &layer));
        queue.push(deferred("j", b"1", &layer));

        assert_eq!(queue.discard().await, 2);
        assert_eq!(queue.flush().await, (0, 0));
        assert_eq!(layer.stats().await.unwrap().item_count, 0);
    }
}
