//! Cache manager: orchestrates operations across layers.
//!
//! The manager is the central coordinator for the multi-layer cache. It:
//! - Fans get/set/delete/clear out to the named layers, tolerating failures
//! - Promotes hits from slower layers into every faster layer before them
//! - Dispatches strategy hooks and records metrics for every call
//! - Runs the warming and metrics timers in the background

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use bytes::Bytes;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use prometheus::Registry;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::cache::codec::Codec;
use crate::cache::metrics::{CacheEvent, CacheStats, MetricsRecorder};
use crate::cache::options::CacheOptions;
use crate::cache::strategy::{DeferredWrite, Strategy, StrategyKind, WriteBehindQueue, WritePlan};
use crate::cache::warming::{Loader, WarmingItem, WarmingQueue, WarmingReport};
use crate::config::Config;
use crate::error::{CacheError, CacheResult};
use crate::layers::file::FileLayer;
use crate::layers::memory::MemoryLayer;
use crate::layers::remote::{RemoteConnection, RemoteLayer};
use crate::layers::{Layer, WriteOptions};

/// What happened to one layer during a fanned-out write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayerStatus {
    Stored,
    Failed(String),
    /// Queued by the write-behind strategy.
    Deferred,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerOutcome {
    pub layer: String,
    pub status: LayerStatus,
}

/// Per-layer outcomes of a set, delete or clear.
///
/// The call itself succeeds even when every layer failed; callers that care
/// inspect the report.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteReport {
    pub outcomes: Vec<LayerOutcome>,
}

impl WriteReport {
    fn push(&mut self, layer: &str, status: LayerStatus) {
        self.outcomes.push(LayerOutcome {
            layer: layer.to_string(),
            status,
        });
    }

    pub fn status(&self, layer: &str) -> Option<&LayerStatus> {
        self.outcomes
            .iter()
            .find(|o| o.layer == layer)
            .map(|o| &o.status)
    }

    pub fn succeeded(&self) -> usize {
        self.count(|s| matches!(s, LayerStatus::Stored))
    }

    pub fn failed(&self) -> usize {
        self.count(|s| matches!(s, LayerStatus::Failed(_)))
    }

    pub fn deferred(&self) -> usize {
        self.count(|s| matches!(s, LayerStatus::Deferred))
    }

    /// True when layers were addressed and none accepted the write.
    pub fn all_failed(&self) -> bool {
        !self.outcomes.is_empty() && self.failed() == self.outcomes.len()
    }

    fn count(&self, pred: impl Fn(&LayerStatus) -> bool) -> usize {
        self.outcomes.iter().filter(|o| pred(&o.status)).count()
    }
}

/// The multi-layer cache manager.
pub struct CacheManager {
    config: Arc<Config>,

    /// Layers, fastest first.
    layers: RwLock<Vec<Arc<dyn Layer>>>,

    strategies: RwLock<HashMap<StrategyKind, Arc<Strategy>>>,

    metrics: MetricsRecorder,

    warming: WarmingQueue,

    events: broadcast::Sender<CacheEvent>,

    timers: Mutex<Vec<JoinHandle<()>>>,

    closed: AtomicBool,
}

/// Thread-safe handle to a manager.
pub type SharedCacheManager = Arc<CacheManager>;

/// Wrap a manager and start its warming and metrics timers.
pub fn new_shared_manager(manager: CacheManager) -> SharedCacheManager {
    let shared = Arc::new(manager);
    shared.spawn_background();
    shared
}

impl CacheManager {
    /// Create a manager over an explicit layer list (fastest first).
    pub fn new(config: Config, layers: Vec<Arc<dyn Layer>>) -> CacheResult<Self> {
        let mut seen = std::collections::HashSet::new();
        for layer in &layers {
            if !seen.insert(layer.name().to_string()) {
                return Err(CacheError::config(format!(
                    "duplicate layer name: {}",
                    layer.name()
                )));
            }
        }

        let strategies = StrategyKind::ALL
            .into_iter()
            .map(|kind| (kind, Arc::new(Strategy::new(kind, &config.strategies))))
            .collect();

        let metrics = MetricsRecorder::new(config.metrics.clone())?;
        let warming = WarmingQueue::new(config.warming.batch_size);
        let (events, _) = broadcast::channel(config.manager.event_capacity.max(1));

        info!(
            layers = ?layers.iter().map(|l| l.name()).collect::<Vec<_>>(),
            default_strategy = %config.manager.default_strategy,
            "Cache manager initialized"
        );

        Ok(Self {
            config: Arc::new(config),
            layers: RwLock::new(layers),
            strategies: RwLock::new(strategies),
            metrics,
            warming,
            events,
            timers: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// Build the standard memory → remote → file stack from configuration.
    ///
    /// A layer that fails to initialize aborts construction. The remote layer
    /// needs a connection when enabled.
    pub async fn from_config(
        config: Config,
        remote: Option<Arc<dyn RemoteConnection>>,
    ) -> CacheResult<Self> {
        let codec = Codec::new(config.compression.clone());
        let mut layers: Vec<Arc<dyn Layer>> = vec![Arc::new(MemoryLayer::new(
            config.memory.clone(),
            codec.clone(),
        ))];

        if config.remote.enabled {
            let connection = remote.ok_or_else(|| {
                CacheError::config("remote layer enabled but no connection supplied")
            })?;
            layers.push(Arc::new(RemoteLayer::new(
                &config.remote,
                connection,
                codec.clone(),
            )));
        }

        if config.file.enabled {
            let file = FileLayer::new(&config.file, codec).await?;
            info!(path = %file.root().display(), "File layer ready");
            layers.push(Arc::new(file));
        }

        Self::new(config, layers)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    // ─── Operations ────────────────────────────────────────────────────────

    /// Look a key up in each named layer, in order.
    ///
    /// A hit is copied into every layer before the one that served it.
    /// Returns `Ok(None)` on a miss; layer errors are logged and skipped.
    pub async fn get(&self, key: &str, options: &CacheOptions) -> CacheResult<Option<Value>> {
        let start = Instant::now();
        let layers = self.resolve_layers(options)?;
        let strategy = self.resolve_strategy(options)?;

        for (idx, layer) in layers.iter().enumerate() {
            let hit = match layer.get(key).await {
                Ok(Some(hit)) => hit,
                Ok(None) => continue,
                Err(e) => {
                    warn!(key, layer = layer.name(), kind = %layer.kind(), error = %e, "Layer get failed");
                    self.metrics.record_error(layer.name());
                    continue;
                }
            };

            let value: Value = match serde_json::from_slice(&hit.value) {
                Ok(value) => value,
                Err(e) => {
                    warn!(key, layer = layer.name(), error = %e, "Undecodable cached value");
                    self.metrics.record_error(layer.name());
                    continue;
                }
            };

            self.metrics.record_hit();
            if idx > 0 && strategy.admits_promotion(key) {
                // Copies never outlive the entry they were read from.
                let mut write = self.write_options(options, &strategy);
                if hit.ttl.is_some() {
                    write.ttl = hit.ttl;
                }
                self.promote(key, &hit.value, &layers[..idx], &write).await;
            }
            strategy.on_hit(key, &value, layer.name());
            self.metrics.record_duration(start.elapsed());
            debug!(key, layer = layer.name(), "Cache hit");
            return Ok(Some(value));
        }

        self.metrics.record_miss();
        self.metrics.record_duration(start.elapsed());
        debug!(key, "Cache miss");
        Ok(None)
    }

    /// Store a value in every named layer.
    ///
    /// Per-layer failures never fail the call; they show up in the report.
    pub async fn set(
        &self,
        key: &str,
        value: &Value,
        options: &CacheOptions,
    ) -> CacheResult<WriteReport> {
        let start = Instant::now();
        let layers = self.resolve_layers(options)?;
        let strategy = self.resolve_strategy(options)?;
        let bytes = Bytes::from(serde_json::to_vec(value)?);

        let mut write = self.write_options(options, &strategy);
        let plan = strategy.on_set(key, &bytes, &mut write);
        let immediate = match plan {
            WritePlan::AllLayers => layers.len(),
            WritePlan::FastestThenDeferred => layers.len().min(1),
        };
        let (now, later) = layers.split_at(immediate);
        self.cancel_deferred(key, now).await;

        let mut report = self
            .fan_out("set", key, now, |layer| {
                let bytes = bytes.clone();
                async move { layer.set(key, bytes, &write).await }
            })
            .await;

        if let Some(queue) = strategy.write_behind_queue().filter(|_| !later.is_empty()) {
            for layer in later {
                queue.push(DeferredWrite {
                    key: key.to_string(),
                    value: bytes.clone(),
                    options: write,
                    layer: Arc::clone(layer),
                });
                report.push(layer.name(), LayerStatus::Deferred);
            }
            queue.schedule_flush();
        }

        self.metrics.record_set();
        self.metrics.record_duration(start.elapsed());
        if report.all_failed() {
            warn!(key, "Set failed on every layer");
        }
        self.emit(CacheEvent::Set {
            key: key.to_string(),
            layers: report
                .outcomes
                .iter()
                .filter(|o| !matches!(o.status, LayerStatus::Failed(_)))
                .map(|o| o.layer.clone())
                .collect(),
        });
        Ok(report)
    }

    /// Remove a key from every named layer.
    pub async fn delete(&self, key: &str, options: &CacheOptions) -> CacheResult<WriteReport> {
        let start = Instant::now();
        let layers = self.resolve_layers(options)?;
        self.cancel_deferred(key, &layers).await;

        let report = self
            .fan_out("delete", key, &layers, |layer| async move {
                layer.delete(key).await.map(|_| ())
            })
            .await;

        self.metrics.record_delete();
        self.metrics.record_duration(start.elapsed());
        self.emit(CacheEvent::Delete {
            key: key.to_string(),
        });
        Ok(report)
    }

    /// Empty every named layer and reset all metrics.
    pub async fn clear(&self, options: &CacheOptions) -> CacheResult<WriteReport> {
        let layers = self.resolve_layers(options)?;

        // Pending deferred writes are dropped first so none lands after the clear.
        let strategies: Vec<_> = self.strategies.read().values().cloned().collect();
        for strategy in strategies {
            strategy.reset().await;
        }

        let report = self
            .fan_out("clear", "*", &layers, |layer| async move { layer.clear().await })
            .await;

        self.metrics.reset();
        info!(layers = report.outcomes.len(), "Cache cleared");
        self.emit(CacheEvent::Clear);
        Ok(report)
    }

    /// Global metrics plus per-layer statistics for the named layers.
    pub async fn get_stats(&self, options: &CacheOptions) -> CacheResult<CacheStats> {
        let layers = self.resolve_layers(options)?;
        let results = join_all(layers.iter().map(|layer| layer.stats())).await;

        let mut stats = CacheStats {
            global: self.metrics.snapshot(),
            ..Default::default()
        };
        for (layer, result) in layers.iter().zip(results) {
            match result {
                Ok(layer_stats) => {
                    stats.global.evictions += layer_stats.evictions;
                    stats.global.total_size += layer_stats.size_bytes;
                    stats.layers.insert(layer.name().to_string(), layer_stats);
                }
                Err(e) => {
                    warn!(layer = layer.name(), error = %e, "Layer stats unavailable");
                }
            }
        }
        Ok(stats)
    }

    /// Queue a key to be refreshed by the warming scheduler.
    pub fn add_to_warming_queue(&self, key: impl Into<String>, loader: Loader, options: CacheOptions) {
        let key = key.into();
        debug!(key = %key, "Queued for warming");
        self.warming.push(WarmingItem {
            key,
            loader,
            options,
        });
    }

    pub fn warming_queue_len(&self) -> usize {
        self.warming.len()
    }

    /// Run one warming batch now.
    ///
    /// Returns None when another batch is still in flight.
    pub async fn run_warming_batch(&self) -> Option<WarmingReport> {
        let Some(mut guard) = self.warming.begin_batch() else {
            debug!("Warming batch already in flight, skipping");
            return None;
        };
        let batch = std::mem::take(&mut guard.batch);
        let mut report = WarmingReport {
            attempted: batch.len(),
            ..Default::default()
        };
        if batch.is_empty() {
            return Some(report);
        }

        // Each loader on its own task so a panic stays contained.
        let loads = join_all(batch.into_iter().map(|item| {
            let load = Arc::clone(&item.loader);
            let handle = tokio::spawn(async move { load().await });
            async move { (item, handle.await) }
        }))
        .await;

        let mut loaded = Vec::new();
        for (item, result) in loads {
            match result {
                Ok(Ok(value)) => loaded.push((item, value)),
                Ok(Err(e)) => {
                    report.failed += 1;
                    warn!(key = %item.key, error = %e, "Warming loader failed");
                }
                Err(e) => {
                    report.failed += 1;
                    warn!(key = %item.key, error = %e, "Warming loader panicked");
                }
            }
        }

        let writes = join_all(
            loaded
                .iter()
                .map(|(item, value)| self.set(&item.key, value, &item.options)),
        )
        .await;
        for ((item, _), result) in loaded.iter().zip(writes) {
            match result {
                Ok(_) => report.succeeded += 1,
                Err(e) => {
                    report.failed += 1;
                    warn!(key = %item.key, error = %e, "Warming write rejected");
                }
            }
        }

        info!(
            attempted = report.attempted,
            succeeded = report.succeeded,
            failed = report.failed,
            "Warming batch complete"
        );
        Some(report)
    }

    /// Take a metrics snapshot, append it to the histories and publish alerts.
    pub async fn collect_metrics(&self) -> CacheResult<CacheStats> {
        let stats = self.get_stats(&CacheOptions::default()).await?;
        let alerts = self.metrics.evaluate(&stats);
        self.emit(CacheEvent::Metrics(stats.clone()));
        for alert in alerts {
            warn!(
                alert = alert.name(),
                hit_rate = stats.global.hit_rate,
                avg_response_time_ms = stats.global.avg_response_time,
                "Cache alert"
            );
            self.emit(alert);
        }
        Ok(stats)
    }

    /// Hit-rate and response-time histories, oldest first.
    pub fn metrics_history(&self) -> (Vec<f64>, Vec<f64>) {
        (
            self.metrics.hit_rate_history(),
            self.metrics.response_time_history(),
        )
    }

    /// Receive set/delete/clear/metrics/alert events.
    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.events.subscribe()
    }

    pub fn prometheus_registry(&self) -> &Registry {
        self.metrics.registry()
    }

    /// Direct handle to a layer, for inspection.
    pub fn layer(&self, name: &str) -> Option<Arc<dyn Layer>> {
        self.layers
            .read()
            .iter()
            .find(|l| l.name() == name)
            .cloned()
    }

    pub fn layer_names(&self) -> Vec<String> {
        self.layers
            .read()
            .iter()
            .map(|l| l.name().to_string())
            .collect()
    }

    pub fn strategy(&self, kind: StrategyKind) -> Option<Arc<Strategy>> {
        self.strategies.read().get(&kind).cloned()
    }

    // ─── Lifecycle ─────────────────────────────────────────────────────────

    /// Start the warming and metrics timers.
    ///
    /// The tasks hold a weak reference and stop once the manager is dropped
    /// or closed.
    pub fn spawn_background(self: &Arc<Self>) {
        let warming = spawn_ticker(
            Arc::downgrade(self),
            self.config.warming.interval(),
            |manager| {
                // Overlapping ticks are no-ops inside run_warming_batch.
                tokio::spawn(async move {
                    manager.run_warming_batch().await;
                });
            },
        );
        let metrics = spawn_ticker(
            Arc::downgrade(self),
            self.config.metrics.interval(),
            |manager| {
                tokio::spawn(async move {
                    if let Err(e) = manager.collect_metrics().await {
                        warn!(error = %e, "Metrics collection failed");
                    }
                });
            },
        );
        self.timers.lock().extend([warming, metrics]);
        debug!("Background timers started");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stop timers, make one last write-behind attempt, close every layer and
    /// clear the registries. In-flight operations finish on their own.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for timer in self.timers.lock().drain(..) {
            timer.abort();
        }

        for queue in self.write_behind_queues() {
            let (written, failed) = queue.flush().await;
            if written + failed > 0 {
                info!(written, failed, "Final write-behind flush");
            }
        }

        let layers: Vec<_> = self.layers.write().drain(..).collect();
        let results = join_all(layers.iter().map(|layer| layer.close())).await;
        for (layer, result) in layers.iter().zip(results) {
            if let Err(e) = result {
                warn!(layer = layer.name(), error = %e, "Layer close failed");
            }
        }

        self.strategies.write().clear();
        self.warming.clear();
        info!("Cache manager closed");
    }

    // ─── Internals ─────────────────────────────────────────────────────────

    fn ensure_open(&self) -> CacheResult<()> {
        if self.is_closed() {
            return Err(CacheError::config("cache manager is closed"));
        }
        Ok(())
    }

    fn resolve_layers(&self, options: &CacheOptions) -> CacheResult<Vec<Arc<dyn Layer>>> {
        self.ensure_open()?;
        let layers = self.layers.read();
        let Some(names) = &options.layers else {
            return Ok(layers.clone());
        };
        names
            .iter()
            .map(|name| {
                layers
                    .iter()
                    .find(|l| l.name() == name)
                    .cloned()
                    .ok_or_else(|| CacheError::config(format!("unknown layer: {name}")))
            })
            .collect()
    }

    fn resolve_strategy(&self, options: &CacheOptions) -> CacheResult<Arc<Strategy>> {
        let kind = options
            .strategy
            .unwrap_or(self.config.manager.default_strategy);
        self.strategies
            .read()
            .get(&kind)
            .cloned()
            .ok_or_else(|| CacheError::config(format!("strategy not registered: {kind}")))
    }

    fn write_options(&self, options: &CacheOptions, strategy: &Strategy) -> WriteOptions {
        WriteOptions {
            ttl: options.ttl_duration().or_else(|| strategy.default_ttl()),
            compress: options.compress.unwrap_or(self.config.manager.compress),
        }
    }

    fn write_behind_queues(&self) -> Vec<Arc<WriteBehindQueue>> {
        self.strategies
            .read()
            .values()
            .filter_map(|s| s.write_behind_queue().cloned())
            .collect()
    }

    /// Drop deferred writes of `key` that a direct write or delete on
    /// `layers` supersedes.
    async fn cancel_deferred(&self, key: &str, layers: &[Arc<dyn Layer>]) {
        if layers.is_empty() {
            return;
        }
        let names: Vec<&str> = layers.iter().map(|l| l.name()).collect();
        for queue in self.write_behind_queues() {
            let dropped = queue.cancel(key, &names).await;
            if dropped > 0 {
                debug!(key, dropped, "Superseded deferred writes");
            }
        }
    }

    /// Copy a hit into faster layers. Failures are logged, never returned.
    async fn promote(
        &self,
        key: &str,
        bytes: &Bytes,
        targets: &[Arc<dyn Layer>],
        write: &WriteOptions,
    ) {
        let report = self
            .fan_out("promote", key, targets, |layer| {
                let bytes = bytes.clone();
                async move { layer.set(key, bytes, write).await }
            })
            .await;
        debug!(
            key,
            promoted = report.succeeded(),
            failed = report.failed(),
            "Promotion complete"
        );
    }

    /// Run `op` on every layer concurrently and collect the outcomes.
    async fn fan_out<'a, F, Fut>(
        &self,
        op: &'static str,
        key: &str,
        layers: &'a [Arc<dyn Layer>],
        f: F,
    ) -> WriteReport
    where
        F: Fn(&'a Arc<dyn Layer>) -> Fut,
        Fut: Future<Output = CacheResult<()>>,
    {
        let results = join_all(layers.iter().map(f)).await;
        let mut report = WriteReport::default();
        for (layer, result) in layers.iter().zip(results) {
            match result {
                Ok(()) => report.push(layer.name(), LayerStatus::Stored),
                Err(e) => {
                    warn!(op, key, layer = layer.name(), error = %e, "Layer operation failed");
                    self.metrics.record_error(layer.name());
                    report.push(layer.name(), LayerStatus::Failed(e.to_string()));
                }
            }
        }
        report
    }

    fn emit(&self, event: CacheEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

impl Drop for CacheManager {
    fn drop(&mut self) {
        for timer in self.timers.get_mut().drain(..) {
            timer.abort();
        }
    }
}

fn spawn_ticker<F>(
    manager: Weak<CacheManager>,
    period: std::time::Duration,
    on_tick: F,
) -> JoinHandle<()>
where
    F: Fn(Arc<CacheManager>) + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(manager) = manager.upgrade() else {
                break;
            };
            if manager.is_closed() {
                break;
            }
            on_tick(manager);
        }
    })
}
