//! Bounded in-process layer.
//!
//! Two budgets are enforced before every insert: total bytes and item count.
//! When either would be exceeded, the least recently accessed entry is
//! evicted, repeatedly, until both fit. Recency is tracked with a monotonic
//! tick and an ordered index so the victim lookup is O(log n).

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::cache::codec::Codec;
use crate::cache::entry::{Entry, LayerKind, LayerStats, Payload};
use crate::config::MemoryLayerConfig;
use crate::error::{CacheError, CacheResult};
use crate::layers::{Layer, LayerHit, WriteOptions};

/// Map and eviction metadata, always updated together under one lock.
#[derive(Debug, Default)]
struct Store {
    entries: HashMap<String, Entry>,

    /// access tick → key, oldest first.
    recency: BTreeMap<u64, String>,

    next_tick: u64,

    bytes_used: usize,

    evictions: u64,
}

impl Store {
    fn tick(&mut self) -> u64 {
        self.next_tick += 1;
        self.next_tick
    }

    fn remove(&mut self, key: &str) -> Option<Entry> {
        let entry = self.entries.remove(key)?;
        self.recency.remove(&entry.access_tick);
        self.bytes_used = self.bytes_used.saturating_sub(entry.size);
        Some(entry)
    }

    fn insert(&mut self, mut entry: Entry) {
        let tick = self.tick();
        entry.access_tick = tick;
        self.bytes_used += entry.size;
        self.recency.insert(tick, entry.key.clone());
        self.entries.insert(entry.key.clone(), entry);
    }

    fn touch(&mut self, key: &str) -> Option<&Entry> {
        let tick = self.tick();
        let entry = self.entries.get_mut(key)?;
        self.recency.remove(&entry.access_tick);
        entry.touch(tick);
        self.recency.insert(tick, entry.key.clone());
        Some(entry)
    }

    /// Evict least recently accessed entries until `incoming` bytes and one
    /// more item fit. Returns the evicted keys, oldest first.
    fn make_room(&mut self, incoming: usize, max_size: usize, max_items: usize) -> Vec<String> {
        let mut victims = Vec::new();
        while self.bytes_used + incoming > max_size || self.entries.len() + 1 > max_items {
            let Some((_, key)) = self.recency.pop_first() else {
                break;
            };
            if let Some(entry) = self.entries.remove(&key) {
                self.bytes_used = self.bytes_used.saturating_sub(entry.size);
                self.evictions += 1;
                victims.push(key);
            }
        }
        victims
    }
}

/// The in-memory layer.
pub struct MemoryLayer {
    name: String,
    config: MemoryLayerConfig,
    codec: Codec,
    store: Mutex<Store>,
}

impl MemoryLayer {
    pub fn new(config: MemoryLayerConfig, codec: Codec) -> Self {
        Self::named("memory", config, codec)
    }

    pub fn named(name: impl Into<String>, config: MemoryLayerConfig, codec: Codec) -> Self {
        Self {
            name: name.into(),
            config,
            codec,
            store: Mutex::new(Store::default()),
        }
    }

    /// Whether a live entry exists, without counting as an access.
    pub fn contains(&self, key: &str) -> bool {
        self.store
            .lock()
            .entries
            .get(key)
            .is_some_and(|entry| !entry.is_expired())
    }

    /// Number of stored entries, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.store.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Access count of a live entry.
    pub fn access_count(&self, key: &str) -> Option<u64> {
        self.store.lock().entries.get(key).map(|e| e.access_count)
    }

    fn lookup(&self, key: &str) -> Option<(Payload, Option<Duration>)> {
        let mut store = self.store.lock();
        let now = Instant::now();
        let expired = store.entries.get(key)?.is_expired_at(now);
        if expired {
            store.remove(key);
            debug!(key, layer = %self.name, "Purged expired entry");
            return None;
        }
        store
            .touch(key)
            .map(|entry| (entry.payload.clone(), entry.time_left_at(now)))
    }
}

#[async_trait]
impl Layer for MemoryLayer {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> LayerKind {
        LayerKind::Memory
    }

    async fn get(&self, key: &str) -> CacheResult<Option<LayerHit>> {
        // Decode outside the lock.
        let found = self.lookup(key);
        Ok(found.map(|(payload, ttl)| LayerHit::new(self.codec.decode(&payload), ttl)))
    }

    async fn set(&self, key: &str, value: Bytes, options: &WriteOptions) -> CacheResult<()> {
        let payload = self.codec.encode(value, options.compress)?;
        let entry = Entry::new(key, payload, options.ttl);

        if entry.size > self.config.max_size {
            return Err(CacheError::EntryTooLarge {
                key: key.to_string(),
                size: entry.size,
                limit: self.config.max_size,
            });
        }

        let mut store = self.store.lock();
        store.remove(key);
        let victims = store.make_room(entry.size, self.config.max_size, self.config.max_items);
        store.insert(entry);
        drop(store);

        for victim in &victims {
            debug!(key = %victim, layer = %self.name, "Evicted entry");
        }
        trace!(key, layer = %self.name, "Stored entry");
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<bool> {
        Ok(self.store.lock().remove(key).is_some())
    }

    async fn clear(&self) -> CacheResult<()> {
        *self.store.lock() = Store::default();
        Ok(())
    }

    async fn stats(&self) -> CacheResult<LayerStats> {
        let store = self.store.lock();
        Ok(LayerStats {
            item_count: store.entries.len(),
            size_bytes: store.bytes_used,
            capacity: self.config.max_size,
            evictions: store.evictions,
        })
    }
}
