//! Cache entry types and layer bookkeeping.
//!
//! An entry holds one key's payload plus the metadata the memory layer needs
//! for expiry and recency eviction. Entries are the unit stored in a layer.

use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Identifies the kind of backend a layer is built on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LayerKind {
    /// In-process memory (fastest).
    Memory,
    /// Networked key-value store.
    Remote,
    /// Persistent files on local disk (slowest).
    File,
}

impl std::fmt::Display for LayerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LayerKind::Memory => write!(f, "memory"),
            LayerKind::Remote => write!(f, "remote"),
            LayerKind::File => write!(f, "file"),
        }
    }
}

/// A stored payload with an explicit compression flag.
///
/// Every layer keeps the flag next to the bytes, so decoding never has to
/// guess whether the data was compressed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    pub data: Bytes,
    pub compressed: bool,
}

impl Payload {
    pub fn raw(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            compressed: false,
        }
    }
}

/// A single cache entry.
#[derive(Debug, Clone)]
pub struct Entry {
    pub key: String,

    pub payload: Payload,

    /// Bytes charged against the layer budget (key + payload).
    pub size: usize,

    pub created_at: Instant,

    pub last_accessed: Instant,

    pub access_count: u64,

    /// Absolute expiry. None = never expires.
    pub expires_at: Option<Instant>,

    /// Monotonic recency stamp assigned by the owning layer.
    pub access_tick: u64,
}

impl Entry {
    pub fn new(key: impl Into<String>, payload: Payload, ttl: Option<Duration>) -> Self {
        let key = key.into();
        let now = Instant::now();
        let size = key.len() + payload.data.len();
        Self {
            key,
            payload,
            size,
            created_at: now,
            last_accessed: now,
            access_count: 0,
            expires_at: ttl.and_then(|ttl| now.checked_add(ttl)),
            access_tick: 0,
        }
    }

    /// Record an access, updating timestamp and counter.
    pub fn touch(&mut self, tick: u64) {
        self.last_accessed = Instant::now();
        self.access_count += 1;
        self.access_tick = tick;
    }

    pub fn is_expired_at(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Instant::now())
    }

    /// Remaining lifetime at `now`. None = never expires.
    pub fn time_left_at(&self, now: Instant) -> Option<Duration> {
        self.expires_at.map(|at| at.saturating_duration_since(now))
    }
}

/// Per-layer usage statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LayerStats {
    /// Number of entries in this layer.
    pub item_count: usize,
    /// Total bytes used in this layer.
    pub size_bytes: usize,
    /// Capacity budget in bytes (0 = unbounded or unknown).
    pub capacity: usize,
    /// Entries removed to satisfy the layer's budgets.
    pub evictions: u64,
}

impl LayerStats {
    /// Usage as a fraction of capacity (0.0 - 1.0).
    pub fn utilization(&self) -> f64 {
        if self.capacity == 0 {
            return 0.0;
        }
        self.size_bytes as f64 / self.capacity as f64
    }
}
