//! Storage layers behind the cache manager.
//!
//! - [`memory`]: bounded in-process store with LRU eviction and TTL
//! - [`remote`]: adapter over an external key-value connection
//! - [`file`]: sharded JSON files on local disk
//!
//! Every layer implements [`Layer`]. Layers own their own consistency and
//! eviction; the manager only fans operations out and tolerates failures.

pub mod file;
pub mod memory;
pub mod remote;

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::cache::entry::{LayerKind, LayerStats};
use crate::error::CacheResult;

/// Per-write settings resolved by the manager.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteOptions {
    /// Relative time-to-live. None = layer default.
    pub ttl: Option<Duration>,

    /// Compress the payload before storing it.
    pub compress: bool,
}

/// A value found in a layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerHit {
    pub value: Bytes,

    /// Lifetime left on the stored entry. None = no expiry.
    pub ttl: Option<Duration>,
}

impl LayerHit {
    pub fn new(value: Bytes, ttl: Option<Duration>) -> Self {
        Self { value, ttl }
    }
}

/// A storage backend participating in the cache.
#[async_trait]
pub trait Layer: Send + Sync {
    /// Name callers use to address this layer.
    fn name(&self) -> &str;

    fn kind(&self) -> LayerKind;

    /// Fetch a value and its remaining lifetime. Expired entries are never
    /// returned.
    async fn get(&self, key: &str) -> CacheResult<Option<LayerHit>>;

    async fn set(&self, key: &str, value: Bytes, options: &WriteOptions) -> CacheResult<()>;

    /// Remove a key. Returns whether something was removed.
    async fn delete(&self, key: &str) -> CacheResult<bool>;

    async fn clear(&self) -> CacheResult<()>;

    async fn stats(&self) -> CacheResult<LayerStats>;

    /// Release connections or handles. Default: nothing to release.
    async fn close(&self) -> CacheResult<()> {
        Ok(())
    }
}
