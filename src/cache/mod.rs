//! Multi-layer cache management.
//!
//! This module contains the orchestration logic that sits above the layers:
//! - [`entry`]: Entry, payload and per-layer statistics types
//! - [`codec`]: zstd compression of stored payloads
//! - [`strategy`]: Retention strategies (LRU, LFU, TTL, write-through, write-behind)
//! - [`metrics`]: Counters, histories, alerts and prometheus export
//! - [`warming`]: Loader queue drained in batches by the warming timer
//! - [`options`]: Per-call options
//! - [`manager`]: The manager that ties it all together

pub mod codec;
pub mod entry;
pub mod manager;
pub mod metrics;
pub mod options;
pub mod strategy;
pub mod warming;
