//! multi-layer-cache: a tiered key/value cache.
//!
//! Values pass through an ordered stack of layers, fastest first:
//!   in-process memory → remote store (optional) → local filesystem
//!
//! Hits in a slower layer are promoted into the faster ones, writes fan out to
//! every layer, and a background scheduler keeps hot keys warm.

pub mod cache;
pub mod config;
pub mod error;
pub mod layers;

pub use cache::manager::{
    new_shared_manager, CacheManager, LayerOutcome, LayerStatus, SharedCacheManager, WriteReport,
};
pub use cache::metrics::{CacheEvent, CacheStats, ManagerMetrics};
pub use cache::options::CacheOptions;
pub use cache::strategy::StrategyKind;
pub use cache::warming::{loader, Loader, WarmingReport};
pub use config::Config;
pub use error::{CacheError, CacheResult};
pub use layers::{Layer, LayerHit};
