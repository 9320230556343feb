//! Error taxonomy for the cache manager and its layers.
//!
//! Per-layer errors are normally caught by the manager, logged and counted.
//! Only configuration problems, unserializable values and startup failures
//! reach the caller.

use thiserror::Error;

use crate::cache::codec::CompressionError;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Layer {layer} unavailable: {reason}")]
    LayerUnavailable { layer: String, reason: String },

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Compression failed: {0}")]
    Compression(#[from] CompressionError),

    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Entry {key} is {size} bytes, larger than the layer budget of {limit} bytes")]
    EntryTooLarge {
        key: String,
        size: usize,
        limit: usize,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Metrics registration failed: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl CacheError {
    pub fn unavailable(layer: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        CacheError::LayerUnavailable {
            layer: layer.into(),
            reason: reason.to_string(),
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        CacheError::Configuration(msg.into())
    }
}

pub type CacheResult<T> = Result<T, CacheError>;
