//! Per-call options.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::strategy::StrategyKind;
use crate::error::{CacheError, CacheResult};

/// Options recognized by every manager operation. Unset fields fall back to
/// the manager configuration.
///
/// The JSON form is `{"strategy", "layers", "ttl" (ms), "compress"}`; any
/// other key is rejected.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<StrategyKind>,

    /// Layer names in lookup order. None = all configured layers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layers: Option<Vec<String>>,

    /// Time-to-live in milliseconds.
    #[serde(default, rename = "ttl", skip_serializing_if = "Option::is_none")]
    pub ttl_ms: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compress: Option<bool>,
}

impl CacheOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse options from a JSON object, rejecting unknown keys and
    /// unknown strategy names.
    pub fn from_json(value: serde_json::Value) -> CacheResult<Self> {
        serde_json::from_value(value).map_err(|e| CacheError::config(e.to_string()))
    }

    pub fn strategy(mut self, strategy: StrategyKind) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub fn layers<I, S>(mut self, layers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.layers = Some(layers.into_iter().map(Into::into).collect());
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        // Saturates at u64::MAX ms.
        self.ttl_ms = Some(u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn compress(mut self, compress: bool) -> Self {
        self.compress = Some(compress);
        self
    }

    pub fn ttl_duration(&self) -> Option<Duration> {
        self.ttl_ms.map(Duration::from_millis)
    }
}
