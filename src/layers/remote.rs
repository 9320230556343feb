//! Remote key-value layer.
//!
//! A thin adapter: the connection handle is supplied by the caller and owns
//! its own availability, retry and timeout policy. Each value is written as a
//! single JSON envelope carrying the payload and its `compressed` flag, with
//! the TTL handed to the backend.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use crate::cache::codec::Codec;
use crate::cache::entry::{LayerKind, LayerStats};
use crate::config::RemoteLayerConfig;
use crate::error::{CacheError, CacheResult};
use crate::layers::file::FileEnvelope;
use crate::layers::{Layer, LayerHit, WriteOptions};

/// Connection to an external key-value service.
///
/// Errors are reported as strings; the layer maps them to
/// [`CacheError::LayerUnavailable`].
#[async_trait]
pub trait RemoteConnection: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, String>;

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), String>;

    async fn delete(&self, key: &str) -> Result<bool, String>;

    /// Drop every key in the backing database.
    async fn flush(&self) -> Result<(), String>;

    /// Number of keys in the backing database.
    async fn len(&self) -> Result<u64, String>;

    async fn close(&self) -> Result<(), String> {
        Ok(())
    }
}

/// Layer adapter over a [`RemoteConnection`].
pub struct RemoteLayer {
    name: String,
    key_prefix: String,
    connection: Arc<dyn RemoteConnection>,
    codec: Codec,
}

impl RemoteLayer {
    pub fn new(config: &RemoteLayerConfig, connection: Arc<dyn RemoteConnection>, codec: Codec) -> Self {
        Self {
            name: "remote".to_string(),
            key_prefix: config.key_prefix.clone(),
            connection,
            codec,
        }
    }

    fn remote_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    fn unavailable(&self, reason: String) -> CacheError {
        CacheError::unavailable(&self.name, reason)
    }
}

#[async_trait]
impl Layer for RemoteLayer {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> LayerKind {
        LayerKind::Remote
    }

    async fn get(&self, key: &str) -> CacheResult<Option<LayerHit>> {
        let Some(wire) = self
            .connection
            .get(&self.remote_key(key))
            .await
            .map_err(|e| self.unavailable(e))?
        else {
            return Ok(None);
        };
        let envelope: FileEnvelope = serde_json::from_slice(&wire)?;
        // The backend expires entries itself; this covers clock skew and
        // backends without native TTL.
        let now = SystemTime::now();
        if envelope.is_expired_at(now) {
            return Ok(None);
        }
        let ttl = envelope.time_left_at(now);
        let payload = envelope.into_payload()?;
        Ok(Some(LayerHit::new(self.codec.decode(&payload), ttl)))
    }

    async fn set(&self, key: &str, value: Bytes, options: &WriteOptions) -> CacheResult<()> {
        let payload = self.codec.encode(value, options.compress)?;
        let wire = serde_json::to_vec(&FileEnvelope::from_payload(&payload, options.ttl)?)?;
        let size = wire.len();
        self.connection
            .set(&self.remote_key(key), wire, options.ttl)
            .await
            .map_err(|e| self.unavailable(e))?;
        debug!(key, size, ttl = ?options.ttl, "Wrote remote entry");
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<bool> {
        self.connection
            .delete(&self.remote_key(key))
            .await
            .map_err(|e| self.unavailable(e))
    }

    async fn clear(&self) -> CacheResult<()> {
        self.connection.flush().await.map_err(|e| self.unavailable(e))
    }

    async fn stats(&self) -> CacheResult<LayerStats> {
        let count = self.connection.len().await.map_err(|e| self.unavailable(e))?;
        Ok(LayerStats {
            item_count: count as usize,
            ..Default::default()
        })
    }

    async fn close(&self) -> CacheResult<()> {
        self.connection.close().await.map_err(|e| self.unavailable(e))
    }
}

#[cfg(feature = "redis")]
pub use redis_backend::RedisConnection;

#[cfg(feature = "redis")]
mod redis_backend {
    use std::time::Duration;

    use async_trait::async_trait;
    use redis::aio::ConnectionManager;
    use redis::AsyncCommands;

    use super::RemoteConnection;

    /// Redis-backed connection. Reconnects are handled by [`ConnectionManager`].
    #[derive(Clone)]
    pub struct RedisConnection {
        manager: ConnectionManager,
    }

    impl RedisConnection {
        pub async fn connect(url: &str) -> redis::RedisResult<Self> {
            let client = redis::Client::open(url)?;
            let manager = ConnectionManager::new(client).await?;
            tracing::info!(url, "Remote connection established");
            Ok(Self { manager })
        }
    }

    #[async_trait]
    impl RemoteConnection for RedisConnection {
        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, String> {
            let mut con = self.manager.clone();
            con.get(key).await.map_err(|e| e.to_string())
        }

        async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), String> {
            let mut con = self.manager.clone();
            match ttl {
                Some(ttl) => {
                    let millis = u64::try_from(ttl.as_millis().max(1)).unwrap_or(u64::MAX);
                    con.pset_ex(key, value, millis).await.map_err(|e| e.to_string())
                }
                None => con.set(key, value).await.map_err(|e| e.to_string()),
            }
        }

        async fn delete(&self, key: &str) -> Result<bool, String> {
            let mut con = self.manager.clone();
            let removed: u64 = con.del(key).await.map_err(|e| e.to_string())?;
            Ok(removed > 0)
        }

        async fn flush(&self) -> Result<(), String> {
            let mut con = self.manager.clone();
            let _: () = redis::cmd("FLUSHDB")
                .query_async(&mut con)
                .await
                .map_err(|e| e.to_string())?;
            Ok(())
        }

        async fn len(&self) -> Result<u64, String> {
            let mut con = self.manager.clone();
            let count: u64 = redis::cmd("DBSIZE")
                .query_async(&mut con)
                .await
                .map_err(|e| e.to_string())?;
            Ok(count)
        }
    }
}
