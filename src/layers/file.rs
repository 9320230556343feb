//! Persistent file layer.
//!
//! Each key is stored as `<root>/<sha256[..2]>/<sha256>.json` holding a
//! `{"data": ..., "compressed": ..., "expires_at": ...}` envelope. An entry
//! expires at its own `expires_at` or when the file's modification time is
//! older than the configured TTL, whichever comes first.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::{debug, warn};

use crate::cache::codec::Codec;
use crate::cache::entry::{LayerKind, LayerStats, Payload};
use crate::config::FileLayerConfig;
use crate::error::{CacheError, CacheResult};
use crate::layers::{Layer, LayerHit, WriteOptions};

/// On-disk body of one entry.
#[derive(Debug, Serialize, Deserialize)]
pub struct FileEnvelope {
    pub data: String,
    pub compressed: bool,

    /// Absolute expiry in milliseconds since the Unix epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
}

/// Current wall-clock time in milliseconds since the Unix epoch.
fn unix_millis(at: SystemTime) -> u64 {
    at.duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

impl FileEnvelope {
    /// Compressed bytes are base64; plain payloads must be UTF-8 text.
    pub fn from_payload(payload: &Payload, ttl: Option<Duration>) -> CacheResult<Self> {
        let data = if payload.compressed {
            STANDARD.encode(&payload.data)
        } else {
            String::from_utf8(payload.data.to_vec()).map_err(|e| {
                CacheError::Serialization(serde::ser::Error::custom(format!(
                    "payload is not valid UTF-8: {e}"
                )))
            })?
        };
        let expires_at = ttl.map(|ttl| {
            let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
            unix_millis(SystemTime::now()).saturating_add(ttl_ms)
        });
        Ok(Self {
            data,
            compressed: payload.compressed,
            expires_at,
        })
    }

    /// Lifetime left at `now`. None = no expiry; zero once expired.
    pub fn time_left_at(&self, now: SystemTime) -> Option<Duration> {
        self.expires_at
            .map(|at| Duration::from_millis(at.saturating_sub(unix_millis(now))))
    }

    pub fn is_expired_at(&self, now: SystemTime) -> bool {
        self.expires_at.is_some_and(|at| unix_millis(now) >= at)
    }

    pub fn into_payload(self) -> CacheResult<Payload> {
        let data = if self.compressed {
            STANDARD.decode(self.data.as_bytes()).map_err(|e| {
                CacheError::Serialization(serde::de::Error::custom(format!(
                    "invalid base64 data: {e}"
                )))
            })?
        } else {
            self.data.into_bytes()
        };
        Ok(Payload {
            data: Bytes::from(data),
            compressed: self.compressed,
        })
    }
}

/// Hex SHA-256 of a cache key.
pub fn key_hash(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hex::encode(hasher.finalize())
}

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Disk-backed layer.
pub struct FileLayer {
    name: String,
    root: PathBuf,
    ttl: Option<Duration>,
    codec: Codec,
}

impl FileLayer {
    /// Create the layer, ensuring the root directory exists.
    pub async fn new(config: &FileLayerConfig, codec: Codec) -> CacheResult<Self> {
        fs::create_dir_all(&config.path).await?;
        Ok(Self {
            name: "file".to_string(),
            root: config.path.clone(),
            ttl: config.ttl(),
            codec,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the file holding `key`. Two-character shard directories keep
    /// any one directory small.
    pub fn entry_path(&self, key: &str) -> PathBuf {
        let hash = key_hash(key);
        self.root.join(&hash[..2]).join(format!("{hash}.json"))
    }

    /// Lifetime left under the configured mtime TTL. None = no TTL.
    fn mtime_time_left(&self, modified: SystemTime, now: SystemTime) -> Option<Duration> {
        // A clock that moved backwards counts as fresh.
        self.ttl.map(|ttl| match now.duration_since(modified) {
            Ok(age) => ttl.saturating_sub(age),
            Err(_) => ttl,
        })
    }

    async fn expire(&self, key: &str, path: &Path) -> CacheResult<Option<LayerHit>> {
        Self::remove_if_exists(path).await?;
        debug!(key, path = %path.display(), "Removed expired cache file");
        Ok(None)
    }

    async fn remove_if_exists(path: &Path) -> CacheResult<bool> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl Layer for FileLayer {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> LayerKind {
        LayerKind::File
    }

    async fn get(&self, key: &str) -> CacheResult<Option<LayerHit>> {
        let path = self.entry_path(key);
        let now = SystemTime::now();

        let meta = match fs::metadata(&path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mtime_left = self.mtime_time_left(meta.modified()?, now);
        if mtime_left.is_some_and(|left| left.is_zero()) {
            return self.expire(key, &path).await;
        }

        let body = match fs::read(&path).await {
            Ok(body) => body,
            // Deleted between stat and read.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let envelope: FileEnvelope = serde_json::from_slice(&body)?;
        if envelope.is_expired_at(now) {
            return self.expire(key, &path).await;
        }
        let ttl = match (envelope.time_left_at(now), mtime_left) {
            (Some(entry), Some(mtime)) => Some(entry.min(mtime)),
            (entry, mtime) => entry.or(mtime),
        };
        let payload = envelope.into_payload()?;
        Ok(Some(LayerHit::new(self.codec.decode(&payload), ttl)))
    }

    async fn set(&self, key: &str, value: Bytes, options: &WriteOptions) -> CacheResult<()> {
        let payload = self.codec.encode(value, options.compress)?;
        let body = serde_json::to_vec(&FileEnvelope::from_payload(&payload, options.ttl)?)?;

        let path = self.entry_path(key);
        let Some(parent) = path.parent() else {
            return Err(CacheError::config(format!("no parent for {}", path.display())));
        };
        fs::create_dir_all(parent).await?;

        // Write to a sibling temp file, then rename over the target.
        let tmp = parent.join(format!(
            ".{}.{}.{}.tmp",
            key_hash(key),
            std::process::id(),
            TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        if let Err(e) = fs::write(&tmp, &body).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        if let Err(e) = fs::rename(&tmp, &path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        debug!(key, path = %path.display(), size = body.len(), "Wrote cache file");
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<bool> {
        Self::remove_if_exists(&self.entry_path(key)).await
    }

    async fn clear(&self) -> CacheResult<()> {
        let mut entries = fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            let result = if file_type.is_dir() {
                fs::remove_dir_all(entry.path()).await
            } else {
                fs::remove_file(entry.path()).await
            };
            if let Err(e) = result {
                warn!(path = %entry.path().display(), error = %e, "Failed to remove cache path");
            }
        }
        Ok(())
    }

    /// Walks every shard directory; cost grows with the number of files.
    async fn stats(&self) -> CacheResult<LayerStats> {
        let mut stats = LayerStats::default();
        let mut shards = fs::read_dir(&self.root).await?;
        while let Some(shard) = shards.next_entry().await? {
            if !shard.file_type().await?.is_dir() {
                continue;
            }
            let mut files = fs::read_dir(shard.path()).await?;
            while let Some(file) = files.next_entry().await? {
                let is_entry = file
                    .path()
                    .extension()
                    .is_some_and(|ext| ext == "json");
                if !is_entry {
                    continue;
                }
                let meta = file.metadata().await?;
                if meta.is_file() {
                    stats.item_count += 1;
                    stats.size_bytes += meta.len() as usize;
                }
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn layer(tmp: &TempDir, ttl_ms: Option<u64>) -> FileLayer {
        let config = FileLayerConfig {
            enabled: true,
            path: tmp.path().join("cache"),
            ttl_ms,
        };
        FileLayer::new(&config, Codec::default()).await.unwrap()
    }

    #[test]
    fn test_key_hash_is_sha256_hex() {
        assert_eq!(
            key_hash("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn test_layout_and_envelope() {
        let tmp = TempDir::new().unwrap();
        let layer = layer(&tmp, None).await;

        layer
            .set("user:1", Bytes::from_static(b"{\"n\":1}"), &WriteOptions::default())
            .await
            .unwrap();

        let hash = key_hash("user:1");
        let path = layer.root().join(&hash[..2]).join(format!("{hash}.json"));
        assert_eq!(path, layer.entry_path("user:1"));

        let body: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(body["data"], "{\"n\":1}");
        assert_eq!(body["compressed"], false);
        assert!(body.get("expires_at").is_none());
    }

    #[tokio::test]
    async fn test_compressed_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let layer = layer(&tmp, None).await;
        let value = Bytes::from(vec![b'z'; 4096]);
        let opts = WriteOptions {
            ttl: None,
            compress: true,
        };

        layer.set("k", value.clone(), &opts).await.unwrap();
        assert_eq!(layer.get("k").await.unwrap(), Some(LayerHit::new(value, None)));

        let body: serde_json::Value =
            serde_json::from_slice(&std::fs::read(layer.entry_path("k")).unwrap()).unwrap();
        assert_eq!(body["compressed"], true);
    }

    #[tokio::test]
    async fn test_mtime_ttl_expires_and_deletes() {
        let tmp = TempDir::new().unwrap();
        let layer = layer(&tmp, Some(50)).await;
        layer
            .set("k", Bytes::from_static(b"1"), &WriteOptions::default())
            .await
            .unwrap();
        assert!(layer.get("k").await.unwrap().is_some());

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(layer.get("k").await.unwrap().is_none());
        assert!(!layer.entry_path("k").exists());
    }

    #[tokio::test]
    async fn test_entry_ttl_expires_before_mtime_ttl() {
        let tmp = TempDir::new().unwrap();
        let layer = layer(&tmp, Some(60_000)).await;
        let opts = WriteOptions {
            ttl: Some(Duration::from_millis(50)),
            compress: false,
        };
        layer.set("k", Bytes::from_static(b"1"), &opts).await.unwrap();

        let hit = layer.get("k").await.unwrap().unwrap();
        assert!(hit.ttl.unwrap() <= Duration::from_millis(50));

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(layer.get("k").await.unwrap().is_none());
        assert!(!layer.entry_path("k").exists());
    }

    #[tokio::test]
    async fn test_mtime_ttl_reported_as_time_left() {
        let tmp = TempDir::new().unwrap();
        let layer = layer(&tmp, Some(10_000)).await;
        layer
            .set("k", Bytes::from_static(b"1"), &WriteOptions::default())
            .await
            .unwrap();

        let left = layer.get("k").await.unwrap().unwrap().ttl.unwrap();
        assert!(left <= Duration::from_secs(10) && left > Duration::from_secs(5));
    }

    #[test]
    fn test_envelope_expiry() {
        let payload = Payload::raw("v");
        let envelope = FileEnvelope::from_payload(&payload, Some(Duration::from_secs(2))).unwrap();
        let now = SystemTime::now();
        assert!(!envelope.is_expired_at(now));
        assert!(envelope.is_expired_at(now + Duration::from_secs(3)));
        assert_eq!(envelope.time_left_at(now + Duration::from_secs(5)), Some(Duration::ZERO));

        let forever = FileEnvelope::from_payload(&payload, None).unwrap();
        assert_eq!(forever.time_left_at(now), None);
        assert!(!forever.is_expired_at(now + Duration::from_secs(86_400)));
    }

    #[tokio::test]
    async fn test_stats_and_clear() {
        let tmp = TempDir::new().unwrap();
        let layer = layer(&tmp, None).await;
        for i in 0..5 {
            layer
                .set(&format!("k{i}"), Bytes::from_static(b"12345"), &WriteOptions::default())
                .await
                .unwrap();
        }

        let stats = layer.stats().await.unwrap();
        assert_eq!(stats.item_count, 5);
        assert!(stats.size_bytes > 0);

        layer.clear().await.unwrap();
        assert_eq!(layer.stats().await.unwrap().item_count, 0);
        assert!(layer.get("k0").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_missing_is_false() {
        let tmp = TempDir::new().unwrap();
        let layer = layer(&tmp, None).await;
        assert!(!layer.delete("nope").await.unwrap());
    }
}
