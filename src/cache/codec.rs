//! Payload compression.
//!
//! Values are zstd-compressed when a write asks for it. The resulting
//! [`Payload`] carries an explicit `compressed` flag. A compression failure
//! fails the layer write. Decoding is lenient: if decompression fails, the
//! raw bytes are handed back and a warning is logged.

use bytes::Bytes;
use thiserror::Error;
use tracing::warn;

use crate::cache::entry::Payload;
use crate::config::CompressionConfig;

#[derive(Error, Debug)]
pub enum CompressionError {
    #[error("Zstd compression failed: {0}")]
    ZstdError(#[from] std::io::Error),
}

/// Compresses and decompresses payloads for any layer.
#[derive(Debug, Clone)]
pub struct Codec {
    config: CompressionConfig,
}

impl Codec {
    pub fn new(config: CompressionConfig) -> Self {
        Self { config }
    }

    /// Build a payload from serialized value bytes.
    pub fn encode(&self, data: Bytes, compress: bool) -> Result<Payload, CompressionError> {
        if !compress {
            return Ok(Payload::raw(data));
        }
        Ok(Payload {
            data: Bytes::from(self.zstd_compress(&data)?),
            compressed: true,
        })
    }

    /// Recover the original bytes, failing if compressed data is corrupt.
    pub fn try_decode(&self, payload: &Payload) -> Result<Bytes, CompressionError> {
        if !payload.compressed {
            return Ok(payload.data.clone());
        }
        Ok(Bytes::from(self.zstd_decompress(&payload.data)?))
    }

    /// Recover the original bytes from a payload.
    ///
    /// A failed decompression is recoverable: the raw bytes are returned.
    pub fn decode(&self, payload: &Payload) -> Bytes {
        match self.try_decode(payload) {
            Ok(data) => data,
            Err(e) => {
                warn!(error = %e, "Decompression failed, returning raw value");
                payload.data.clone()
            }
        }
    }

    fn zstd_compress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
        let compressed = zstd::encode_all(data, self.config.zstd_level)?;
        Ok(compressed)
    }

    fn zstd_decompress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
        let decompressed = zstd::decode_all(data)?;
        Ok(decompressed)
    }
}

impl Default for Codec {
    fn default() -> Self {
        Self::new(CompressionConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zstd_roundtrip() {
        let codec = Codec::default();
        let data = Bytes::from(vec![42u8; 4096]);

        let payload = codec.encode(data.clone(), true).unwrap();
        assert!(payload.compressed);
        assert!(payload.data.len() < data.len()); // should compress well

        assert_eq!(codec.decode(&payload), data);
    }

    #[test]
    fn test_uncompressed_passthrough() {
        let codec = Codec::default();
        let payload = codec.encode(Bytes::from_static(b"{\"a\":1}"), false).unwrap();
        assert!(!payload.compressed);
        assert_eq!(codec.decode(&payload), Bytes::from_static(b"{\"a\":1}"));
    }

    #[test]
    fn test_lenient_decode_returns_raw() {
        let codec = Codec::default();
        let bogus = Payload {
            data: Bytes::from_static(b"not zstd at all"),
            compressed: true,
        };
        assert_eq!(codec.decode(&bogus), Bytes::from_static(b"not zstd at all"));
    }

    #[test]
    fn test_strict_decode_surfaces_compression_error() {
        let codec = Codec::default();
        let bogus = Payload {
            data: Bytes::from_static(b"\x28\xb5\x2f\xfd garbage"),
            compressed: true,
        };
        let err = crate::error::CacheError::from(codec.try_decode(&bogus).unwrap_err());
        assert!(matches!(err, crate::error::CacheError::Compression(_)));
    }
}
