//! Value encoding: serialize, deflate, then hash the compressed bytes.
//!
//! The content hash is taken over the compressed form, so two writes of the
//! same serialized value at the same compression level share one blob.

use distcache_common::{Error, HashKey, Result};
use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::io::{Read, Write};

/// Converts cached values to and from bytes
pub trait ValueSerializer<V>: Send + Sync {
    fn serialize(&self, value: &V) -> Result<Vec<u8>>;
    fn deserialize(&self, bytes: &[u8]) -> Result<V>;
}

/// Serializer for any serde type, using bincode
#[derive(Clone, Copy, Debug, Default)]
pub struct BincodeSerializer;

impl<V: Serialize + DeserializeOwned> ValueSerializer<V> for BincodeSerializer {
    fn serialize(&self, value: &V) -> Result<Vec<u8>> {
        bincode::serialize(value).map_err(|e| Error::serialization(e.to_string()))
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<V> {
        bincode::deserialize(bytes).map_err(|e| Error::deserialization(e.to_string()))
    }
}

/// Pass-through serializer for values that already are bytes
#[derive(Clone, Copy, Debug, Default)]
pub struct RawSerializer;

impl ValueSerializer<Vec<u8>> for RawSerializer {
    fn serialize(&self, value: &Vec<u8>) -> Result<Vec<u8>> {
        Ok(value.clone())
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        Ok(bytes.to_vec())
    }
}

/// A value ready to be stored as a blob
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncodedValue {
    pub hash: HashKey,
    pub compressed: Vec<u8>,
}

impl EncodedValue {
    pub fn len(&self) -> u64 {
        self.compressed.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.compressed.is_empty()
    }
}

/// Deflate codec
#[derive(Clone, Copy, Debug)]
pub struct ValueCodec {
    level: Compression,
}

impl Default for ValueCodec {
    fn default() -> Self {
        Self::new(6)
    }
}

impl ValueCodec {
    /// Codec at zlib level `level` (clamped to 0-9)
    pub fn new(level: u32) -> Self {
        Self {
            level: Compression::new(level.min(9)),
        }
    }

    pub fn encode(&self, serialized: &[u8]) -> Result<EncodedValue> {
        let mut encoder = ZlibEncoder::new(Vec::new(), self.level);
        encoder
            .write_all(serialized)
            .map_err(|e| Error::Compression(e.to_string()))?;
        let compressed = encoder
            .finish()
            .map_err(|e| Error::Compression(e.to_string()))?;
        Ok(EncodedValue {
            hash: HashKey::digest(&compressed),
            compressed,
        })
    }

    pub fn decode(&self, compressed: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        ZlibDecoder::new(compressed)
            .read_to_end(&mut out)
            .map_err(|e| Error::Compression(e.to_string()))?;
        Ok(out)
    }
}
