//! Opaque value encoding.
//!
//! The core never interprets user values; an injected codec turns them
//! into bytes and back. A decode failure is reported per entry and the
//! entry is treated as absent, so one corrupt value cannot poison a list
//! or a cache.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;

use crate::error::{CoordError, CoordResult};

/// Byte encoder/decoder for a value type.
pub trait Codec<V>: Send + Sync {
    fn encode(&self, value: &V) -> CoordResult<Vec<u8>>;
    fn decode(&self, bytes: &[u8]) -> CoordResult<V>;
}

/// Default codec: bincode over serde.
pub struct BincodeCodec<V> {
    _marker: PhantomData<fn() -> V>,
}

impl<V> BincodeCodec<V> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<V> Default for BincodeCodec<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> Codec<V> for BincodeCodec<V>
where
    V: Serialize + DeserializeOwned + Send + Sync,
{
    fn encode(&self, value: &V) -> CoordResult<Vec<u8>> {
        bincode::serialize(value).map_err(|e| CoordError::decode(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> CoordResult<V> {
        bincode::deserialize(bytes).map_err(|e| CoordError::decode(e.to_string()))
    }
}

/// Identity codec for values that are already raw bytes (the HA-info map
/// stores user bytes untouched).
pub struct BytesCodec;

impl Codec<Vec<u8>> for BytesCodec {
    fn encode(&self, value: &Vec<u8>) -> CoordResult<Vec<u8>> {
        Ok(value.clone())
    }

    fn decode(&self, bytes: &[u8]) -> CoordResult<Vec<u8>> {
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::SubscriberInfo;

    #[test]
    fn test_bincode_codec_roundtrip() {
        let codec = BincodeCodec::new();
        let sub = SubscriberInfo::new("node-1", "127.0.0.1", 5501);
        let bytes = codec.encode(&sub).unwrap();
        let back: SubscriberInfo = codec.decode(&bytes).unwrap();
        assert_eq!(back, sub);
    }

    #[test]
    fn test_bincode_codec_rejects_garbage() {
        let codec: BincodeCodec<SubscriberInfo> = BincodeCodec::new();
        let err = codec.decode(&[0xFF, 0x01]).unwrap_err();
        assert!(matches!(err, CoordError::Decode { .. }));
    }

    #[test]
    fn test_bytes_codec_is_identity() {
        let codec = BytesCodec;
        let value = vec![1u8, 2, 3];
        assert_eq!(codec.encode(&value).unwrap(), value);
        assert_eq!(codec.decode(&value).unwrap(), value);
    }
}
