//! Payload codecs for the fast queue
//!
//! The queue only moves framed bytes; turning values into bytes is the job
//! of a [`Codec`]. The default is [`JsonCodec`].

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::IpcError;

/// Serializes values into a caller-owned buffer and back.
pub trait Codec: Clone + Send + Sync + 'static {
    /// Append the serialized form of `value` to `buf`
    fn encode<T: Serialize + ?Sized>(&self, value: &T, buf: &mut Vec<u8>) -> Result<(), IpcError>;

    /// Deserialize a value from exactly `bytes`
    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, IpcError>;
}

/// JSON codec backed by `serde_json`
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode<T: Serialize + ?Sized>(&self, value: &T, buf: &mut Vec<u8>) -> Result<(), IpcError> {
        serde_json::to_writer(buf, value).map_err(|e| IpcError::SerializationError(e.to_string()))
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, IpcError> {
        serde_json::from_slice(bytes).map_err(|e| IpcError::DeserializationError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_encode_appends() {
        let mut buf = b"head".to_vec();
        JsonCodec.encode(&vec![1, 2, 3], &mut buf).unwrap();
        assert_eq!(&buf, b"head[1,2,3]");
    }

    #[test]
    fn test_decode_nested() {
        let mut expected = BTreeMap::new();
        expected.insert("a".to_string(), vec![Some(1u8), None]);

        let mut buf = Vec::new();
        JsonCodec.encode(&expected, &mut buf).unwrap();
        let decoded: BTreeMap<String, Vec<Option<u8>>> = JsonCodec.decode(&buf).unwrap();
        assert_eq!(decoded, expected);
    }

    #[test]
    fn test_decode_garbage_is_deserialization_error() {
        let result: Result<u32, _> = JsonCodec.decode(b"{oops");
        assert!(matches!(result, Err(IpcError::DeserializationError(_))));
    }
}
