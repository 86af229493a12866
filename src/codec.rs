//! Payload serialization.
//!
//! The dispatch runtime is generic over a [`PayloadCodec`]; the default is
//! JSON. Implementations must be cheap to clone since each registered
//! binding captures its own copy.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Serialization failure for one payload.
#[derive(Debug, Error)]
#[error("{operation} failed: {message}")]
pub struct CodecError {
    /// "encode" or "decode".
    pub operation: &'static str,
    /// Underlying failure description.
    pub message: String,
}

/// Pluggable payload encoding.
pub trait PayloadCodec: Clone + Send + Sync + 'static {
    /// Serialize a value into wire bytes.
    fn encode<T: Serialize>(&self, value: &T) -> Result<Bytes, CodecError>;

    /// Deserialize wire bytes into a typed value.
    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError>;
}

/// Default codec: JSON via serde.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl PayloadCodec for JsonCodec {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Bytes, CodecError> {
        serde_json::to_vec(value)
            .map(Bytes::from)
            .map_err(|e| CodecError {
                operation: "encode",
                message: e.to_string(),
            })
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError> {
        serde_json::from_slice(bytes).map_err(|e| CodecError {
            operation: "decode",
            message: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Order {
        id: u64,
        item: String,
        tags: Vec<String>,
    }

    #[test]
    fn test_round_trip() {
        let codec = JsonCodec;
        let order = Order {
            id: 7,
            item: "widget".into(),
            tags: vec!["a".into(), "b".into()],
        };
        let bytes = codec.encode(&order).unwrap();
        let back: Order = codec.decode(&bytes).unwrap();
        assert_eq!(back, order);
    }

    #[test]
    fn test_decode_failure_reports_operation() {
        let codec = JsonCodec;
        let err = codec.decode::<Order>(b"not json").unwrap_err();
        assert_eq!(err.operation, "decode");
    }
}
