//! The serializer is an external collaborator: any bidirectional
//! bytes<->value codec satisfying `loads(dumps(x)) == x`. The crate
//! ships a default JSON implementation so the library is usable out of
//! the box; callers may supply their own (msgpack, protobuf, ...).
//!
//! The trait operates on `serde_json::Value` rather than a generic
//! `T` so it stays object-safe and can be stored as `Arc<dyn
//! Serializer>` on the engine; `Queue::publish` does the `T <->
//! Value` conversion with plain `serde_json::to_value`/`from_value`
//! before handing off to the configured serializer.

use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

pub trait Serializer: Send + Sync {
    fn dumps(&self, value: &Value) -> Result<Vec<u8>>;
    fn loads(&self, bytes: &[u8]) -> Result<Value>;
}

/// Default serializer, backed by `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn dumps(&self, value: &Value) -> Result<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| Error::Serialization(e.to_string()))
    }

    fn loads(&self, bytes: &[u8]) -> Result<Value> {
        serde_json::from_slice(bytes).map_err(|e| Error::Serialization(e.to_string()))
    }
}

/// Encode a user value through `serializer`, going via `Value` so the
/// serializer trait itself can stay object-safe.
pub fn encode<T: Serialize>(serializer: &dyn Serializer, value: &T) -> Result<Vec<u8>> {
    let value = serde_json::to_value(value).map_err(|e| Error::Serialization(e.to_string()))?;
    serializer.dumps(&value)
}

/// Decode bytes produced by `encode` back into a user value.
pub fn decode<T: DeserializeOwned>(serializer: &dyn Serializer, bytes: &[u8]) -> Result<T> {
    let value = serializer.loads(bytes)?;
    serde_json::from_value(value).map_err(|e| Error::Serialization(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Sample {
        data: String,
        count: u32,
    }

    #[test]
    fn round_trip_preserves_value() {
        let serializer = JsonSerializer;
        let original = Sample {
            data: "hello".into(),
            count: 7,
        };

        let bytes = encode(&serializer, &original).unwrap();
        let restored: Sample = decode(&serializer, &bytes).unwrap();

        assert_eq!(original, restored);
    }
}
