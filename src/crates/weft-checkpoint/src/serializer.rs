//! Serialization protocol for checkpoint payloads.

use crate::error::Result;
use serde::{Deserialize, Serialize};

/// Protocol for serializing and deserializing checkpoint data.
///
/// Savers that persist to bytes pick a strategy through this trait; JSON is
/// the default, bincode is available where size and speed matter.
pub trait SerializerProtocol: Send + Sync {
    /// Serialize a value to bytes.
    fn dumps<T: Serialize>(&self, value: &T) -> Result<Vec<u8>>;

    /// Deserialize a value from bytes.
    fn loads<T: for<'de> Deserialize<'de>>(&self, data: &[u8]) -> Result<T>;

    /// Serialize to a JSON value.
    fn dumps_json<T: Serialize>(&self, value: &T) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(value)?)
    }

    /// Deserialize from a JSON value.
    fn loads_json<T: for<'de> Deserialize<'de>>(&self, value: &serde_json::Value) -> Result<T> {
        Ok(serde_json::from_value(value.clone())?)
    }
}

/// JSON-based serializer (default).
#[derive(Debug, Clone, Default)]
pub struct JsonSerializer;

impl JsonSerializer {
    pub fn new() -> Self {
        Self
    }
}

impl SerializerProtocol for JsonSerializer {
    fn dumps<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    fn loads<T: for<'de> Deserialize<'de>>(&self, data: &[u8]) -> Result<T> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// Binary serializer using bincode.
#[derive(Debug, Clone, Default)]
pub struct BincodeSerializer;

impl BincodeSerializer {
    pub fn new() -> Self {
        Self
    }
}

impl SerializerProtocol for BincodeSerializer {
    fn dumps<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        Ok(bincode::serialize(value)?)
    }

    fn loads<T: for<'de> Deserialize<'de>>(&self, data: &[u8]) -> Result<T> {
        Ok(bincode::deserialize(data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::Checkpoint;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Payload {
        thread: String,
        step: i32,
    }

    #[test]
    fn json_round_trip() {
        let serializer = JsonSerializer::new();
        let checkpoint = Checkpoint::empty();

        let bytes = serializer.dumps(&checkpoint).unwrap();
        let restored: Checkpoint = serializer.loads(&bytes).unwrap();
        assert_eq!(restored.id, checkpoint.id);
    }

    // Checkpoints themselves stay on the JSON path: bincode cannot encode
    // self-describing values like serde_json::Value.
    #[test]
    fn bincode_round_trip() {
        let serializer = BincodeSerializer::new();
        let payload = Payload {
            thread: "t-1".to_string(),
            step: 4,
        };

        let bytes = serializer.dumps(&payload).unwrap();
        let restored: Payload = serializer.loads(&bytes).unwrap();
        assert_eq!(payload, restored);
    }
}
