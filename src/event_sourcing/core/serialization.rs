use std::fmt::Debug;

use crate::error::{EventStoreError, Result};
use super::event::MetaData;

// ============================================================================
// Payload Serialization
// ============================================================================
//
// The engine stores payloads and metadata as opaque bytes. A Serializer
// converts between those bytes and JSON values; typed conversion happens at
// the message edges (DomainEventMessage::from_payload / payload_as).
//
// ============================================================================

/// Converts payloads between their JSON form and stored bytes.
pub trait Serializer: Send + Sync + Debug {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    fn serialize(&self, value: &serde_json::Value) -> Result<Vec<u8>>;

    fn deserialize(&self, bytes: &[u8]) -> Result<serde_json::Value>;

    fn serialize_metadata(&self, metadata: &MetaData) -> Result<Vec<u8>> {
        if metadata.is_empty() {
            return Ok(Vec::new());
        }
        Ok(serde_json::to_vec(metadata)?)
    }

    fn deserialize_metadata(&self, bytes: &[u8]) -> Result<MetaData> {
        if bytes.is_empty() {
            return Ok(MetaData::new());
        }
        serde_json::from_slice(bytes)
            .map_err(|e| EventStoreError::SerializationFailure(format!("metadata: {}", e)))
    }
}

/// UTF-8 JSON serializer backed by serde_json.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn name(&self) -> &'static str {
        "json"
    }

    fn serialize(&self, value: &serde_json::Value) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<serde_json::Value> {
        serde_json::from_slice(bytes)
            .map_err(|e| EventStoreError::SerializationFailure(format!("payload: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_serializer_payload() {
        let serializer = JsonSerializer;
        let value = serde_json::json!({"name": "widget", "count": 2});

        let bytes = serializer.serialize(&value).unwrap();
        assert_eq!(serializer.deserialize(&bytes).unwrap(), value);
    }

    #[test]
    fn test_empty_metadata_is_stored_as_no_bytes() {
        let serializer = JsonSerializer;
        let bytes = serializer.serialize_metadata(&MetaData::new()).unwrap();

        assert!(bytes.is_empty());
        assert!(serializer.deserialize_metadata(&bytes).unwrap().is_empty());
    }

    #[test]
    fn test_garbage_bytes_fail_to_deserialize() {
        let serializer = JsonSerializer;
        let result = serializer.deserialize(b"\x00\x01not-json");
        assert!(matches!(result, Err(EventStoreError::SerializationFailure(_))));
    }
}
