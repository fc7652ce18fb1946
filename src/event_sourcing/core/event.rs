use serde::{de::DeserializeOwned, Deserialize, Serialize};
use uuid::Uuid;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

use crate::error::{EventStoreError, Result};
use crate::event_sourcing::commit::TrackingToken;

// ============================================================================
// Event Representations
// ============================================================================
//
// - DomainEventMessage: what callers append and read (payload as JSON value)
// - EventData:          the serialized form the codec packs into commits
// - Tracked*:           either of the above paired with a resumable token
//
// ============================================================================

/// Event metadata: string keys, arbitrary JSON values.
pub type MetaData = BTreeMap<String, serde_json::Value>;

/// Caller-facing domain event.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct DomainEventMessage {
    // Identity
    pub event_id: Uuid,
    pub aggregate_id: String,
    pub aggregate_type: String,
    pub sequence_number: u64,

    // Payload type information
    pub payload_type: String,
    pub payload_revision: Option<String>,

    pub payload: serde_json::Value,
    pub metadata: MetaData,

    pub timestamp: DateTime<Utc>,
}

impl DomainEventMessage {
    pub fn new(
        aggregate_type: &str,
        aggregate_id: &str,
        sequence_number: u64,
        payload_type: &str,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            aggregate_id: aggregate_id.to_string(),
            aggregate_type: aggregate_type.to_string(),
            sequence_number,
            payload_type: payload_type.to_string(),
            payload_revision: None,
            payload,
            metadata: MetaData::new(),
            timestamp: Utc::now(),
        }
    }

    /// Build a message from any serializable payload.
    pub fn from_payload<P: Serialize>(
        aggregate_type: &str,
        aggregate_id: &str,
        sequence_number: u64,
        payload_type: &str,
        payload: &P,
    ) -> Result<Self> {
        let value = serde_json::to_value(payload)?;
        Ok(Self::new(aggregate_type, aggregate_id, sequence_number, payload_type, value))
    }

    pub fn with_event_id(mut self, event_id: Uuid) -> Self {
        self.event_id = event_id;
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_revision(mut self, revision: &str) -> Self {
        self.payload_revision = Some(revision.to_string());
        self
    }

    pub fn with_metadata(mut self, key: &str, value: serde_json::Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }

    /// Deserialize the (already upcast) payload into a concrete type.
    pub fn payload_as<P: DeserializeOwned>(&self) -> Result<P> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            EventStoreError::SerializationFailure(format!(
                "payload '{}' does not match requested type: {}",
                self.payload_type, e
            ))
        })
    }
}

/// Serialized event as stored inside a commit.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct EventData {
    pub event_id: Uuid,
    pub aggregate_id: String,
    pub aggregate_type: String,
    pub sequence_number: u64,
    pub payload_type: String,
    pub payload_revision: Option<String>,
    pub payload: Vec<u8>,
    pub metadata: Vec<u8>,
    pub timestamp: DateTime<Utc>,
}

/// Serialized event paired with the token that resumes right after it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrackedEventData {
    pub token: TrackingToken,
    pub event: EventData,
}

/// Deserialized, upcast event paired with its resumable token.
#[derive(Clone, Debug, PartialEq)]
pub struct TrackedEventMessage {
    pub token: TrackingToken,
    pub event: DomainEventMessage,
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct ItemAdded {
        sku: String,
        quantity: u32,
    }

    #[test]
    fn test_message_builder() {
        let event_id = Uuid::new_v4();
        let timestamp = Utc::now();
        let message = DomainEventMessage::new("Cart", "cart-1", 4, "ItemAdded", serde_json::json!({}))
            .with_event_id(event_id)
            .with_timestamp(timestamp)
            .with_revision("2")
            .with_metadata("user", serde_json::json!("alice"));

        assert_eq!(message.event_id, event_id);
        assert_eq!(message.timestamp, timestamp);
        assert_eq!(message.sequence_number, 4);
        assert_eq!(message.payload_revision.as_deref(), Some("2"));
        assert_eq!(message.metadata.get("user"), Some(&serde_json::json!("alice")));
    }

    #[test]
    fn test_typed_payload() {
        let payload = ItemAdded { sku: "A-1".to_string(), quantity: 3 };
        let message = DomainEventMessage::from_payload("Cart", "cart-1", 0, "ItemAdded", &payload).unwrap();

        let back: ItemAdded = message.payload_as().unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn test_payload_type_mismatch_is_serialization_failure() {
        let message = DomainEventMessage::new("Cart", "cart-1", 0, "ItemAdded", serde_json::json!("text"));
        let result: Result<ItemAdded> = message.payload_as();
        assert!(matches!(result, Err(EventStoreError::SerializationFailure(_))));
    }
}
