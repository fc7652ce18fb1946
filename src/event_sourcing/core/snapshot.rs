use serde::{de::DeserializeOwned, Deserialize, Serialize};
use chrono::{DateTime, Utc};

use crate::error::{EventStoreError, Result};

// ============================================================================
// Snapshots
// ============================================================================

/// Cached aggregate state at a given sequence number.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct DomainSnapshot {
    pub aggregate_id: String,
    pub aggregate_type: String,
    pub sequence_number: u64,
    pub payload_type: String,
    pub payload_revision: Option<String>,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl DomainSnapshot {
    pub fn from_state<S: Serialize>(
        aggregate_type: &str,
        aggregate_id: &str,
        sequence_number: u64,
        payload_type: &str,
        state: &S,
    ) -> Result<Self> {
        Ok(Self {
            aggregate_id: aggregate_id.to_string(),
            aggregate_type: aggregate_type.to_string(),
            sequence_number,
            payload_type: payload_type.to_string(),
            payload_revision: None,
            payload: serde_json::to_value(state)?,
            timestamp: Utc::now(),
        })
    }

    pub fn state_as<S: DeserializeOwned>(&self) -> Result<S> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            EventStoreError::SerializationFailure(format!("snapshot '{}': {}", self.payload_type, e))
        })
    }
}

/// Persisted snapshot record. Unique on `(aggregate_id, sequence_number)`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct SnapshotDocument {
    pub aggregate_id: String,
    pub aggregate_type: String,
    pub sequence_number: u64,
    pub payload_type: String,
    pub payload_revision: Option<String>,
    pub payload: Vec<u8>,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct CartState {
        items: Vec<String>,
    }

    #[test]
    fn test_snapshot_state_roundtrip() {
        let state = CartState { items: vec!["a".to_string(), "b".to_string()] };
        let snapshot = DomainSnapshot::from_state("Cart", "cart-9", 12, "CartState", &state).unwrap();

        assert_eq!(snapshot.sequence_number, 12);
        assert_eq!(snapshot.state_as::<CartState>().unwrap(), state);
    }
}
