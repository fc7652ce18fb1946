// ============================================================================
// Error Taxonomy
// ============================================================================
//
// Two layers:
// - StoreError:      what a document store driver reports (physical)
// - EventStoreError: what engine callers see (semantic)
//
// The conflict classifier is the only place that turns the first into the
// second for write paths.
//
// ============================================================================

/// Physical errors reported by a [`DocumentStore`](crate::event_sourcing::DocumentStore).
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// A unique index rejected the write.
    #[error("duplicate key in {collection}: {key}")]
    DuplicateKey { collection: &'static str, key: String },

    /// Connectivity loss, timeout or any other transient driver failure.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A persisted document could not be decoded.
    #[error("corrupt document: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn unavailable<E: std::fmt::Display>(error: E) -> Self {
        StoreError::Unavailable(error.to_string())
    }

    pub fn corrupt<E: std::fmt::Display>(error: E) -> Self {
        StoreError::Corrupt(error.to_string())
    }
}

/// Errors surfaced by the event storage engine.
#[derive(Debug, thiserror::Error)]
pub enum EventStoreError {
    /// The aggregate already has an event stream (duplicate first commit).
    #[error("aggregate '{aggregate_id}' already has an event stream")]
    AggregateStreamCreationConflict { aggregate_id: String },

    /// A non-initial commit collided with one already stored.
    #[error("conflicting append for aggregate '{aggregate_id}' at sequence {sequence_number}")]
    AppendConflict {
        aggregate_id: String,
        sequence_number: u64,
    },

    /// Uniqueness violation reported without a classifying resolver.
    #[error("storage conflict: {0}")]
    StorageConflict(String),

    /// Transient storage failure. Safe to retry at the caller's discretion.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Payload, metadata or document (de)serialization failed.
    #[error("serialization failure: {0}")]
    SerializationFailure(String),

    /// An upcaster rejected a stored payload.
    #[error("failed to upcast '{payload_type}': {source}")]
    UpcastFailure {
        payload_type: String,
        #[source]
        source: anyhow::Error,
    },

    /// Empty, cross-aggregate or non-contiguous batch.
    #[error("invalid batch: {0}")]
    InvalidBatch(String),

    /// A tracking token string could not be decoded.
    #[error("invalid tracking token: {0}")]
    InvalidToken(String),
}

impl EventStoreError {
    /// True for conflict kinds raised by a uniqueness violation.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            EventStoreError::AggregateStreamCreationConflict { .. }
                | EventStoreError::AppendConflict { .. }
                | EventStoreError::StorageConflict(_)
        )
    }
}

impl From<serde_json::Error> for EventStoreError {
    fn from(error: serde_json::Error) -> Self {
        EventStoreError::SerializationFailure(error.to_string())
    }
}

// Read paths and unclassified write failures. Duplicate keys on the write
// path go through the conflict classifier instead.
impl From<StoreError> for EventStoreError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::Unavailable(message) => EventStoreError::StorageUnavailable(message),
            StoreError::Corrupt(message) => EventStoreError::SerializationFailure(message),
            duplicate @ StoreError::DuplicateKey { .. } => {
                EventStoreError::StorageConflict(duplicate.to_string())
            }
        }
    }
}

pub type Result<T, E = EventStoreError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_kinds() {
        let creation = EventStoreError::AggregateStreamCreationConflict {
            aggregate_id: "a".to_string(),
        };
        let append = EventStoreError::AppendConflict {
            aggregate_id: "a".to_string(),
            sequence_number: 3,
        };
        let unclassified = EventStoreError::StorageConflict("dup".to_string());
        let transient = EventStoreError::StorageUnavailable("timeout".to_string());

        assert!(creation.is_conflict());
        assert!(append.is_conflict());
        assert!(unclassified.is_conflict());
        assert!(!transient.is_conflict());
    }

    #[test]
    fn test_error_messages_name_the_aggregate() {
        let err = EventStoreError::AppendConflict {
            aggregate_id: "order-1".to_string(),
            sequence_number: 7,
        };
        let message = err.to_string();
        assert!(message.contains("order-1"));
        assert!(message.contains('7'));
    }

    #[test]
    fn test_serde_error_maps_to_serialization_failure() {
        let parse: std::result::Result<serde_json::Value, _> = serde_json::from_str("{not json");
        let err: EventStoreError = parse.unwrap_err().into();
        assert!(matches!(err, EventStoreError::SerializationFailure(_)));
    }
}
