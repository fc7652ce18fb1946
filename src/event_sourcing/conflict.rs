use std::fmt::Debug;

use crate::error::{EventStoreError, StoreError};

// ============================================================================
// Conflict Classifier
// ============================================================================
//
// Writers never lock or pre-reserve sequence numbers. They try the write and,
// when the store's unique index on (aggregate_id, first_sequence) rejects it,
// classify the failure:
//
//   resolver recognises duplicate, first == 0 -> AggregateStreamCreationConflict
//   resolver recognises duplicate, first >  0 -> AppendConflict
//   no resolver configured                    -> StorageConflict
//
// Only the commit key is unique. Event identifiers are not checked.
//
// ============================================================================

/// Decides whether a physical store error is a uniqueness violation.
pub trait ConflictResolver: Send + Sync + Debug {
    fn is_duplicate_key_violation(&self, error: &StoreError) -> bool;
}

/// Recognises [`StoreError::DuplicateKey`] as reported by the bundled stores.
#[derive(Debug, Clone, Copy, Default)]
pub struct DuplicateKeyResolver;

impl ConflictResolver for DuplicateKeyResolver {
    fn is_duplicate_key_violation(&self, error: &StoreError) -> bool {
        matches!(error, StoreError::DuplicateKey { .. })
    }
}

/// Turn a failed commit write into the error surfaced to the appender.
pub fn classify(
    resolver: Option<&dyn ConflictResolver>,
    aggregate_id: &str,
    first_sequence: u64,
    error: StoreError,
) -> EventStoreError {
    let classified = match resolver {
        Some(resolver) if resolver.is_duplicate_key_violation(&error) => {
            if first_sequence == 0 {
                EventStoreError::AggregateStreamCreationConflict {
                    aggregate_id: aggregate_id.to_string(),
                }
            } else {
                EventStoreError::AppendConflict {
                    aggregate_id: aggregate_id.to_string(),
                    sequence_number: first_sequence,
                }
            }
        }
        _ => EventStoreError::from(error),
    };

    if classified.is_conflict() {
        tracing::warn!(
            aggregate_id = %aggregate_id,
            first_sequence = first_sequence,
            error = %classified,
            "⚠️  Commit rejected by uniqueness constraint"
        );
    }

    classified
}

/// Metrics label for a conflict kind.
pub fn conflict_kind(error: &EventStoreError) -> &'static str {
    match error {
        EventStoreError::AggregateStreamCreationConflict { .. } => "stream_creation",
        EventStoreError::AppendConflict { .. } => "append",
        EventStoreError::StorageConflict(_) => "unclassified",
        _ => "other",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn duplicate() -> StoreError {
        StoreError::DuplicateKey {
            collection: "event_commits",
            key: "agg/0".to_string(),
        }
    }

    #[test]
    fn test_first_commit_duplicate_is_stream_creation_conflict() {
        let err = classify(Some(&DuplicateKeyResolver), "agg", 0, duplicate());
        assert!(matches!(
            err,
            EventStoreError::AggregateStreamCreationConflict { ref aggregate_id } if aggregate_id == "agg"
        ));
        assert_eq!(conflict_kind(&err), "stream_creation");
    }

    #[test]
    fn test_later_commit_duplicate_is_append_conflict() {
        let err = classify(Some(&DuplicateKeyResolver), "agg", 4, duplicate());
        assert!(matches!(err, EventStoreError::AppendConflict { sequence_number: 4, .. }));
        assert_eq!(conflict_kind(&err), "append");
    }

    #[test]
    fn test_without_resolver_duplicate_is_unclassified() {
        let err = classify(None, "agg", 0, duplicate());
        assert!(matches!(err, EventStoreError::StorageConflict(_)));
        assert_eq!(conflict_kind(&err), "unclassified");
    }

    #[test]
    fn test_transient_errors_pass_through() {
        let err = classify(
            Some(&DuplicateKeyResolver),
            "agg",
            0,
            StoreError::Unavailable("connection reset".to_string()),
        );
        assert!(matches!(err, EventStoreError::StorageUnavailable(_)));
    }

    #[derive(Debug)]
    struct NeverDuplicate;

    impl ConflictResolver for NeverDuplicate {
        fn is_duplicate_key_violation(&self, _error: &StoreError) -> bool {
            false
        }
    }

    #[test]
    fn test_resolver_that_does_not_recognise_error() {
        let err = classify(Some(&NeverDuplicate), "agg", 0, duplicate());
        assert!(matches!(err, EventStoreError::StorageConflict(_)));
    }
}
