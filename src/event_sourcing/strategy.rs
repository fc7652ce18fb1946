use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::Result;
use crate::event_sourcing::commit::{encode, Commit};
use crate::event_sourcing::core::EventData;

// ============================================================================
// Storage Strategies
// ============================================================================
//
// How one aggregate's contiguous run of events becomes documents:
//
// - DocumentPerCommit: the whole run is one commit document (atomic)
// - DocumentPerEvent:  every event is its own single-event commit
//
// Both produce the same Commit shape, so the store, the classifier and the
// streaming reads do not care which one is configured.
//
// ============================================================================

/// Maps a run of events onto commit documents.
pub trait StorageStrategy: Send + Sync + Debug {
    fn name(&self) -> &'static str;

    /// `events` is one aggregate's run, already checked for ordering by the engine.
    fn create_documents(&self, aggregate_id: &str, events: &[EventData]) -> Result<Vec<Commit>>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DocumentPerCommit;

impl StorageStrategy for DocumentPerCommit {
    fn name(&self) -> &'static str {
        "document_per_commit"
    }

    fn create_documents(&self, aggregate_id: &str, events: &[EventData]) -> Result<Vec<Commit>> {
        Ok(vec![encode(aggregate_id, events)?])
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DocumentPerEvent;

impl StorageStrategy for DocumentPerEvent {
    fn name(&self) -> &'static str {
        "document_per_event"
    }

    fn create_documents(&self, aggregate_id: &str, events: &[EventData]) -> Result<Vec<Commit>> {
        // Validate the run as a whole before splitting it up
        encode(aggregate_id, events)?;

        events
            .iter()
            .map(|event| encode(aggregate_id, std::slice::from_ref(event)))
            .collect()
    }
}

/// Configuration switch selecting a [`StorageStrategy`].
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StorageStrategyKind {
    #[default]
    DocumentPerCommit,
    DocumentPerEvent,
}

impl StorageStrategyKind {
    pub fn build(self) -> Arc<dyn StorageStrategy> {
        match self {
            StorageStrategyKind::DocumentPerCommit => Arc::new(DocumentPerCommit),
            StorageStrategyKind::DocumentPerEvent => Arc::new(DocumentPerEvent),
        }
    }
}

impl FromStr for StorageStrategyKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "commit" | "document_per_commit" => Ok(StorageStrategyKind::DocumentPerCommit),
            "event" | "document_per_event" => Ok(StorageStrategyKind::DocumentPerEvent),
            other => anyhow::bail!("unknown storage strategy '{}'", other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EventStoreError;
    use chrono::Utc;
    use uuid::Uuid;

    fn events(aggregate_id: &str, range: std::ops::Range<u64>) -> Vec<EventData> {
        range
            .map(|sequence_number| EventData {
                event_id: Uuid::new_v4(),
                aggregate_id: aggregate_id.to_string(),
                aggregate_type: "Ticket".to_string(),
                sequence_number,
                payload_type: "Opened".to_string(),
                payload_revision: None,
                payload: b"{}".to_vec(),
                metadata: Vec::new(),
                timestamp: Utc::now(),
            })
            .collect()
    }

    #[test]
    fn test_document_per_commit_packs_run() {
        let docs = DocumentPerCommit.create_documents("t-1", &events("t-1", 0..3)).unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!((docs[0].first_sequence, docs[0].last_sequence), (0, 2));
    }

    #[test]
    fn test_document_per_event_splits_run() {
        let docs = DocumentPerEvent.create_documents("t-1", &events("t-1", 5..8)).unwrap();
        let bounds: Vec<(u64, u64)> = docs.iter().map(|d| (d.first_sequence, d.last_sequence)).collect();
        assert_eq!(bounds, vec![(5, 5), (6, 6), (7, 7)]);
    }

    #[test]
    fn test_document_per_event_rejects_gaps_up_front() {
        let mut run = events("t-1", 0..3);
        run.remove(1);
        assert!(matches!(
            DocumentPerEvent.create_documents("t-1", &run),
            Err(EventStoreError::InvalidBatch(_))
        ));
    }

    #[test]
    fn test_kind_parsing_and_build() {
        assert_eq!("event".parse::<StorageStrategyKind>().unwrap(), StorageStrategyKind::DocumentPerEvent);
        assert_eq!(
            "Document_Per_Commit".parse::<StorageStrategyKind>().unwrap(),
            StorageStrategyKind::DocumentPerCommit
        );
        assert!("sharded".parse::<StorageStrategyKind>().is_err());
        assert_eq!(StorageStrategyKind::DocumentPerEvent.build().name(), "document_per_event");
    }
}
