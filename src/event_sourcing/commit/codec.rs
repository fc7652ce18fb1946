use serde::{Deserialize, Serialize};
use uuid::Uuid;
use chrono::{DateTime, SubsecRound, Utc};

use crate::error::{EventStoreError, Result};
use crate::event_sourcing::core::EventData;
use super::token::CommitKey;

// ============================================================================
// Commit Codec
// ============================================================================
//
// A commit is the physical unit of persistence: one document holding a
// contiguous run [first..=last] of a single aggregate's events. Events inside
// a commit only store their offset; the absolute sequence number is
// reconstructed as first + offset on decode.
//
// ============================================================================

/// One event inside a commit document.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct CommitEntry {
    pub offset: u32,
    pub event_id: Uuid,
    pub payload_type: String,
    pub payload_revision: Option<String>,
    pub payload: Vec<u8>,
    pub metadata: Vec<u8>,
    pub timestamp: DateTime<Utc>,
}

/// Persisted commit record. Unique on `(aggregate_id, first_sequence)`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Commit {
    pub commit_id: Uuid,
    pub aggregate_id: String,
    pub aggregate_type: String,
    pub first_sequence: u64,
    pub last_sequence: u64,
    pub commit_timestamp: DateTime<Utc>,
    pub events: Vec<CommitEntry>,
}

impl Commit {
    /// Position of this commit in the global timeline.
    pub fn key(&self) -> CommitKey {
        CommitKey::new(self.commit_timestamp, self.commit_id)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Number of events as stored in a tracking token.
    pub fn event_count(&self) -> u32 {
        u32::try_from(self.events.len()).unwrap_or(u32::MAX)
    }

    /// Latest event timestamp in the commit; events need not be time-ordered.
    pub fn max_event_timestamp(&self) -> Option<DateTime<Utc>> {
        self.events.iter().map(|e| e.timestamp).max()
    }

    pub fn contains_sequence(&self, sequence_number: u64) -> bool {
        (self.first_sequence..=self.last_sequence).contains(&sequence_number)
    }
}

/// Pack an ordered, contiguous run of one aggregate's events into a commit.
pub fn encode(aggregate_id: &str, events: &[EventData]) -> Result<Commit> {
    let first = events
        .first()
        .ok_or_else(|| EventStoreError::InvalidBatch("cannot encode an empty batch".to_string()))?;

    if u32::try_from(events.len()).is_err() {
        return Err(EventStoreError::InvalidBatch(format!(
            "batch of {} events exceeds commit capacity",
            events.len()
        )));
    }

    let first_sequence = first.sequence_number;
    let mut entries = Vec::with_capacity(events.len());

    for (offset, event) in (0u32..).zip(events) {
        if event.aggregate_id != aggregate_id {
            return Err(EventStoreError::InvalidBatch(format!(
                "event {} belongs to aggregate '{}', expected '{}'",
                event.event_id, event.aggregate_id, aggregate_id
            )));
        }
        if event.aggregate_type != first.aggregate_type {
            return Err(EventStoreError::InvalidBatch(format!(
                "mixed aggregate types '{}' and '{}' for aggregate '{}'",
                first.aggregate_type, event.aggregate_type, aggregate_id
            )));
        }
        let expected = first_sequence + u64::from(offset);
        if event.sequence_number != expected {
            return Err(EventStoreError::InvalidBatch(format!(
                "non-contiguous sequence for aggregate '{}': expected {}, got {}",
                aggregate_id, expected, event.sequence_number
            )));
        }

        entries.push(CommitEntry {
            offset,
            event_id: event.event_id,
            payload_type: event.payload_type.clone(),
            payload_revision: event.payload_revision.clone(),
            payload: event.payload.clone(),
            metadata: event.metadata.clone(),
            timestamp: event.timestamp,
        });
    }

    let last_sequence = first_sequence + (entries.len() as u64 - 1);

    Ok(Commit {
        commit_id: Uuid::now_v7(),
        aggregate_id: aggregate_id.to_string(),
        aggregate_type: first.aggregate_type.clone(),
        first_sequence,
        last_sequence,
        // Stores with millisecond resolution must round-trip the key exactly
        commit_timestamp: Utc::now().trunc_subsecs(3),
        events: entries,
    })
}

/// Lazily unpack the events of a commit, in stored order.
pub fn decode(commit: &Commit) -> impl Iterator<Item = EventData> + '_ {
    commit.events.iter().map(move |entry| EventData {
        event_id: entry.event_id,
        aggregate_id: commit.aggregate_id.clone(),
        aggregate_type: commit.aggregate_type.clone(),
        sequence_number: commit.first_sequence + u64::from(entry.offset),
        payload_type: entry.payload_type.clone(),
        payload_revision: entry.payload_revision.clone(),
        payload: entry.payload.clone(),
        metadata: entry.metadata.clone(),
        timestamp: entry.timestamp,
    })
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn event(aggregate_id: &str, sequence_number: u64) -> EventData {
        EventData {
            event_id: Uuid::new_v4(),
            aggregate_id: aggregate_id.to_string(),
            aggregate_type: "Account".to_string(),
            sequence_number,
            payload_type: "Deposited".to_string(),
            payload_revision: Some("1".to_string()),
            payload: format!("{{\"seq\":{}}}", sequence_number).into_bytes(),
            metadata: b"{\"trace\":\"t\"}".to_vec(),
            timestamp: Utc::now() - Duration::seconds(sequence_number as i64),
        }
    }

    #[test]
    fn test_encode_sets_bounds_and_offsets() {
        let events: Vec<_> = (3..6).map(|s| event("acc-1", s)).collect();
        let commit = encode("acc-1", &events).unwrap();

        assert_eq!(commit.first_sequence, 3);
        assert_eq!(commit.last_sequence, 5);
        assert_eq!(commit.aggregate_type, "Account");
        let offsets: Vec<u32> = commit.events.iter().map(|e| e.offset).collect();
        assert_eq!(offsets, vec![0, 1, 2]);
        assert!(commit.contains_sequence(4));
        assert!(!commit.contains_sequence(6));
    }

    #[test]
    fn test_decode_is_lossless() {
        let events: Vec<_> = (0..4).map(|s| event("acc-1", s)).collect();
        let commit = encode("acc-1", &events).unwrap();

        let decoded: Vec<EventData> = decode(&commit).collect();
        assert_eq!(decoded, events);
    }

    #[test]
    fn test_decode_is_restartable() {
        let events: Vec<_> = (0..3).map(|s| event("acc-1", s)).collect();
        let commit = encode("acc-1", &events).unwrap();

        let first_pass: Vec<EventData> = decode(&commit).collect();
        let second_pass: Vec<EventData> = decode(&commit).collect();
        assert_eq!(first_pass, second_pass);
    }

    #[test]
    fn test_empty_batch_is_rejected() {
        assert!(matches!(encode("acc-1", &[]), Err(EventStoreError::InvalidBatch(_))));
    }

    #[test]
    fn test_gap_is_rejected() {
        let events = vec![event("acc-1", 0), event("acc-1", 2)];
        assert!(matches!(encode("acc-1", &events), Err(EventStoreError::InvalidBatch(_))));
    }

    #[test]
    fn test_foreign_aggregate_is_rejected() {
        let events = vec![event("acc-1", 0), event("acc-2", 1)];
        assert!(matches!(encode("acc-1", &events), Err(EventStoreError::InvalidBatch(_))));
    }

    #[test]
    fn test_max_event_timestamp_ignores_order() {
        let mut events: Vec<_> = (0..3).map(|s| event("acc-1", s)).collect();
        let latest = Utc::now() + Duration::hours(1);
        events[1].timestamp = latest;
        let commit = encode("acc-1", &events).unwrap();

        assert_eq!(commit.max_event_timestamp(), Some(latest));
    }
}
