use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::StoreError;
use crate::event_sourcing::commit::{Commit, CommitKey};
use crate::event_sourcing::core::SnapshotDocument;
use super::{DocumentStore, StoreResult};

// ============================================================================
// In-Memory Document Store
// ============================================================================
//
// Keys are assigned under the write lock: the commit timestamp is clamped to
// be no earlier than the previous commit's and the id is a fresh UUIDv7, so
// the global timeline is exactly insertion order.
//
// with_writer_clock keeps the writer's key instead, like backends ordered by
// the writers' clocks: a slow writer can land a commit behind newer ones.
//
// ============================================================================

const COMMITS: &str = "event_commits";
const SNAPSHOTS: &str = "snapshots";

#[derive(Debug)]
pub struct MemoryDocumentStore {
    inner: RwLock<Collections>,
    // Zero: keys follow insertion order
    look_back: Duration,
}

#[derive(Debug, Default)]
struct Collections {
    timeline: BTreeMap<CommitKey, Commit>,
    // aggregate_id -> first_sequence -> timeline key
    streams: HashMap<String, BTreeMap<u64, CommitKey>>,
    snapshots: HashMap<String, BTreeMap<u64, SnapshotDocument>>,
    outage: Option<String>,
}

impl Collections {
    fn ensure_available(&self) -> StoreResult<()> {
        match &self.outage {
            Some(reason) => Err(StoreError::Unavailable(reason.clone())),
            None => Ok(()),
        }
    }
}

impl Default for MemoryDocumentStore {
    fn default() -> Self {
        Self::with_writer_clock(Duration::zero())
    }
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store that keeps each commit's own key; commits may land up to
    /// `look_back` behind the newest one.
    pub fn with_writer_clock(look_back: Duration) -> Self {
        Self {
            inner: RwLock::default(),
            look_back,
        }
    }

    /// Simulate an outage: every operation fails with `Unavailable` until cleared.
    pub async fn set_outage(&self, reason: Option<&str>) {
        self.inner.write().await.outage = reason.map(str::to_string);
    }

    pub async fn commit_count(&self) -> usize {
        self.inner.read().await.timeline.len()
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn insert_commit(&self, mut commit: Commit) -> StoreResult<CommitKey> {
        let mut guard = self.inner.write().await;
        let collections = &mut *guard;
        collections.ensure_available()?;

        let stream = collections.streams.entry(commit.aggregate_id.clone()).or_default();
        if stream.contains_key(&commit.first_sequence) {
            return Err(StoreError::DuplicateKey {
                collection: COMMITS,
                key: format!("{}/{}", commit.aggregate_id, commit.first_sequence),
            });
        }

        if self.look_back <= Duration::zero() {
            if let Some(last) = collections.timeline.keys().next_back() {
                if commit.commit_timestamp < last.timestamp {
                    commit.commit_timestamp = last.timestamp;
                }
            }
            commit.commit_id = Uuid::now_v7();
        }

        let key = commit.key();
        stream.insert(commit.first_sequence, key);
        collections.timeline.insert(key, commit);
        Ok(key)
    }

    fn look_back(&self) -> Duration {
        self.look_back
    }

    async fn last_sequence_number(&self, aggregate_id: &str) -> StoreResult<Option<u64>> {
        let collections = self.inner.read().await;
        collections.ensure_available()?;

        let last = collections
            .streams
            .get(aggregate_id)
            .and_then(|stream| stream.values().next_back())
            .and_then(|key| collections.timeline.get(key))
            .map(|commit| commit.last_sequence);
        Ok(last)
    }

    async fn aggregate_commits(
        &self,
        aggregate_id: &str,
        from_sequence: u64,
        limit: usize,
    ) -> StoreResult<Vec<Commit>> {
        let collections = self.inner.read().await;
        collections.ensure_available()?;

        let Some(stream) = collections.streams.get(aggregate_id) else {
            return Ok(Vec::new());
        };

        let commits = stream
            .values()
            .filter_map(|key| collections.timeline.get(key))
            .filter(|commit| commit.last_sequence >= from_sequence)
            .take(limit)
            .cloned()
            .collect();
        Ok(commits)
    }

    async fn commits_after(
        &self,
        from: Option<&CommitKey>,
        inclusive: bool,
        limit: usize,
    ) -> StoreResult<Vec<Commit>> {
        let collections = self.inner.read().await;
        collections.ensure_available()?;

        let lower = match from {
            None => Bound::Unbounded,
            Some(key) if inclusive => Bound::Included(*key),
            Some(key) => Bound::Excluded(*key),
        };

        let commits = collections
            .timeline
            .range((lower, Bound::Unbounded))
            .take(limit)
            .map(|(_, commit)| commit.clone())
            .collect();
        Ok(commits)
    }

    async fn first_commit_with_event_since(
        &self,
        instant: DateTime<Utc>,
    ) -> StoreResult<Option<CommitKey>> {
        let collections = self.inner.read().await;
        collections.ensure_available()?;

        let key = collections
            .timeline
            .iter()
            .find(|(_, commit)| commit.max_event_timestamp().is_some_and(|t| t >= instant))
            .map(|(key, _)| *key);
        Ok(key)
    }

    async fn last_commit(&self) -> StoreResult<Option<Commit>> {
        let collections = self.inner.read().await;
        collections.ensure_available()?;
        Ok(collections.timeline.values().next_back().cloned())
    }

    async fn insert_snapshot(&self, snapshot: SnapshotDocument) -> StoreResult<()> {
        let mut collections = self.inner.write().await;
        collections.ensure_available()?;

        let history = collections.snapshots.entry(snapshot.aggregate_id.clone()).or_default();
        if history.contains_key(&snapshot.sequence_number) {
            return Err(StoreError::DuplicateKey {
                collection: SNAPSHOTS,
                key: format!("{}/{}", snapshot.aggregate_id, snapshot.sequence_number),
            });
        }
        history.insert(snapshot.sequence_number, snapshot);
        Ok(())
    }

    async fn delete_snapshots_before(&self, aggregate_id: &str, sequence_number: u64) -> StoreResult<u64> {
        let mut collections = self.inner.write().await;
        collections.ensure_available()?;

        let Some(history) = collections.snapshots.get_mut(aggregate_id) else {
            return Ok(0);
        };
        let before = history.len();
        history.retain(|seq, _| *seq >= sequence_number);
        Ok((before - history.len()) as u64)
    }

    async fn snapshots(&self, aggregate_id: &str) -> StoreResult<Vec<SnapshotDocument>> {
        let collections = self.inner.read().await;
        collections.ensure_available()?;

        let snapshots = collections
            .snapshots
            .get(aggregate_id)
            .map(|history| history.values().rev().cloned().collect())
            .unwrap_or_default();
        Ok(snapshots)
    }
}

// ============================================================================
// Tests
// ============================================================================
