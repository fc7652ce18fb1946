// ============================================================================
// Event Sourcing Store - Document Store Driver Seam
// ============================================================================
//
// The engine talks to persistence only through DocumentStore. A store owns
// two collections:
//
// - commits:   unique on (aggregate_id, first_sequence), globally ordered by
//              (commit_timestamp, commit_id)
// - snapshots: unique on (aggregate_id, sequence_number)
//
// Implementations:
// - MemoryDocumentStore: in-process, used by tests and the demo
// - ScyllaDocumentStore: ScyllaDB, LWT for the uniqueness constraint
//
// ============================================================================

pub mod memory;
pub mod scylla;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::fmt::Debug;

use crate::error::StoreError;
use crate::event_sourcing::commit::{Commit, CommitKey};
use crate::event_sourcing::core::SnapshotDocument;

pub use memory::MemoryDocumentStore;
pub use self::scylla::ScyllaDocumentStore;

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait DocumentStore: Send + Sync + Debug {
    /// Persist a commit atomically.
    ///
    /// Fails with [`StoreError::DuplicateKey`] when a commit with the same
    /// `(aggregate_id, first_sequence)` exists. The store may move the
    /// commit's timestamp forward and replace its id to keep the timeline
    /// ordered; the returned key is the one actually stored.
    async fn insert_commit(&self, commit: Commit) -> StoreResult<CommitKey>;

    /// How far behind the newest visible commit a commit may still become
    /// visible. Zero when keys are assigned in insertion order; readers then
    /// never look behind their position.
    fn look_back(&self) -> Duration {
        Duration::zero()
    }

    /// Highest `last_sequence` over the aggregate's commits.
    async fn last_sequence_number(&self, aggregate_id: &str) -> StoreResult<Option<u64>>;

    /// Commits of one aggregate whose range reaches `from_sequence` or
    /// beyond, ordered by `first_sequence`.
    async fn aggregate_commits(
        &self,
        aggregate_id: &str,
        from_sequence: u64,
        limit: usize,
    ) -> StoreResult<Vec<Commit>>;

    /// Commits in global order after `from` (or from the start when `None`).
    /// With `inclusive` the commit at `from` itself is returned first.
    async fn commits_after(
        &self,
        from: Option<&CommitKey>,
        inclusive: bool,
        limit: usize,
    ) -> StoreResult<Vec<Commit>>;

    /// Earliest commit in global order holding an event stamped at or after `instant`.
    async fn first_commit_with_event_since(
        &self,
        instant: DateTime<Utc>,
    ) -> StoreResult<Option<CommitKey>>;

    /// Last commit in global order.
    async fn last_commit(&self) -> StoreResult<Option<Commit>>;

    async fn insert_snapshot(&self, snapshot: SnapshotDocument) -> StoreResult<()>;

    /// Remove the aggregate's snapshots older than `sequence_number`.
    async fn delete_snapshots_before(&self, aggregate_id: &str, sequence_number: u64) -> StoreResult<u64>;

    /// All snapshots of an aggregate, newest first.
    async fn snapshots(&self, aggregate_id: &str) -> StoreResult<Vec<SnapshotDocument>>;
}
