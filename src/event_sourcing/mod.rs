// ============================================================================
// Event Sourcing Infrastructure
// ============================================================================
//
// Storage engine for event-sourced aggregates:
// - core:     message, snapshot, serializer and upcaster types
// - commit:   commit document codec and the global tracking token
// - conflict: duplicate-key classification for concurrent appenders
// - strategy: how runs of events become documents
// - store:    the document store seam and its backends
// - engine:   the storage engine tying all of the above together
//
// ============================================================================

pub mod commit;
pub mod conflict;
pub mod core;
pub mod engine;
pub mod store;
pub mod strategy;

// Re-export the public surface
pub use self::core::*;
pub use commit::{Commit, CommitEntry, CommitKey, TrackingToken};
pub use conflict::{ConflictResolver, DuplicateKeyResolver};
pub use engine::{
    AggregateHistory, EventStorageEngine, EventStorageEngineBuilder, EventSubscription, ReadMode,
    TrackedEventStream,
};
pub use store::{DocumentStore, MemoryDocumentStore, ScyllaDocumentStore, StoreResult};
pub use strategy::{DocumentPerCommit, DocumentPerEvent, StorageStrategy, StorageStrategyKind};
