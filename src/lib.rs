// ============================================================================
// Commit Event Store
// ============================================================================
//
// Event storage engine that persists each appended batch of an aggregate's
// events as one commit document, streams the global commit timeline with
// resumable tracking tokens, and keeps aggregate snapshots.
//
// ============================================================================

pub mod config;
pub mod error;
pub mod event_sourcing;
pub mod metrics;
pub mod utils;

pub use config::{AppConfig, Backend, EngineConfig, ScyllaConfig, SnapshotRetention};
pub use error::{EventStoreError, Result, StoreError};
pub use event_sourcing::{
    DomainEventMessage, DomainSnapshot, EventStorageEngine, ReadMode, TrackedEventMessage, TrackingToken,
};
