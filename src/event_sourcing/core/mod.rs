// ============================================================================
// Event Sourcing Core - Message Types and Collaborator Traits
// ============================================================================
//
// Everything here is storage-agnostic:
// - event:         caller-facing and serialized event forms
// - snapshot:      snapshot forms
// - serialization: bytes <-> JSON payloads
// - upcasting:     read-time payload schema migration
//
// ============================================================================

pub mod event;
pub mod serialization;
pub mod snapshot;
pub mod upcasting;

// Re-export core types for convenience
pub use event::{DomainEventMessage, EventData, MetaData, TrackedEventData, TrackedEventMessage};
pub use serialization::{JsonSerializer, Serializer};
pub use snapshot::{DomainSnapshot, SnapshotDocument};
pub use upcasting::{EventUpcaster, IntermediateEvent, RevisionUpcaster, UpcasterChain};
