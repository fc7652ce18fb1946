// ============================================================================
// Commits - Physical Layout and Global Position
// ============================================================================

pub mod codec;
pub mod token;

pub use codec::{decode, encode, Commit, CommitEntry};
pub use token::{CommitKey, TrackingToken};
