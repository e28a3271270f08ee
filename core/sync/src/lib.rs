//! Shelfsync Sync Engine
//!
//! Synchronizes local libraries with a versioned remote API:
//! - Download and merge of remote changes with field-level rebase
//! - Ordered, batched upload of local changes
//! - Conflict detection with caller-chosen resolutions
//! - Per-library retry with progressive delays, plus session backoff
//! - Cooperative cancellation of running sessions

pub mod changeset;
pub mod conflict;
pub mod engine;
pub mod merge;
pub mod resolver;
pub mod retry;
pub mod scheduler;
pub mod state;

// Re-export main types
pub use changeset::{order_by_parent, ChangeSetBuilder, DEFAULT_BATCH_SIZE};
pub use conflict::{Conflict, ConflictDetector, ConflictResolution, ServerReport};
pub use engine::{PendingConflict, SessionHandle, SyncConfig, SyncController};
pub use merge::{merge_remote, MergeDecision};
pub use resolver::ConflictResolver;
pub use retry::{DelayIntervals, RetryConfig, RetryDelay, MAX_ATTEMPTS_COUNT};
pub use scheduler::{FailureDecision, LibraryPhase, SessionBackoff, SyncScheduler};
pub use state::{FailureReason, SessionOutcome, SyncEvent};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_exports() {
        let _config = SyncConfig::default();
        let _retry_config = RetryConfig::default();
        let _builder = ChangeSetBuilder::default();
        let _detector = ConflictDetector::new();
        let _backoff = SessionBackoff::default();
    }
}
