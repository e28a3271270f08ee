//! Session results and progress events.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use shelfsync_common::{LibraryIdentifier, ObjectKind};

use crate::conflict::Conflict;

/// Why a library did not finish syncing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// Transport failures or version conflicts outlasted the retry budget.
    RetriesExhausted { attempts: u32, last_error: String },
    /// A local store transaction failed. Never retried.
    Store(String),
    /// A conflict was skipped or nobody was listening for it.
    UnresolvedConflict(Conflict),
    /// The server refused these objects, as `"<kind> <key>"`. They stay dirty.
    ObjectsRejected { keys: Vec<String> },
    /// Anything else that stopped the library.
    Fatal(String),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::RetriesExhausted {
                attempts,
                last_error,
            } => write!(f, "gave up after {} attempts: {}", attempts, last_error),
            FailureReason::Store(message) => write!(f, "store error: {}", message),
            FailureReason::UnresolvedConflict(conflict) => {
                write!(f, "unresolved conflict: {}", conflict)
            }
            FailureReason::ObjectsRejected { keys } => {
                write!(f, "server rejected {}", keys.join(", "))
            }
            FailureReason::Fatal(message) => f.write_str(message),
        }
    }
}

/// Terminal result of a sync session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Every queued library finished.
    AllSynced,
    /// At least one library failed; the rest finished.
    PartiallyFailed(BTreeMap<LibraryIdentifier, FailureReason>),
    /// The session was cancelled before it finished.
    Cancelled,
}

impl SessionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, SessionOutcome::AllSynced)
    }
}

/// Progress reported while a session runs.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    LibraryQueued(LibraryIdentifier),
    LibraryStarted(LibraryIdentifier),
    /// Skipped because it is local-only or unknown on both sides.
    LibrarySkipped(LibraryIdentifier),
    ObjectsDownloaded {
        library: LibraryIdentifier,
        kind: ObjectKind,
        count: usize,
    },
    BatchUploaded {
        library: LibraryIdentifier,
        kind: ObjectKind,
        synced: usize,
        failed: usize,
    },
    DeletionsUploaded {
        library: LibraryIdentifier,
        kind: ObjectKind,
        count: usize,
    },
    RetryScheduled {
        library: LibraryIdentifier,
        attempt: u32,
        delay: Duration,
    },
    ConflictDetected {
        library: LibraryIdentifier,
        conflict: Conflict,
    },
    ConflictResolved(LibraryIdentifier),
    LibraryCompleted(LibraryIdentifier),
    LibraryFailed {
        library: LibraryIdentifier,
        reason: FailureReason,
    },
}
