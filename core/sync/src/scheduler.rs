//! Per-library sync scheduling and session backoff.
//!
//! Each library moves through `Idle -> Queued -> InFlight` and then to
//! `Completed`, `Conflicted` or `Failed`. Only a `Queued` library may start a
//! pass, so at most one pass per library is ever in flight.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

use shelfsync_common::{Error, LibraryIdentifier, Result};

use crate::retry::{DelayIntervals, RetryConfig};

/// Scheduling phase of one library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LibraryPhase {
    Idle,
    Queued,
    InFlight,
    Completed,
    Conflicted,
    Failed,
}

impl LibraryPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            LibraryPhase::Idle => "idle",
            LibraryPhase::Queued => "queued",
            LibraryPhase::InFlight => "in_flight",
            LibraryPhase::Completed => "completed",
            LibraryPhase::Conflicted => "conflicted",
            LibraryPhase::Failed => "failed",
        }
    }
}

impl fmt::Display for LibraryPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What to do after a failed pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureDecision {
    /// Wait `delay`, then the library is queued again.
    Retry { attempt: u32, delay: Duration },
    /// The library is failed for the rest of the session.
    GiveUp { attempts: u32 },
}

#[derive(Debug, Clone)]
struct LibrarySchedule {
    phase: LibraryPhase,
    /// Consecutive failed attempts of the current pass.
    failures: u32,
    /// Completed passes this session.
    passes: u32,
    /// Library version conflicts seen this session.
    version_conflicts: usize,
    /// Failed with no further retry.
    terminal: bool,
}

impl LibrarySchedule {
    fn new() -> Self {
        Self {
            phase: LibraryPhase::Idle,
            failures: 0,
            passes: 0,
            version_conflicts: 0,
            terminal: false,
        }
    }

    fn transition(&mut self, library: LibraryIdentifier, to: LibraryPhase) -> Result<()> {
        self.validate_transition(to)?;
        debug!("{}: {} -> {}", library, self.phase, to);
        self.phase = to;
        Ok(())
    }

    fn validate_transition(&self, to: LibraryPhase) -> Result<()> {
        use LibraryPhase::*;

        let valid = match (self.phase, to) {
            (Idle, Queued) => true,
            (Queued, InFlight) => true,

            (InFlight, Completed) => true,
            (InFlight, Conflicted) => true,
            (InFlight, Failed) => true,
            // Deferred after a library version conflict
            (InFlight, Queued) => true,

            // More dirty objects remain
            (Completed, Queued) => true,
            // Resolution applied
            (Conflicted, Queued) => true,
            (Conflicted, Failed) => true,
            // Retry after backoff
            (Failed, Queued) => !self.terminal,

            _ => false,
        };

        if !valid {
            return Err(Error::InvalidStateTransition {
                from: self.phase.to_string(),
                to: to.to_string(),
            });
        }
        Ok(())
    }
}

/// Owns the per-library state machines of one session.
#[derive(Debug)]
pub struct SyncScheduler {
    retry: RetryConfig,
    conflict_delays: Vec<Duration>,
    max_passes: u32,
    libraries: BTreeMap<LibraryIdentifier, LibrarySchedule>,
}

impl SyncScheduler {
    pub fn new(retry: RetryConfig, conflict_delays: Vec<Duration>, max_passes: u32) -> Self {
        Self {
            retry,
            conflict_delays,
            max_passes,
            libraries: BTreeMap::new(),
        }
    }

    /// Current phase, `Idle` for unknown libraries.
    pub fn phase(&self, library: LibraryIdentifier) -> LibraryPhase {
        self.libraries
            .get(&library)
            .map(|schedule| schedule.phase)
            .unwrap_or(LibraryPhase::Idle)
    }

    /// Queue a library. Already queued or running libraries are left alone.
    ///
    /// Returns whether the library was newly queued.
    pub fn enqueue(&mut self, library: LibraryIdentifier) -> Result<bool> {
        let schedule = self
            .libraries
            .entry(library)
            .or_insert_with(LibrarySchedule::new);
        if matches!(schedule.phase, LibraryPhase::Queued | LibraryPhase::InFlight) {
            return Ok(false);
        }
        schedule.transition(library, LibraryPhase::Queued)?;
        Ok(true)
    }

    /// Hand a queued library to a pass.
    pub fn begin(&mut self, library: LibraryIdentifier) -> Result<()> {
        self.schedule_mut(library)?
            .transition(library, LibraryPhase::InFlight)
    }

    /// Record a finished pass. Returns `true` if the library was queued for
    /// another pass because dirty objects remain.
    pub fn complete(&mut self, library: LibraryIdentifier, more_dirty: bool) -> Result<bool> {
        let max_passes = self.max_passes;
        let schedule = self.schedule_mut(library)?;
        schedule.transition(library, LibraryPhase::Completed)?;
        schedule.passes += 1;
        schedule.failures = 0;

        if more_dirty && schedule.passes < max_passes {
            schedule.transition(library, LibraryPhase::Queued)?;
            return Ok(true);
        }
        if more_dirty {
            warn!(
                "{}: dirty objects remain after {} passes",
                library, schedule.passes
            );
        }
        info!("{}: completed", library);
        Ok(false)
    }

    /// Pause a library on a conflict.
    pub fn conflict(&mut self, library: LibraryIdentifier) -> Result<()> {
        self.schedule_mut(library)?
            .transition(library, LibraryPhase::Conflicted)
    }

    /// Requeue a conflicted library once its conflict was resolved.
    pub fn resume(&mut self, library: LibraryIdentifier) -> Result<()> {
        let schedule = self.schedule_mut(library)?;
        schedule.transition(library, LibraryPhase::Queued)?;
        schedule.failures = 0;
        Ok(())
    }

    /// Record a failed pass and decide whether it is retried.
    ///
    /// Only retryable errors are retried, and only up to the attempt cap.
    /// A retried library is queued again right away; the caller waits out
    /// the returned delay before beginning it.
    pub fn fail(&mut self, library: LibraryIdentifier, error: &Error) -> Result<FailureDecision> {
        let retry = self.retry.clone();
        let schedule = self.schedule_mut(library)?;
        schedule.transition(library, LibraryPhase::Failed)?;
        schedule.failures += 1;
        let attempt = schedule.failures;

        if error.is_retryable() && retry.allows_retry(attempt) {
            let retry_after = match error {
                Error::Transport { retry_after, .. } => *retry_after,
                _ => None,
            };
            let delay = retry.delay_for(attempt, retry_after);
            schedule.transition(library, LibraryPhase::Queued)?;
            warn!(
                "{}: attempt {} failed ({}), retrying in {:?}",
                library, attempt, error, delay
            );
            return Ok(FailureDecision::Retry { attempt, delay });
        }

        schedule.terminal = true;
        warn!("{}: failed after {} attempts: {}", library, attempt, error);
        Ok(FailureDecision::GiveUp { attempts: attempt })
    }

    /// Fail a library for the rest of the session, after an unresolved
    /// conflict or objects the server refused.
    pub fn abandon(&mut self, library: LibraryIdentifier) -> Result<()> {
        let schedule = self.schedule_mut(library)?;
        schedule.transition(library, LibraryPhase::Failed)?;
        schedule.terminal = true;
        Ok(())
    }

    /// Requeue after the library advanced during an upload.
    ///
    /// Returns the wait before the re-download, or `None` once the conflict
    /// delays are exhausted, in which case the library is failed.
    pub fn defer(&mut self, library: LibraryIdentifier) -> Result<Option<Duration>> {
        let conflict_delays = self.conflict_delays.clone();
        let schedule = self.schedule_mut(library)?;
        let index = schedule.version_conflicts;
        schedule.version_conflicts += 1;

        match conflict_delays.get(index) {
            Some(delay) => {
                schedule.transition(library, LibraryPhase::Queued)?;
                Ok(Some(*delay))
            }
            None => {
                schedule.transition(library, LibraryPhase::Failed)?;
                schedule.terminal = true;
                Ok(None)
            }
        }
    }

    /// Whether every known library reached a terminal phase.
    pub fn is_settled(&self) -> bool {
        self.libraries.values().all(|schedule| {
            schedule.phase == LibraryPhase::Completed
                || (schedule.phase == LibraryPhase::Failed && schedule.terminal)
        })
    }

    fn schedule_mut(&mut self, library: LibraryIdentifier) -> Result<&mut LibrarySchedule> {
        self.libraries
            .get_mut(&library)
            .ok_or_else(|| Error::NotFound(format!("no schedule for {}", library)))
    }
}

/// Gate on starting new sessions after consecutive failed ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionBackoff {
    intervals: Vec<Duration>,
    consecutive_failures: usize,
    last_failure: Option<DateTime<Utc>>,
}

impl SessionBackoff {
    pub fn new(intervals: Vec<Duration>) -> Self {
        Self {
            intervals,
            consecutive_failures: 0,
            last_failure: None,
        }
    }

    /// Number of failed sessions since the last success.
    pub fn consecutive_failures(&self) -> usize {
        self.consecutive_failures
    }

    /// Earliest time a new session may start, if gated.
    pub fn next_allowed(&self) -> Option<DateTime<Utc>> {
        let last_failure = self.last_failure?;
        let index = self.consecutive_failures.checked_sub(1)?;
        let wait = DelayIntervals::clamped(&self.intervals, index)?;
        let wait = chrono::Duration::from_std(wait).unwrap_or(chrono::Duration::MAX);
        Some(
            last_failure
                .checked_add_signed(wait)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        )
    }

    /// `Ok` if a session may start at `now`, `Error::Backoff` otherwise.
    pub fn can_start(&self, now: DateTime<Utc>) -> Result<()> {
        match self.next_allowed() {
            Some(allowed) if allowed > now => {
                let remaining = (allowed - now).num_seconds().max(1);
                Err(Error::Backoff {
                    retry_in_secs: u64::try_from(remaining).unwrap_or(u64::MAX),
                })
            }
            _ => Ok(()),
        }
    }

    pub fn record_failure(&mut self, now: DateTime<Utc>) {
        self.consecutive_failures += 1;
        self.last_failure = Some(now);
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.last_failure = None;
    }
}

impl Default for SessionBackoff {
    fn default() -> Self {
        Self::new(DelayIntervals::sync())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryDelay;

    const A: LibraryIdentifier = LibraryIdentifier::MY_LIBRARY;
    const B: LibraryIdentifier = LibraryIdentifier::Group(2);

    fn scheduler() -> SyncScheduler {
        let retry = RetryConfig::new(10).with_delay(RetryDelay::Constant { seconds: 0.0 });
        SyncScheduler::new(retry, vec![Duration::ZERO, Duration::from_secs(3)], 3)
    }

    #[test]
    fn test_happy_path() {
        let mut scheduler = scheduler();
        assert!(scheduler.enqueue(A).unwrap());
        assert!(!scheduler.enqueue(A).unwrap());
        scheduler.begin(A).unwrap();
        assert_eq!(scheduler.phase(A), LibraryPhase::InFlight);
        assert!(!scheduler.complete(A, false).unwrap());
        assert_eq!(scheduler.phase(A), LibraryPhase::Completed);
        assert!(scheduler.is_settled());
    }

    #[test]
    fn test_only_one_pass_in_flight() {
        let mut scheduler = scheduler();
        scheduler.enqueue(A).unwrap();
        scheduler.begin(A).unwrap();
        assert!(matches!(
            scheduler.begin(A),
            Err(Error::InvalidStateTransition { .. })
        ));
    }

    #[test]
    fn test_requeue_is_bounded_by_max_passes() {
        let mut scheduler = scheduler();
        scheduler.enqueue(A).unwrap();
        for _ in 0..2 {
            scheduler.begin(A).unwrap();
            assert!(scheduler.complete(A, true).unwrap());
        }
        scheduler.begin(A).unwrap();
        assert!(!scheduler.complete(A, true).unwrap());
        assert_eq!(scheduler.phase(A), LibraryPhase::Completed);
    }

    #[test]
    fn test_transport_failures_retry_then_give_up() {
        let mut scheduler = scheduler();
        scheduler.enqueue(B).unwrap();
        for attempt in 1..10 {
            scheduler.begin(B).unwrap();
            let decision = scheduler.fail(B, &Error::transport("reset")).unwrap();
            assert!(matches!(decision, FailureDecision::Retry { attempt: a, .. } if a == attempt));
            assert_eq!(scheduler.phase(B), LibraryPhase::Queued);
        }
        scheduler.begin(B).unwrap();
        let decision = scheduler.fail(B, &Error::transport("reset")).unwrap();
        assert_eq!(decision, FailureDecision::GiveUp { attempts: 10 });
        assert!(scheduler.enqueue(B).is_err());
        assert!(scheduler.is_settled());
    }

    #[test]
    fn test_store_errors_are_not_retried() {
        let mut scheduler = scheduler();
        scheduler.enqueue(A).unwrap();
        scheduler.begin(A).unwrap();
        let decision = scheduler
            .fail(A, &Error::Store("disk full".to_string()))
            .unwrap();
        assert_eq!(decision, FailureDecision::GiveUp { attempts: 1 });
    }

    #[test]
    fn test_conflict_pauses_only_that_library() {
        let mut scheduler = scheduler();
        scheduler.enqueue(A).unwrap();
        scheduler.enqueue(B).unwrap();
        scheduler.begin(A).unwrap();
        scheduler.begin(B).unwrap();
        scheduler.conflict(B).unwrap();
        scheduler.complete(A, false).unwrap();

        assert_eq!(scheduler.phase(A), LibraryPhase::Completed);
        assert_eq!(scheduler.phase(B), LibraryPhase::Conflicted);
        assert!(!scheduler.is_settled());

        scheduler.resume(B).unwrap();
        assert_eq!(scheduler.phase(B), LibraryPhase::Queued);
    }

    #[test]
    fn test_defer_uses_conflict_delays() {
        let mut scheduler = scheduler();
        scheduler.enqueue(A).unwrap();
        scheduler.begin(A).unwrap();
        assert_eq!(scheduler.defer(A).unwrap(), Some(Duration::ZERO));
        scheduler.begin(A).unwrap();
        assert_eq!(scheduler.defer(A).unwrap(), Some(Duration::from_secs(3)));
        scheduler.begin(A).unwrap();
        assert_eq!(scheduler.defer(A).unwrap(), None);
        assert_eq!(scheduler.phase(A), LibraryPhase::Failed);
    }

    #[test]
    fn test_session_backoff_escalates() {
        let mut backoff = SessionBackoff::default();
        let now = Utc::now();
        assert!(backoff.can_start(now).is_ok());

        backoff.record_failure(now);
        let err = backoff.can_start(now).unwrap_err();
        assert!(matches!(err, Error::Backoff { retry_in_secs } if retry_in_secs == 1800));
        assert!(backoff
            .can_start(now + chrono::Duration::minutes(31))
            .is_ok());

        backoff.record_failure(now);
        assert!(backoff
            .can_start(now + chrono::Duration::minutes(31))
            .is_err());

        backoff.record_success();
        assert!(backoff.can_start(now).is_ok());
    }
}
