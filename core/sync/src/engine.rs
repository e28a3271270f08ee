//! Sync controller that orchestrates sessions across libraries.
//!
//! A session runs one pipeline per library. Pipelines run concurrently with
//! each other, but each library has at most one pass in flight, and every
//! pass is strictly sequential: download, deletions, upload, delete.

use chrono::Utc;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use shelfsync_common::{Error, LibraryIdentifier, ObjectKind, Result, WriteScope};
use shelfsync_storage::{
    LibraryRecord, LibrarySyncState, Mutation, ObjectOutcome, ObjectStore, RemoteGateway,
    RemoteObject, RemovedKeys,
};

use crate::changeset::{ChangeSetBuilder, DEFAULT_BATCH_SIZE};
use crate::conflict::{Conflict, ConflictDetector, ConflictResolution, ServerReport};
use crate::merge::merge_remote;
use crate::resolver::ConflictResolver;
use crate::retry::{DelayIntervals, RetryConfig, RetryDelay, MAX_ATTEMPTS_COUNT};
use crate::scheduler::{FailureDecision, SessionBackoff, SyncScheduler};
use crate::state::{FailureReason, SessionOutcome, SyncEvent};

/// Configuration for the sync controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Attempts per library pass before the library fails for the session.
    pub max_attempts: u32,
    /// Delay between attempts.
    pub retry_delay: RetryDelay,
    /// Whether to add jitter to retry delays.
    pub jitter: bool,
    /// Timeout for each remote request.
    pub request_timeout: Duration,
    /// Objects per write or delete request.
    pub batch_size: usize,
    /// Passes per library per session while dirty objects remain.
    pub max_passes: u32,
    /// Waits before re-downloading after library version conflicts.
    pub conflict_delays: Vec<Duration>,
    /// Waits before a new session after consecutive failed sessions.
    pub sync_delay_intervals: Vec<Duration>,
}

impl SyncConfig {
    /// Per-library retry policy derived from this configuration.
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig::new(self.max_attempts)
            .with_delay(self.retry_delay)
            .with_jitter(self.jitter)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_attempts: MAX_ATTEMPTS_COUNT,
            retry_delay: RetryDelay::RETRY,
            jitter: false,
            request_timeout: Duration::from_secs(15),
            batch_size: DEFAULT_BATCH_SIZE,
            max_passes: 3,
            conflict_delays: DelayIntervals::conflict(),
            sync_delay_intervals: DelayIntervals::sync(),
        }
    }
}

/// A conflict waiting for an answer from the caller.
///
/// Dropping it without answering counts as skipping it.
pub struct PendingConflict {
    /// Library the conflict was found in.
    pub library_id: LibraryIdentifier,
    pub conflict: Conflict,
    /// Library version the server reported when the conflict was found.
    pub server_version: i64,
    /// Why the previous answer to this conflict could not be applied.
    pub previous_error: Option<String>,
    responder: oneshot::Sender<Option<ConflictResolution>>,
}

impl PendingConflict {
    /// Answer the conflict.
    pub fn resolve(self, resolution: ConflictResolution) {
        let _ = self.responder.send(Some(resolution));
    }

    /// Leave the conflict unresolved. The library fails for this session.
    pub fn skip(self) {
        let _ = self.responder.send(None);
    }

    /// A `DeleteObjects` answer stamped with the reported server version.
    pub fn delete_objects(&self, removed: RemovedKeys) -> ConflictResolution {
        ConflictResolution::DeleteObjects {
            library_id: self.library_id,
            removed,
            version: self.server_version,
        }
    }
}

impl std::fmt::Debug for PendingConflict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingConflict")
            .field("library_id", &self.library_id)
            .field("conflict", &self.conflict)
            .field("server_version", &self.server_version)
            .field("previous_error", &self.previous_error)
            .finish()
    }
}

/// Handle to a running session.
pub struct SessionHandle {
    id: Uuid,
    cancel: CancellationToken,
    conflicts: mpsc::Receiver<PendingConflict>,
    events: mpsc::UnboundedReceiver<SyncEvent>,
    task: JoinHandle<SessionOutcome>,
}

impl SessionHandle {
    /// Session id, as logged.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Request cooperative cancellation.
    ///
    /// Requests in flight are abandoned and nothing further is committed.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Token cancelled together with the session.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Next conflict needing an answer, or `None` once the session is done.
    pub async fn next_conflict(&mut self) -> Option<PendingConflict> {
        self.conflicts.recv().await
    }

    /// Next progress event, or `None` once the session is done.
    pub async fn next_event(&mut self) -> Option<SyncEvent> {
        self.events.recv().await
    }

    /// Next progress event if one is ready.
    pub fn try_next_event(&mut self) -> Option<SyncEvent> {
        self.events.try_recv().ok()
    }

    /// Wait for the session to finish.
    ///
    /// Conflicts still queued at this point are treated as skipped.
    pub async fn outcome(self) -> SessionOutcome {
        let SessionHandle {
            conflicts, task, ..
        } = self;
        drop(conflicts);
        match task.await {
            Ok(outcome) => outcome,
            Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
            Err(_) => SessionOutcome::Cancelled,
        }
    }
}

/// Top-level orchestrator for sync sessions.
pub struct SyncController<S: ObjectStore + ?Sized, G: RemoteGateway + ?Sized> {
    store: Arc<S>,
    gateway: Arc<G>,
    config: SyncConfig,
    backoff: Arc<Mutex<SessionBackoff>>,
}

impl<S, G> SyncController<S, G>
where
    S: ObjectStore + ?Sized + 'static,
    G: RemoteGateway + ?Sized + 'static,
{
    pub fn new(store: Arc<S>, gateway: Arc<G>, config: SyncConfig) -> Self {
        let backoff = SessionBackoff::new(config.sync_delay_intervals.clone());
        Self {
            store,
            gateway,
            config,
            backoff: Arc::new(Mutex::new(backoff)),
        }
    }

    /// Replace the session backoff, e.g. with one restored from disk.
    pub fn with_backoff(self, backoff: SessionBackoff) -> Self {
        Self {
            backoff: Arc::new(Mutex::new(backoff)),
            ..self
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Current session backoff state.
    pub async fn backoff(&self) -> SessionBackoff {
        self.backoff.lock().await.clone()
    }

    /// Start a session over `libraries`.
    ///
    /// Fails with `Error::Backoff` while failed sessions still gate new ones.
    pub async fn start_session(&self, libraries: Vec<LibraryIdentifier>) -> Result<SessionHandle> {
        self.backoff.lock().await.can_start(Utc::now())?;

        let id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        let (conflicts_tx, conflicts_rx) = mpsc::channel(16);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let mut scheduler = SyncScheduler::new(
            self.config.retry_config(),
            self.config.conflict_delays.clone(),
            self.config.max_passes,
        );
        let mut queued = Vec::new();
        for library in libraries.into_iter().collect::<BTreeSet<_>>() {
            if scheduler.enqueue(library)? {
                let _ = events_tx.send(SyncEvent::LibraryQueued(library));
                queued.push(library);
            }
        }

        let session = Arc::new(Session {
            store: self.store.clone(),
            gateway: self.gateway.clone(),
            config: self.config.clone(),
            scheduler: Mutex::new(scheduler),
            builder: ChangeSetBuilder::new(self.config.batch_size),
            detector: ConflictDetector::new(),
            resolver: ConflictResolver::new(self.store.clone()),
            cancel: cancel.clone(),
            conflicts: conflicts_tx,
            events: events_tx,
        });

        info!("Session {} started for {} libraries", id, queued.len());
        let backoff = self.backoff.clone();
        let task = tokio::spawn(async move {
            let outcome = session.run(queued).await;
            let mut backoff = backoff.lock().await;
            match &outcome {
                SessionOutcome::AllSynced => backoff.record_success(),
                SessionOutcome::PartiallyFailed(failures) => {
                    backoff.record_failure(Utc::now());
                    warn!(
                        "Session {} finished with {} failed libraries",
                        id,
                        failures.len()
                    );
                }
                SessionOutcome::Cancelled => {}
            }
            info!("Session {} finished: {:?}", id, outcome);
            outcome
        });

        Ok(SessionHandle {
            id,
            cancel,
            conflicts: conflicts_rx,
            events: events_rx,
            task,
        })
    }
}

/// How one library pipeline ended.
enum Stop {
    Cancelled,
    Failed(FailureReason),
}

/// What a single pass produced.
enum PassOutcome {
    /// Finished, listing objects the server refused as `"<kind> <key>"`.
    Done { rejected: Vec<String> },
    Skipped,
    Conflicts {
        conflicts: Vec<Conflict>,
        server_version: i64,
        /// Library version committed before the pass found the conflicts.
        local_version: i64,
    },
}

/// Shared state of one running session.
struct Session<S: ObjectStore + ?Sized, G: RemoteGateway + ?Sized> {
    store: Arc<S>,
    gateway: Arc<G>,
    config: SyncConfig,
    /// Per-library phases, shared by all pipelines of the session.
    scheduler: Mutex<SyncScheduler>,
    builder: ChangeSetBuilder,
    detector: ConflictDetector,
    resolver: ConflictResolver<S>,
    cancel: CancellationToken,
    /// Bounded, so pipelines wait while the caller answers.
    conflicts: mpsc::Sender<PendingConflict>,
    events: mpsc::UnboundedSender<SyncEvent>,
}

impl<S, G> Session<S, G>
where
    S: ObjectStore + ?Sized,
    G: RemoteGateway + ?Sized,
{
    async fn run(&self, libraries: Vec<LibraryIdentifier>) -> SessionOutcome {
        let pipelines = libraries.into_iter().map(|library| async move {
            let result = self.run_library(library).await;
            (library, result)
        });
        let results = join_all(pipelines).await;

        if self.cancel.is_cancelled() {
            return SessionOutcome::Cancelled;
        }

        let mut failures = BTreeMap::new();
        for (library, result) in results {
            match result {
                Ok(()) => {}
                Err(Stop::Cancelled) => return SessionOutcome::Cancelled,
                Err(Stop::Failed(reason)) => {
                    failures.insert(library, reason);
                }
            }
        }

        if failures.is_empty() {
            SessionOutcome::AllSynced
        } else {
            SessionOutcome::PartiallyFailed(failures)
        }
    }

    async fn run_library(&self, library: LibraryIdentifier) -> std::result::Result<(), Stop> {
        let result = self.drive_library(library).await;
        match &result {
            Ok(()) => self.emit(SyncEvent::LibraryCompleted(library)),
            Err(Stop::Failed(reason)) => {
                warn!("{}: sync failed: {}", library, reason);
                self.emit(SyncEvent::LibraryFailed {
                    library,
                    reason: reason.clone(),
                });
            }
            Err(Stop::Cancelled) => debug!("{}: cancelled", library),
        }
        result
    }

    async fn drive_library(&self, library: LibraryIdentifier) -> std::result::Result<(), Stop> {
        loop {
            if self.cancel.is_cancelled() {
                return Err(Stop::Cancelled);
            }
            self.scheduler.lock().await.begin(library).map_err(fatal)?;
            self.emit(SyncEvent::LibraryStarted(library));

            match self.run_pass(library).await {
                Ok(PassOutcome::Done { rejected }) if !rejected.is_empty() => {
                    self.scheduler.lock().await.abandon(library).map_err(fatal)?;
                    return Err(Stop::Failed(FailureReason::ObjectsRejected { keys: rejected }));
                }
                Ok(PassOutcome::Done { .. }) => {
                    let more_dirty = self.store.has_dirty(library).await.map_err(store_failure)?;
                    let requeued = self
                        .scheduler
                        .lock()
                        .await
                        .complete(library, more_dirty)
                        .map_err(fatal)?;
                    if !requeued {
                        return Ok(());
                    }
                    debug!("{}: dirty objects remain, running another pass", library);
                }
                Ok(PassOutcome::Skipped) => {
                    self.emit(SyncEvent::LibrarySkipped(library));
                    self.scheduler
                        .lock()
                        .await
                        .complete(library, false)
                        .map_err(fatal)?;
                    return Ok(());
                }
                Ok(PassOutcome::Conflicts {
                    conflicts,
                    server_version,
                    local_version,
                }) => {
                    self.scheduler.lock().await.conflict(library).map_err(fatal)?;
                    // Only the last answer may advance the library version, so
                    // conflicts left unanswered are found again next session.
                    let last = conflicts.len().saturating_sub(1);
                    for (index, conflict) in conflicts.into_iter().enumerate() {
                        let cap = (index < last).then_some(local_version);
                        let surfaced = self.surface(library, conflict, server_version, cap).await;
                        if let Err(stop) = surfaced {
                            if let Stop::Failed(_) = stop {
                                self.scheduler.lock().await.abandon(library).map_err(fatal)?;
                            }
                            return Err(stop);
                        }
                    }
                    self.scheduler.lock().await.resume(library).map_err(fatal)?;
                }
                Err(Error::Cancelled) => return Err(Stop::Cancelled),
                Err(err @ Error::VersionConflict { .. }) => {
                    let deferred = self.scheduler.lock().await.defer(library).map_err(fatal)?;
                    match deferred {
                        Some(delay) => {
                            info!("{}: {}, downloading again in {:?}", library, err, delay);
                            self.wait(delay).await?;
                        }
                        None => {
                            return Err(Stop::Failed(FailureReason::RetriesExhausted {
                                attempts: u32::try_from(self.config.conflict_delays.len() + 1)
                                    .unwrap_or(u32::MAX),
                                last_error: err.to_string(),
                            }));
                        }
                    }
                }
                Err(err) => {
                    let decision = self
                        .scheduler
                        .lock()
                        .await
                        .fail(library, &err)
                        .map_err(fatal)?;
                    match decision {
                        FailureDecision::Retry { attempt, delay } => {
                            self.emit(SyncEvent::RetryScheduled {
                                library,
                                attempt,
                                delay,
                            });
                            self.wait(delay).await?;
                        }
                        FailureDecision::GiveUp { attempts } => {
                            return Err(Stop::Failed(failure_reason(err, attempts)));
                        }
                    }
                }
            }
        }
    }

    /// Hand a conflict to the caller until it is resolved or given up on.
    async fn surface(
        &self,
        library: LibraryIdentifier,
        conflict: Conflict,
        server_version: i64,
        version_cap: Option<i64>,
    ) -> std::result::Result<(), Stop> {
        info!("{}: conflict: {}", library, conflict);
        self.emit(SyncEvent::ConflictDetected {
            library,
            conflict: conflict.clone(),
        });

        let mut previous_error = None;
        loop {
            let (responder, answer) = oneshot::channel();
            let pending = PendingConflict {
                library_id: library,
                conflict: conflict.clone(),
                server_version,
                previous_error: previous_error.take(),
                responder,
            };
            if self.conflicts.send(pending).await.is_err() {
                return Err(Stop::Failed(FailureReason::UnresolvedConflict(conflict)));
            }

            let answer = tokio::select! {
                _ = self.cancel.cancelled() => return Err(Stop::Cancelled),
                answer = answer => answer,
            };
            let resolution = match answer {
                Ok(Some(resolution)) => resolution,
                Ok(None) | Err(_) => {
                    return Err(Stop::Failed(FailureReason::UnresolvedConflict(conflict)));
                }
            };

            if self.cancel.is_cancelled() {
                return Err(Stop::Cancelled);
            }
            let resolution = match version_cap {
                Some(version) => resolution.capped_at(version),
                None => resolution,
            };
            match self.resolver.resolve(&conflict, &resolution).await {
                Ok(()) => {
                    self.emit(SyncEvent::ConflictResolved(library));
                    return Ok(());
                }
                Err(err) => {
                    warn!("{}: resolution rejected: {}", library, err);
                    previous_error = Some(err.to_string());
                }
            }
        }
    }

    async fn run_pass(&self, library: LibraryIdentifier) -> Result<PassOutcome> {
        let existing = self.store.library(library).await?;
        if let Some(record) = &existing {
            if record.sync_state == LibrarySyncState::LocalOnly {
                info!("{}: local only, skipping", library);
                return Ok(PassOutcome::Skipped);
            }
        }

        let record = match library {
            LibraryIdentifier::Group(group_id) => {
                let group = self.call(self.gateway.fetch_group(group_id)).await?;
                match (group, existing) {
                    (None, None) => {
                        warn!("{}: unknown locally and remotely", library);
                        return Ok(PassOutcome::Skipped);
                    }
                    (None, Some(record)) => {
                        let report = ServerReport::GroupMissing {
                            group_id,
                            name: record.name.clone(),
                        };
                        return Ok(PassOutcome::Conflicts {
                            conflicts: self.detector.classify(library, &report),
                            server_version: record.version,
                            local_version: record.version,
                        });
                    }
                    (Some(group), existing) => {
                        let base = existing
                            .clone()
                            .unwrap_or_else(|| LibraryRecord::new(library, group.name.clone()));
                        let updated = LibraryRecord {
                            name: group.name,
                            can_edit_metadata: group.can_edit_metadata,
                            can_edit_files: group.can_edit_files,
                            ..base
                        };
                        if existing.as_ref() != Some(&updated) {
                            self.commit(library, vec![Mutation::PutLibrary(updated.clone())])
                                .await?;
                        }
                        updated
                    }
                }
            }
            LibraryIdentifier::Custom(_) => match existing {
                Some(record) => record,
                None => {
                    let record = LibraryRecord::my_library();
                    self.commit(library, vec![Mutation::PutLibrary(record.clone())])
                        .await?;
                    record
                }
            },
        };

        let since = record.version;
        let mut library_version = since;

        for kind in ObjectKind::UPLOAD_ORDER {
            let page = self
                .call(self.gateway.fetch_since(library, kind, since))
                .await?;
            library_version = library_version.max(page.library_version);
            let mut objects = page.objects;

            let missing: Vec<String> = self
                .store
                .read_needing_sync(library, kind)
                .await?
                .into_iter()
                .map(|object| object.key)
                .filter(|key| !objects.iter().any(|o| &o.key == key))
                .collect();
            if !missing.is_empty() {
                let page = self
                    .call(self.gateway.fetch_objects(library, kind, &missing))
                    .await?;
                objects.extend(page.objects);
            }

            let count = self.merge(library, kind, objects).await?;
            if count > 0 {
                self.emit(SyncEvent::ObjectsDownloaded {
                    library,
                    kind,
                    count,
                });
            }
        }

        let deletions = self
            .call(self.gateway.fetch_deletions(library, since))
            .await?;
        library_version = library_version.max(deletions.library_version);

        let mut purge = Vec::new();
        let mut held = Vec::new();
        for kind in ObjectKind::UPLOAD_ORDER {
            let keys = deletions.removed.keys(kind);
            if keys.is_empty() {
                continue;
            }
            for object in self.store.read_objects(library, kind, keys).await? {
                if object.deleted {
                    purge.push(Mutation::Remove {
                        kind,
                        key: object.key,
                    });
                } else {
                    held.push(object);
                }
            }
        }

        let conflicts = self.detector.classify(
            library,
            &ServerReport::Removals {
                removed: deletions.removed,
                held,
            },
        );
        if !conflicts.is_empty() {
            if !purge.is_empty() {
                self.commit(library, purge).await?;
            }
            return Ok(PassOutcome::Conflicts {
                conflicts,
                server_version: library_version,
                local_version: since,
            });
        }

        let mut mutations = purge;
        mutations.push(Mutation::SetVersion(library_version));
        if record.sync_state == LibrarySyncState::Idle {
            mutations.push(Mutation::SetSyncState(LibrarySyncState::Normal));
        }
        self.commit(library, mutations).await?;

        let write_batches = self.builder.build_upload_batch(&*self.store, library).await?;
        let delete_batches = self
            .builder
            .build_deletion_batches(&*self.store, library)
            .await?;

        if let LibraryIdentifier::Group(group_id) = library {
            let pending = !write_batches.is_empty() || !delete_batches.is_empty();
            if pending && !record.can_edit_metadata {
                return Ok(self.write_denied(
                    library,
                    group_id,
                    &record.name,
                    WriteScope::Metadata,
                    library_version,
                ));
            }
        }

        let mut base_version = library_version;
        let mut rejected = Vec::new();
        for mut batch in write_batches {
            batch.base_version = base_version;
            let response = match self.call(self.gateway.upload(&batch)).await {
                Err(Error::Permission { group_id, scope }) => {
                    return Ok(self.write_denied(
                        library,
                        group_id,
                        &record.name,
                        scope,
                        base_version,
                    ));
                }
                other => other?,
            };

            let mut mutations = Vec::new();
            let mut conflicted = Vec::new();
            let mut failed = 0;
            for result in response.results {
                match result.outcome {
                    ObjectOutcome::Synced { version } => mutations.push(Mutation::MarkSynced {
                        kind: batch.kind,
                        key: result.key,
                        version,
                    }),
                    ObjectOutcome::Conflict { remote_version } => {
                        warn!(
                            "{}: {} {} changed remotely (version {})",
                            library, batch.kind, result.key, remote_version
                        );
                        conflicted.push(result.key);
                    }
                    ObjectOutcome::Failed { code, message } => {
                        warn!(
                            "{}: {} {} rejected ({}): {}",
                            library, batch.kind, result.key, code, message
                        );
                        rejected.push(format!("{} {}", batch.kind, result.key));
                        failed += 1;
                    }
                }
            }

            let synced = mutations.len();
            for mut object in self
                .store
                .read_objects(library, batch.kind, &conflicted)
                .await?
            {
                object.needs_sync = true;
                mutations.push(Mutation::Put(object));
            }
            mutations.push(Mutation::SetVersion(response.library_version));
            self.commit(library, mutations).await?;
            base_version = response.library_version;

            self.emit(SyncEvent::BatchUploaded {
                library,
                kind: batch.kind,
                synced,
                failed,
            });

            if !conflicted.is_empty() {
                return Err(Error::VersionConflict {
                    local_version: batch.base_version,
                    remote_version: response.library_version,
                });
            }
        }

        let local_tombstones = self
            .builder
            .local_only_tombstones(&*self.store, library)
            .await?;
        if !local_tombstones.is_empty() {
            let mutations = local_tombstones
                .into_iter()
                .map(|(kind, key)| Mutation::Remove { kind, key })
                .collect();
            self.commit(library, mutations).await?;
        }

        for mut batch in delete_batches {
            batch.base_version = base_version;
            let version = match self.call(self.gateway.submit_deletions(&batch)).await {
                Err(Error::Permission { group_id, scope }) => {
                    return Ok(self.write_denied(
                        library,
                        group_id,
                        &record.name,
                        scope,
                        base_version,
                    ));
                }
                other => other?,
            };

            let count = batch.keys.len();
            let mut mutations: Vec<Mutation> = batch
                .keys
                .into_iter()
                .map(|key| Mutation::Remove {
                    kind: batch.kind,
                    key,
                })
                .collect();
            mutations.push(Mutation::SetVersion(version));
            self.commit(library, mutations).await?;
            base_version = version;

            self.emit(SyncEvent::DeletionsUploaded {
                library,
                kind: batch.kind,
                count,
            });
        }

        Ok(PassOutcome::Done { rejected })
    }

    fn write_denied(
        &self,
        library: LibraryIdentifier,
        group_id: i64,
        name: &str,
        scope: WriteScope,
        server_version: i64,
    ) -> PassOutcome {
        let report = ServerReport::WriteDenied {
            group_id,
            name: name.to_string(),
            scope,
        };
        PassOutcome::Conflicts {
            conflicts: self.detector.classify(library, &report),
            server_version,
            local_version: server_version,
        }
    }

    /// Merge downloaded objects in one transaction. Returns how many changed.
    async fn merge(
        &self,
        library: LibraryIdentifier,
        kind: ObjectKind,
        objects: Vec<RemoteObject>,
    ) -> Result<usize> {
        if objects.is_empty() {
            return Ok(0);
        }

        let keys: Vec<String> = objects.iter().map(|o| o.key.clone()).collect();
        let local: BTreeMap<String, _> = self
            .store
            .read_objects(library, kind, &keys)
            .await?
            .into_iter()
            .map(|object| (object.key.clone(), object))
            .collect();

        let mutations: Vec<Mutation> = objects
            .iter()
            .filter_map(|remote| merge_remote(local.get(&remote.key), remote).into_object())
            .map(Mutation::Put)
            .collect();
        let count = mutations.len();
        if count > 0 {
            self.commit(library, mutations).await?;
        }
        Ok(count)
    }

    /// Run a remote request bounded by the request timeout and cancellation.
    async fn call<T>(&self, request: impl Future<Output = Result<T>>) -> Result<T> {
        let timeout = self.config.request_timeout;
        tokio::select! {
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            result = tokio::time::timeout(timeout, request) => match result {
                Ok(result) => result,
                Err(_) => Err(Error::transport(format!("request timed out after {:?}", timeout))),
            },
        }
    }

    /// Commit unless the session was cancelled.
    async fn commit(&self, library: LibraryIdentifier, mutations: Vec<Mutation>) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        self.store.commit(library, mutations).await
    }

    async fn wait(&self, delay: Duration) -> std::result::Result<(), Stop> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(Stop::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    fn emit(&self, event: SyncEvent) {
        let _ = self.events.send(event);
    }
}

fn fatal(err: Error) -> Stop {
    Stop::Failed(FailureReason::Fatal(err.to_string()))
}

fn store_failure(err: Error) -> Stop {
    Stop::Failed(FailureReason::Store(err.to_string()))
}

fn failure_reason(err: Error, attempts: u32) -> FailureReason {
    match err {
        Error::Store(message) => FailureReason::Store(message),
        err if err.is_retryable() => FailureReason::RetriesExhausted {
            attempts,
            last_error: err.to_string(),
        },
        err => FailureReason::Fatal(err.to_string()),
    }
}
