//! Local object store abstraction.
//!
//! The sync engine never mutates objects directly: every change is
//! expressed as a batch of [`Mutation`]s and handed to
//! [`ObjectStore::commit`], which applies the whole batch or nothing.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::object::SyncableObject;
use shelfsync_common::{LibraryIdentifier, ObjectKind, Result};

/// Local sync state of a library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LibrarySyncState {
    /// Known locally but never synced.
    Idle,
    /// Syncs in both directions.
    Normal,
    /// Kept locally only. Sync skips it.
    LocalOnly,
}

/// Library metadata kept alongside its objects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibraryRecord {
    pub id: LibraryIdentifier,
    pub name: String,
    /// Last server library version this store fully reflects.
    pub version: i64,
    pub sync_state: LibrarySyncState,
    pub can_edit_metadata: bool,
    pub can_edit_files: bool,
}

impl LibraryRecord {
    /// A fresh, writable library record at version zero.
    pub fn new(id: LibraryIdentifier, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            version: 0,
            sync_state: LibrarySyncState::Idle,
            can_edit_metadata: true,
            can_edit_files: true,
        }
    }

    /// The personal library.
    pub fn my_library() -> Self {
        Self::new(LibraryIdentifier::MY_LIBRARY, "My Library")
    }
}

/// A single change applied inside a store transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    /// Insert or replace an object.
    Put(SyncableObject),
    /// Remove an object. Fails if the key is unknown.
    Remove { kind: ObjectKind, key: String },
    /// Record a successful upload: set version, clear local changes.
    MarkSynced {
        kind: ObjectKind,
        key: String,
        version: i64,
    },
    /// Treat an object as never uploaded so it is re-created in full.
    /// Fails if the key is unknown.
    MarkNew { kind: ObjectKind, key: String },
    /// Accept the library as-is: clear every change mask and drop tombstones.
    ClearChanges,
    /// Discard local changes. Never-uploaded objects are removed, the rest
    /// are flagged for re-download.
    RevertChanges,
    /// Clear every `needs_sync` flag in the library.
    ClearNeedsSync,
    /// Set the library version.
    SetVersion(i64),
    /// Set the library sync state.
    SetSyncState(LibrarySyncState),
    /// Insert or replace a library record, keeping its objects.
    PutLibrary(LibraryRecord),
    /// Remove a library and all of its objects. No-op if absent.
    RemoveLibrary,
}

/// Transactional store of syncable objects, partitioned by library.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store name for logging.
    fn name(&self) -> &str;

    /// Objects of `kind` with local changes or a pending deletion, sorted by key.
    async fn read_dirty(
        &self,
        library: LibraryIdentifier,
        kind: ObjectKind,
    ) -> Result<Vec<SyncableObject>>;

    /// Objects of `kind` flagged as needing a re-download.
    async fn read_needing_sync(
        &self,
        library: LibraryIdentifier,
        kind: ObjectKind,
    ) -> Result<Vec<SyncableObject>>;

    /// Objects of `kind` with the given keys. Unknown keys are skipped.
    async fn read_objects(
        &self,
        library: LibraryIdentifier,
        kind: ObjectKind,
        keys: &[String],
    ) -> Result<Vec<SyncableObject>>;

    /// Library record, if the library exists locally.
    async fn library(&self, library: LibraryIdentifier) -> Result<Option<LibraryRecord>>;

    /// Every local library record.
    async fn libraries(&self) -> Result<Vec<LibraryRecord>>;

    /// Last server version the library reflects.
    async fn current_version(&self, library: LibraryIdentifier) -> Result<i64>;

    /// Apply all mutations atomically.
    async fn commit(&self, library: LibraryIdentifier, mutations: Vec<Mutation>) -> Result<()>;

    /// Whether the library has anything left to upload.
    async fn has_dirty(&self, library: LibraryIdentifier) -> Result<bool> {
        for kind in ObjectKind::UPLOAD_ORDER {
            if !self.read_dirty(library, kind).await?.is_empty() {
                return Ok(true);
            }
        }
        Ok(false)
    }
}
