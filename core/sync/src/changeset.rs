//! Building upload and deletion batches from locally-dirty objects.
//!
//! Building is a pure read: nothing is marked as sent here. The controller
//! commits the outcome only after the server answered, so a batch can be
//! rebuilt and resent safely.

use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

use shelfsync_common::{LibraryIdentifier, ObjectKind, Result};
use shelfsync_storage::{DeleteBatch, ObjectStore, SyncableObject, UploadEntry, WriteBatch};

/// Default number of objects per write or delete request.
pub const DEFAULT_BATCH_SIZE: usize = 50;

/// Builds ordered write and delete batches for one library.
#[derive(Debug, Clone)]
pub struct ChangeSetBuilder {
    max_batch_size: usize,
}

impl ChangeSetBuilder {
    pub fn new(max_batch_size: usize) -> Self {
        Self {
            max_batch_size: max_batch_size.max(1),
        }
    }

    /// Write batches for every dirty, non-deleted object in `library`.
    ///
    /// Batches follow [`ObjectKind::UPLOAD_ORDER`]; within a kind, parents
    /// precede their children.
    pub async fn build_upload_batch<S: ObjectStore + ?Sized>(
        &self,
        store: &S,
        library: LibraryIdentifier,
    ) -> Result<Vec<WriteBatch>> {
        let base_version = store.current_version(library).await?;
        let mut batches = Vec::new();

        for kind in ObjectKind::UPLOAD_ORDER {
            let dirty: Vec<SyncableObject> = store
                .read_dirty(library, kind)
                .await?
                .into_iter()
                .filter(|object| !object.deleted)
                .collect();
            if dirty.is_empty() {
                continue;
            }

            let ordered = if kind.has_parent() {
                order_by_parent(dirty)
            } else {
                dirty
            };

            let entries: Vec<UploadEntry> = ordered
                .into_iter()
                .filter_map(|object| {
                    object.update_parameters().map(|parameters| UploadEntry {
                        key: object.key,
                        base_version: object.version,
                        parameters,
                    })
                })
                .collect();

            debug!("{}: {} {} to upload", library, entries.len(), kind);
            for chunk in entries.chunks(self.max_batch_size) {
                batches.push(WriteBatch {
                    library_id: library,
                    kind,
                    base_version,
                    entries: chunk.to_vec(),
                });
            }
        }

        Ok(batches)
    }

    /// Delete batches for tombstones the server knows about.
    ///
    /// Tombstones of never-uploaded objects are left to
    /// [`ChangeSetBuilder::local_only_tombstones`].
    pub async fn build_deletion_batches<S: ObjectStore + ?Sized>(
        &self,
        store: &S,
        library: LibraryIdentifier,
    ) -> Result<Vec<DeleteBatch>> {
        let base_version = store.current_version(library).await?;
        let mut batches = Vec::new();

        for kind in ObjectKind::UPLOAD_ORDER {
            let keys: Vec<String> = store
                .read_dirty(library, kind)
                .await?
                .into_iter()
                .filter(|object| object.deleted && object.version > 0)
                .map(|object| object.key)
                .collect();

            for chunk in keys.chunks(self.max_batch_size) {
                batches.push(DeleteBatch {
                    library_id: library,
                    kind,
                    base_version,
                    keys: chunk.to_vec(),
                });
            }
        }

        Ok(batches)
    }

    /// Tombstones of objects the server never saw. These need no request.
    pub async fn local_only_tombstones<S: ObjectStore + ?Sized>(
        &self,
        store: &S,
        library: LibraryIdentifier,
    ) -> Result<Vec<(ObjectKind, String)>> {
        let mut tombstones = Vec::new();
        for kind in ObjectKind::UPLOAD_ORDER {
            tombstones.extend(
                store
                    .read_dirty(library, kind)
                    .await?
                    .into_iter()
                    .filter(|object| object.deleted && object.version == 0)
                    .map(|object| (kind, object.key)),
            );
        }
        Ok(tombstones)
    }
}

impl Default for ChangeSetBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_BATCH_SIZE)
    }
}

/// Order objects so that every parent in the set precedes its children.
///
/// Siblings and independent roots are ordered by key. Parents outside the
/// set are ignored. Objects caught in a parent cycle are appended by key.
pub fn order_by_parent(objects: Vec<SyncableObject>) -> Vec<SyncableObject> {
    let mut by_key: BTreeMap<String, SyncableObject> = objects
        .into_iter()
        .map(|object| (object.key.clone(), object))
        .collect();

    let mut children: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut ready: BTreeSet<String> = BTreeSet::new();
    for (key, object) in &by_key {
        match &object.parent_key {
            Some(parent) if parent != key && by_key.contains_key(parent) => {
                children.entry(parent.clone()).or_default().push(key.clone());
            }
            _ => {
                ready.insert(key.clone());
            }
        }
    }

    let mut ordered = Vec::with_capacity(by_key.len());
    while let Some(key) = ready.pop_first() {
        if let Some(kids) = children.remove(&key) {
            ready.extend(kids);
        }
        if let Some(object) = by_key.remove(&key) {
            ordered.push(object);
        }
    }

    if !by_key.is_empty() {
        warn!(
            "Parent cycle among {:?}, appending in key order",
            by_key.keys().collect::<Vec<_>>()
        );
        ordered.extend(by_key.into_values());
    }

    ordered
}
