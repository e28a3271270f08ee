//! Applying conflict resolutions to the store.

use std::sync::Arc;
use tracing::{debug, info};

use shelfsync_common::{Error, LibraryIdentifier, ObjectKind, Result};
use shelfsync_storage::{LibrarySyncState, Mutation, ObjectStore, RemovedKeys};

use crate::conflict::{Conflict, ConflictResolution};

/// Applies [`ConflictResolution`]s, each in a single store transaction.
pub struct ConflictResolver<S: ObjectStore + ?Sized> {
    store: Arc<S>,
}

impl<S: ObjectStore + ?Sized> ConflictResolver<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Apply a resolution that was checked against its conflict.
    pub async fn resolve(
        &self,
        conflict: &Conflict,
        resolution: &ConflictResolution,
    ) -> Result<()> {
        if !conflict.accepts(resolution) {
            return Err(Error::resolution(
                None,
                format!("{:?} does not answer conflict: {}", resolution, conflict),
            ));
        }
        // Removed objects the answer keeps are re-created on the server.
        let kept = match (conflict.removed_keys(), resolution) {
            (Some(held), ConflictResolution::DeleteObjects { removed, .. }) => {
                held.without(removed)
            }
            _ => RemovedKeys::default(),
        };
        self.commit(resolution, &kept).await
    }

    /// Apply a resolution atomically.
    ///
    /// On failure nothing is changed and `Error::Resolution` names the
    /// offending key when there is one.
    pub async fn apply(&self, resolution: &ConflictResolution) -> Result<()> {
        self.commit(resolution, &RemovedKeys::default()).await
    }

    async fn commit(&self, resolution: &ConflictResolution, kept: &RemovedKeys) -> Result<()> {
        let library = resolution.library_id();

        if self.store.library(library).await?.is_none() {
            if let ConflictResolution::DeleteGroup(group_id) = resolution {
                debug!("Group {} not present locally, nothing to delete", group_id);
                return Ok(());
            }
            return Err(Error::resolution(
                None,
                format!("{} does not exist locally", library),
            ));
        }

        let mutations = match resolution {
            ConflictResolution::DeleteGroup(_) => vec![Mutation::RemoveLibrary],
            ConflictResolution::MarkGroupAsLocalOnly(_) => vec![
                Mutation::ClearNeedsSync,
                Mutation::SetSyncState(LibrarySyncState::LocalOnly),
            ],
            ConflictResolution::RevertLibraryToOriginal(_) => vec![Mutation::RevertChanges],
            ConflictResolution::MarkChangesAsResolved(_) => vec![Mutation::ClearChanges],
            ConflictResolution::DeleteObjects {
                removed, version, ..
            } => {
                let mut mutations: Vec<Mutation> = ObjectKind::UPLOAD_ORDER
                    .into_iter()
                    .flat_map(|kind| {
                        removed.keys(kind).iter().map(move |key| Mutation::Remove {
                            kind,
                            key: key.clone(),
                        })
                    })
                    .collect();
                for kind in ObjectKind::UPLOAD_ORDER {
                    mutations.extend(kept.keys(kind).iter().map(|key| Mutation::MarkNew {
                        kind,
                        key: key.clone(),
                    }));
                }
                mutations.push(Mutation::SetVersion(*version));
                mutations
            }
        };

        self.store
            .commit(library, mutations)
            .await
            .map_err(|err| match err {
                Error::NotFound(key) => Error::resolution(Some(key), "object not found"),
                Error::Resolution { .. } => err,
                other => Error::resolution(None, other.to_string()),
            })?;

        info!("{}: applied {:?}", library, resolution);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use shelfsync_storage::{ChangedFields, FieldTag, LibraryRecord, MemoryStore, SyncableObject};

    const LIB: LibraryIdentifier = LibraryIdentifier::MY_LIBRARY;

    async fn store() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        let mut edited = SyncableObject::new_local(ObjectKind::Item, "ITEM0001").synced_at(3);
        edited.edit(FieldTag::Fields, json!({"title": "Edited"}));
        store
            .commit(
                LIB,
                vec![
                    Mutation::PutLibrary(LibraryRecord::my_library()),
                    Mutation::Put(edited),
                    Mutation::Put(
                        SyncableObject::new_local(ObjectKind::Item, "ITEM0002").synced_at(3),
                    ),
                    Mutation::SetVersion(3),
                ],
            )
            .await
            .unwrap();
        store
    }

    fn delete_items(keys: &[&str], version: i64) -> ConflictResolution {
        ConflictResolution::DeleteObjects {
            library_id: LIB,
            removed: RemovedKeys {
                items: keys.iter().map(|k| k.to_string()).collect(),
                ..Default::default()
            },
            version,
        }
    }

    #[tokio::test]
    async fn test_delete_objects_stamps_version() {
        let store = store().await;
        let resolver = ConflictResolver::new(store.clone());
        resolver
            .apply(&delete_items(&["ITEM0001", "ITEM0002"], 12))
            .await
            .unwrap();

        assert_eq!(store.current_version(LIB).await.unwrap(), 12);
        assert!(store.object(LIB, ObjectKind::Item, "ITEM0001").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_objects_rolls_back_on_missing_key() {
        let store = store().await;
        let before = store.snapshot().unwrap();
        let resolver = ConflictResolver::new(store.clone());

        let err = resolver
            .apply(&delete_items(&["ITEM0001", "GONE0001"], 12))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Resolution { key: Some(ref k), .. } if k == "GONE0001"));
        assert_eq!(store.snapshot().unwrap(), before);
    }

    #[tokio::test]
    async fn test_kept_removed_items_are_recreated_in_full() {
        let store = store().await;
        let resolver = ConflictResolver::new(store.clone());
        let conflict = Conflict::RemovedItemsHaveLocalChanges {
            library_id: LIB,
            keys: vec![
                ("ITEM0001".to_string(), String::new()),
                ("ITEM0002".to_string(), String::new()),
            ],
        };

        resolver
            .resolve(&conflict, &delete_items(&["ITEM0002"], 12))
            .await
            .unwrap();

        assert!(store.object(LIB, ObjectKind::Item, "ITEM0002").unwrap().is_none());
        let kept = store
            .object(LIB, ObjectKind::Item, "ITEM0001")
            .unwrap()
            .unwrap();
        assert_eq!(kept.version, 0);
        assert_eq!(kept.changed_fields, ChangedFields::all());
        assert_eq!(kept.attributes[&FieldTag::Fields], json!({"title": "Edited"}));
        assert_eq!(store.current_version(LIB).await.unwrap(), 12);
    }

    #[tokio::test]
    async fn test_mark_changes_as_resolved_is_idempotent() {
        let store = store().await;
        let resolver = ConflictResolver::new(store.clone());
        let resolution = ConflictResolution::MarkChangesAsResolved(LIB);

        resolver.apply(&resolution).await.unwrap();
        let once = store.snapshot().unwrap();
        resolver.apply(&resolution).await.unwrap();
        assert_eq!(store.snapshot().unwrap(), once);
        assert!(!store.has_dirty(LIB).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_missing_group_is_noop() {
        let store = store().await;
        let resolver = ConflictResolver::new(store.clone());
        resolver
            .apply(&ConflictResolution::DeleteGroup(5))
            .await
            .unwrap();
        assert_eq!(store.libraries().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_mark_group_local_only() {
        let store = store().await;
        let group = LibraryIdentifier::Group(5);
        let mut flagged =
            SyncableObject::new_local(ObjectKind::Collection, "COLL0001").synced_at(1);
        flagged.needs_sync = true;
        store
            .commit(
                group,
                vec![
                    Mutation::PutLibrary(LibraryRecord::new(group, "Lab")),
                    Mutation::Put(flagged),
                ],
            )
            .await
            .unwrap();

        ConflictResolver::new(store.clone())
            .apply(&ConflictResolution::MarkGroupAsLocalOnly(5))
            .await
            .unwrap();

        let record = store.library(group).await.unwrap().unwrap();
        assert_eq!(record.sync_state, LibrarySyncState::LocalOnly);
        let object = store
            .object(group, ObjectKind::Collection, "COLL0001")
            .unwrap()
            .unwrap();
        assert!(!object.needs_sync);
    }

    #[tokio::test]
    async fn test_resolve_rejects_mismatched_resolution() {
        let store = store().await;
        let resolver = ConflictResolver::new(store.clone());
        let conflict = Conflict::GroupRemoved {
            group_id: 5,
            name: "Lab".to_string(),
        };
        let err = resolver
            .resolve(&conflict, &ConflictResolution::MarkChangesAsResolved(LIB))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Resolution { key: None, .. }));
    }
}
