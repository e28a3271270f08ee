//! Conflict classification.
//!
//! A [`Conflict`] is a discrepancy between local and server state that the
//! engine will not settle on its own. Every conflict is produced by
//! [`ConflictDetector::classify`] and answered by a [`ConflictResolution`].

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, warn};

use shelfsync_common::{LibraryIdentifier, ObjectKind, WriteScope};
use shelfsync_storage::{RemovedKeys, SyncableObject};

/// A detected problem that needs an explicit resolution.
///
/// Variants cannot be built outside this crate; use the detector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum Conflict {
    /// The group no longer exists or is no longer accessible.
    #[non_exhaustive]
    GroupRemoved { group_id: i64, name: String },
    /// Metadata writes to the group are no longer permitted.
    #[non_exhaustive]
    GroupMetadataWriteDenied { group_id: i64, name: String },
    /// File writes to the group are no longer permitted.
    #[non_exhaustive]
    GroupFileWriteDenied { group_id: i64, name: String },
    /// The server deleted objects this client still holds.
    #[non_exhaustive]
    ObjectsRemovedRemotely {
        library_id: LibraryIdentifier,
        removed: RemovedKeys,
    },
    /// The server deleted items that were edited locally, as
    /// `(key, parent key or "")` pairs.
    #[non_exhaustive]
    RemovedItemsHaveLocalChanges {
        library_id: LibraryIdentifier,
        keys: Vec<(String, String)>,
    },
}

impl Conflict {
    /// Library the conflict belongs to.
    pub fn library_id(&self) -> LibraryIdentifier {
        match self {
            Conflict::GroupRemoved { group_id, .. }
            | Conflict::GroupMetadataWriteDenied { group_id, .. }
            | Conflict::GroupFileWriteDenied { group_id, .. } => {
                LibraryIdentifier::Group(*group_id)
            }
            Conflict::ObjectsRemovedRemotely { library_id, .. }
            | Conflict::RemovedItemsHaveLocalChanges { library_id, .. } => *library_id,
        }
    }

    /// Lower values are surfaced first.
    pub fn priority(&self) -> u8 {
        match self {
            Conflict::RemovedItemsHaveLocalChanges { .. } => 0,
            Conflict::GroupRemoved { .. } => 1,
            Conflict::GroupMetadataWriteDenied { .. } => 2,
            Conflict::GroupFileWriteDenied { .. } => 3,
            Conflict::ObjectsRemovedRemotely { .. } => 4,
        }
    }

    /// Keys a `DeleteObjects` answer may name.
    pub fn removed_keys(&self) -> Option<RemovedKeys> {
        match self {
            Conflict::ObjectsRemovedRemotely { removed, .. } => Some(removed.clone()),
            Conflict::RemovedItemsHaveLocalChanges { keys, .. } => Some(RemovedKeys {
                items: keys.iter().map(|(key, _)| key.clone()).collect(),
                ..Default::default()
            }),
            _ => None,
        }
    }

    /// Whether `resolution` structurally answers this conflict.
    pub fn accepts(&self, resolution: &ConflictResolution) -> bool {
        match (self, resolution) {
            (
                Conflict::GroupRemoved { group_id, .. },
                ConflictResolution::DeleteGroup(id) | ConflictResolution::MarkGroupAsLocalOnly(id),
            ) => group_id == id,

            (
                Conflict::GroupMetadataWriteDenied { group_id, .. }
                | Conflict::GroupFileWriteDenied { group_id, .. },
                ConflictResolution::RevertLibraryToOriginal(library)
                | ConflictResolution::MarkChangesAsResolved(library),
            ) => *library == LibraryIdentifier::Group(*group_id),

            (
                Conflict::ObjectsRemovedRemotely { library_id, .. }
                | Conflict::RemovedItemsHaveLocalChanges { library_id, .. },
                ConflictResolution::DeleteObjects {
                    library_id: target,
                    removed,
                    ..
                },
            ) => {
                target == library_id
                    && self
                        .removed_keys()
                        .map(|held| removed.is_subset_of(&held))
                        .unwrap_or(false)
            }

            _ => false,
        }
    }
}

impl fmt::Display for Conflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Conflict::GroupRemoved { group_id, name } => {
                write!(f, "group \"{}\" ({}) was removed", name, group_id)
            }
            Conflict::GroupMetadataWriteDenied { group_id, name } => {
                write!(f, "metadata writes to group \"{}\" ({}) are denied", name, group_id)
            }
            Conflict::GroupFileWriteDenied { group_id, name } => {
                write!(f, "file writes to group \"{}\" ({}) are denied", name, group_id)
            }
            Conflict::ObjectsRemovedRemotely {
                library_id,
                removed,
            } => write!(
                f,
                "{}: server removed {} collections, {} items, {} searches, {} tags",
                library_id,
                removed.collections.len(),
                removed.items.len(),
                removed.searches.len(),
                removed.tags.len()
            ),
            Conflict::RemovedItemsHaveLocalChanges { library_id, keys } => write!(
                f,
                "{}: server removed {} locally edited items",
                library_id,
                keys.len()
            ),
        }
    }
}

/// A user or policy answer to a [`Conflict`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConflictResolution {
    /// Remove the group library and everything in it.
    DeleteGroup(i64),
    /// Keep the group's data but stop syncing it.
    MarkGroupAsLocalOnly(i64),
    /// Drop local changes and re-fetch canonical state.
    RevertLibraryToOriginal(LibraryIdentifier),
    /// Treat local changes as already synced.
    MarkChangesAsResolved(LibraryIdentifier),
    /// Delete exactly the listed keys and stamp the library version.
    #[serde(rename_all = "camelCase")]
    DeleteObjects {
        library_id: LibraryIdentifier,
        removed: RemovedKeys,
        version: i64,
    },
}

impl ConflictResolution {
    pub fn library_id(&self) -> LibraryIdentifier {
        match self {
            ConflictResolution::DeleteGroup(id) | ConflictResolution::MarkGroupAsLocalOnly(id) => {
                LibraryIdentifier::Group(*id)
            }
            ConflictResolution::RevertLibraryToOriginal(library)
            | ConflictResolution::MarkChangesAsResolved(library) => *library,
            ConflictResolution::DeleteObjects { library_id, .. } => *library_id,
        }
    }

    /// The same answer with its version stamp capped at `version`.
    pub(crate) fn capped_at(&self, version: i64) -> Self {
        match self {
            ConflictResolution::DeleteObjects {
                library_id,
                removed,
                version: stamp,
            } => ConflictResolution::DeleteObjects {
                library_id: *library_id,
                removed: removed.clone(),
                version: (*stamp).min(version),
            },
            other => other.clone(),
        }
    }
}

/// What the server told us, in the shape the detector classifies.
#[derive(Debug, Clone)]
pub enum ServerReport {
    /// A group library could not be found remotely.
    GroupMissing { group_id: i64, name: String },
    /// A write to a group was refused.
    WriteDenied {
        group_id: i64,
        name: String,
        scope: WriteScope,
    },
    /// Keys removed on the server, with the local objects still held for them.
    Removals {
        removed: RemovedKeys,
        held: Vec<SyncableObject>,
    },
}

/// Classifies server reports into conflicts. Never mutates anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConflictDetector;

impl ConflictDetector {
    pub fn new() -> Self {
        Self
    }

    /// Classify one report, highest priority first.
    pub fn classify(&self, library: LibraryIdentifier, report: &ServerReport) -> Vec<Conflict> {
        let mut conflicts = match report {
            ServerReport::GroupMissing { group_id, name } => vec![Conflict::GroupRemoved {
                group_id: *group_id,
                name: name.clone(),
            }],
            ServerReport::WriteDenied {
                group_id,
                name,
                scope: WriteScope::Metadata,
            } => vec![Conflict::GroupMetadataWriteDenied {
                group_id: *group_id,
                name: name.clone(),
            }],
            ServerReport::WriteDenied {
                group_id,
                name,
                scope: WriteScope::Files,
            } => vec![Conflict::GroupFileWriteDenied {
                group_id: *group_id,
                name: name.clone(),
            }],
            ServerReport::Removals { removed, held } => classify_removals(library, removed, held),
        };

        conflicts.sort_by_key(Conflict::priority);
        if !conflicts.is_empty() {
            debug!("{}: classified {} conflicts", library, conflicts.len());
        }
        conflicts
    }
}

fn classify_removals(
    library: LibraryIdentifier,
    removed: &RemovedKeys,
    held: &[SyncableObject],
) -> Vec<Conflict> {
    let mut unexplained = RemovedKeys::default();
    let mut edited_items = Vec::new();

    for kind in ObjectKind::UPLOAD_ORDER {
        for key in removed.keys(kind) {
            let object = match held.iter().find(|o| o.kind == kind && &o.key == key) {
                Some(object) => object,
                None => continue,
            };
            // A local tombstone already explains the removal.
            if object.deleted {
                continue;
            }

            if kind == ObjectKind::Item && object.has_local_changes() {
                edited_items.push((key.clone(), object.parent_key.clone().unwrap_or_default()));
                continue;
            }

            if kind == ObjectKind::Collection && object.has_local_changes() {
                warn!(
                    "{}: collection {} was removed remotely but has local changes",
                    library, key
                );
            }
            unexplained.keys_mut(kind).push(key.clone());
        }
    }

    let mut conflicts = Vec::new();
    if !edited_items.is_empty() {
        conflicts.push(Conflict::RemovedItemsHaveLocalChanges {
            library_id: library,
            keys: edited_items,
        });
    }
    if !unexplained.is_empty() {
        conflicts.push(Conflict::ObjectsRemovedRemotely {
            library_id: library,
            removed: unexplained,
        });
    }
    conflicts
}
