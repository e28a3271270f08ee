//! Remote API abstraction.
//!
//! Shapes mirror a versioned web API: every response carries the library
//! version it reflects and every write names the version it is based on.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::object::{ChangedFields, FieldTag, SyncableObject};
use shelfsync_common::{LibraryIdentifier, ObjectKind, Result};

/// Server-side state of a single object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteObject {
    pub key: String,
    pub kind: ObjectKind,
    pub version: i64,
    pub parent_key: Option<String>,
    pub trash: bool,
    pub date_modified: DateTime<Utc>,
    #[serde(default)]
    pub attributes: BTreeMap<FieldTag, Value>,
}

impl RemoteObject {
    pub fn new(kind: ObjectKind, key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            kind,
            version: 0,
            parent_key: None,
            trash: false,
            date_modified: Utc::now(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, tag: FieldTag, value: Value) -> Self {
        self.attributes.insert(tag, value);
        self
    }

    pub fn with_parent(mut self, parent_key: impl Into<String>) -> Self {
        self.parent_key = Some(parent_key.into());
        self
    }

    /// Apply wire parameters from an upload.
    ///
    /// Parameter names that match no known field group are treated as
    /// entries of the `fields` group.
    pub fn apply_parameters(&mut self, parameters: &Map<String, Value>) {
        for (name, value) in parameters {
            if name == "key" || name == "version" {
                continue;
            }
            match FieldTag::from_wire_name(self.kind, name) {
                Some(FieldTag::Parent) => {
                    self.parent_key = value.as_str().map(str::to_string);
                }
                Some(FieldTag::Trash) => {
                    self.trash = value.as_bool().unwrap_or(false);
                }
                Some(FieldTag::DateModified) => {
                    if let Some(date) = value
                        .as_str()
                        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                    {
                        self.date_modified = date.with_timezone(&Utc);
                    }
                }
                Some(tag) => {
                    self.attributes.insert(tag, value.clone());
                }
                None => {
                    let fields = self
                        .attributes
                        .entry(FieldTag::Fields)
                        .or_insert_with(|| Value::Object(Map::new()));
                    if let Value::Object(fields) = fields {
                        fields.insert(name.clone(), value.clone());
                    }
                }
            }
        }
    }

    /// Convert to a clean local object at this version.
    pub fn to_local(&self) -> SyncableObject {
        SyncableObject {
            key: self.key.clone(),
            kind: self.kind,
            version: self.version,
            needs_sync: false,
            changed_fields: ChangedFields::empty(),
            parent_key: self.parent_key.clone(),
            trash: self.trash,
            deleted: false,
            date_modified: self.date_modified,
            attributes: self.attributes.clone(),
        }
    }
}

/// Objects changed since a version.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VersionedPage {
    pub library_version: i64,
    pub objects: Vec<RemoteObject>,
}

/// Keys removed from a library, grouped by kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemovedKeys {
    pub collections: Vec<String>,
    pub items: Vec<String>,
    pub searches: Vec<String>,
    pub tags: Vec<String>,
}

impl RemovedKeys {
    pub fn keys(&self, kind: ObjectKind) -> &[String] {
        match kind {
            ObjectKind::Collection => &self.collections,
            ObjectKind::Item => &self.items,
            ObjectKind::Search => &self.searches,
            ObjectKind::Tag => &self.tags,
        }
    }

    pub fn keys_mut(&mut self, kind: ObjectKind) -> &mut Vec<String> {
        match kind {
            ObjectKind::Collection => &mut self.collections,
            ObjectKind::Item => &mut self.items,
            ObjectKind::Search => &mut self.searches,
            ObjectKind::Tag => &mut self.tags,
        }
    }

    pub fn is_empty(&self) -> bool {
        ObjectKind::UPLOAD_ORDER
            .into_iter()
            .all(|kind| self.keys(kind).is_empty())
    }

    /// Whether every key in `self` also appears in `other`.
    pub fn is_subset_of(&self, other: &RemovedKeys) -> bool {
        ObjectKind::UPLOAD_ORDER.into_iter().all(|kind| {
            self.keys(kind)
                .iter()
                .all(|key| other.keys(kind).contains(key))
        })
    }

    /// Keys in `self` that do not appear in `other`.
    pub fn without(&self, other: &RemovedKeys) -> RemovedKeys {
        let mut rest = RemovedKeys::default();
        for kind in ObjectKind::UPLOAD_ORDER {
            *rest.keys_mut(kind) = self
                .keys(kind)
                .iter()
                .filter(|key| !other.keys(kind).contains(key))
                .cloned()
                .collect();
        }
        rest
    }
}

/// Server-side deletions since a version.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeletionPage {
    pub library_version: i64,
    pub removed: RemovedKeys,
}

/// Group metadata and the current user's permissions in it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupInfo {
    pub id: i64,
    pub name: String,
    pub version: i64,
    pub can_edit_metadata: bool,
    pub can_edit_files: bool,
}

/// One object in a write batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadEntry {
    pub key: String,
    /// Object version the edit was based on.
    pub base_version: i64,
    pub parameters: Map<String, Value>,
}

/// An ordered batch of object writes for one library and kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteBatch {
    pub library_id: LibraryIdentifier,
    pub kind: ObjectKind,
    /// Library version the batch is based on.
    pub base_version: i64,
    pub entries: Vec<UploadEntry>,
}

impl WriteBatch {
    pub fn keys(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.key.clone()).collect()
    }
}

/// A batch of deletions for one library and kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteBatch {
    pub library_id: LibraryIdentifier,
    pub kind: ObjectKind,
    pub base_version: i64,
    pub keys: Vec<String>,
}

/// Server verdict on a single uploaded object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ObjectOutcome {
    Synced { version: i64 },
    /// The object changed on the server after `base_version`.
    Conflict { remote_version: i64 },
    Failed { code: u16, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectResult {
    pub key: String,
    pub outcome: ObjectOutcome,
}

/// Response to a write batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadResponse {
    pub library_version: i64,
    pub results: Vec<ObjectResult>,
}

/// Remote API used by the sync engine.
///
/// Implementations report library-level precondition failures as
/// `Error::VersionConflict`, denied writes as `Error::Permission` and
/// network faults as `Error::Transport`.
#[async_trait]
pub trait RemoteGateway: Send + Sync {
    /// Gateway name for logging.
    fn name(&self) -> &str;

    /// Group metadata, or `None` if the group no longer exists.
    async fn fetch_group(&self, group_id: i64) -> Result<Option<GroupInfo>>;

    /// Objects of `kind` with a version greater than `since`.
    async fn fetch_since(
        &self,
        library: LibraryIdentifier,
        kind: ObjectKind,
        since: i64,
    ) -> Result<VersionedPage>;

    /// Specific objects by key. Unknown keys are skipped.
    async fn fetch_objects(
        &self,
        library: LibraryIdentifier,
        kind: ObjectKind,
        keys: &[String],
    ) -> Result<VersionedPage>;

    /// Keys deleted on the server after `since`.
    async fn fetch_deletions(&self, library: LibraryIdentifier, since: i64)
        -> Result<DeletionPage>;

    /// Submit a write batch.
    async fn upload(&self, batch: &WriteBatch) -> Result<UploadResponse>;

    /// Submit deletions. Returns the new library version.
    async fn submit_deletions(&self, batch: &DeleteBatch) -> Result<i64>;
}
