//! Syncable objects and their locally-dirty field groups.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

use shelfsync_common::ObjectKind;

/// A group of attributes that is tracked as one unit of local change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FieldTag {
    Name,
    Parent,
    Fields,
    Collections,
    Tags,
    Creators,
    Trash,
    DateModified,
    ItemType,
    Relations,
    Conditions,
}

impl FieldTag {
    /// Every concrete tag, in wire emission order.
    pub const ALL: [FieldTag; 11] = [
        FieldTag::ItemType,
        FieldTag::Name,
        FieldTag::Parent,
        FieldTag::Fields,
        FieldTag::Creators,
        FieldTag::Collections,
        FieldTag::Tags,
        FieldTag::Relations,
        FieldTag::Conditions,
        FieldTag::Trash,
        FieldTag::DateModified,
    ];

    fn bit(self) -> u16 {
        1 << (self as u16)
    }

    /// Whether objects of `kind` carry this field group.
    pub fn applies_to(self, kind: ObjectKind) -> bool {
        match kind {
            ObjectKind::Collection => matches!(self, FieldTag::Name | FieldTag::Parent),
            ObjectKind::Search => matches!(
                self,
                FieldTag::Name | FieldTag::Conditions | FieldTag::DateModified
            ),
            ObjectKind::Item => !matches!(self, FieldTag::Name | FieldTag::Conditions),
            ObjectKind::Tag => matches!(self, FieldTag::Name),
        }
    }

    /// Wire parameter name for value-carrying groups.
    ///
    /// `Fields` has no single name: its entries are flattened into the parameters.
    pub fn wire_name(self, kind: ObjectKind) -> Option<&'static str> {
        match self {
            FieldTag::Name => Some("name"),
            FieldTag::Parent => match kind {
                ObjectKind::Collection => Some("parentCollection"),
                ObjectKind::Item => Some("parentItem"),
                _ => None,
            },
            FieldTag::Fields => None,
            FieldTag::Collections => Some("collections"),
            FieldTag::Tags => Some("tags"),
            FieldTag::Creators => Some("creators"),
            FieldTag::Trash => Some("deleted"),
            FieldTag::DateModified => Some("dateModified"),
            FieldTag::ItemType => Some("itemType"),
            FieldTag::Relations => Some("relations"),
            FieldTag::Conditions => Some("conditions"),
        }
    }

    /// Inverse of [`FieldTag::wire_name`].
    pub fn from_wire_name(kind: ObjectKind, name: &str) -> Option<Self> {
        FieldTag::ALL
            .into_iter()
            .filter(|tag| tag.applies_to(kind))
            .find(|tag| tag.wire_name(kind) == Some(name))
    }
}

const ALL_SENTINEL: u16 = 1 << 15;

/// Bitmask of locally-dirty field groups.
///
/// The `all` sentinel means the full object must be resent, which is the
/// state of an object created locally and never uploaded.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChangedFields(u16);

impl ChangedFields {
    /// No local changes.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Full-object sentinel.
    pub const fn all() -> Self {
        Self(ALL_SENTINEL)
    }

    /// Build a mask from individual tags.
    pub fn from_tags(tags: impl IntoIterator<Item = FieldTag>) -> Self {
        let mut fields = Self::empty();
        for tag in tags {
            fields.insert(tag);
        }
        fields
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn is_all(&self) -> bool {
        self.0 & ALL_SENTINEL != 0
    }

    /// Whether `tag` is dirty. Always true under the `all` sentinel.
    pub fn contains(&self, tag: FieldTag) -> bool {
        self.is_all() || self.0 & tag.bit() != 0
    }

    pub fn insert(&mut self, tag: FieldTag) {
        self.0 |= tag.bit();
    }

    pub fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Dirty tags applicable to `kind`, expanding the sentinel.
    pub fn tags_for(&self, kind: ObjectKind) -> Vec<FieldTag> {
        FieldTag::ALL
            .into_iter()
            .filter(|tag| tag.applies_to(kind) && self.contains(*tag))
            .collect()
    }
}

impl fmt::Debug for ChangedFields {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_all() {
            return write!(f, "ChangedFields(all)");
        }
        let tags: Vec<FieldTag> = FieldTag::ALL
            .into_iter()
            .filter(|tag| self.0 & tag.bit() != 0)
            .collect();
        write!(f, "ChangedFields({:?})", tags)
    }
}

/// A locally stored object that participates in sync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncableObject {
    /// Stable key, unique within its library.
    pub key: String,
    /// Object type; decides upload order and which fields apply.
    pub kind: ObjectKind,
    /// Last known server version of this object. Zero if never uploaded.
    pub version: i64,
    /// Server holds data newer than `version`.
    pub needs_sync: bool,
    /// Field groups edited locally since the last sync.
    pub changed_fields: ChangedFields,
    /// Key of the parent collection or item, if any.
    pub parent_key: Option<String>,
    /// In the trash, but not deleted.
    pub trash: bool,
    /// Local deletion tombstone awaiting upload.
    pub deleted: bool,
    /// Time of the last local edit.
    pub date_modified: DateTime<Utc>,
    /// Values of value-carrying field groups.
    #[serde(default)]
    pub attributes: BTreeMap<FieldTag, Value>,
}

impl SyncableObject {
    /// Create an object on first local edit. The whole object is dirty.
    pub fn new_local(kind: ObjectKind, key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            kind,
            version: 0,
            needs_sync: false,
            changed_fields: ChangedFields::all(),
            parent_key: None,
            trash: false,
            deleted: false,
            date_modified: Utc::now(),
            attributes: BTreeMap::new(),
        }
    }

    /// Set an attribute without marking it dirty.
    pub fn with_attribute(mut self, tag: FieldTag, value: Value) -> Self {
        self.attributes.insert(tag, value);
        self
    }

    /// Set the parent without marking it dirty.
    pub fn with_parent(mut self, parent_key: impl Into<String>) -> Self {
        self.parent_key = Some(parent_key.into());
        self
    }

    /// Set the known server version and clear local dirtiness.
    pub fn synced_at(mut self, version: i64) -> Self {
        self.version = version;
        self.changed_fields = ChangedFields::empty();
        self
    }

    /// Record a local edit of a value-carrying field group.
    pub fn edit(&mut self, tag: FieldTag, value: Value) {
        self.attributes.insert(tag, value);
        self.touch(tag);
    }

    /// Record a local parent change.
    pub fn set_parent(&mut self, parent_key: Option<String>) {
        self.parent_key = parent_key;
        self.touch(FieldTag::Parent);
    }

    /// Record a local trash toggle.
    pub fn set_trash(&mut self, trash: bool) {
        self.trash = trash;
        self.touch(FieldTag::Trash);
    }

    /// Tombstone the object so its deletion is uploaded.
    pub fn mark_deleted(&mut self) {
        self.deleted = true;
        self.date_modified = Utc::now();
    }

    fn touch(&mut self, tag: FieldTag) {
        self.changed_fields.insert(tag);
        if self.kind != ObjectKind::Collection && self.kind != ObjectKind::Tag {
            self.changed_fields.insert(FieldTag::DateModified);
        }
        self.date_modified = Utc::now();
    }

    /// Whether any field group was edited locally since the last sync.
    pub fn has_local_changes(&self) -> bool {
        !self.changed_fields.is_empty()
    }

    /// Whether the object has anything to upload, edits or a deletion.
    pub fn is_dirty(&self) -> bool {
        self.has_local_changes() || self.deleted
    }

    /// Wire parameters for the dirty field groups, or `None` when clean.
    ///
    /// Identity fields (`key`, `version`) are always present. Under the
    /// `all` sentinel every field group the object carries is emitted.
    pub fn update_parameters(&self) -> Option<Map<String, Value>> {
        if !self.has_local_changes() {
            return None;
        }

        let mut parameters = Map::new();
        parameters.insert("key".to_string(), Value::from(self.key.clone()));
        parameters.insert("version".to_string(), Value::from(self.version));

        for tag in self.changed_fields.tags_for(self.kind) {
            self.write_parameter(tag, &mut parameters);
        }

        Some(parameters)
    }

    fn write_parameter(&self, tag: FieldTag, parameters: &mut Map<String, Value>) {
        let value = match tag {
            FieldTag::Parent => match &self.parent_key {
                Some(key) => Value::from(key.clone()),
                None => Value::Bool(false),
            },
            FieldTag::Trash => Value::Bool(self.trash),
            FieldTag::DateModified => Value::from(
                self.date_modified
                    .to_rfc3339_opts(SecondsFormat::Secs, true),
            ),
            FieldTag::Fields => {
                if let Some(Value::Object(fields)) = self.attributes.get(&FieldTag::Fields) {
                    for (name, value) in fields {
                        parameters.insert(name.clone(), value.clone());
                    }
                }
                return;
            }
            _ => match self.attributes.get(&tag) {
                Some(value) => value.clone(),
                None => return,
            },
        };

        if let Some(name) = tag.wire_name(self.kind) {
            parameters.insert(name.to_string(), value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_changed_fields_sentinel() {
        let fields = ChangedFields::all();
        assert!(fields.is_all());
        assert!(fields.contains(FieldTag::Creators));
        assert!(!fields.is_empty());

        let fields = ChangedFields::from_tags([FieldTag::Name, FieldTag::Parent]);
        assert!(fields.contains(FieldTag::Name));
        assert!(!fields.contains(FieldTag::Tags));
        assert!(!fields.is_all());
    }

    #[test]
    fn test_changed_fields_serializes_as_bits() {
        let fields = ChangedFields::from_tags([FieldTag::Name]);
        let json = serde_json::to_string(&fields).unwrap();
        let restored: ChangedFields = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, fields);
    }

    #[test]
    fn test_clean_object_has_no_parameters() {
        let object = SyncableObject::new_local(ObjectKind::Collection, "AAAA1111").synced_at(4);
        assert!(object.update_parameters().is_none());
    }

    #[test]
    fn test_partial_parameters_only_include_dirty_groups() {
        let mut object = SyncableObject::new_local(ObjectKind::Collection, "AAAA1111")
            .with_attribute(FieldTag::Name, json!("Reading"))
            .with_parent("PPPP0000")
            .synced_at(12);
        object.edit(FieldTag::Name, json!("Reading list"));

        let parameters = object.update_parameters().unwrap();
        assert_eq!(parameters["key"], json!("AAAA1111"));
        assert_eq!(parameters["version"], json!(12));
        assert_eq!(parameters["name"], json!("Reading list"));
        assert!(!parameters.contains_key("parentCollection"));
    }

    #[test]
    fn test_full_item_parameters() {
        let object = SyncableObject::new_local(ObjectKind::Item, "ITEM0001")
            .with_attribute(FieldTag::ItemType, json!("book"))
            .with_attribute(FieldTag::Fields, json!({"title": "Dune", "date": "1965"}))
            .with_attribute(FieldTag::Tags, json!([{"tag": "scifi"}]));

        let parameters = object.update_parameters().unwrap();
        assert_eq!(parameters["itemType"], json!("book"));
        assert_eq!(parameters["title"], json!("Dune"));
        assert_eq!(parameters["date"], json!("1965"));
        assert_eq!(parameters["tags"], json!([{"tag": "scifi"}]));
        assert_eq!(parameters["parentItem"], json!(false));
        assert_eq!(parameters["deleted"], json!(false));
        assert!(parameters.contains_key("dateModified"));
        assert!(!parameters.contains_key("name"));
    }

    #[test]
    fn test_wire_name_round_trip() {
        for kind in ObjectKind::UPLOAD_ORDER {
            for tag in FieldTag::ALL.into_iter().filter(|t| t.applies_to(kind)) {
                if let Some(name) = tag.wire_name(kind) {
                    assert_eq!(FieldTag::from_wire_name(kind, name), Some(tag));
                }
            }
        }
    }
}
