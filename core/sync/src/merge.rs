//! Merging downloaded objects into local state.

use shelfsync_storage::{FieldTag, RemoteObject, SyncableObject};

/// Outcome of merging one remote object.
#[derive(Debug, Clone, PartialEq)]
pub enum MergeDecision {
    /// Not known locally.
    Insert(SyncableObject),
    /// Known and clean locally; the server copy replaces it.
    Overwrite(SyncableObject),
    /// The local copy is at least as new.
    Ignore,
    /// Known and dirty locally; the version advances and locally-dirty
    /// field groups keep their local values.
    Rebase(SyncableObject),
}

impl MergeDecision {
    /// The object to store, if anything changes.
    pub fn into_object(self) -> Option<SyncableObject> {
        match self {
            MergeDecision::Insert(object)
            | MergeDecision::Overwrite(object)
            | MergeDecision::Rebase(object) => Some(object),
            MergeDecision::Ignore => None,
        }
    }
}

/// Decide how `remote` lands on top of `local`.
///
/// Dirty local data is never overwritten here.
pub fn merge_remote(local: Option<&SyncableObject>, remote: &RemoteObject) -> MergeDecision {
    let local = match local {
        Some(local) => local,
        None => return MergeDecision::Insert(remote.to_local()),
    };

    if remote.version <= local.version && !local.needs_sync {
        return MergeDecision::Ignore;
    }

    if !local.is_dirty() {
        return MergeDecision::Overwrite(remote.to_local());
    }

    let mut merged = remote.to_local();
    if local.changed_fields.is_all() {
        merged = SyncableObject {
            version: remote.version,
            needs_sync: false,
            ..local.clone()
        };
    } else {
        for tag in local.changed_fields.tags_for(local.kind) {
            keep_local(&mut merged, local, tag);
        }
        merged.changed_fields = local.changed_fields;
        merged.deleted = local.deleted;
    }

    MergeDecision::Rebase(merged)
}

fn keep_local(merged: &mut SyncableObject, local: &SyncableObject, tag: FieldTag) {
    match tag {
        FieldTag::Parent => merged.parent_key = local.parent_key.clone(),
        FieldTag::Trash => merged.trash = local.trash,
        FieldTag::DateModified => merged.date_modified = local.date_modified,
        _ => match local.attributes.get(&tag) {
            Some(value) => {
                merged.attributes.insert(tag, value.clone());
            }
            None => {
                merged.attributes.remove(&tag);
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use shelfsync_common::ObjectKind;

    fn remote(version: i64) -> RemoteObject {
        let mut object = RemoteObject::new(ObjectKind::Item, "ITEM0001")
            .with_attribute(FieldTag::Fields, json!({"title": "Remote title"}))
            .with_attribute(FieldTag::Tags, json!([{"tag": "remote"}]));
        object.version = version;
        object
    }

    #[test]
    fn test_unknown_object_is_inserted() {
        let decision = merge_remote(None, &remote(4));
        assert!(matches!(decision, MergeDecision::Insert(ref o) if o.version == 4));
    }

    #[test]
    fn test_stale_remote_is_ignored() {
        let local = remote(6).to_local();
        assert_eq!(merge_remote(Some(&local), &remote(5)), MergeDecision::Ignore);
    }

    #[test]
    fn test_needs_sync_forces_overwrite() {
        let mut local = remote(6).to_local();
        local.needs_sync = true;
        let decision = merge_remote(Some(&local), &remote(6));
        assert!(matches!(decision, MergeDecision::Overwrite(ref o) if !o.needs_sync));
    }

    #[test]
    fn test_dirty_local_fields_survive() {
        let mut local = remote(3).to_local();
        local.edit(FieldTag::Fields, json!({"title": "Local title"}));

        let decision = merge_remote(Some(&local), &remote(8));
        let merged = match decision {
            MergeDecision::Rebase(merged) => merged,
            other => panic!("expected rebase, got {:?}", other),
        };
        assert_eq!(merged.version, 8);
        assert_eq!(
            merged.attributes[&FieldTag::Fields],
            json!({"title": "Local title"})
        );
        assert_eq!(merged.attributes[&FieldTag::Tags], json!([{"tag": "remote"}]));
        assert!(merged.changed_fields.contains(FieldTag::Fields));
    }
}
