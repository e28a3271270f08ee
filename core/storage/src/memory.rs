//! In-memory object store.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::object::{ChangedFields, SyncableObject};
use crate::store::{LibraryRecord, Mutation, ObjectStore};
use shelfsync_common::{Error, LibraryIdentifier, ObjectKind, Result};

/// A library with its objects, grouped by kind and key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LibraryState {
    pub record: LibraryRecord,
    #[serde(default)]
    pub objects: BTreeMap<ObjectKind, BTreeMap<String, SyncableObject>>,
}

impl LibraryState {
    fn new(record: LibraryRecord) -> Self {
        Self {
            record,
            objects: BTreeMap::new(),
        }
    }

    fn objects_mut(&mut self, kind: ObjectKind) -> &mut BTreeMap<String, SyncableObject> {
        self.objects.entry(kind).or_default()
    }

    fn all_objects_mut(&mut self) -> impl Iterator<Item = &mut BTreeMap<String, SyncableObject>> {
        self.objects.values_mut()
    }
}

/// Serializable copy of a whole store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub libraries: Vec<LibraryState>,
}

/// In-memory object store.
///
/// Each commit clones the target library, applies the batch to the clone
/// and swaps it in only if every mutation succeeded.
#[derive(Clone, Default)]
pub struct MemoryStore {
    libraries: Arc<RwLock<BTreeMap<LibraryIdentifier, LibraryState>>>,
    failing_commits: Arc<AtomicUsize>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store from a snapshot.
    pub fn from_snapshot(snapshot: StoreSnapshot) -> Self {
        let libraries = snapshot
            .libraries
            .into_iter()
            .map(|state| (state.record.id, state))
            .collect();
        Self {
            libraries: Arc::new(RwLock::new(libraries)),
            failing_commits: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Copy the current contents.
    pub fn snapshot(&self) -> Result<StoreSnapshot> {
        Ok(StoreSnapshot {
            libraries: self.read()?.values().cloned().collect(),
        })
    }

    /// Serialize the store to JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.snapshot()?)?)
    }

    /// Restore a store from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(Self::from_snapshot(serde_json::from_str(json)?))
    }

    /// Write the store to a JSON file.
    pub async fn save(&self, path: &Path) -> Result<()> {
        let json = self.to_json()?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, json).await?;
        Ok(())
    }

    /// Load a store from a JSON file, or start empty if the file is missing.
    pub async fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let json = tokio::fs::read_to_string(path).await?;
        Self::from_json(&json)
    }

    /// Make the next `count` commits fail with a store error.
    pub fn fail_next_commits(&self, count: usize) {
        self.failing_commits.store(count, Ordering::SeqCst);
    }

    /// Look up a single object.
    pub fn object(
        &self,
        library: LibraryIdentifier,
        kind: ObjectKind,
        key: &str,
    ) -> Result<Option<SyncableObject>> {
        Ok(self
            .read()?
            .get(&library)
            .and_then(|state| state.objects.get(&kind))
            .and_then(|objects| objects.get(key))
            .cloned())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, BTreeMap<LibraryIdentifier, LibraryState>>> {
        self.libraries
            .read()
            .map_err(|_| Error::Store("store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, BTreeMap<LibraryIdentifier, LibraryState>>> {
        self.libraries
            .write()
            .map_err(|_| Error::Store("store lock poisoned".to_string()))
    }

    fn take_injected_failure(&self) -> bool {
        self.failing_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn filtered(
        &self,
        library: LibraryIdentifier,
        kind: ObjectKind,
        keep: impl Fn(&SyncableObject) -> bool,
    ) -> Result<Vec<SyncableObject>> {
        let libraries = self.read()?;
        let objects = libraries
            .get(&library)
            .and_then(|state| state.objects.get(&kind));
        Ok(objects
            .map(|objects| objects.values().filter(|o| keep(o)).cloned().collect())
            .unwrap_or_default())
    }
}

fn apply(
    staged: &mut Option<LibraryState>,
    library: LibraryIdentifier,
    mutation: Mutation,
) -> Result<()> {
    match mutation {
        Mutation::PutLibrary(record) => {
            if record.id != library {
                return Err(Error::InvalidInput(format!(
                    "library record {} committed to {}",
                    record.id, library
                )));
            }
            match staged {
                Some(state) => state.record = record,
                None => *staged = Some(LibraryState::new(record)),
            }
            return Ok(());
        }
        Mutation::RemoveLibrary => {
            *staged = None;
            return Ok(());
        }
        _ => {}
    }

    let state = staged
        .as_mut()
        .ok_or_else(|| Error::NotFound(format!("library {}", library)))?;

    match mutation {
        Mutation::Put(object) => {
            state.objects_mut(object.kind).insert(object.key.clone(), object);
        }
        Mutation::Remove { kind, key } => {
            if state.objects_mut(kind).remove(&key).is_none() {
                return Err(Error::NotFound(key));
            }
        }
        Mutation::MarkSynced { kind, key, version } => {
            let object = state
                .objects_mut(kind)
                .get_mut(&key)
                .ok_or(Error::NotFound(key))?;
            object.version = version;
            object.changed_fields = Default::default();
            object.needs_sync = false;
        }
        Mutation::MarkNew { kind, key } => {
            let object = state
                .objects_mut(kind)
                .get_mut(&key)
                .ok_or(Error::NotFound(key))?;
            object.version = 0;
            object.changed_fields = ChangedFields::all();
            object.needs_sync = false;
            object.deleted = false;
        }
        Mutation::ClearChanges => {
            for objects in state.all_objects_mut() {
                objects.retain(|_, object| !object.deleted);
                for object in objects.values_mut() {
                    object.changed_fields = Default::default();
                }
            }
        }
        Mutation::RevertChanges => {
            for objects in state.all_objects_mut() {
                objects.retain(|_, object| !(object.is_dirty() && object.version == 0));
                for object in objects.values_mut().filter(|o| o.is_dirty()) {
                    object.changed_fields = Default::default();
                    object.deleted = false;
                    object.needs_sync = true;
                }
            }
        }
        Mutation::ClearNeedsSync => {
            for objects in state.all_objects_mut() {
                for object in objects.values_mut() {
                    object.needs_sync = false;
                }
            }
        }
        Mutation::SetVersion(version) => state.record.version = version,
        Mutation::SetSyncState(sync_state) => state.record.sync_state = sync_state,
        Mutation::PutLibrary(_) | Mutation::RemoveLibrary => {}
    }

    Ok(())
}

#[async_trait]
impl ObjectStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn read_dirty(
        &self,
        library: LibraryIdentifier,
        kind: ObjectKind,
    ) -> Result<Vec<SyncableObject>> {
        self.filtered(library, kind, |o| o.is_dirty())
    }

    async fn read_needing_sync(
        &self,
        library: LibraryIdentifier,
        kind: ObjectKind,
    ) -> Result<Vec<SyncableObject>> {
        self.filtered(library, kind, |o| o.needs_sync)
    }

    async fn read_objects(
        &self,
        library: LibraryIdentifier,
        kind: ObjectKind,
        keys: &[String],
    ) -> Result<Vec<SyncableObject>> {
        self.filtered(library, kind, |o| keys.contains(&o.key))
    }

    async fn library(&self, library: LibraryIdentifier) -> Result<Option<LibraryRecord>> {
        Ok(self.read()?.get(&library).map(|state| state.record.clone()))
    }

    async fn libraries(&self) -> Result<Vec<LibraryRecord>> {
        Ok(self
            .read()?
            .values()
            .map(|state| state.record.clone())
            .collect())
    }

    async fn current_version(&self, library: LibraryIdentifier) -> Result<i64> {
        self.read()?
            .get(&library)
            .map(|state| state.record.version)
            .ok_or_else(|| Error::NotFound(format!("library {}", library)))
    }

    async fn commit(&self, library: LibraryIdentifier, mutations: Vec<Mutation>) -> Result<()> {
        if self.take_injected_failure() {
            return Err(Error::Store("injected commit failure".to_string()));
        }

        let mut libraries = self.write()?;
        let mut staged = libraries.get(&library).cloned();
        for mutation in mutations {
            apply(&mut staged, library, mutation)?;
        }

        match staged {
            Some(state) => {
                libraries.insert(library, state);
            }
            None => {
                libraries.remove(&library);
            }
        }
        Ok(())
    }
}
