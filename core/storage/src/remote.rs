//! In-memory remote that behaves like a versioned library API.
//!
//! Used by tests and by the CLI's local simulation mode. Supports fault
//! injection so retry and conflict paths can be driven deterministically.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

use crate::gateway::{
    DeleteBatch, DeletionPage, GroupInfo, ObjectOutcome, ObjectResult, RemoteGateway,
    RemoteObject, RemovedKeys, UploadResponse, VersionedPage, WriteBatch,
};
use shelfsync_common::{Error, LibraryIdentifier, ObjectKind, Result, WriteScope};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Tombstone {
    kind: ObjectKind,
    key: String,
    version: i64,
}

/// Server-side state of one library.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteLibrary {
    pub id: LibraryIdentifier,
    pub name: String,
    pub version: i64,
    pub can_edit_metadata: bool,
    pub can_edit_files: bool,
    #[serde(default)]
    objects: BTreeMap<ObjectKind, BTreeMap<String, RemoteObject>>,
    #[serde(default)]
    deletions: Vec<Tombstone>,
}

impl RemoteLibrary {
    fn new(id: LibraryIdentifier, name: String) -> Self {
        Self {
            id,
            name,
            version: 0,
            can_edit_metadata: true,
            can_edit_files: true,
            objects: BTreeMap::new(),
            deletions: Vec::new(),
        }
    }

    fn check_write(&self) -> Result<()> {
        match self.id {
            LibraryIdentifier::Group(group_id) if !self.can_edit_metadata => {
                Err(Error::Permission {
                    group_id,
                    scope: WriteScope::Metadata,
                })
            }
            _ => Ok(()),
        }
    }

    fn check_base_version(&self, base_version: i64) -> Result<()> {
        if self.version > base_version {
            return Err(Error::VersionConflict {
                local_version: base_version,
                remote_version: self.version,
            });
        }
        Ok(())
    }

    fn remove(&mut self, kind: ObjectKind, key: &str, version: i64) {
        if let Some(objects) = self.objects.get_mut(&kind) {
            objects.remove(key);
        }
        self.deletions.push(Tombstone {
            kind,
            key: key.to_string(),
            version,
        });
    }
}

/// Serializable copy of the whole remote.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteSnapshot {
    pub libraries: Vec<RemoteLibrary>,
}

#[derive(Debug, Clone, Copy)]
struct Fault {
    remaining: usize,
    retry_after: Option<f64>,
}

#[derive(Default)]
struct RemoteState {
    libraries: BTreeMap<LibraryIdentifier, RemoteLibrary>,
    faults: HashMap<LibraryIdentifier, Fault>,
    requests: HashMap<LibraryIdentifier, usize>,
}

impl RemoteState {
    fn begin_request(&mut self, library: LibraryIdentifier) -> Result<()> {
        *self.requests.entry(library).or_default() += 1;
        if let Some(fault) = self.faults.get_mut(&library) {
            if fault.remaining > 0 {
                fault.remaining -= 1;
                return Err(Error::Transport {
                    message: format!("injected failure for {}", library),
                    retry_after: fault.retry_after,
                });
            }
        }
        Ok(())
    }

    fn library(&self, library: LibraryIdentifier) -> Result<&RemoteLibrary> {
        self.libraries
            .get(&library)
            .ok_or_else(|| Error::NotFound(format!("remote library {}", library)))
    }

    fn library_mut(&mut self, library: LibraryIdentifier) -> Result<&mut RemoteLibrary> {
        self.libraries
            .get_mut(&library)
            .ok_or_else(|| Error::NotFound(format!("remote library {}", library)))
    }
}

/// In-memory [`RemoteGateway`].
#[derive(Clone, Default)]
pub struct MemoryRemote {
    state: Arc<Mutex<RemoteState>>,
    latency: Duration,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every request by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn from_snapshot(snapshot: RemoteSnapshot) -> Self {
        let state = RemoteState {
            libraries: snapshot
                .libraries
                .into_iter()
                .map(|library| (library.id, library))
                .collect(),
            ..Default::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
            latency: Duration::ZERO,
        }
    }

    pub fn snapshot(&self) -> Result<RemoteSnapshot> {
        Ok(RemoteSnapshot {
            libraries: self.lock()?.libraries.values().cloned().collect(),
        })
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.snapshot()?)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, json).await?;
        Ok(())
    }

    /// Load a remote from a JSON file, or start empty if the file is missing.
    pub async fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let json = tokio::fs::read_to_string(path).await?;
        Ok(Self::from_snapshot(serde_json::from_str(&json)?))
    }

    /// Create an empty, writable library.
    pub fn create_library(&self, library: LibraryIdentifier, name: &str) -> Result<()> {
        self.lock()?
            .libraries
            .entry(library)
            .or_insert_with(|| RemoteLibrary::new(library, name.to_string()));
        Ok(())
    }

    /// Delete a library, as when a group is deleted or the user leaves it.
    pub fn remove_library(&self, library: LibraryIdentifier) -> Result<()> {
        self.lock()?.libraries.remove(&library);
        Ok(())
    }

    pub fn set_permissions(
        &self,
        library: LibraryIdentifier,
        can_edit_metadata: bool,
        can_edit_files: bool,
    ) -> Result<()> {
        let mut state = self.lock()?;
        let remote = state.library_mut(library)?;
        remote.can_edit_metadata = can_edit_metadata;
        remote.can_edit_files = can_edit_files;
        Ok(())
    }

    /// Write an object as another client would. Returns the new library version.
    pub fn server_put(&self, library: LibraryIdentifier, mut object: RemoteObject) -> Result<i64> {
        let mut state = self.lock()?;
        let remote = state.library_mut(library)?;
        remote.version += 1;
        object.version = remote.version;
        remote
            .objects
            .entry(object.kind)
            .or_default()
            .insert(object.key.clone(), object);
        Ok(remote.version)
    }

    /// Delete an object as another client would. Returns the new library version.
    pub fn server_delete(
        &self,
        library: LibraryIdentifier,
        kind: ObjectKind,
        key: &str,
    ) -> Result<i64> {
        let mut state = self.lock()?;
        let remote = state.library_mut(library)?;
        remote.version += 1;
        let version = remote.version;
        remote.remove(kind, key, version);
        Ok(version)
    }

    pub fn object(
        &self,
        library: LibraryIdentifier,
        kind: ObjectKind,
        key: &str,
    ) -> Result<Option<RemoteObject>> {
        let state = self.lock()?;
        Ok(state
            .libraries
            .get(&library)
            .and_then(|remote| remote.objects.get(&kind))
            .and_then(|objects| objects.get(key))
            .cloned())
    }

    pub fn library_version(&self, library: LibraryIdentifier) -> Result<Option<i64>> {
        Ok(self.lock()?.libraries.get(&library).map(|remote| remote.version))
    }

    /// Fail the next `count` requests touching `library` with a transport error.
    pub fn fail_next(&self, library: LibraryIdentifier, count: usize) -> Result<()> {
        self.inject(library, count, None)
    }

    /// Like [`MemoryRemote::fail_next`], with a `Retry-After` hint.
    pub fn fail_next_with_retry_after(
        &self,
        library: LibraryIdentifier,
        count: usize,
        retry_after: f64,
    ) -> Result<()> {
        self.inject(library, count, Some(retry_after))
    }

    /// Number of requests made against `library` so far.
    pub fn request_count(&self, library: LibraryIdentifier) -> Result<usize> {
        Ok(self
            .lock()?
            .requests
            .get(&library)
            .copied()
            .unwrap_or_default())
    }

    fn inject(
        &self,
        library: LibraryIdentifier,
        count: usize,
        retry_after: Option<f64>,
    ) -> Result<()> {
        self.lock()?.faults.insert(
            library,
            Fault {
                remaining: count,
                retry_after,
            },
        );
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, RemoteState>> {
        self.state
            .lock()
            .map_err(|_| Error::transport("remote state poisoned"))
    }

    async fn delay(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }
}

#[async_trait]
impl RemoteGateway for MemoryRemote {
    fn name(&self) -> &str {
        "memory"
    }

    async fn fetch_group(&self, group_id: i64) -> Result<Option<GroupInfo>> {
        self.delay().await;
        let library = LibraryIdentifier::Group(group_id);
        let mut state = self.lock()?;
        state.begin_request(library)?;
        Ok(state.libraries.get(&library).map(|remote| GroupInfo {
            id: group_id,
            name: remote.name.clone(),
            version: remote.version,
            can_edit_metadata: remote.can_edit_metadata,
            can_edit_files: remote.can_edit_files,
        }))
    }

    async fn fetch_since(
        &self,
        library: LibraryIdentifier,
        kind: ObjectKind,
        since: i64,
    ) -> Result<VersionedPage> {
        self.delay().await;
        let mut state = self.lock()?;
        state.begin_request(library)?;
        let remote = state.library(library)?;
        let objects = remote
            .objects
            .get(&kind)
            .map(|objects| {
                objects
                    .values()
                    .filter(|object| object.version > since)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Ok(VersionedPage {
            library_version: remote.version,
            objects,
        })
    }

    async fn fetch_objects(
        &self,
        library: LibraryIdentifier,
        kind: ObjectKind,
        keys: &[String],
    ) -> Result<VersionedPage> {
        self.delay().await;
        let mut state = self.lock()?;
        state.begin_request(library)?;
        let remote = state.library(library)?;
        let objects = remote
            .objects
            .get(&kind)
            .map(|objects| {
                keys.iter()
                    .filter_map(|key| objects.get(key))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Ok(VersionedPage {
            library_version: remote.version,
            objects,
        })
    }

    async fn fetch_deletions(
        &self,
        library: LibraryIdentifier,
        since: i64,
    ) -> Result<DeletionPage> {
        self.delay().await;
        let mut state = self.lock()?;
        state.begin_request(library)?;
        let remote = state.library(library)?;
        let mut removed = RemovedKeys::default();
        for tombstone in remote.deletions.iter().filter(|t| t.version > since) {
            let keys = removed.keys_mut(tombstone.kind);
            if !keys.contains(&tombstone.key) {
                keys.push(tombstone.key.clone());
            }
        }
        Ok(DeletionPage {
            library_version: remote.version,
            removed,
        })
    }

    async fn upload(&self, batch: &WriteBatch) -> Result<UploadResponse> {
        self.delay().await;
        let mut state = self.lock()?;
        state.begin_request(batch.library_id)?;
        let remote = state.library_mut(batch.library_id)?;
        remote.check_write()?;
        remote.check_base_version(batch.base_version)?;

        let new_version = remote.version + 1;
        let objects = remote.objects.entry(batch.kind).or_default();
        let mut results = Vec::with_capacity(batch.entries.len());

        for entry in &batch.entries {
            if let Some(existing) = objects.get(&entry.key) {
                if existing.version > entry.base_version {
                    results.push(ObjectResult {
                        key: entry.key.clone(),
                        outcome: ObjectOutcome::Conflict {
                            remote_version: existing.version,
                        },
                    });
                    continue;
                }
            }

            let missing_parent = ["parentCollection", "parentItem"]
                .iter()
                .filter_map(|name| entry.parameters.get(*name))
                .filter_map(|value| value.as_str())
                .find(|parent| !objects.contains_key(*parent))
                .map(str::to_string);
            if let Some(parent) = missing_parent {
                results.push(ObjectResult {
                    key: entry.key.clone(),
                    outcome: ObjectOutcome::Failed {
                        code: 409,
                        message: format!("Parent {} doesn't exist", parent),
                    },
                });
                continue;
            }

            let object = objects
                .entry(entry.key.clone())
                .or_insert_with(|| RemoteObject::new(batch.kind, entry.key.clone()));
            object.apply_parameters(&entry.parameters);
            object.version = new_version;
            results.push(ObjectResult {
                key: entry.key.clone(),
                outcome: ObjectOutcome::Synced {
                    version: new_version,
                },
            });
        }

        let wrote = results
            .iter()
            .any(|r| matches!(r.outcome, ObjectOutcome::Synced { .. }));
        if wrote {
            remote.version = new_version;
        }
        debug!(
            "Accepted upload of {} {} to {}, library version {}",
            batch.entries.len(),
            batch.kind,
            batch.library_id,
            remote.version
        );

        Ok(UploadResponse {
            library_version: remote.version,
            results,
        })
    }

    async fn submit_deletions(&self, batch: &DeleteBatch) -> Result<i64> {
        self.delay().await;
        let mut state = self.lock()?;
        state.begin_request(batch.library_id)?;
        let remote = state.library_mut(batch.library_id)?;
        remote.check_write()?;
        remote.check_base_version(batch.base_version)?;

        remote.version += 1;
        let version = remote.version;
        for key in &batch.keys {
            remote.remove(batch.kind, key, version);
        }
        Ok(version)
    }
}
