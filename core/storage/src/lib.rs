//! Local object storage and remote API seams for shelfsync.
//!
//! This crate defines the two boundaries the sync engine talks to:
//! - [`ObjectStore`]: transactional local storage of syncable objects
//! - [`RemoteGateway`]: the versioned remote library API
//!
//! In-memory implementations of both are provided for tests and for the
//! CLI's file-backed simulation.

pub mod gateway;
pub mod memory;
pub mod object;
pub mod remote;
pub mod store;

pub use gateway::{
    DeleteBatch, DeletionPage, GroupInfo, ObjectOutcome, ObjectResult, RemoteGateway,
    RemoteObject, RemovedKeys, UploadEntry, UploadResponse, VersionedPage, WriteBatch,
};
pub use memory::{LibraryState, MemoryStore, StoreSnapshot};
pub use object::{ChangedFields, FieldTag, SyncableObject};
pub use remote::{MemoryRemote, RemoteLibrary, RemoteSnapshot};
pub use store::{LibraryRecord, LibrarySyncState, Mutation, ObjectStore};
