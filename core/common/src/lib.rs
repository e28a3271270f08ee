//! Common utilities and types shared across shelfsync crates.
//!
//! This module provides the error taxonomy used by the sync engine and the
//! identifiers that partition every piece of synced state.

pub mod error;
pub mod types;

pub use error::{Error, Result, WriteScope};
pub use types::{CustomLibraryKind, LibraryIdentifier, ObjectKind};
