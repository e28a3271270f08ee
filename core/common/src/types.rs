//! Common types used throughout shelfsync.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Kinds of non-group libraries a user owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CustomLibraryKind {
    /// The user's personal library.
    MyLibrary,
}

impl CustomLibraryKind {
    /// Human readable library name.
    pub fn library_name(&self) -> &'static str {
        match self {
            CustomLibraryKind::MyLibrary => "My Library",
        }
    }
}

/// Identifies an independent versioning domain.
///
/// Each library has its own monotonically increasing server version counter,
/// so this value partitions every piece of synced state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LibraryIdentifier {
    Custom(CustomLibraryKind),
    Group(i64),
}

impl LibraryIdentifier {
    /// Shorthand for the personal library.
    pub const MY_LIBRARY: Self = LibraryIdentifier::Custom(CustomLibraryKind::MyLibrary);

    /// Whether this is a group library.
    pub fn is_group(&self) -> bool {
        matches!(self, LibraryIdentifier::Group(_))
    }

    /// Group id, if this is a group library.
    pub fn group_id(&self) -> Option<i64> {
        match self {
            LibraryIdentifier::Group(id) => Some(*id),
            LibraryIdentifier::Custom(_) => None,
        }
    }

    /// Remote API path prefix for this library.
    pub fn api_path(&self, user_id: i64) -> String {
        match self {
            LibraryIdentifier::Group(id) => format!("groups/{}", id),
            LibraryIdentifier::Custom(_) => format!("users/{}", user_id),
        }
    }

    /// Parse an API path (`users/<id>` or `groups/<id>`) back into an identifier.
    pub fn from_api_path(path: &str) -> Option<Self> {
        let mut parts = path.trim_matches('/').split('/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some("users"), Some(_), None) => Some(Self::MY_LIBRARY),
            (Some("groups"), Some(id), None) => id.parse().ok().map(LibraryIdentifier::Group),
            _ => None,
        }
    }

    /// Name used in log lines.
    pub fn debug_name(&self) -> String {
        match self {
            LibraryIdentifier::Group(id) => format!("Group ({})", id),
            LibraryIdentifier::Custom(kind) => kind.library_name().to_string(),
        }
    }
}

impl fmt::Display for LibraryIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.debug_name())
    }
}

/// Kinds of syncable objects stored inside a library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ObjectKind {
    Collection,
    Search,
    Item,
    Tag,
}

impl ObjectKind {
    /// Order in which writes and deletions are submitted.
    ///
    /// Collections go first so items can reference them.
    pub const UPLOAD_ORDER: [ObjectKind; 4] = [
        ObjectKind::Collection,
        ObjectKind::Search,
        ObjectKind::Item,
        ObjectKind::Tag,
    ];

    /// Remote API path segment.
    pub fn api_path(&self) -> &'static str {
        match self {
            ObjectKind::Collection => "collections",
            ObjectKind::Search => "searches",
            ObjectKind::Item => "items",
            ObjectKind::Tag => "tags",
        }
    }

    /// Whether objects of this kind can reference a parent of the same kind.
    pub fn has_parent(&self) -> bool {
        matches!(self, ObjectKind::Collection | ObjectKind::Item)
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.api_path())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_path_round_trip() {
        let group = LibraryIdentifier::Group(42);
        assert_eq!(group.api_path(7), "groups/42");
        assert_eq!(LibraryIdentifier::from_api_path("groups/42"), Some(group));

        assert_eq!(LibraryIdentifier::MY_LIBRARY.api_path(7), "users/7");
        assert_eq!(
            LibraryIdentifier::from_api_path("/users/7/"),
            Some(LibraryIdentifier::MY_LIBRARY)
        );
    }

    #[test]
    fn test_from_api_path_rejects_garbage() {
        assert_eq!(LibraryIdentifier::from_api_path("groups/abc"), None);
        assert_eq!(LibraryIdentifier::from_api_path("items/42"), None);
        assert_eq!(LibraryIdentifier::from_api_path("groups/1/items"), None);
    }

    #[test]
    fn test_library_serialization_shape() {
        let json = serde_json::to_string(&LibraryIdentifier::Group(5)).unwrap();
        assert_eq!(json, r#"{"group":5}"#);

        let json = serde_json::to_string(&LibraryIdentifier::MY_LIBRARY).unwrap();
        assert_eq!(json, r#"{"custom":"myLibrary"}"#);

        let parsed: LibraryIdentifier = serde_json::from_str(r#"{"group":9}"#).unwrap();
        assert_eq!(parsed.group_id(), Some(9));
    }

    #[test]
    fn test_debug_name() {
        assert_eq!(LibraryIdentifier::Group(3).debug_name(), "Group (3)");
        assert_eq!(LibraryIdentifier::MY_LIBRARY.to_string(), "My Library");
    }
}
