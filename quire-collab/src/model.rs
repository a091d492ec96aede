//! Rows shared by every layer: documents, operations, version entries
//! and collaborators.

use chrono::{DateTime, Utc};
use quire_ot::TextOperation;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type DocumentId = Uuid;
pub type UserId = Uuid;

/// A collaboratively edited text document.
///
/// `version` and `length` always describe the newest entry in the version log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: DocumentId,
    pub title: String,
    pub owner: UserId,
    pub is_public: bool,
    /// Newest accepted version (starts at 1, the genesis entry).
    pub version: u64,
    /// Length in characters after `version`.
    pub length: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Document {
    /// A document row before its genesis entry is written.
    pub fn new(owner: UserId, title: impl Into<String>, is_public: bool) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            owner,
            is_public,
            version: 0,
            length: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

/// An accepted edit.
///
/// `components` are stored as accepted, i.e. already transformed to apply
/// on top of the previous version. `base_version` keeps the version the
/// author originally edited against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub id: Uuid,
    pub document: DocumentId,
    pub author: UserId,
    pub components: TextOperation,
    pub base_version: u64,
    pub created_at: DateTime<Utc>,
}

impl Operation {
    pub fn new(document: DocumentId, author: UserId, base_version: u64, components: TextOperation) -> Self {
        Self {
            id: Uuid::new_v4(),
            document,
            author,
            components,
            base_version,
            created_at: Utc::now(),
        }
    }
}

/// One slot of the version log. `(document, version)` is unique.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionEntry {
    pub document: DocumentId,
    pub version: u64,
    pub operation: Operation,
    /// Document length after applying `operation`.
    pub result_len: usize,
}

/// Access level of a collaborator. Ordered: `View < Edit < Admin`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    View,
    Edit,
    Admin,
}

impl std::fmt::Display for Permission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Permission::View => write!(f, "view"),
            Permission::Edit => write!(f, "edit"),
            Permission::Admin => write!(f, "admin"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collaborator {
    pub document: DocumentId,
    pub user: UserId,
    pub permission: Permission,
}

/// Inbound edit: `{documentId, authorId, baseVersion, operationComponents}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Submission {
    pub document: DocumentId,
    pub author: UserId,
    pub base_version: u64,
    pub components: TextOperation,
}

/// Result of a successful submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Acceptance {
    pub version: u64,
    /// Components as logged, valid against `version - 1`.
    pub components: TextOperation,
    pub operation_id: Uuid,
    /// Versions the submission was transformed against.
    pub transformed_over: u64,
}

/// Materialised document content at a version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub document: DocumentId,
    pub version: u64,
    pub content: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_ordering() {
        assert!(Permission::View < Permission::Edit);
        assert!(Permission::Edit < Permission::Admin);
        assert_eq!(Permission::Admin.to_string(), "admin");
    }

    #[test]
    fn test_new_document_starts_before_genesis() {
        let owner = Uuid::new_v4();
        let doc = Document::new(owner, "Notes", false);
        assert_eq!(doc.version, 0);
        assert_eq!(doc.length, 0);
        assert_eq!(doc.owner, owner);
    }
}
