//! Collaborator permissions.
//!
//! Access control proper (accounts, invitations) lives outside this crate;
//! the engine only asks an [`AccessControl`] for a user's level before
//! queuing work. [`CollaboratorTable`] is the in-process implementation.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::error::CollabError;
use crate::model::{Collaborator, Document, DocumentId, Permission, UserId};

pub trait AccessControl: Send + Sync {
    /// Explicit collaborator level, if any.
    fn collaborator(&self, document: DocumentId, user: UserId) -> Option<Permission>;

    fn grant(&self, document: DocumentId, user: UserId, permission: Permission);

    fn revoke(&self, document: DocumentId, user: UserId) -> Option<Permission>;

    fn collaborators(&self, document: DocumentId) -> Vec<Collaborator>;

    /// Effective level: `Admin` for the owner, else the collaborator row,
    /// or `View` on public documents.
    ///
    /// Ownership comes from the stored document row, so it holds even when
    /// the collaborator rows were lost with a restart.
    fn permission(&self, document: &Document, user: UserId) -> Option<Permission> {
        if document.owner == user {
            return Some(Permission::Admin);
        }
        let explicit = self.collaborator(document.id, user);
        let public = document.is_public.then_some(Permission::View);
        explicit.max(public)
    }

    /// Fail with `PermissionDenied` unless `user` holds at least `required`.
    fn require(&self, document: &Document, user: UserId, required: Permission) -> Result<Permission, CollabError> {
        match self.permission(document, user) {
            Some(level) if level >= required => Ok(level),
            _ => Err(CollabError::PermissionDenied {
                document: document.id,
                user,
                required,
            }),
        }
    }
}

/// In-memory `(document, user) -> permission` table.
#[derive(Default)]
pub struct CollaboratorTable {
    rows: RwLock<HashMap<(DocumentId, UserId), Permission>>,
}

impl CollaboratorTable {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AccessControl for CollaboratorTable {
    fn collaborator(&self, document: DocumentId, user: UserId) -> Option<Permission> {
        self.rows.read().get(&(document, user)).copied()
    }

    fn grant(&self, document: DocumentId, user: UserId, permission: Permission) {
        self.rows.write().insert((document, user), permission);
    }

    fn revoke(&self, document: DocumentId, user: UserId) -> Option<Permission> {
        self.rows.write().remove(&(document, user))
    }

    fn collaborators(&self, document: DocumentId) -> Vec<Collaborator> {
        let mut rows: Vec<Collaborator> = self
            .rows
            .read()
            .iter()
            .filter(|((doc, _), _)| *doc == document)
            .map(|((doc, user), permission)| Collaborator {
                document: *doc,
                user: *user,
                permission: *permission,
            })
            .collect();
        rows.sort_by(|a, b| b.permission.cmp(&a.permission).then(a.user.cmp(&b.user)));
        rows
    }
}
