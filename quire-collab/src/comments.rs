//! Comment anchors that follow the text they were written about.
//!
//! A comment is anchored to a half-open character range at a version.
//! Every accepted entry re-projects the anchors of its document; when all
//! anchored characters are gone the comment becomes orphaned and stays put.
//! Comment bodies and threads are persisted elsewhere; only anchoring is
//! tracked here.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::broadcast::CollabEvent;
use crate::error::CollabError;
use crate::model::{DocumentId, UserId, VersionEntry};
use crate::snapshot::SnapshotManager;
use crate::storage::VersionLog;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommentState {
    Active,
    /// The anchored text was deleted.
    Orphaned,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub id: Uuid,
    pub document: DocumentId,
    pub author: UserId,
    /// Set on replies.
    pub parent: Option<Uuid>,
    pub body: String,
    pub position_start: usize,
    pub position_end: usize,
    /// Version the anchor range is valid at.
    pub anchor_version: u64,
    pub selected_text: String,
    pub state: CommentState,
    pub resolved: bool,
    pub created_at: DateTime<Utc>,
}

/// A comment as submitted, anchored at the version its author saw.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewComment {
    pub document: DocumentId,
    pub author: UserId,
    pub start: usize,
    pub end: usize,
    pub at_version: u64,
    pub body: String,
    pub parent: Option<Uuid>,
}

/// Where an anchor ends up after a run of entries.
enum Projected {
    Range(usize, usize),
    Orphaned,
}

fn project_through<'a>(
    start: usize,
    end: usize,
    entries: impl IntoIterator<Item = &'a VersionEntry>,
) -> Projected {
    let (mut start, mut end) = (start, end);
    for entry in entries {
        match quire_ot::project_range(start, end, &entry.operation.components) {
            Some((s, e)) => (start, end) = (s, e),
            None => return Projected::Orphaned,
        }
    }
    Projected::Range(start, end)
}

pub struct CommentBook {
    log: Arc<dyn VersionLog>,
    snapshots: Arc<SnapshotManager>,
    comments: RwLock<HashMap<DocumentId, Vec<Comment>>>,
}

impl CommentBook {
    pub fn new(log: Arc<dyn VersionLog>, snapshots: Arc<SnapshotManager>) -> Self {
        Self {
            log,
            snapshots,
            comments: RwLock::new(HashMap::new()),
        }
    }

    /// Anchor a new comment, projecting its range up to the newest version.
    pub fn add(&self, new: NewComment) -> Result<Comment, CollabError> {
        let mut comments = self.comments.write();

        let current = self.log.current_version(new.document)?;
        if new.at_version > current {
            return Err(CollabError::FutureVersion {
                base: new.at_version,
                current,
            });
        }
        let len = self.length_at(new.document, new.at_version)?;
        if new.start > new.end || new.end > len {
            return Err(CollabError::InvalidAnchor {
                start: new.start,
                end: new.end,
                len,
            });
        }
        let thread = comments.entry(new.document).or_default();
        if let Some(parent) = new.parent {
            if !thread.iter().any(|c| c.id == parent) {
                return Err(CollabError::CommentNotFound(parent));
            }
        }

        // Entries appended after this read are re-anchored by `reanchor`
        // once the lock is released.
        let snapshot = self.snapshots.snapshot(new.document)?;
        let entries = self.log.entries_since(new.document, new.at_version)?;
        let (seen, later): (Vec<_>, Vec<_>) = entries.iter().partition(|e| e.version <= snapshot.version);

        let mut comment = Comment {
            id: Uuid::new_v4(),
            document: new.document,
            author: new.author,
            parent: new.parent,
            body: new.body,
            position_start: new.start,
            position_end: new.end,
            anchor_version: snapshot.version,
            selected_text: String::new(),
            state: CommentState::Active,
            resolved: false,
            created_at: Utc::now(),
        };

        match project_through(new.start, new.end, seen) {
            Projected::Range(start, end) => {
                comment.selected_text = snapshot.content.chars().skip(start).take(end - start).collect();
                match project_through(start, end, later.iter().copied()) {
                    Projected::Range(start, end) => {
                        comment.position_start = start;
                        comment.position_end = end;
                        comment.anchor_version = later.last().map_or(snapshot.version, |e| e.version);
                    }
                    Projected::Orphaned => comment.state = CommentState::Orphaned,
                }
            }
            Projected::Orphaned => comment.state = CommentState::Orphaned,
        }

        log::debug!(
            "Comment {} on {} anchored at {}..{} (v{})",
            comment.id,
            comment.document,
            comment.position_start,
            comment.position_end,
            comment.anchor_version
        );
        thread.push(comment.clone());
        Ok(comment)
    }

    pub fn resolve(&self, id: Uuid) -> Result<Comment, CollabError> {
        let mut comments = self.comments.write();
        let comment = comments
            .values_mut()
            .flat_map(|thread| thread.iter_mut())
            .find(|c| c.id == id)
            .ok_or(CollabError::CommentNotFound(id))?;
        comment.resolved = true;
        Ok(comment.clone())
    }

    pub fn get(&self, id: Uuid) -> Option<Comment> {
        self.comments
            .read()
            .values()
            .flat_map(|thread| thread.iter())
            .find(|c| c.id == id)
            .cloned()
    }

    /// Comments of a document in creation order.
    pub fn comments(&self, document: DocumentId) -> Vec<Comment> {
        self.comments.read().get(&document).cloned().unwrap_or_default()
    }

    pub fn replies(&self, parent: Uuid) -> Vec<Comment> {
        self.comments
            .read()
            .values()
            .flat_map(|thread| thread.iter())
            .filter(|c| c.parent == Some(parent))
            .cloned()
            .collect()
    }

    /// Move the active anchors of the entry's document through it.
    pub fn reanchor(&self, entry: &VersionEntry) -> Vec<CollabEvent> {
        let mut comments = self.comments.write();
        let Some(thread) = comments.get_mut(&entry.document) else {
            return Vec::new();
        };

        let mut events = Vec::new();
        for comment in thread.iter_mut() {
            if comment.state == CommentState::Orphaned || comment.anchor_version >= entry.version {
                continue;
            }
            comment.anchor_version = entry.version;
            match project_through(comment.position_start, comment.position_end, [entry]) {
                Projected::Range(start, end) => {
                    if (start, end) != (comment.position_start, comment.position_end) {
                        comment.position_start = start;
                        comment.position_end = end;
                        events.push(CollabEvent::CommentMoved {
                            document: entry.document,
                            comment: comment.id,
                            position_start: start,
                            position_end: end,
                            version: entry.version,
                        });
                    }
                }
                Projected::Orphaned => {
                    comment.state = CommentState::Orphaned;
                    log::debug!("Comment {} orphaned at version {}", comment.id, entry.version);
                    events.push(CollabEvent::CommentOrphaned {
                        document: entry.document,
                        comment: comment.id,
                        version: entry.version,
                    });
                }
            }
        }
        events
    }

    fn length_at(&self, document: DocumentId, version: u64) -> Result<usize, CollabError> {
        self.log
            .length_at(document, version)?
            .ok_or_else(|| CollabError::storage(format!("version {version} of {document} is missing")))
    }
}
