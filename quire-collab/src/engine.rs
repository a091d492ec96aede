//! The collaboration engine: one entry point for documents, edits,
//! presence and comments.
//!
//! Architecture:
//! ```text
//!            submit / join / cursor / comment
//!                          │
//!                  ┌───────▼────────┐   require(level)   ┌───────────────┐
//!                  │  CollabEngine  │ ─────────────────► │ AccessControl │
//!                  └───────┬────────┘                    └───────────────┘
//!                          │ queue
//!                  ┌───────▼────────┐   append            ┌─────────────┐
//!                  │   Sequencer    │ ──────────────────► │ VersionLog  │
//!                  └───────┬────────┘                     └─────────────┘
//!                          │ on_accepted (version order)
//!        ┌─────────────────┼──────────────────┬─────────────────┐
//!        ▼                 ▼                  ▼                 ▼
//!   SnapshotManager   RoomManager        SessionTracker     CommentBook
//!   (fold body)       (Accepted)         (CursorMoved)      (CommentMoved)
//! ```

use std::sync::{Arc, Weak};

use quire_ot::{PositionalEdit, TextOperation};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::access::{AccessControl, CollaboratorTable};
use crate::broadcast::{CollabEvent, RoomManager};
use crate::comments::{Comment, CommentBook, NewComment};
use crate::config::CollabConfig;
use crate::error::CollabError;
use crate::model::{
    Acceptance, Collaborator, Document, DocumentId, Operation, Permission, Snapshot, Submission, UserId,
    VersionEntry,
};
use crate::sequencer::{AcceptListener, Sequencer, SequencerState, SequencerStats};
use crate::session::{ActiveUser, Session, SessionTracker};
use crate::snapshot::SnapshotManager;
use crate::storage::{MemoryLog, RocksLog, VersionLog};

/// Fans an accepted entry out to every derived view, in a fixed order.
struct EngineListener {
    snapshots: Arc<SnapshotManager>,
    rooms: Arc<RoomManager>,
    sessions: Arc<SessionTracker>,
    comments: Arc<CommentBook>,
}

impl AcceptListener for EngineListener {
    fn on_accepted(&self, entry: &VersionEntry) {
        self.snapshots.on_accepted(entry);
        self.rooms.publish(CollabEvent::Accepted {
            document: entry.document,
            version: entry.version,
            operation: entry.operation.components.clone(),
            author: entry.operation.author,
            operation_id: entry.operation.id,
        });
        for event in self.sessions.project_cursors(entry) {
            self.rooms.publish(event);
        }
        for event in self.comments.reanchor(entry) {
            self.rooms.publish(event);
        }
    }
}

/// Returned by [`CollabEngine::join`].
pub struct Joined {
    pub session: Session,
    /// Users that were already on the document.
    pub active_users: Vec<ActiveUser>,
    pub events: broadcast::Receiver<Arc<CollabEvent>>,
}

pub struct CollabEngine {
    config: CollabConfig,
    log: Arc<dyn VersionLog>,
    access: Arc<dyn AccessControl>,
    sequencer: Sequencer,
    snapshots: Arc<SnapshotManager>,
    sessions: Arc<SessionTracker>,
    comments: Arc<CommentBook>,
    rooms: Arc<RoomManager>,
}

impl CollabEngine {
    /// Open the configured log: RocksDB when `storage.path` is set, memory otherwise.
    pub fn open(config: CollabConfig) -> Result<Self, CollabError> {
        let log: Arc<dyn VersionLog> = match &config.storage.path {
            Some(path) => Arc::new(RocksLog::open(path, &config.storage)?),
            None => {
                log::info!("No storage path configured, keeping the version log in memory");
                Arc::new(MemoryLog::new())
            }
        };
        Ok(Self::with_log(config, log, Arc::new(CollaboratorTable::new())))
    }

    pub fn with_log(config: CollabConfig, log: Arc<dyn VersionLog>, access: Arc<dyn AccessControl>) -> Self {
        let snapshots = Arc::new(SnapshotManager::new(log.clone(), &config.snapshots));
        let sessions = Arc::new(SessionTracker::new(log.clone(), config.sessions.idle_timeout()));
        let comments = Arc::new(CommentBook::new(log.clone(), snapshots.clone()));
        let rooms = Arc::new(RoomManager::new(config.broadcast_capacity));

        let listener: Arc<dyn AcceptListener> = Arc::new(EngineListener {
            snapshots: snapshots.clone(),
            rooms: rooms.clone(),
            sessions: sessions.clone(),
            comments: comments.clone(),
        });
        let sequencer = Sequencer::new(log.clone(), config.sequencer.clone(), vec![listener]);

        Self {
            config,
            log,
            access,
            sequencer,
            snapshots,
            sessions,
            comments,
            rooms,
        }
    }

    pub fn config(&self) -> &CollabConfig {
        &self.config
    }

    // ── Documents ────────────────────────────────────────────────────────

    /// Create a document whose version 1 inserts `content`. The owner
    /// becomes its admin.
    pub fn create_document(
        &self,
        owner: UserId,
        title: &str,
        content: &str,
        is_public: bool,
    ) -> Result<Document, CollabError> {
        let document = Document::new(owner, title, is_public);
        let id = document.id;
        let genesis = Operation::new(id, owner, 0, TextOperation::insert_at(0, 0, content)?);

        self.log.create_document(document, genesis)?;
        self.access.grant(id, owner, Permission::Admin);
        log::info!("Created document {id} ({title:?}) for {owner}");
        Ok(self.log.document(id)?)
    }

    pub fn document(&self, id: DocumentId) -> Result<Document, CollabError> {
        Ok(self.log.document(id)?)
    }

    pub fn list_documents(&self) -> Result<Vec<Document>, CollabError> {
        Ok(self.log.list_documents()?)
    }

    /// Grant `permission` to `user`; `granted_by` must be an admin.
    pub fn grant(
        &self,
        granted_by: UserId,
        document: DocumentId,
        user: UserId,
        permission: Permission,
    ) -> Result<(), CollabError> {
        let doc = self.document(document)?;
        self.access.require(&doc, granted_by, Permission::Admin)?;
        self.access.grant(document, user, permission);
        log::info!("{granted_by} granted {permission} on {document} to {user}");
        Ok(())
    }

    pub fn revoke(&self, revoked_by: UserId, document: DocumentId, user: UserId) -> Result<Option<Permission>, CollabError> {
        let doc = self.document(document)?;
        self.access.require(&doc, revoked_by, Permission::Admin)?;
        Ok(self.access.revoke(document, user))
    }

    pub fn collaborators(&self, document: DocumentId) -> Vec<Collaborator> {
        self.access.collaborators(document)
    }

    pub fn permission(&self, document: DocumentId, user: UserId) -> Result<Option<Permission>, CollabError> {
        let doc = self.document(document)?;
        Ok(self.access.permission(&doc, user))
    }

    // ── Edits ────────────────────────────────────────────────────────────

    /// Check, queue and sequence one edit.
    pub async fn submit(&self, submission: Submission) -> Result<Acceptance, CollabError> {
        let doc = self.document(submission.document)?;
        self.access.require(&doc, submission.author, Permission::Edit)?;

        if submission.base_version <= doc.version {
            let expected = self.length_at(doc.id, submission.base_version)?;
            let actual = submission.components.base_len();
            if actual != expected {
                return Err(CollabError::malformed(format!(
                    "operation spans {actual} characters but version {} has {expected}",
                    submission.base_version
                )));
            }
        }

        self.sessions.touch(submission.document, submission.author);
        self.sequencer.submit(submission).await
    }

    /// Submit components in their JSON form.
    pub async fn submit_json(
        &self,
        document: DocumentId,
        author: UserId,
        base_version: u64,
        components: &str,
    ) -> Result<Acceptance, CollabError> {
        let components = quire_ot::decode_json(components)?;
        self.submit(Submission {
            document,
            author,
            base_version,
            components,
        })
        .await
    }

    /// Submit positional edits made against `base_version`.
    pub async fn submit_positional(
        &self,
        document: DocumentId,
        author: UserId,
        base_version: u64,
        edits: &[PositionalEdit],
    ) -> Result<Acceptance, CollabError> {
        let current = self.log.current_version(document)?;
        if base_version > current {
            return Err(CollabError::FutureVersion {
                base: base_version,
                current,
            });
        }
        let base_len = self.length_at(document, base_version)?;
        let components = quire_ot::from_positional(base_len, edits)?;
        self.submit(Submission {
            document,
            author,
            base_version,
            components,
        })
        .await
    }

    /// Catch-up feed: every entry after `version`.
    pub fn entries_since(&self, user: UserId, document: DocumentId, version: u64) -> Result<Vec<VersionEntry>, CollabError> {
        let doc = self.document(document)?;
        self.access.require(&doc, user, Permission::View)?;
        if version > doc.version {
            return Err(CollabError::FutureVersion {
                base: version,
                current: doc.version,
            });
        }
        Ok(self.log.entries_since(document, version)?)
    }

    pub fn snapshot(&self, user: UserId, document: DocumentId) -> Result<Snapshot, CollabError> {
        let doc = self.document(document)?;
        self.access.require(&doc, user, Permission::View)?;
        self.snapshots.snapshot(document)
    }

    // ── Presence ─────────────────────────────────────────────────────────

    pub fn join(&self, document: DocumentId, user: UserId, display_name: &str) -> Result<Joined, CollabError> {
        let doc = self.document(document)?;
        self.access.require(&doc, user, Permission::View)?;

        let events = self.rooms.subscribe(document);
        let (session, active_users) = self.sessions.join(document, user, display_name)?;
        self.rooms.publish(CollabEvent::UserJoined {
            document,
            user,
            display_name: display_name.to_string(),
        });
        Ok(Joined {
            session,
            active_users,
            events,
        })
    }

    pub fn leave(&self, document: DocumentId, user: UserId) -> bool {
        if self.sessions.leave(document, user).is_none() {
            return false;
        }
        self.rooms.publish(CollabEvent::UserLeft { document, user });
        self.rooms.remove_if_idle(document);
        true
    }

    /// Store a cursor seen at `observed_version`; returns where it landed.
    pub fn update_cursor(
        &self,
        document: DocumentId,
        user: UserId,
        position: usize,
        observed_version: u64,
    ) -> Result<(usize, u64), CollabError> {
        let (position, version) = self.sessions.update_cursor(document, user, position, observed_version)?;
        self.rooms.publish(CollabEvent::CursorMoved {
            document,
            user,
            position,
            version,
        });
        Ok((position, version))
    }

    pub fn set_typing(&self, document: DocumentId, user: UserId, typing: bool) -> Result<(), CollabError> {
        match self.sessions.set_typing(document, user, typing)? {
            Some(true) => self.rooms.publish(CollabEvent::TypingStarted { document, user }),
            Some(false) => self.rooms.publish(CollabEvent::TypingStopped { document, user }),
            None => 0,
        };
        Ok(())
    }

    pub fn active_users(&self, document: DocumentId) -> Vec<ActiveUser> {
        self.sessions.active_users(document)
    }

    /// Expire idle sessions and announce their departure.
    pub fn reap_idle_sessions(&self) -> usize {
        let expired = self.sessions.reap_expired();
        for session in &expired {
            self.rooms.publish(CollabEvent::UserLeft {
                document: session.document,
                user: session.user,
            });
        }
        expired.len()
    }

    /// Reap idle sessions every `sessions.reap_interval`. The task ends
    /// once the engine is dropped.
    pub fn spawn_reaper(self: &Arc<Self>) -> JoinHandle<()> {
        let engine: Weak<Self> = Arc::downgrade(self);
        let period = self.config.sessions.reap_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(engine) = engine.upgrade() else {
                    break;
                };
                let reaped = engine.reap_idle_sessions();
                if reaped > 0 {
                    log::debug!("Reaped {reaped} idle sessions");
                }
            }
        })
    }

    // ── Comments ─────────────────────────────────────────────────────────

    pub fn add_comment(&self, new: NewComment) -> Result<Comment, CollabError> {
        let doc = self.document(new.document)?;
        self.access.require(&doc, new.author, Permission::View)?;

        let comment = self.comments.add(new)?;
        self.rooms.publish(CollabEvent::CommentAdded {
            document: comment.document,
            comment: comment.id,
            author: comment.author,
            position_start: comment.position_start,
            position_end: comment.position_end,
        });
        Ok(comment)
    }

    /// The author or any editor may resolve a comment.
    pub fn resolve_comment(&self, user: UserId, comment: Uuid) -> Result<Comment, CollabError> {
        let existing = self.comments.get(comment).ok_or(CollabError::CommentNotFound(comment))?;
        if existing.author != user {
            let doc = self.document(existing.document)?;
            self.access.require(&doc, user, Permission::Edit)?;
        }
        self.comments.resolve(comment)
    }

    pub fn comments(&self, user: UserId, document: DocumentId) -> Result<Vec<Comment>, CollabError> {
        let doc = self.document(document)?;
        self.access.require(&doc, user, Permission::View)?;
        Ok(self.comments.comments(document))
    }

    // ── Observability ────────────────────────────────────────────────────

    pub fn subscribe(&self, user: UserId, document: DocumentId) -> Result<broadcast::Receiver<Arc<CollabEvent>>, CollabError> {
        let doc = self.document(document)?;
        self.access.require(&doc, user, Permission::View)?;
        Ok(self.rooms.subscribe(document))
    }

    pub fn state(&self, document: DocumentId) -> SequencerState {
        self.sequencer.state(document)
    }

    pub fn queue_depth(&self, document: DocumentId) -> usize {
        self.sequencer.queue_depth(document)
    }

    pub fn stats(&self) -> SequencerStats {
        self.sequencer.stats()
    }

    /// Refuse new edits and wait for queued ones to complete.
    pub async fn shutdown(&self) {
        self.sequencer.shutdown().await;
        log::info!(
            "Engine shut down with {} sessions across {} rooms",
            self.sessions.session_count(),
            self.rooms.room_count()
        );
    }

    fn length_at(&self, document: DocumentId, version: u64) -> Result<usize, CollabError> {
        self.log
            .length_at(document, version)?
            .ok_or_else(|| CollabError::storage(format!("version {version} of {document} is missing")))
    }
}
