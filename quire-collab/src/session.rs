//! Live sessions: who is on which document, where their cursor is, and
//! whether they are typing.
//!
//! ## Architecture
//!
//! ```text
//! join / cursor / typing          accepted entry (from sequencer)
//!        │                                  │
//!        ▼                                  ▼
//! SessionTracker::update_cursor()   SessionTracker::project_cursors()
//!   project from observed version     transform_cursor() per session
//!        │                                  │
//!        └──────────► CursorMoved ◄─────────┘
//! ```
//!
//! Nothing here is durable. A restart disconnects everyone, and a session
//! idle for longer than the configured window is reaped.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use uuid::Uuid;

use crate::broadcast::CollabEvent;
use crate::error::CollabError;
use crate::model::{DocumentId, UserId, VersionEntry};
use crate::storage::VersionLog;

/// One user connected to one document.
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub id: Uuid,
    pub document: DocumentId,
    pub user: UserId,
    pub display_name: String,
    /// Cursor gap position, valid at `cursor_version`.
    pub cursor: usize,
    pub cursor_version: u64,
    pub typing: bool,
    pub connected_at: DateTime<Utc>,
    #[serde(skip)]
    last_active: Instant,
}

impl Session {
    fn new(document: DocumentId, user: UserId, display_name: String, version: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            document,
            user,
            display_name,
            cursor: 0,
            cursor_version: version,
            typing: false,
            connected_at: Utc::now(),
            last_active: Instant::now(),
        }
    }

    pub fn is_idle(&self, timeout: Duration) -> bool {
        self.last_active.elapsed() > timeout
    }

    pub fn idle_for(&self) -> Duration {
        self.last_active.elapsed()
    }

    fn touch(&mut self) {
        self.last_active = Instant::now();
    }
}

/// What a joining user learns about everyone already present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActiveUser {
    pub user: UserId,
    pub display_name: String,
    pub cursor: usize,
    pub typing: bool,
}

impl From<&Session> for ActiveUser {
    fn from(session: &Session) -> Self {
        Self {
            user: session.user,
            display_name: session.display_name.clone(),
            cursor: session.cursor,
            typing: session.typing,
        }
    }
}

pub struct SessionTracker {
    log: Arc<dyn VersionLog>,
    idle_timeout: Duration,
    sessions: RwLock<HashMap<DocumentId, HashMap<UserId, Session>>>,
}

impl SessionTracker {
    pub fn new(log: Arc<dyn VersionLog>, idle_timeout: Duration) -> Self {
        Self {
            log,
            idle_timeout,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Register `user` on `document`, replacing an older session of theirs.
    /// Returns the new session and the users already present.
    pub fn join(
        &self,
        document: DocumentId,
        user: UserId,
        display_name: impl Into<String>,
    ) -> Result<(Session, Vec<ActiveUser>), CollabError> {
        let version = self.log.current_version(document)?;
        let session = Session::new(document, user, display_name.into(), version);

        let mut sessions = self.sessions.write();
        let room = sessions.entry(document).or_default();
        let others = room
            .values()
            .filter(|s| s.user != user)
            .map(ActiveUser::from)
            .collect();
        room.insert(user, session.clone());

        log::info!("User {user} joined document {document} ({} sessions)", room.len());
        Ok((session, others))
    }

    pub fn leave(&self, document: DocumentId, user: UserId) -> Option<Session> {
        let mut sessions = self.sessions.write();
        let room = sessions.get_mut(&document)?;
        let session = room.remove(&user);
        if room.is_empty() {
            sessions.remove(&document);
        }
        if session.is_some() {
            log::info!("User {user} left document {document}");
        }
        session
    }

    /// Mark activity; false when there is no such session.
    pub fn touch(&self, document: DocumentId, user: UserId) -> bool {
        let mut sessions = self.sessions.write();
        match sessions.get_mut(&document).and_then(|room| room.get_mut(&user)) {
            Some(session) => {
                session.touch();
                true
            }
            None => false,
        }
    }

    /// Store a cursor observed at `observed_version`, projected forward to
    /// the newest version. Returns the stored `(position, version)`.
    pub fn update_cursor(
        &self,
        document: DocumentId,
        user: UserId,
        position: usize,
        observed_version: u64,
    ) -> Result<(usize, u64), CollabError> {
        let mut sessions = self.sessions.write();
        let session = sessions
            .get_mut(&document)
            .and_then(|room| room.get_mut(&user))
            .ok_or(CollabError::SessionNotFound { document, user })?;

        let current = self.log.document(document)?;
        if observed_version > current.version {
            return Err(CollabError::FutureVersion {
                base: observed_version,
                current: current.version,
            });
        }

        let entries = self.log.entries_since(document, observed_version)?;
        let mut cursor = position;
        let mut version = observed_version;
        for entry in &entries {
            let own = entry.operation.author == user;
            cursor = quire_ot::transform_cursor(cursor, &entry.operation.components, own);
            version = entry.version;
        }
        if entries.is_empty() {
            cursor = cursor.min(current.length);
        }

        session.cursor = cursor;
        session.cursor_version = version;
        session.touch();
        log::trace!("Cursor of {user} on {document} at {cursor} (v{version})");
        Ok((cursor, version))
    }

    /// Returns the new state, or `None` when it did not change.
    pub fn set_typing(&self, document: DocumentId, user: UserId, typing: bool) -> Result<Option<bool>, CollabError> {
        let mut sessions = self.sessions.write();
        let session = sessions
            .get_mut(&document)
            .and_then(|room| room.get_mut(&user))
            .ok_or(CollabError::SessionNotFound { document, user })?;
        session.touch();
        if session.typing == typing {
            return Ok(None);
        }
        session.typing = typing;
        Ok(Some(typing))
    }

    /// Move every cursor on the entry's document through it.
    pub fn project_cursors(&self, entry: &VersionEntry) -> Vec<CollabEvent> {
        let mut sessions = self.sessions.write();
        let Some(room) = sessions.get_mut(&entry.document) else {
            return Vec::new();
        };

        let mut events = Vec::new();
        for session in room.values_mut() {
            if session.cursor_version >= entry.version {
                continue;
            }
            if session.cursor_version + 1 != entry.version {
                log::warn!(
                    "Cursor of {} skipped from v{} to v{}",
                    session.user,
                    session.cursor_version,
                    entry.version
                );
            }
            let own = entry.operation.author == session.user;
            let moved = quire_ot::transform_cursor(session.cursor, &entry.operation.components, own);
            session.cursor_version = entry.version;
            if moved != session.cursor {
                session.cursor = moved;
                events.push(CollabEvent::CursorMoved {
                    document: entry.document,
                    user: session.user,
                    position: moved,
                    version: entry.version,
                });
            }
        }
        events
    }

    /// Remove sessions idle for longer than the timeout.
    pub fn reap_expired(&self) -> Vec<Session> {
        let mut sessions = self.sessions.write();
        let mut expired = Vec::new();
        for room in sessions.values_mut() {
            let idle: Vec<UserId> = room
                .values()
                .filter(|s| s.is_idle(self.idle_timeout))
                .map(|s| s.user)
                .collect();
            for user in idle {
                if let Some(session) = room.remove(&user) {
                    log::info!(
                        "Session of {user} on {} expired after {:?}",
                        session.document,
                        session.idle_for()
                    );
                    expired.push(session);
                }
            }
        }
        sessions.retain(|_, room| !room.is_empty());
        expired
    }

    pub fn session(&self, document: DocumentId, user: UserId) -> Option<Session> {
        self.sessions.read().get(&document)?.get(&user).cloned()
    }

    pub fn active_users(&self, document: DocumentId) -> Vec<ActiveUser> {
        self.sessions
            .read()
            .get(&document)
            .map(|room| room.values().map(ActiveUser::from).collect())
            .unwrap_or_default()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().values().map(HashMap::len).sum()
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }
}
