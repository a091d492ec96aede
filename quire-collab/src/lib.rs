//! # quire-collab: server-side core for collaborative text editing
//!
//! Accepts concurrent edits against shared documents, orders them per
//! document, transforms stale edits with [`quire_ot`], logs the result
//! and fans it out to everyone on the document.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐  Submission   ┌──────────────┐  append   ┌──────────────┐
//! │ client edit │ ────────────► │  Sequencer   │ ────────► │  VersionLog  │
//! └─────────────┘               │ (per-doc     │           │ Memory/Rocks │
//!                               │  worker)     │           └──────┬───────┘
//!                               └──────┬───────┘                  │
//!                                      │ accepted entry           │ replay
//!                 ┌────────────────────┼──────────────────┐       │
//!                 ▼                    ▼                  ▼       ▼
//!          ┌─────────────┐     ┌──────────────┐   ┌──────────────────┐
//!          │ RoomManager │     │SessionTracker│   │ SnapshotManager  │
//!          │ (broadcast) │     │ CommentBook  │   │ (rope + cache)   │
//!          └─────────────┘     └──────────────┘   └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`engine`]: [`CollabEngine`], the facade the transport layer calls
//! - [`sequencer`]: per-document FIFO queues and the rebase/append loop
//! - [`storage`]: the [`VersionLog`] contract, in memory and on RocksDB
//! - [`snapshot`]: materialised bodies folded from the log
//! - [`session`]: presence, cursors and typing indicators
//! - [`comments`]: comment anchors re-projected on every edit
//! - [`broadcast`]: per-document event rooms
//! - [`access`]: collaborator permission checks
//! - [`config`]: TOML configuration

pub mod access;
pub mod broadcast;
pub mod comments;
pub mod config;
pub mod engine;
pub mod error;
pub mod model;
pub mod sequencer;
pub mod session;
pub mod snapshot;
pub mod storage;

// Re-exports for convenience
pub use access::{AccessControl, CollaboratorTable};
pub use broadcast::{BroadcastGroup, BroadcastStats, CollabEvent, RoomManager};
pub use comments::{Comment, CommentBook, CommentState, NewComment};
pub use config::{CollabConfig, ConfigError, SequencerConfig, SessionConfig, SnapshotConfig, StorageConfig};
pub use engine::{CollabEngine, Joined};
pub use error::CollabError;
pub use model::{
    Acceptance, Collaborator, Document, DocumentId, Operation, Permission, Snapshot, Submission, UserId,
    VersionEntry,
};
pub use sequencer::{AcceptListener, Sequencer, SequencerState, SequencerStats};
pub use session::{ActiveUser, Session, SessionTracker};
pub use snapshot::SnapshotManager;
pub use storage::{verify_document, LogError, MemoryLog, RocksLog, StoreError, VerifyReport, VersionLog};
