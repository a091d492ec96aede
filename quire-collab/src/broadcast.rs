//! Per-document fan-out of engine events.
//!
//! Uses tokio broadcast channels for O(1) send to all subscribers. Each
//! subscriber gets an independent receiver that buffers up to `capacity`
//! events; a subscriber that falls further behind observes `Lagged` and
//! should resynchronise with `entries_since`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use quire_ot::TextOperation;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::model::{DocumentId, UserId};

/// Everything pushed to the sessions of a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CollabEvent {
    /// A new version was appended.
    Accepted {
        document: DocumentId,
        version: u64,
        operation: TextOperation,
        author: UserId,
        operation_id: Uuid,
    },
    UserJoined {
        document: DocumentId,
        user: UserId,
        display_name: String,
    },
    UserLeft {
        document: DocumentId,
        user: UserId,
    },
    CursorMoved {
        document: DocumentId,
        user: UserId,
        position: usize,
        version: u64,
    },
    TypingStarted {
        document: DocumentId,
        user: UserId,
    },
    TypingStopped {
        document: DocumentId,
        user: UserId,
    },
    CommentAdded {
        document: DocumentId,
        comment: Uuid,
        author: UserId,
        position_start: usize,
        position_end: usize,
    },
    CommentMoved {
        document: DocumentId,
        comment: Uuid,
        position_start: usize,
        position_end: usize,
        version: u64,
    },
    CommentOrphaned {
        document: DocumentId,
        comment: Uuid,
        version: u64,
    },
}

impl CollabEvent {
    pub fn document(&self) -> DocumentId {
        match self {
            CollabEvent::Accepted { document, .. }
            | CollabEvent::UserJoined { document, .. }
            | CollabEvent::UserLeft { document, .. }
            | CollabEvent::CursorMoved { document, .. }
            | CollabEvent::TypingStarted { document, .. }
            | CollabEvent::TypingStopped { document, .. }
            | CollabEvent::CommentAdded { document, .. }
            | CollabEvent::CommentMoved { document, .. }
            | CollabEvent::CommentOrphaned { document, .. } => *document,
        }
    }
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    /// Events published while nobody was subscribed.
    pub messages_dropped: u64,
    pub subscribers: usize,
}

/// Lock-free counters so `publish` never takes a lock.
#[derive(Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

/// The broadcast channel of a single document.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<CollabEvent>>,
    capacity: usize,
    stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            capacity,
            stats: AtomicBroadcastStats::default(),
        }
    }

    /// Send to every subscriber. Returns the number of receivers.
    pub fn publish(&self, event: CollabEvent) -> usize {
        match self.sender.send(Arc::new(event)) {
            Ok(count) => {
                self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
                count
            }
            Err(_) => {
                self.stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
                0
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<CollabEvent>> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
            subscribers: self.subscriber_count(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Maps document IDs to broadcast groups.
pub struct RoomManager {
    rooms: RwLock<HashMap<DocumentId, Arc<BroadcastGroup>>>,
    default_capacity: usize,
}

impl RoomManager {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            default_capacity,
        }
    }

    pub fn get_or_create(&self, document: DocumentId) -> Arc<BroadcastGroup> {
        if let Some(room) = self.rooms.read().get(&document) {
            return room.clone();
        }

        let mut rooms = self.rooms.write();
        rooms
            .entry(document)
            .or_insert_with(|| Arc::new(BroadcastGroup::new(self.default_capacity)))
            .clone()
    }

    pub fn get(&self, document: DocumentId) -> Option<Arc<BroadcastGroup>> {
        self.rooms.read().get(&document).cloned()
    }

    pub fn subscribe(&self, document: DocumentId) -> broadcast::Receiver<Arc<CollabEvent>> {
        self.get_or_create(document).subscribe()
    }

    /// Publish to the event's document room, if one exists.
    pub fn publish(&self, event: CollabEvent) -> usize {
        match self.get(event.document()) {
            Some(room) => room.publish(event),
            None => 0,
        }
    }

    /// Drop a room nobody listens to.
    pub fn remove_if_idle(&self, document: DocumentId) -> bool {
        let mut rooms = self.rooms.write();
        match rooms.get(&document) {
            Some(room) if room.subscriber_count() == 0 => {
                rooms.remove(&document);
                true
            }
            _ => false,
        }
    }

    pub fn room_count(&self) -> usize {
        self.rooms.read().len()
    }

    pub fn active_documents(&self) -> Vec<DocumentId> {
        self.rooms.read().keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn joined(document: DocumentId) -> CollabEvent {
        CollabEvent::UserJoined {
            document,
            user: Uuid::new_v4(),
            display_name: "Alice".into(),
        }
    }

    #[tokio::test]
    async fn test_broadcast_fan_out() {
        let group = BroadcastGroup::new(16);
        let mut rx1 = group.subscribe();
        let mut rx2 = group.subscribe();
        let mut rx3 = group.subscribe();

        let doc = Uuid::new_v4();
        assert_eq!(group.publish(joined(doc)), 3);

        for rx in [&mut rx1, &mut rx2, &mut rx3] {
            let event = rx.recv().await.unwrap();
            assert_eq!(event.document(), doc);
        }
    }

    #[tokio::test]
    async fn test_broadcast_stats() {
        let group = BroadcastGroup::new(16);
        let doc = Uuid::new_v4();
        group.publish(joined(doc));

        let _rx = group.subscribe();
        group.publish(joined(doc));
        group.publish(joined(doc));

        let stats = group.stats();
        assert_eq!(stats.messages_sent, 2);
        assert_eq!(stats.messages_dropped, 1);
        assert_eq!(stats.subscribers, 1);
    }

    #[tokio::test]
    async fn test_lagging_subscriber() {
        let group = BroadcastGroup::new(2);
        let mut rx = group.subscribe();
        let doc = Uuid::new_v4();
        for _ in 0..5 {
            group.publish(joined(doc));
        }
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(_))
        ));
    }

    #[test]
    fn test_room_manager_get_or_create() {
        let manager = RoomManager::new(16);
        let doc = Uuid::new_v4();

        let room1 = manager.get_or_create(doc);
        let room2 = manager.get_or_create(doc);
        assert!(Arc::ptr_eq(&room1, &room2));
        assert_eq!(manager.room_count(), 1);
        assert_eq!(room1.capacity(), 16);
    }

    #[tokio::test]
    async fn test_room_manager_routes_by_document() {
        let manager = RoomManager::new(16);
        let (doc1, doc2) = (Uuid::new_v4(), Uuid::new_v4());
        let mut rx1 = manager.subscribe(doc1);
        let _rx2 = manager.subscribe(doc2);

        assert_eq!(manager.publish(joined(doc1)), 1);
        assert_eq!(manager.publish(joined(Uuid::new_v4())), 0);
        assert_eq!(rx1.recv().await.unwrap().document(), doc1);

        let docs = manager.active_documents();
        assert!(docs.contains(&doc1) && docs.contains(&doc2));
    }

    #[test]
    fn test_room_manager_cleanup() {
        let manager = RoomManager::new(16);
        let doc = Uuid::new_v4();
        let rx = manager.subscribe(doc);

        assert!(!manager.remove_if_idle(doc));
        drop(rx);
        assert!(manager.remove_if_idle(doc));
        assert_eq!(manager.room_count(), 0);
    }

    #[test]
    fn test_event_json_shape() {
        let doc = Uuid::nil();
        let user = Uuid::nil();
        let json = serde_json::to_string(&CollabEvent::TypingStarted { document: doc, user }).unwrap();
        assert!(json.starts_with(r#"{"type":"typing_started""#));
    }
}
