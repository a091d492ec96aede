//! End-to-end tests through `CollabEngine` with the in-memory log.

use std::sync::Arc;
use std::time::Duration;

use quire_collab::{
    CollabConfig, CollabEngine, CollabError, CollabEvent, CommentState, NewComment, Permission, Submission,
};
use quire_ot::{apply, TextOperation};
use tokio::sync::broadcast::error::TryRecvError;
use uuid::Uuid;

fn engine() -> CollabEngine {
    CollabEngine::open(CollabConfig::for_testing()).unwrap()
}

fn edit(document: Uuid, author: Uuid, base_version: u64, components: TextOperation) -> Submission {
    Submission {
        document,
        author,
        base_version,
        components,
    }
}

/// Fold every entry visible to `user` into a string.
fn replay(engine: &CollabEngine, user: Uuid, document: Uuid) -> String {
    engine
        .entries_since(user, document, 0)
        .unwrap()
        .iter()
        .fold(String::new(), |text, e| apply(&text, &e.operation.components).unwrap())
}

#[tokio::test]
async fn test_hello_world_scenario() {
    let engine = engine();
    let owner = Uuid::new_v4();
    let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
    let doc = engine.create_document(owner, "Greeting", "Hello", false).unwrap();
    engine.grant(owner, doc.id, a, Permission::Edit).unwrap();
    engine.grant(owner, doc.id, b, Permission::Edit).unwrap();

    let first = engine
        .submit(edit(doc.id, a, 1, TextOperation::insert_at(5, 5, ", world").unwrap()))
        .await
        .unwrap();
    assert_eq!(first.version, 2);
    assert_eq!(engine.snapshot(owner, doc.id).unwrap().content, "Hello, world");

    let second = engine
        .submit(edit(doc.id, b, 1, TextOperation::insert_at(5, 0, "Say: ").unwrap()))
        .await
        .unwrap();
    assert_eq!(second.version, 3);
    assert_eq!(second.transformed_over, 1);

    let snapshot = engine.snapshot(owner, doc.id).unwrap();
    assert_eq!(snapshot.version, 3);
    assert_eq!(snapshot.content, "Say: Hello, world");
    assert_eq!(replay(&engine, owner, doc.id), snapshot.content);
}

#[tokio::test]
async fn test_stale_client_three_versions_behind() {
    let engine = engine();
    let owner = Uuid::new_v4();
    let doc = engine.create_document(owner, "Draft", "abcdef", false).unwrap();

    // Three unrelated edits land first.
    let mut length = 6;
    for text in ["1", "22", "333"] {
        let current = engine.document(doc.id).unwrap().version;
        engine
            .submit(edit(doc.id, owner, current, TextOperation::insert_at(length, length, text).unwrap()))
            .await
            .unwrap();
        length += text.len();
    }
    assert_eq!(engine.document(doc.id).unwrap().version, 4);

    let stale = Uuid::new_v4();
    engine.grant(owner, doc.id, stale, Permission::Edit).unwrap();
    let accepted = engine
        .submit(edit(doc.id, stale, 1, TextOperation::delete_at(6, 0, 3).unwrap()))
        .await
        .unwrap();
    assert_eq!(accepted.version, 5);
    assert_eq!(accepted.transformed_over, 3);
    assert_eq!(engine.snapshot(owner, doc.id).unwrap().content, "def122333");
}

#[tokio::test]
async fn test_future_version_requires_resync() {
    let engine = engine();
    let owner = Uuid::new_v4();
    let doc = engine.create_document(owner, "Draft", "abc", false).unwrap();

    let err = engine
        .submit(edit(doc.id, owner, 7, TextOperation::identity(3)))
        .await
        .unwrap_err();
    assert_eq!(err, CollabError::FutureVersion { base: 7, current: 1 });
    assert!(err.requires_resync());
    assert!(!err.is_retryable());
    assert_eq!(engine.document(doc.id).unwrap().version, 1);
}

#[tokio::test]
async fn test_public_documents_are_read_only_for_strangers() {
    let engine = engine();
    let owner = Uuid::new_v4();
    let stranger = Uuid::new_v4();
    let doc = engine.create_document(owner, "Manifesto", "read me", true).unwrap();

    assert_eq!(engine.snapshot(stranger, doc.id).unwrap().content, "read me");
    let err = engine
        .submit(edit(doc.id, stranger, 1, TextOperation::insert_at(7, 7, "!").unwrap()))
        .await
        .unwrap_err();
    assert!(matches!(err, CollabError::PermissionDenied { .. }));
}

#[tokio::test]
async fn test_concurrent_editors_converge() {
    let engine = Arc::new(engine());
    let owner = Uuid::new_v4();
    let doc = engine.create_document(owner, "Shared", "0123456789", false).unwrap();

    let mut editors = Vec::new();
    for _ in 0..6 {
        let user = Uuid::new_v4();
        engine.grant(owner, doc.id, user, Permission::Edit).unwrap();
        editors.push(user);
    }

    // Everyone edits against version 1 at once.
    let mut handles = Vec::new();
    for (i, user) in editors.iter().copied().enumerate() {
        let engine = engine.clone();
        let id = doc.id;
        let op = if i % 2 == 0 {
            TextOperation::insert_at(10, i, &format!("[{i}]")).unwrap()
        } else {
            TextOperation::delete_at(10, i, 1).unwrap()
        };
        handles.push(tokio::spawn(async move { engine.submit(edit(id, user, 1, op)).await }));
    }
    let mut versions = Vec::new();
    for handle in handles {
        versions.push(handle.await.unwrap().unwrap().version);
    }
    versions.sort_unstable();
    assert_eq!(versions, (2..=7).collect::<Vec<_>>());

    let snapshot = engine.snapshot(owner, doc.id).unwrap();
    assert_eq!(snapshot.content, replay(&engine, owner, doc.id));
    for i in [0, 2, 4] {
        assert!(snapshot.content.contains(&format!("[{i}]")));
    }
    for deleted in ['1', '3', '5'] {
        assert!(!snapshot.content.contains(deleted), "{deleted} survived in {}", snapshot.content);
    }
}

#[tokio::test]
async fn test_documents_sequence_independently() {
    let engine = Arc::new(engine());
    let owner = Uuid::new_v4();
    let docs: Vec<_> = (0..4)
        .map(|i| engine.create_document(owner, &format!("doc {i}"), "", false).unwrap())
        .collect();

    let mut handles = Vec::new();
    for doc in &docs {
        for n in 0..10 {
            let engine = engine.clone();
            let id = doc.id;
            handles.push(tokio::spawn(async move {
                engine
                    .submit(edit(id, owner, 1, TextOperation::insert_at(0, 0, &n.to_string()).unwrap()))
                    .await
            }));
        }
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    for doc in &docs {
        let row = engine.document(doc.id).unwrap();
        assert_eq!(row.version, 11);
        assert_eq!(row.length, 10);
    }
    assert_eq!(engine.stats().accepted, 40);
}

#[tokio::test]
async fn test_broadcast_follows_version_order() {
    let engine = Arc::new(engine());
    let owner = Uuid::new_v4();
    let doc = engine.create_document(owner, "Feed", "", false).unwrap();
    let mut events = engine.subscribe(owner, doc.id).unwrap();

    let mut handles = Vec::new();
    for i in 0..20 {
        let engine = engine.clone();
        let id = doc.id;
        handles.push(tokio::spawn(async move {
            engine
                .submit(edit(id, owner, 1, TextOperation::insert_at(0, 0, &format!("{i},")).unwrap()))
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let mut versions = Vec::new();
    loop {
        match events.try_recv() {
            Ok(event) => {
                if let CollabEvent::Accepted { version, .. } = *event {
                    versions.push(version);
                }
            }
            Err(TryRecvError::Empty) => break,
            Err(e) => panic!("unexpected receive error: {e}"),
        }
    }
    assert_eq!(versions, (2..=21).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_comment_reanchoring() {
    let engine = engine();
    let owner = Uuid::new_v4();
    let doc = engine.create_document(owner, "Review", "Hello world", false).unwrap();
    let mut events = engine.subscribe(owner, doc.id).unwrap();

    let shifted = engine
        .add_comment(NewComment {
            document: doc.id,
            author: owner,
            start: 6,
            end: 11,
            at_version: 1,
            body: "which world?".into(),
            parent: None,
        })
        .unwrap();
    assert_eq!(shifted.selected_text, "world");

    engine
        .submit(edit(doc.id, owner, 1, TextOperation::insert_at(11, 0, "12345").unwrap()))
        .await
        .unwrap();
    let comment = &engine.comments(owner, doc.id).unwrap()[0];
    assert_eq!((comment.position_start, comment.position_end), (11, 16));

    engine
        .submit(edit(doc.id, owner, 2, TextOperation::delete_at(16, 11, 5).unwrap()))
        .await
        .unwrap();
    let comment = &engine.comments(owner, doc.id).unwrap()[0];
    assert_eq!(comment.state, CommentState::Orphaned);

    let mut saw_moved = false;
    let mut saw_orphaned = false;
    while let Ok(event) = events.try_recv() {
        match *event {
            CollabEvent::CommentMoved { comment, .. } if comment == shifted.id => saw_moved = true,
            CollabEvent::CommentOrphaned { comment, version, .. } if comment == shifted.id => {
                assert_eq!(version, 3);
                saw_orphaned = true;
            }
            _ => {}
        }
    }
    assert!(saw_moved && saw_orphaned);
}

#[tokio::test]
async fn test_cursors_follow_remote_edits() {
    let engine = engine();
    let owner = Uuid::new_v4();
    let writer = Uuid::new_v4();
    let doc = engine.create_document(owner, "Cursors", "Hello", false).unwrap();
    engine.grant(owner, doc.id, writer, Permission::Edit).unwrap();

    engine.join(doc.id, owner, "Owner").unwrap();
    engine.update_cursor(doc.id, owner, 5, 1).unwrap();

    engine
        .submit(edit(doc.id, writer, 1, TextOperation::insert_at(5, 0, ">> ").unwrap()))
        .await
        .unwrap();
    let cursor = engine
        .active_users(doc.id)
        .into_iter()
        .find(|u| u.user == owner)
        .unwrap()
        .cursor;
    assert_eq!(cursor, 8);

    // A cursor reported against version 1 lands in the same place.
    assert_eq!(engine.update_cursor(doc.id, owner, 5, 1).unwrap(), (8, 2));
}

#[tokio::test]
async fn test_idle_sessions_are_reaped() {
    let engine = Arc::new(engine());
    let owner = Uuid::new_v4();
    let doc = engine.create_document(owner, "Idle", "", false).unwrap();
    let mut joined = engine.join(doc.id, owner, "Owner").unwrap();
    joined.events.recv().await.unwrap();

    let reaper = engine.spawn_reaper();
    let event = tokio::time::timeout(Duration::from_secs(5), joined.events.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(*event, CollabEvent::UserLeft { user, .. } if user == owner));
    assert!(engine.active_users(doc.id).is_empty());
    reaper.abort();
}

#[tokio::test]
async fn test_log_stays_contiguous() {
    let engine = engine();
    let owner = Uuid::new_v4();
    let doc = engine.create_document(owner, "Log", "x", false).unwrap();
    for base in 1..=5 {
        engine
            .submit(edit(doc.id, owner, base, TextOperation::insert_at(base as usize, 0, "y").unwrap()))
            .await
            .unwrap();
    }
    let entries = engine.entries_since(owner, doc.id, 0).unwrap();
    let versions: Vec<u64> = entries.iter().map(|e| e.version).collect();
    assert_eq!(versions, (1..=6).collect::<Vec<_>>());
    assert_eq!(engine.entries_since(owner, doc.id, 4).unwrap().len(), 2);
    assert!(matches!(
        engine.entries_since(owner, doc.id, 9),
        Err(CollabError::FutureVersion { base: 9, current: 6 })
    ));
}
