//! End-to-end document tests: two clients edit the same session
//! through a real in-process WebSocket server.

mod support;

use fete_collab::api::{InMemoryBackend, SessionRecord};
use fete_collab::connection::{ConnectionConfig, ConnectionManager};
use fete_collab::document::{DocumentEngine, DocumentError, OperationKind, PathSegment};
use fete_collab::events::Subscription;
use fete_collab::protocol::{Envelope, Role, UserIdentity};
use serde_json::json;
use support::start_fanout_server;
use tokio::time::{timeout, Duration};
use uuid::Uuid;

type Docs = DocumentEngine<InMemoryBackend>;

async fn connected_client(port: u16, name: &str) -> (ConnectionManager, Docs) {
    let user = UserIdentity::new(name, Role::Family);
    let mgr = ConnectionManager::new(
        user.user_id,
        ConnectionConfig {
            url: format!("ws://127.0.0.1:{port}"),
            ..ConnectionConfig::default()
        },
    );
    mgr.connect().await.unwrap();
    let handle = mgr.handle();
    let engine = DocumentEngine::new(user, InMemoryBackend::new(), handle);
    (mgr, engine)
}

async fn pump<F>(sub: &mut Subscription<Envelope>, engine: &mut Docs, mut done: F)
where
    F: FnMut(&Docs) -> bool,
{
    while !done(engine) {
        match timeout(Duration::from_secs(3), sub.recv()).await {
            Ok(Some(env)) => engine.handle_envelope(&env),
            _ => break,
        }
    }
}

/// Open the same session on both engines, seeding the second backend
/// with the record the first created.
async fn shared_session(alice: &mut Docs, bob: &mut Docs, content: serde_json::Value) -> Uuid {
    let session_id = alice
        .create_session(Uuid::new_v4(), content)
        .await
        .unwrap();
    let opened = alice.session(session_id).unwrap();
    bob.backend().seed_session(SessionRecord {
        session_id,
        document_id: opened.document_id,
        participants: opened.participants.clone(),
        version: opened.version,
        content: opened.content.clone(),
    });
    bob.join_session(session_id).await.unwrap();
    session_id
}

fn key(k: &str) -> PathSegment {
    PathSegment::Key(k.to_string())
}

#[tokio::test]
async fn test_edit_propagates_to_peer() {
    let port = start_fanout_server().await;
    let (mgr_a, mut alice) = connected_client(port, "Alice").await;
    let (mgr_b, mut bob) = connected_client(port, "Bob").await;
    let session_id = shared_session(
        &mut alice,
        &mut bob,
        json!({ "title": "Reunion", "guests": [] }),
    )
    .await;

    let mut sub_b = mgr_b.inbound();
    alice
        .apply_edit(
            session_id,
            OperationKind::Update,
            vec![key("title")],
            Some(json!("Summer Reunion")),
        )
        .await
        .unwrap();

    pump(&mut sub_b, &mut bob, |e| {
        e.session(session_id).unwrap().content["title"] == json!("Summer Reunion")
    })
    .await;
    assert_eq!(
        bob.session(session_id).unwrap().content["title"],
        json!("Summer Reunion")
    );
    assert_eq!(bob.unresolved_conflicts(session_id), 0);

    mgr_a.destroy().await;
    mgr_b.destroy().await;
}

#[tokio::test]
async fn test_disjoint_edits_converge_without_conflict() {
    let port = start_fanout_server().await;
    let (mgr_a, mut alice) = connected_client(port, "Alice").await;
    let (mgr_b, mut bob) = connected_client(port, "Bob").await;
    let session_id = shared_session(
        &mut alice,
        &mut bob,
        json!({ "title": "Reunion", "budget": 100 }),
    )
    .await;

    let mut sub_a = mgr_a.inbound();
    let mut sub_b = mgr_b.inbound();

    alice
        .apply_edit(
            session_id,
            OperationKind::Update,
            vec![key("title")],
            Some(json!("Summer Reunion")),
        )
        .await
        .unwrap();
    bob.apply_edit(
        session_id,
        OperationKind::Update,
        vec![key("budget")],
        Some(json!(250)),
    )
    .await
    .unwrap();

    pump(&mut sub_a, &mut alice, |e| {
        e.session(session_id).unwrap().content["budget"] == json!(250)
    })
    .await;
    pump(&mut sub_b, &mut bob, |e| {
        e.session(session_id).unwrap().content["title"] == json!("Summer Reunion")
    })
    .await;

    let final_a = &alice.session(session_id).unwrap().content;
    let final_b = &bob.session(session_id).unwrap().content;
    assert_eq!(final_a, final_b);
    assert_eq!(alice.unresolved_conflicts(session_id), 0);
    assert_eq!(bob.unresolved_conflicts(session_id), 0);

    mgr_a.destroy().await;
    mgr_b.destroy().await;
}

#[tokio::test]
async fn test_concurrent_same_field_converges_with_conflict() {
    let port = start_fanout_server().await;
    let (mgr_a, mut alice) = connected_client(port, "Alice").await;
    let (mgr_b, mut bob) = connected_client(port, "Bob").await;
    let session_id = shared_session(&mut alice, &mut bob, json!({ "venue": "TBD" })).await;

    let mut sub_a = mgr_a.inbound();
    let mut sub_b = mgr_b.inbound();

    // Both write the same field before either sees the other's edit
    alice
        .apply_edit(
            session_id,
            OperationKind::Update,
            vec![key("venue")],
            Some(json!("Garden Hall")),
        )
        .await
        .unwrap();
    bob.apply_edit(
        session_id,
        OperationKind::Update,
        vec![key("venue")],
        Some(json!("Beach House")),
    )
    .await
    .unwrap();

    pump(&mut sub_a, &mut alice, |e| {
        e.unresolved_conflicts(session_id) >= 1
    })
    .await;
    pump(&mut sub_b, &mut bob, |e| {
        e.unresolved_conflicts(session_id) >= 1
    })
    .await;

    // Same winner on both sides, and the race is surfaced exactly once
    assert_eq!(
        alice.session(session_id).unwrap().content["venue"],
        bob.session(session_id).unwrap().content["venue"]
    );
    assert_eq!(alice.unresolved_conflicts(session_id), 1);
    assert_eq!(bob.unresolved_conflicts(session_id), 1);

    mgr_a.destroy().await;
    mgr_b.destroy().await;
}

#[tokio::test]
async fn test_lock_announcement_blocks_peer() {
    let port = start_fanout_server().await;
    let (mgr_a, mut alice) = connected_client(port, "Alice").await;
    let (mgr_b, mut bob) = connected_client(port, "Bob").await;
    let session_id = shared_session(&mut alice, &mut bob, json!({ "title": "Reunion" })).await;

    let mut sub_b = mgr_b.inbound();
    let lock = alice.acquire_lock(session_id, 60_000).await.unwrap();

    pump(&mut sub_b, &mut bob, |e| {
        e.session(session_id).unwrap().lock.is_some()
    })
    .await;
    let seen = bob.session(session_id).unwrap().lock.as_ref().unwrap();
    assert_eq!(seen.holder, lock.holder);

    let result = bob
        .apply_edit(
            session_id,
            OperationKind::Update,
            vec![key("title")],
            Some(json!("Hijacked")),
        )
        .await;
    assert!(matches!(result, Err(DocumentError::LockConflict { .. })));

    // The holder edits freely, and release reopens the session
    alice
        .apply_edit(
            session_id,
            OperationKind::Update,
            vec![key("title")],
            Some(json!("Locked In")),
        )
        .await
        .unwrap();
    alice.release_lock(session_id).await.unwrap();

    pump(&mut sub_b, &mut bob, |e| {
        e.session(session_id).unwrap().lock.is_none()
            && e.session(session_id).unwrap().content["title"] == json!("Locked In")
    })
    .await;
    bob.apply_edit(
        session_id,
        OperationKind::Update,
        vec![key("title")],
        Some(json!("Free Again")),
    )
    .await
    .unwrap();

    mgr_a.destroy().await;
    mgr_b.destroy().await;
}

#[tokio::test]
async fn test_revert_propagates_as_new_edit() {
    let port = start_fanout_server().await;
    let (mgr_a, mut alice) = connected_client(port, "Alice").await;
    let (mgr_b, mut bob) = connected_client(port, "Bob").await;
    let session_id = shared_session(&mut alice, &mut bob, json!({ "title": "Draft" })).await;

    let mut sub_b = mgr_b.inbound();
    alice
        .create_version_snapshot(session_id, "baseline", true)
        .await
        .unwrap();
    let baseline = alice.session(session_id).unwrap().version;

    alice
        .apply_edit(
            session_id,
            OperationKind::Update,
            vec![key("title")],
            Some(json!("Scribbles")),
        )
        .await
        .unwrap();
    alice.revert_to_version(session_id, baseline).await.unwrap();

    pump(&mut sub_b, &mut bob, |e| {
        e.session(session_id).unwrap().content["title"] == json!("Draft")
    })
    .await;
    assert_eq!(
        bob.session(session_id).unwrap().content["title"],
        json!("Draft")
    );

    mgr_a.destroy().await;
    mgr_b.destroy().await;
}
