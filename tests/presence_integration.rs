//! End-to-end presence tests: trackers announce over a real
//! in-process WebSocket server.

mod support;

use fete_collab::connection::{ConnectionConfig, ConnectionManager};
use fete_collab::events::Subscription;
use fete_collab::presence::{PresenceStatus, PresenceTracker};
use fete_collab::protocol::{Envelope, Role, UserIdentity};
use support::start_fanout_server;
use tokio::time::{timeout, Duration};
use uuid::Uuid;

async fn connected_tracker(port: u16, user: UserIdentity) -> (ConnectionManager, PresenceTracker) {
    let mgr = ConnectionManager::new(
        user.user_id,
        ConnectionConfig {
            url: format!("ws://127.0.0.1:{port}"),
            ..ConnectionConfig::default()
        },
    );
    mgr.connect().await.unwrap();
    let handle = mgr.handle();
    let tracker = PresenceTracker::new(user, handle);
    (mgr, tracker)
}

async fn pump<F>(sub: &mut Subscription<Envelope>, tracker: &mut PresenceTracker, mut done: F)
where
    F: FnMut(&PresenceTracker) -> bool,
{
    while !done(tracker) {
        match timeout(Duration::from_secs(3), sub.recv()).await {
            Ok(Some(env)) => tracker.handle_envelope(&env),
            _ => break,
        }
    }
}

#[tokio::test]
async fn test_peer_sees_online_then_offline() {
    let port = start_fanout_server().await;
    let alice = UserIdentity::new("Alice", Role::Family);
    let alice_id = alice.user_id;
    let (mgr_a, mut tracker_a) = connected_tracker(port, alice).await;
    let bob = UserIdentity::new("Bob", Role::Coordinator);
    let (mgr_b, mut tracker_b) = connected_tracker(port, bob).await;

    let mut sub_b = mgr_b.inbound();
    tracker_a.start_tracking("/planning").await;

    pump(&mut sub_b, &mut tracker_b, |t| {
        t.peer(alice_id)
            .is_some_and(|p| p.status == PresenceStatus::Online)
    })
    .await;
    let seen = tracker_b.peer(alice_id).expect("peer should be announced");
    assert_eq!(seen.status, PresenceStatus::Online);
    assert_eq!(seen.current_page.as_deref(), Some("/planning"));

    tracker_a.stop_tracking().await;
    pump(&mut sub_b, &mut tracker_b, |t| {
        t.peer(alice_id)
            .is_some_and(|p| p.status == PresenceStatus::Offline)
    })
    .await;
    assert_eq!(
        tracker_b.peer(alice_id).unwrap().status,
        PresenceStatus::Offline
    );

    mgr_a.destroy().await;
    mgr_b.destroy().await;
}

#[tokio::test]
async fn test_two_devices_aggregate_to_strongest() {
    let port = start_fanout_server().await;
    let alice = UserIdentity::new("Alice", Role::Family);
    let alice_id = alice.user_id;

    // Same user on two devices, each with its own connection
    let (mgr_laptop, mut laptop) = connected_tracker(port, alice.clone()).await;
    let (mgr_phone, mut phone) = connected_tracker(port, alice).await;
    let observer = UserIdentity::new("Morgan", Role::Venue);
    let (mgr_o, mut tracker_o) = connected_tracker(port, observer).await;

    let mut sub_o = mgr_o.inbound();
    laptop.start_tracking("/planning").await;
    phone.start_tracking("/guest-list").await;
    phone.set_visibility_hidden(true).await;

    // Laptop Online beats phone Away
    pump(&mut sub_o, &mut tracker_o, |t| {
        t.peer(alice_id).is_some_and(|p| p.devices.len() == 2)
    })
    .await;
    assert_eq!(
        tracker_o.peer(alice_id).unwrap().status,
        PresenceStatus::Online
    );

    // The laptop going dark leaves the phone's Away
    laptop.stop_tracking().await;
    pump(&mut sub_o, &mut tracker_o, |t| {
        t.peer(alice_id).is_some_and(|p| p.devices.len() == 1)
    })
    .await;
    assert_eq!(
        tracker_o.peer(alice_id).unwrap().status,
        PresenceStatus::Away
    );

    mgr_laptop.destroy().await;
    mgr_phone.destroy().await;
    mgr_o.destroy().await;
}

#[tokio::test]
async fn test_channel_membership_over_wire() {
    let port = start_fanout_server().await;
    let alice = UserIdentity::new("Alice", Role::Family);
    let alice_id = alice.user_id;
    let (mgr_a, mut tracker_a) = connected_tracker(port, alice).await;
    let bob = UserIdentity::new("Bob", Role::Coordinator);
    let (mgr_b, mut tracker_b) = connected_tracker(port, bob).await;

    let channel = Uuid::new_v4();
    let mut sub_b = mgr_b.inbound();
    tracker_a.join_channel(channel).await;

    pump(&mut sub_b, &mut tracker_b, |t| {
        t.channel_members(channel).contains(&alice_id)
    })
    .await;
    assert!(tracker_b.channel_members(channel).contains(&alice_id));

    tracker_a.leave_channel(channel).await;
    pump(&mut sub_b, &mut tracker_b, |t| {
        !t.channel_members(channel).contains(&alice_id)
    })
    .await;
    assert!(!tracker_b.channel_members(channel).contains(&alice_id));

    mgr_a.destroy().await;
    mgr_b.destroy().await;
}
