//! Store-and-forward: sneakernet delivery on reconnect, expiry on silence

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{drain, settle, TestNode, T0};
use scmesh::mesh::relay::SendOutcome;
use scmesh::protocol::MessageKind;
use scmesh::storage::PersistenceAdapter;
use scmesh::transport::local::LocalHub;
use scmesh::utils::ManualClock;

#[tokio::test]
async fn queued_message_delivered_once_on_reconnect() {
    let hub = LocalHub::new();
    let clock = Arc::new(ManualClock::new(T0));
    let mut a = TestNode::new(&hub, &clock);
    let mut b = TestNode::new(&hub, &clock);

    // Nobody is connected: the send parks in persistence
    let (_, outcome) = a
        .relay
        .send_message(b.key(), MessageKind::Text, b"see you later".to_vec(), None)
        .await;
    assert_eq!(outcome, SendOutcome::Queued);
    assert!(a.storage.scan_messages().await.unwrap().len() >= 1);

    let mut b_msgs = b.relay.subscribe_messages();

    // The destination comes back: the backlog drains immediately
    hub.connect(a.key(), b.key());
    settle(&mut [&mut a, &mut b]).await;

    let texts: Vec<_> = drain(&mut b_msgs)
        .into_iter()
        .filter(|m| m.kind == MessageKind::Text)
        .collect();
    assert_eq!(texts.len(), 1);
    assert_eq!(texts[0].payload, b"see you later");

    // Delivered exactly once: the queue is empty and another tick moves
    // nothing
    assert_eq!(a.storage.scan_messages().await.unwrap().len(), 0);
    a.relay.run_retry_tick().await;
    settle(&mut [&mut a, &mut b]).await;
    assert!(drain(&mut b_msgs)
        .iter()
        .all(|m| m.kind != MessageKind::Text));
}

#[tokio::test]
async fn queued_message_expires_after_max_age() {
    let hub = LocalHub::new();
    let clock = Arc::new(ManualClock::new(T0));
    let mut a = TestNode::new(&hub, &clock);
    let mut b = TestNode::new(&hub, &clock);

    let (_, outcome) = a
        .relay
        .send_message(b.key(), MessageKind::Text, b"too late".to_vec(), None)
        .await;
    assert_eq!(outcome, SendOutcome::Queued);

    // Seven days of silence, then a scheduler tick drops the backlog
    clock.advance(Duration::from_secs(7 * 24 * 60 * 60 + 1));
    a.relay.run_retry_tick().await;
    assert_eq!(a.storage.scan_messages().await.unwrap().len(), 0);

    // A late reconnect delivers nothing
    let mut b_msgs = b.relay.subscribe_messages();
    hub.connect(a.key(), b.key());
    settle(&mut [&mut a, &mut b]).await;
    assert!(drain(&mut b_msgs)
        .iter()
        .all(|m| m.kind != MessageKind::Text));
}

#[tokio::test]
async fn relay_parks_message_when_no_next_hop() {
    let hub = LocalHub::new();
    let clock = Arc::new(ManualClock::new(T0));
    let mut a = TestNode::new(&hub, &clock);
    let mut r = TestNode::new(&hub, &clock);
    let mut b = TestNode::new(&hub, &clock);

    // Only A—R is up; R has nowhere to push B's traffic
    hub.connect(a.key(), r.key());
    settle(&mut [&mut a, &mut r]).await;

    a.relay
        .send_message(b.key(), MessageKind::Text, b"via relay".to_vec(), None)
        .await;
    settle(&mut [&mut a, &mut r]).await;

    // R parked the directed envelopes for B
    assert!(r.storage.scan_messages().await.unwrap().len() >= 1);

    // R—B comes up: R plays postman
    let mut b_msgs = b.relay.subscribe_messages();
    hub.connect(r.key(), b.key());
    settle(&mut [&mut a, &mut r, &mut b]).await;

    let texts: Vec<_> = drain(&mut b_msgs)
        .into_iter()
        .filter(|m| m.kind == MessageKind::Text)
        .collect();
    assert_eq!(texts.len(), 1);
    assert_eq!(texts[0].payload, b"via relay");
}
