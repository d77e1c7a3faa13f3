//! End-to-end scenarios exercising the fabric through the public client
//! API against a live sequencer.

mod common;

use common::TestFabric;
use seqfab::transport::Channel;
use seqfab::{ErrorKind, Frame, OutboundPublish, SeqNum, Selector, FIRST_SEQ_NUM};
use std::thread;
use std::time::Duration;

/// One client connects, sends `Hello`, and receives `HelloAck{id=1,
/// initial_seq=0.0}`.
#[test]
fn handshake() {
    let fabric = TestFabric::spawn();
    let client = fabric.connect();
    assert_eq!(client.id().unwrap().0, 1);
    assert_eq!(client.min_send_seq(), FIRST_SEQ_NUM);
    assert_eq!(client.min_recv_seq(), FIRST_SEQ_NUM);
}

/// A publishes on "x"; B, subscribed to "x", receives the delivery and
/// then the advance grant, in that order.
#[test]
fn publish_deliver() {
    let fabric = TestFabric::spawn();
    let mut a = fabric.connect();
    let mut b = fabric.connect();

    b.subscribe(Selector::Channel("x".into()), SeqNum::new(0.0)).unwrap();

    a.publish(OutboundPublish {
        publish_seq: SeqNum::new(1.0),
        receive_seq: SeqNum::new(2.0),
        channel: "x".into(),
        payload: vec![0xDE, 0xAD],
    })
    .unwrap();
    a.clear_to_advance(SeqNum::new(3.0)).unwrap();
    // B never publishes; its own send-frontier must also clear before the
    // global frontier can reach 3.0 and unblock its grant.
    b.clear_to_advance(SeqNum::new(3.0)).unwrap();
    b.request_advance(SeqNum::new(3.0)).unwrap();

    let (msgs, _) = b.receive_messages().unwrap();
    let msgs = if msgs.is_empty() {
        // allow the background pump a moment to resolve and deliver
        thread::sleep(Duration::from_millis(5));
        b.receive_messages().unwrap().0
    } else {
        msgs
    };
    assert_eq!(msgs.len(), 1);
    assert_eq!(msgs[0].payload, vec![0xDE, 0xAD]);

    let grant = b.await_advance().unwrap();
    assert_eq!(grant, SeqNum::new(3.0));
}

/// A requests an advance to 5.0 but must not receive a grant past 1.0
/// until B and C, who never publish, also clear their own send-frontiers
/// past it.
#[test]
fn grant_gated_by_slow_client() {
    let fabric = TestFabric::spawn();
    let mut a = fabric.connect();
    let mut b = fabric.connect();
    let mut c = fabric.connect();

    for client in [&mut a, &mut b, &mut c] {
        client.subscribe(Selector::All, SeqNum::new(0.0)).unwrap();
    }

    b.clear_to_advance(SeqNum::new(1.0)).unwrap();
    c.clear_to_advance(SeqNum::new(1.0)).unwrap();
    a.clear_to_advance(SeqNum::new(1.0)).unwrap();
    a.request_advance(SeqNum::new(5.0)).unwrap();

    thread::sleep(Duration::from_millis(10));
    assert!(a.min_recv_seq() <= SeqNum::new(1.0));

    b.clear_to_advance(SeqNum::new(5.0)).unwrap();
    c.clear_to_advance(SeqNum::new(5.0)).unwrap();

    let grant = a.await_advance().unwrap();
    assert_eq!(grant, SeqNum::new(5.0));
}

/// A wildcard subscriber receives publications on two different channels
/// in delivery order.
#[test]
fn wildcard_vs_specific() {
    let fabric = TestFabric::spawn();
    let mut a = fabric.connect();
    let mut b = fabric.connect();

    a.subscribe(Selector::All, SeqNum::new(0.0)).unwrap();

    b.publish(OutboundPublish {
        publish_seq: SeqNum::new(1.0),
        receive_seq: SeqNum::new(2.0),
        channel: "x".into(),
        payload: vec![1],
    })
    .unwrap();
    b.publish(OutboundPublish {
        publish_seq: SeqNum::new(3.0),
        receive_seq: SeqNum::new(4.0),
        channel: "y".into(),
        payload: vec![2],
    })
    .unwrap();
    b.clear_to_advance(SeqNum::new(5.0)).unwrap();
    a.clear_to_advance(SeqNum::new(5.0)).unwrap();

    let delivered = a.receive_until(SeqNum::new(5.0)).unwrap();
    assert_eq!(delivered.len(), 2);
    assert_eq!(delivered[0].channel, "x");
    assert_eq!(delivered[1].channel, "y");
}

/// A publish whose `receive_seq` does not strictly exceed its
/// `publish_seq` is rejected locally and never reaches the wire.
#[test]
fn causality_rejection_is_local() {
    let fabric = TestFabric::spawn();
    let mut a = fabric.connect();

    let err = a
        .publish(OutboundPublish {
            publish_seq: SeqNum::new(2.0),
            receive_seq: SeqNum::new(1.0),
            channel: "x".into(),
            payload: vec![],
        })
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Misuse);
}

/// A frame that bypasses the client library's local check and arrives at
/// the server with a causality violation is rejected with
/// `ProtocolViolation`, and the owning session is closed.
#[test]
fn causality_violation_closes_session_server_side() {
    let fabric = TestFabric::spawn();
    let mut raw = fabric.connect_raw();
    raw.write_available(&Frame::Hello.encode()).unwrap();
    thread::sleep(Duration::from_millis(5));
    assert_eq!(fabric.session_count(), 1);

    raw.write_available(
        &Frame::Publish {
            publish_seq: SeqNum::new(2.0),
            receive_seq: SeqNum::new(1.0),
            channel: "x".into(),
            payload: vec![],
        }
        .encode(),
    )
    .unwrap();
    thread::sleep(Duration::from_millis(10));
    assert_eq!(fabric.session_count(), 0);
}
