//! Stream link behaviour: ordering, queue limits, close draining and
//! failure propagation

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::timeout;

use super::*;
use crate::config::TransportConfig;
use crate::connection::{ConnectionStatus, LinkContext, SipConnection};
use crate::error::Error;
use crate::link::StreamConnection;
use crate::transport::{TransportEvent, TransportKind};

const OPTIONS: &str = "OPTIONS sip:bob@example.com SIP/2.0\r\nContent-Length: 0\r\n\r\n";

struct TestSetup {
    connection: StreamConnection,
    device: Arc<MockStreamDevice>,
    remote: MockPeer,
    ctx: LinkContext,
    events_rx: mpsc::Receiver<TransportEvent>,
}

fn local() -> SocketAddr {
    addr("127.0.0.1:5060")
}

fn remote() -> SocketAddr {
    addr("127.0.0.1:5070")
}

fn setup_test_environment(config: TransportConfig) -> TestSetup {
    let (ctx, events_rx) = test_context(config);
    let connection = StreamConnection::outbound(TransportKind::Tcp, remote(), Weak::new(), ctx.clone());
    let (device, remote) = MockStreamDevice::new(local(), remote());
    TestSetup {
        connection,
        device,
        remote,
        ctx,
        events_rx,
    }
}

fn setup_gated(config: TransportConfig) -> (TestSetup, Arc<tokio::sync::Semaphore>) {
    let (ctx, events_rx) = test_context(config);
    let connection = StreamConnection::outbound(TransportKind::Tcp, remote(), Weak::new(), ctx.clone());
    let (device, remote, gate) = MockStreamDevice::gated(local(), remote());
    let setup = TestSetup {
        connection,
        device,
        remote,
        ctx,
        events_rx,
    };
    (setup, gate)
}

fn msg(s: &'static str) -> Box<dyn crate::message::OutboundMessage> {
    Box::new(s)
}

#[tokio::test]
async fn test_writes_are_sent_in_order() {
    let setup = setup_test_environment(TransportConfig::default());
    setup.connection.attach(setup.device.clone()).unwrap();
    assert_eq!(setup.connection.status(), ConnectionStatus::Connected);

    let a = setup.connection.write(msg("A"), false).unwrap();
    let b = setup.connection.write(msg("B"), false).unwrap();
    let c = setup.connection.write(msg("C"), false).unwrap();

    assert!(a.await.is_ok());
    assert!(b.await.is_ok());
    assert!(c.await.is_ok());
    assert_eq!(
        setup.device.written(),
        vec![Bytes::from("A"), Bytes::from("B"), Bytes::from("C")]
    );
    assert_eq!(setup.connection.pending_messages(), 0);
}

#[tokio::test]
async fn test_writes_before_connect_are_flushed_on_attach() {
    let setup = setup_test_environment(TransportConfig::default());
    assert_eq!(setup.connection.status(), ConnectionStatus::PreConnect);

    let a = setup.connection.write(msg("A"), false).unwrap();
    let b = setup.connection.write(msg("B"), false).unwrap();
    assert_eq!(setup.connection.pending_messages(), 2);
    assert!(setup.device.written().is_empty());

    setup.connection.attach(setup.device.clone()).unwrap();
    assert!(a.await.is_ok());
    assert!(b.await.is_ok());
    assert_eq!(setup.device.written(), vec![Bytes::from("A"), Bytes::from("B")]);
}

#[tokio::test]
async fn test_queue_limit_counts_message_in_flight() {
    let (setup, gate) = setup_gated(TransportConfig::default().with_max_outbound_pending_messages(1));
    setup.connection.attach(setup.device.clone()).unwrap();

    let first = setup.connection.write(msg("A"), false).unwrap();
    assert!(setup.connection.is_send_pending());

    match setup.connection.write(msg("B"), false) {
        Err(Error::TooManyPendingMessages { limit, .. }) => assert_eq!(limit, 1),
        other => panic!("expected TooManyPendingMessages, got {:?}", other.map(|_| ())),
    }

    gate.add_permits(1);
    assert!(first.await.is_ok());

    // Room again once the write completed
    let third = setup.connection.write(msg("C"), false).unwrap();
    gate.add_permits(1);
    assert!(third.await.is_ok());
    assert_eq!(setup.device.written(), vec![Bytes::from("A"), Bytes::from("C")]);
}

#[tokio::test]
async fn test_writes_under_limit_are_accepted() {
    let (setup, gate) = setup_gated(TransportConfig::default().with_max_outbound_pending_messages(5));
    setup.connection.attach(setup.device.clone()).unwrap();

    let handles: Vec<_> = ["A", "B", "C"]
        .into_iter()
        .map(|m| setup.connection.write(msg(m), false).unwrap())
        .collect();
    assert_eq!(setup.connection.pending_messages(), 3);

    gate.add_permits(3);
    for handle in handles {
        assert!(handle.await.is_ok());
    }
    assert_eq!(setup.connection.pending_messages(), 0);
}

#[tokio::test]
async fn test_close_drains_queue_then_closes_once() {
    let (mut setup, gate) = setup_gated(TransportConfig::default());
    setup.connection.attach(setup.device.clone()).unwrap();

    let handles: Vec<_> = ["A", "B", "C"]
        .into_iter()
        .map(|m| setup.connection.write(msg(m), false).unwrap())
        .collect();

    setup.connection.close();
    assert_eq!(setup.connection.status(), ConnectionStatus::Closing);
    assert!(matches!(
        setup.connection.write(msg("D"), false),
        Err(Error::ConnectionClosing(_))
    ));

    gate.add_permits(3);
    timeout(Duration::from_secs(1), setup.connection.closed())
        .await
        .expect("connection should close after draining");

    for handle in handles {
        assert!(handle.await.is_ok());
    }
    assert_eq!(setup.device.written().len(), 3);
    assert_eq!(setup.connection.status(), ConnectionStatus::Closed);

    // A second close is a no-op
    setup.connection.close();
    settle().await;

    let closed_events = drain_events(&mut setup.events_rx)
        .into_iter()
        .filter(|e| matches!(e, TransportEvent::ConnectionClosed { .. }))
        .count();
    assert_eq!(closed_events, 1);
    assert_eq!(setup.device.shutdown_count(), 1);
    assert!(matches!(
        setup.connection.write(msg("E"), false),
        Err(Error::ConnectionClosed(_))
    ));
}

#[tokio::test]
async fn test_close_idle_connection_is_immediate() {
    let setup = setup_test_environment(TransportConfig::default());
    setup.connection.attach(setup.device.clone()).unwrap();
    setup.connection.close();
    assert_eq!(setup.connection.status(), ConnectionStatus::Closed);
}

#[tokio::test]
async fn test_read_error_is_deferred_while_write_pending() {
    let (setup, gate) = setup_gated(TransportConfig::default());
    setup.connection.attach(setup.device.clone()).unwrap();

    let in_flight = setup.connection.write(msg("A"), false).unwrap();
    setup.remote.fail(io::ErrorKind::ConnectionReset);
    settle().await;

    // The failure waits for the pending write
    assert_eq!(setup.connection.status(), ConnectionStatus::Connected);
    let queued = setup.connection.write(msg("B"), false).unwrap();

    gate.add_permits(1);
    assert!(in_flight.await.is_ok());

    let err = queued.await.unwrap_err();
    assert!(err.is_io());
    assert!(matches!(err, Error::Io(_)));
    assert_eq!(setup.connection.status(), ConnectionStatus::Broken);
    assert_eq!(setup.device.written(), vec![Bytes::from("A")]);

    setup.connection.close();
    assert_eq!(setup.connection.status(), ConnectionStatus::Closed);
}

#[tokio::test]
async fn test_read_error_while_closing_fails_remaining_queue() {
    let (mut setup, gate) = setup_gated(TransportConfig::default());
    setup.connection.attach(setup.device.clone()).unwrap();

    let in_flight = setup.connection.write(msg("A"), false).unwrap();
    let queued: Vec<_> = ["B", "C"]
        .into_iter()
        .map(|m| setup.connection.write(msg(m), false).unwrap())
        .collect();
    setup.connection.close();
    assert_eq!(setup.connection.status(), ConnectionStatus::Closing);

    setup.remote.fail(io::ErrorKind::ConnectionReset);
    settle().await;
    assert_eq!(setup.connection.status(), ConnectionStatus::Closing);

    // Only the write already in flight gets through
    gate.add_permits(1);
    assert!(in_flight.await.is_ok());
    for handle in queued {
        assert!(matches!(handle.await, Err(Error::Io(_))));
    }
    assert_eq!(setup.connection.status(), ConnectionStatus::Broken);
    assert_eq!(setup.device.written(), vec![Bytes::from("A")]);

    setup.connection.close();
    assert_eq!(setup.connection.status(), ConnectionStatus::Closed);
    let events = drain_events(&mut setup.events_rx);
    assert!(events.iter().any(|e| matches!(e, TransportEvent::Error { .. })));
}

#[tokio::test]
async fn test_write_error_fails_every_queued_message() {
    let (mut setup, gate) = setup_gated(TransportConfig::default());
    setup.connection.attach(setup.device.clone()).unwrap();
    setup.device.fail_writes();

    let handles: Vec<_> = ["A", "B", "C"]
        .into_iter()
        .map(|m| setup.connection.write(msg(m), false).unwrap())
        .collect();
    gate.add_permits(10);

    for handle in handles {
        match handle.await {
            Err(Error::SendFailed(peer, _)) => assert_eq!(peer, remote()),
            other => panic!("expected SendFailed, got {:?}", other),
        }
    }
    assert_eq!(setup.connection.status(), ConnectionStatus::Broken);
    assert!(matches!(
        setup.connection.write(msg("D"), false),
        Err(Error::ConnectionBroken(_))
    ));

    let errors = drain_events(&mut setup.events_rx)
        .into_iter()
        .filter(|e| matches!(e, TransportEvent::Error { .. }))
        .count();
    assert_eq!(errors, 1);
}

#[tokio::test]
async fn test_encode_failure_only_fails_that_message() {
    let setup = setup_test_environment(TransportConfig::default());
    setup.connection.attach(setup.device.clone()).unwrap();

    let a = setup.connection.write(msg("A"), false).unwrap();
    let bad = setup.connection.write(Box::new(UnencodableMessage), false).unwrap();
    let b = setup.connection.write(msg("B"), false).unwrap();

    assert!(a.await.is_ok());
    assert!(matches!(bad.await, Err(Error::EncodeFailed(_))));
    assert!(b.await.is_ok());
    assert_eq!(setup.connection.status(), ConnectionStatus::Connected);
    assert_eq!(setup.device.written(), vec![Bytes::from("A"), Bytes::from("B")]);
}

#[tokio::test]
async fn test_inbound_messages_are_framed_and_dispatched() {
    let mut setup = setup_test_environment(TransportConfig::default());
    setup.connection.attach(setup.device.clone()).unwrap();

    // Two messages in one read, the second split across reads
    let both = format!("{}{}", OPTIONS, OPTIONS);
    let (first, rest) = both.as_bytes().split_at(OPTIONS.len() + 10);
    setup.remote.send(first);
    setup.remote.send(rest);

    let mut received = Vec::new();
    while received.len() < 2 {
        let event = timeout(Duration::from_secs(1), setup.events_rx.recv())
            .await
            .expect("timed out waiting for message")
            .expect("event channel closed");
        if let TransportEvent::MessageReceived {
            message,
            source,
            transport,
            ..
        } = event
        {
            assert_eq!(source, remote());
            assert_eq!(transport, TransportKind::Tcp);
            received.push(message);
        }
    }
    assert!(received.iter().all(|m| m == OPTIONS.as_bytes()));
}

#[tokio::test]
async fn test_peer_hang_up_breaks_connection() {
    let mut setup = setup_test_environment(TransportConfig::default());
    setup.connection.attach(setup.device.clone()).unwrap();

    setup.remote.hang_up();
    settle().await;

    assert_eq!(setup.connection.status(), ConnectionStatus::Broken);
    assert_eq!(setup.device.shutdown_count(), 1);
}

#[tokio::test]
async fn test_inbound_connection_learns_peer() {
    let (ctx, _events_rx) = test_context(TransportConfig::default());
    let connection = StreamConnection::inbound(TransportKind::Tcp, Weak::new(), ctx);
    assert_eq!(connection.peer_addr(), None);

    let (device, _remote) = MockStreamDevice::new(local(), remote());
    connection.accept(device).unwrap();
    assert_eq!(connection.peer_addr(), Some(remote()));
    assert_eq!(connection.local_addr(), Some(local()));

    let err = connection.core().set_remote_address(addr("127.0.0.1:9999")).unwrap_err();
    assert!(err.is_illegal_state());
}

#[tokio::test]
async fn test_buffers_are_returned_to_pool() {
    let setup = setup_test_environment(TransportConfig::default());
    setup.connection.attach(setup.device.clone()).unwrap();

    for _ in 0..5 {
        setup.connection.write(msg("A"), false).unwrap().await.unwrap();
    }
    setup.remote.send(OPTIONS.as_bytes());
    settle().await;

    setup.connection.close();
    settle().await;

    let stats = setup.ctx.pool.stats();
    assert_eq!(stats.outstanding, 0, "leaked buffers: {:?}", stats);
    assert!(stats.acquired >= 6);
}

#[tokio::test]
async fn test_attach_after_close_releases_device() {
    let setup = setup_test_environment(TransportConfig::default());
    setup.connection.close();
    assert_eq!(setup.connection.status(), ConnectionStatus::Closed);

    assert!(matches!(
        setup.connection.attach(setup.device.clone()),
        Err(Error::ConnectionClosed(_))
    ));
    settle().await;
    assert_eq!(setup.device.shutdown_count(), 1);
}
