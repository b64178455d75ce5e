//! Test doubles for the I/O substrate and shared test setup

mod stream_link_test;

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify, Semaphore};

use crate::config::TransportConfig;
use crate::connection::LinkContext;
use crate::error::{Error, Result};
use crate::io::{Accepted, DatagramOpener, DatagramSocket, StreamAcceptor, StreamConnector, StreamDevice};
use crate::message::OutboundMessage;
use crate::transport::TransportEvent;

pub(crate) fn addr(s: &str) -> SocketAddr {
    s.parse().unwrap()
}

pub(crate) fn test_context(config: TransportConfig) -> (LinkContext, mpsc::Receiver<TransportEvent>) {
    crate::logging::init_test_logging();
    LinkContext::new(config)
}

/// Give spawned tasks a chance to run
pub(crate) async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}

/// Drain every event delivered so far
pub(crate) fn drain_events(rx: &mut mpsc::Receiver<TransportEvent>) -> Vec<TransportEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// A message whose encoding always fails
#[derive(Debug)]
pub(crate) struct UnencodableMessage;

impl OutboundMessage for UnencodableMessage {
    fn encode(&self, _use_compact_headers: bool, _dst: &mut BytesMut) -> Result<()> {
        Err(Error::EncodeFailed("missing mandatory header".to_string()))
    }
}

/// Remote side of a [`MockStreamDevice`]: feeds what the device reads
pub(crate) struct MockPeer {
    tx: Option<mpsc::UnboundedSender<io::Result<Vec<u8>>>>,
}

impl MockPeer {
    pub(crate) fn send(&self, data: &[u8]) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(Ok(data.to_vec()));
        }
    }

    pub(crate) fn fail(&self, kind: io::ErrorKind) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(Err(io::Error::new(kind, "mock read failure")));
        }
    }

    /// Close the peer's side; the device then reads end of stream
    pub(crate) fn hang_up(&mut self) {
        self.tx = None;
    }
}

/// In-memory stream device. Writes can be held back by a gate and made to
/// fail; reads come from the paired [`MockPeer`].
#[derive(Debug)]
pub(crate) struct MockStreamDevice {
    local: SocketAddr,
    peer: SocketAddr,
    written: Mutex<Vec<Bytes>>,
    write_gate: Option<Arc<Semaphore>>,
    fail_writes: AtomicBool,
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<io::Result<Vec<u8>>>>,
    shutdowns: AtomicUsize,
    write_notifier: Notify,
}

impl MockStreamDevice {
    pub(crate) fn new(local: SocketAddr, peer: SocketAddr) -> (Arc<Self>, MockPeer) {
        Self::build(local, peer, None)
    }

    /// A device whose writes each wait for a permit on the returned gate
    pub(crate) fn gated(local: SocketAddr, peer: SocketAddr) -> (Arc<Self>, MockPeer, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let (device, remote) = Self::build(local, peer, Some(gate.clone()));
        (device, remote, gate)
    }

    fn build(local: SocketAddr, peer: SocketAddr, write_gate: Option<Arc<Semaphore>>) -> (Arc<Self>, MockPeer) {
        let (tx, rx) = mpsc::unbounded_channel();
        let device = Arc::new(Self {
            local,
            peer,
            written: Mutex::new(Vec::new()),
            write_gate,
            fail_writes: AtomicBool::new(false),
            inbound: tokio::sync::Mutex::new(rx),
            shutdowns: AtomicUsize::new(0),
            write_notifier: Notify::new(),
        });
        (device, MockPeer { tx: Some(tx) })
    }

    pub(crate) fn fail_writes(&self) {
        self.fail_writes.store(true, Ordering::SeqCst);
    }

    pub(crate) fn written(&self) -> Vec<Bytes> {
        self.written.lock().clone()
    }

    pub(crate) fn shutdown_count(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }

    pub(crate) async fn wait_for_writes(&self, count: usize) {
        while self.written.lock().len() < count {
            let _ = tokio::time::timeout(Duration::from_millis(50), self.write_notifier.notified()).await;
        }
    }
}

#[async_trait]
impl StreamDevice for MockStreamDevice {
    async fn read(&self, buf: &mut BytesMut) -> io::Result<usize> {
        let mut inbound = self.inbound.lock().await;
        match inbound.recv().await {
            Some(Ok(data)) => {
                buf.extend_from_slice(&data);
                Ok(data.len())
            }
            Some(Err(e)) => Err(e),
            None => Ok(0),
        }
    }

    async fn write_all(&self, buf: &[u8]) -> io::Result<()> {
        if let Some(gate) = &self.write_gate {
            gate.acquire()
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "gate closed"))?
                .forget();
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "mock write failure"));
        }
        self.written.lock().push(Bytes::copy_from_slice(buf));
        self.write_notifier.notify_waiters();
        Ok(())
    }

    async fn shutdown(&self) -> io::Result<()> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.local)
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.peer)
    }
}

/// How a [`MockConnector`] answers connect requests
#[derive(Debug)]
pub(crate) enum ConnectBehavior {
    /// Hand out the queued devices in order
    Succeed,
    /// Fail with connection refused
    Refuse,
    /// Never complete
    Hang,
    /// Hand out the queued devices once the gate grants a permit
    Gated(Arc<Semaphore>),
}

#[derive(Debug)]
pub(crate) struct MockConnector {
    behavior: ConnectBehavior,
    devices: Mutex<VecDeque<Arc<MockStreamDevice>>>,
    attempts: AtomicUsize,
}

impl MockConnector {
    pub(crate) fn new(behavior: ConnectBehavior) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            devices: Mutex::new(VecDeque::new()),
            attempts: AtomicUsize::new(0),
        })
    }

    pub(crate) fn with_device(device: Arc<MockStreamDevice>) -> Arc<Self> {
        let connector = Self::new(ConnectBehavior::Succeed);
        connector.devices.lock().push_back(device);
        connector
    }

    /// A connector whose connects wait on the returned gate
    pub(crate) fn gated(device: Arc<MockStreamDevice>) -> (Arc<Self>, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let connector = Self::new(ConnectBehavior::Gated(gate.clone()));
        connector.devices.lock().push_back(device);
        (connector, gate)
    }

    fn next_device(&self) -> io::Result<Arc<dyn StreamDevice>> {
        let device = self.devices.lock().pop_front();
        match device {
            Some(device) => Ok(device as Arc<dyn StreamDevice>),
            None => Err(io::Error::new(io::ErrorKind::ConnectionRefused, "no device queued")),
        }
    }

    pub(crate) fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StreamConnector for MockConnector {
    async fn connect(&self, _target: SocketAddr) -> io::Result<Arc<dyn StreamDevice>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        match &self.behavior {
            ConnectBehavior::Succeed => self.next_device(),
            ConnectBehavior::Refuse => Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused")),
            ConnectBehavior::Hang => std::future::pending().await,
            ConnectBehavior::Gated(gate) => {
                gate.acquire()
                    .await
                    .map_err(|_| io::Error::new(io::ErrorKind::ConnectionAborted, "gate closed"))?
                    .forget();
                self.next_device()
            }
        }
    }
}

/// An accepted stream that needs no handshake
pub(crate) fn ready(device: &Arc<MockStreamDevice>) -> Accepted {
    Accepted::Ready(device.clone())
}

/// An accepted stream whose handshake never completes
pub(crate) fn stalled_handshake(peer: SocketAddr) -> Accepted {
    Accepted::Handshake {
        peer,
        pending: Box::pin(std::future::pending()),
    }
}

/// Hands out streams pushed by the test as accepted connections
#[derive(Debug)]
pub(crate) struct MockAcceptor {
    local: SocketAddr,
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<Accepted>>,
}

impl MockAcceptor {
    pub(crate) fn new(local: SocketAddr) -> (Arc<Self>, mpsc::UnboundedSender<Accepted>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let acceptor = Arc::new(Self {
            local,
            incoming: tokio::sync::Mutex::new(rx),
        });
        (acceptor, tx)
    }
}

#[async_trait]
impl StreamAcceptor for MockAcceptor {
    async fn accept(&self) -> io::Result<Accepted> {
        let mut incoming = self.incoming.lock().await;
        match incoming.recv().await {
            Some(accepted) => Ok(accepted),
            None => std::future::pending().await,
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.local)
    }
}

/// In-memory datagram socket recording every send
#[derive(Debug)]
pub(crate) struct MockDatagramSocket {
    local: SocketAddr,
    sent: Mutex<Vec<(Bytes, SocketAddr)>>,
    unreachable: Mutex<Option<SocketAddr>>,
    send_gate: Option<Arc<Semaphore>>,
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<(Vec<u8>, SocketAddr)>>,
    inbound_tx: mpsc::UnboundedSender<(Vec<u8>, SocketAddr)>,
}

impl MockDatagramSocket {
    pub(crate) fn new(local: SocketAddr) -> Arc<Self> {
        Self::build(local, None)
    }

    pub(crate) fn gated(local: SocketAddr) -> (Arc<Self>, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        (Self::build(local, Some(gate.clone())), gate)
    }

    fn build(local: SocketAddr, send_gate: Option<Arc<Semaphore>>) -> Arc<Self> {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            local,
            sent: Mutex::new(Vec::new()),
            unreachable: Mutex::new(None),
            send_gate,
            inbound: tokio::sync::Mutex::new(inbound_rx),
            inbound_tx,
        })
    }

    /// Sends to `target` fail from now on
    pub(crate) fn make_unreachable(&self, target: SocketAddr) {
        *self.unreachable.lock() = Some(target);
    }

    /// Queue a datagram for the receive side
    pub(crate) fn inject(&self, data: &[u8], from: SocketAddr) {
        let _ = self.inbound_tx.send((data.to_vec(), from));
    }

    pub(crate) fn sent(&self) -> Vec<(Bytes, SocketAddr)> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl DatagramSocket for MockDatagramSocket {
    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        if let Some(gate) = &self.send_gate {
            gate.acquire()
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "gate closed"))?
                .forget();
        }
        if *self.unreachable.lock() == Some(target) {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "unreachable"));
        }
        self.sent.lock().push((Bytes::copy_from_slice(buf), target));
        Ok(buf.len())
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let mut inbound = self.inbound.lock().await;
        match inbound.recv().await {
            Some((data, from)) => {
                let len = data.len().min(buf.len());
                buf[..len].copy_from_slice(&data[..len]);
                Ok((len, from))
            }
            None => std::future::pending().await,
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.local)
    }
}

/// Opens a [`MockDatagramSocket`], optionally failing the next attempt
#[derive(Debug)]
pub(crate) struct MockDatagramOpener {
    socket: Arc<MockDatagramSocket>,
    opens: AtomicUsize,
    fail_next: AtomicBool,
}

impl MockDatagramOpener {
    pub(crate) fn new(socket: Arc<MockDatagramSocket>) -> Arc<Self> {
        Arc::new(Self {
            socket,
            opens: AtomicUsize::new(0),
            fail_next: AtomicBool::new(false),
        })
    }

    pub(crate) fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    pub(crate) fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DatagramOpener for MockDatagramOpener {
    async fn open(&self) -> io::Result<Arc<dyn DatagramSocket>> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::AddrNotAvailable, "no route"));
        }
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(self.socket.clone() as Arc<dyn DatagramSocket>)
    }
}
