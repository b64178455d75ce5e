//! Datagram link (UDP)
//!
//! One [`DatagramLink`] per endpoint carries every outbound datagram. Sends
//! are queued and a single worker task transmits them one at a time over a
//! send path that is opened lazily on first use. Inbound datagrams are
//! surfaced through short-lived [`DatagramConnection`] handles, one per
//! received packet, which reply through the shared link.

use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::{mpsc, OnceCell};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::buffer::PooledBuffer;
use crate::channel::ListeningEndpoint;
use crate::connection::{ConnectionCore, ConnectionId, ConnectionStatus, LinkContext, SipConnection};
use crate::envelope::{Envelope, SendHandle};
use crate::error::{Error, Result};
use crate::io::{DatagramOpener, DatagramSocket};
use crate::message::OutboundMessage;
use crate::transport::{TransportKind, MAX_UDP_PACKET_SIZE};

/// Shared outbound path of a datagram endpoint
#[derive(Clone)]
pub struct DatagramLink {
    inner: Arc<DatagramInner>,
}

struct DatagramInner {
    core: ConnectionCore,
    opener: Arc<dyn DatagramOpener>,
    send_path: OnceCell<Arc<dyn DatagramSocket>>,
    queue_tx: mpsc::UnboundedSender<Envelope>,
    shutdown: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl DatagramLink {
    /// Create the link and start its send worker. Must be called inside a
    /// tokio runtime.
    pub fn new(
        opener: Arc<dyn DatagramOpener>,
        local_addr: Option<SocketAddr>,
        endpoint: Weak<ListeningEndpoint>,
        ctx: LinkContext,
    ) -> Self {
        let core = ConnectionCore::new(TransportKind::Udp, None, endpoint, ctx);
        if let Some(local) = local_addr {
            core.set_local_addr(local);
        }
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(DatagramInner {
            core,
            opener,
            send_path: OnceCell::new(),
            queue_tx,
            shutdown: CancellationToken::new(),
            worker: Mutex::new(None),
        });

        let worker = tokio::spawn(DatagramInner::run_worker(inner.clone(), queue_rx));
        *inner.worker.lock() = Some(worker);

        Self { inner }
    }

    /// The link's own connection core
    pub fn core(&self) -> &ConnectionCore {
        &self.inner.core
    }

    /// Queue an envelope for its destination.
    ///
    /// The send path is opened by the worker when it transmits, not here. A
    /// failed open is never reported by this call: it fails the envelope the
    /// worker was transmitting through its [`SendHandle`], and the next
    /// envelope retries the open.
    pub fn send(&self, envelope: Envelope) -> Result<()> {
        if self.inner.shutdown.is_cancelled() {
            return Err(Error::TransportClosed);
        }
        if envelope.destination().is_none() {
            return Err(Error::NoRemoteAddress(self.inner.core.id()));
        }

        self.inner
            .queue_tx
            .send(envelope)
            .map_err(|_| Error::TransportClosed)
    }

    /// Handle for a peer that a datagram was received from
    pub fn connection_for(&self, peer: SocketAddr) -> DatagramConnection {
        DatagramConnection::new(self.clone(), peer)
    }

    /// Whether the send path has been opened
    pub fn is_connected(&self) -> bool {
        self.inner.send_path.initialized()
    }

    /// Whether the link has been shut down
    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Stop the worker. Envelopes still queued fail with
    /// [`Error::TransportClosed`]. Calling it again is a no-op.
    pub fn shutdown(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        self.inner.shutdown.cancel();
        self.inner.core.close();
        debug!("UDP link {} shutting down", self.inner.core.id());
    }

    /// Wait for the worker to finish after [`DatagramLink::shutdown`]
    pub async fn join(&self) {
        let worker = self.inner.worker.lock().take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
    }
}

impl DatagramInner {
    async fn ensure_send_path(&self) -> Result<Arc<dyn DatagramSocket>> {
        let socket = self
            .send_path
            .get_or_try_init(|| async {
                let socket = self.opener.open().await.map_err(|e| {
                    warn!("Failed to open UDP send path: {}", e);
                    Error::from(e)
                })?;
                if let Ok(local) = socket.local_addr() {
                    self.core.set_local_addr(local);
                }
                let _ = self.core.connection_established();
                info!("UDP send path ready on {:?}", socket.local_addr().ok());
                Ok::<_, Error>(socket)
            })
            .await?;
        Ok(socket.clone())
    }

    async fn run_worker(inner: Arc<DatagramInner>, mut queue_rx: mpsc::UnboundedReceiver<Envelope>) {
        loop {
            let mut envelope = tokio::select! {
                biased;
                _ = inner.shutdown.cancelled() => break,
                next = queue_rx.recv() => match next {
                    Some(envelope) => envelope,
                    None => break,
                },
            };

            let sent = tokio::select! {
                biased;
                _ = inner.shutdown.cancelled() => Err(Error::TransportClosed),
                sent = inner.transmit(&mut envelope) => sent,
            };
            match sent {
                Ok(()) => envelope.complete(),
                Err(e) => {
                    debug!("UDP send to {:?} failed: {}", envelope.destination(), e);
                    envelope.fail(e);
                }
            }
        }

        queue_rx.close();
        let mut dropped = 0usize;
        while let Ok(envelope) = queue_rx.try_recv() {
            envelope.fail(Error::TransportClosed);
            dropped += 1;
        }
        if dropped > 0 {
            debug!("Failed {} queued datagrams at shutdown", dropped);
        }
        trace!("UDP send worker of link {} stopped", inner.core.id());
    }

    async fn transmit(&self, envelope: &mut Envelope) -> Result<()> {
        let destination = envelope
            .destination()
            .ok_or(Error::NoRemoteAddress(self.core.id()))?;
        let socket = self.ensure_send_path().await?;

        let bytes = envelope.prepare(&self.core.context().pool)?;
        if bytes.len() > MAX_UDP_PACKET_SIZE {
            return Err(Error::PacketTooLarge(bytes.len(), MAX_UDP_PACKET_SIZE));
        }

        let sent = socket
            .send_to(bytes, destination)
            .await
            .map_err(|e| Error::SendFailed(destination, Arc::new(e)))?;
        trace!("Sent {} bytes to {}", sent, destination);
        Ok(())
    }
}

impl fmt::Debug for DatagramLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatagramLink")
            .field("id", &self.inner.core.id())
            .field("local_addr", &self.inner.core.local_addr())
            .field("connected", &self.is_connected())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

/// A UDP peer as seen by upper layers; writes go out over the shared link
#[derive(Clone)]
pub struct DatagramConnection {
    core: Arc<ConnectionCore>,
    link: DatagramLink,
}

impl DatagramConnection {
    fn new(link: DatagramLink, peer: SocketAddr) -> Self {
        let shared = link.core();
        let core = ConnectionCore::new(
            TransportKind::Udp,
            Some(peer),
            shared.endpoint_ref(),
            shared.context().clone(),
        );
        if let Some(local) = shared.local_addr() {
            core.set_local_addr(local);
        }
        let _ = core.connection_established();
        Self {
            core: Arc::new(core),
            link,
        }
    }

    /// Dispatch a received datagram to upper layers
    pub async fn message_received(&self, buffer: PooledBuffer) -> Result<()> {
        self.core
            .message_received(buffer, Arc::new(self.clone()))
            .await
    }
}

impl SipConnection for DatagramConnection {
    fn id(&self) -> ConnectionId {
        self.core.id()
    }

    fn transport(&self) -> TransportKind {
        TransportKind::Udp
    }

    fn path_mtu(&self) -> usize {
        self.core.path_mtu()
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.core.peer_addr()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.core.local_addr()
    }

    fn status(&self) -> ConnectionStatus {
        if self.link.is_shut_down() {
            ConnectionStatus::Closed
        } else {
            self.core.status()
        }
    }

    fn write(&self, message: Box<dyn OutboundMessage>, use_compact_headers: bool) -> Result<SendHandle> {
        if !self.status().accepts_writes() {
            return Err(Error::ConnectionClosed(self.core.id()));
        }
        let peer = self
            .core
            .peer_addr()
            .ok_or(Error::NoRemoteAddress(self.core.id()))?;
        let (envelope, handle) = Envelope::new(message, use_compact_headers);
        self.link.send(envelope.with_destination(peer))?;
        Ok(handle)
    }

    fn close(&self) {
        self.core.close();
    }
}

impl fmt::Debug for DatagramConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DatagramConnection({} {:?} -> {:?})",
            self.core.id(),
            self.core.local_addr(),
            self.core.peer_addr()
        )
    }
}
