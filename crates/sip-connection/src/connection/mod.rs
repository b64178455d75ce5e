//! Connection identity, status and the upper-layer connection API
//!
//! [`ConnectionCore`] is the transport-agnostic part every connection shares:
//! identity, peer address, status state machine and inbound dispatch. The
//! links in [`crate::link`] build on it and expose the [`SipConnection`] trait
//! to upper layers.

mod status;

pub use status::ConnectionStatus;

use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::bridge;
use crate::buffer::{BufferPool, PooledBuffer};
use crate::channel::ListeningEndpoint;
use crate::config::TransportConfig;
use crate::envelope::SendHandle;
use crate::error::{Error, Result};
use crate::framing::StreamFramer;
use crate::message::OutboundMessage;
use crate::transport::{TransportEvent, TransportKind, STREAM_PATH_MTU};

/// Unique identifier of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Generate a fresh identifier
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The first group is plenty to tell connections apart in logs.
        let s = self.0.simple().to_string();
        f.write_str(&s[..8])
    }
}

/// What upper layers see of a connection
pub trait SipConnection: Send + Sync + fmt::Debug {
    /// Connection identifier
    fn id(&self) -> ConnectionId;

    /// Transport this connection runs over
    fn transport(&self) -> TransportKind;

    /// Whether delivery is reliable
    fn is_reliable(&self) -> bool {
        self.transport().is_reliable()
    }

    /// Whether the connection is encrypted
    fn is_secure(&self) -> bool {
        self.transport().is_secure()
    }

    /// Largest message the path carries without fragmentation concerns
    fn path_mtu(&self) -> usize;

    /// Remote peer, once known
    fn peer_addr(&self) -> Option<SocketAddr>;

    /// Local address, once known
    fn local_addr(&self) -> Option<SocketAddr>;

    /// Current status
    fn status(&self) -> ConnectionStatus;

    /// Queue `message` for sending.
    ///
    /// Rejections (closed, closing, broken, queue full) are returned
    /// immediately; the outcome of an accepted message arrives on the
    /// returned handle.
    fn write(&self, message: Box<dyn OutboundMessage>, use_compact_headers: bool) -> Result<SendHandle>;

    /// Close the connection; calling it again is a no-op
    fn close(&self);
}

/// Resources shared by every connection of a registry
#[derive(Clone)]
pub struct LinkContext {
    /// Layer configuration
    pub config: Arc<TransportConfig>,
    /// Buffer pool for reads and writes
    pub pool: BufferPool,
    /// Dispatch boundary towards upper layers
    pub events_tx: mpsc::Sender<TransportEvent>,
}

impl LinkContext {
    /// Create a context and the receiving end of its event channel
    pub fn new(config: TransportConfig) -> (Self, mpsc::Receiver<TransportEvent>) {
        let (events_tx, events_rx) = mpsc::channel(config.event_channel_capacity);
        let pool = BufferPool::new(config.read_buffer_size, config.max_pooled_buffers);
        let ctx = Self {
            config: Arc::new(config),
            pool,
            events_tx,
        };
        (ctx, events_rx)
    }

    /// Deliver an event without waiting; used from synchronous paths
    pub(crate) fn emit(&self, event: TransportEvent) {
        if let Err(e) = self.events_tx.try_send(event) {
            warn!("Dropping transport event: {}", e);
        }
    }
}

impl fmt::Debug for LinkContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkContext")
            .field("config", &self.config)
            .field("pool", &self.pool)
            .finish()
    }
}

/// Identity, status and inbound dispatch shared by every connection
pub struct ConnectionCore {
    id: ConnectionId,
    transport: TransportKind,
    peer: OnceLock<SocketAddr>,
    local: OnceLock<SocketAddr>,
    status: watch::Sender<ConnectionStatus>,
    endpoint: Weak<ListeningEndpoint>,
    framer: Option<Mutex<StreamFramer>>,
    ctx: LinkContext,
}

impl ConnectionCore {
    /// Create a connection in `PreConnect`, with the peer address if it is
    /// already known (outbound and datagram connections)
    pub fn new(
        transport: TransportKind,
        peer: Option<SocketAddr>,
        endpoint: Weak<ListeningEndpoint>,
        ctx: LinkContext,
    ) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::PreConnect);
        let framer = transport
            .is_stream()
            .then(|| Mutex::new(StreamFramer::new(ctx.config.max_message_size)));
        let core = Self {
            id: ConnectionId::new(),
            transport,
            peer: OnceLock::new(),
            local: OnceLock::new(),
            status,
            endpoint,
            framer,
            ctx,
        };
        if let Some(peer) = peer {
            let _ = core.peer.set(peer);
        }
        core
    }

    /// Connection identifier
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Transport kind
    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    /// Remote peer, once known
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer.get().copied()
    }

    /// Local address, once known
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local.get().copied()
    }

    pub(crate) fn set_local_addr(&self, addr: SocketAddr) {
        let _ = self.local.set(addr);
    }

    /// Record the peer of an inbound connection. Fails if the peer is already
    /// known.
    pub fn set_remote_address(&self, addr: SocketAddr) -> Result<()> {
        self.peer.set(addr).map_err(|_| {
            let existing = self.peer_addr().unwrap_or(addr);
            Error::RemoteAddressAlreadySet(existing)
        })
    }

    /// Current status
    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    /// Subscribe to status changes
    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    /// Move to `next`, returning the previous status
    pub fn transition(&self, next: ConnectionStatus) -> Result<ConnectionStatus> {
        let mut outcome = Err(Error::InvalidStateTransition {
            from: next,
            to: next,
        });
        self.status.send_if_modified(|current| {
            if current.can_transition_to(next) {
                outcome = Ok(*current);
                *current = next;
                true
            } else {
                outcome = Err(Error::InvalidStateTransition {
                    from: *current,
                    to: next,
                });
                false
            }
        });
        if let Ok(prev) = outcome {
            trace!("Connection {} {} -> {}", self.id, prev, next);
        }
        outcome
    }

    /// Mark the transport as established
    pub fn connection_established(&self) -> Result<()> {
        self.transition(ConnectionStatus::Connected).map(|_| ())
    }

    /// Mark the connection as failed. Returns `false` if it already was.
    pub fn mark_broken(&self) -> bool {
        self.transition(ConnectionStatus::Broken).is_ok()
    }

    /// Move to `Closed`. Returns `true` only for the call that closed it.
    pub fn close(&self) -> bool {
        self.transition(ConnectionStatus::Closed).is_ok()
    }

    /// Reported path MTU
    pub fn path_mtu(&self) -> usize {
        match self.transport {
            TransportKind::Udp => self.ctx.config.udp_path_mtu,
            TransportKind::Tcp | TransportKind::Tls => STREAM_PATH_MTU,
        }
    }

    /// Endpoint that created this connection, while it is alive
    pub fn listening_endpoint(&self) -> Option<Arc<ListeningEndpoint>> {
        self.endpoint.upgrade()
    }

    pub(crate) fn endpoint_ref(&self) -> Weak<ListeningEndpoint> {
        self.endpoint.clone()
    }

    /// Shared resources
    pub fn context(&self) -> &LinkContext {
        &self.ctx
    }

    /// Copy inbound bytes out of `buffer`, release it, and dispatch every
    /// message they complete. `connection` is the handle upper layers reply on.
    pub async fn message_received(
        &self,
        buffer: PooledBuffer,
        connection: Arc<dyn SipConnection>,
    ) -> Result<()> {
        let bytes = bridge::copy_inbound(buffer);
        let messages = match &self.framer {
            Some(framer) => framer.lock().push(&bytes)?,
            None => vec![bytes],
        };

        let source = self.peer_addr().ok_or(Error::NoRemoteAddress(self.id))?;
        let destination = self
            .local_addr()
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)));

        for message in messages {
            debug!(
                "Received {} byte {} message from {}",
                message.len(),
                self.transport,
                source
            );
            let event = TransportEvent::MessageReceived {
                message,
                source,
                destination,
                transport: self.transport,
                connection: connection.clone(),
            };
            if self.ctx.events_tx.send(event).await.is_err() {
                debug!("Transport event receiver dropped; discarding message from {}", source);
                break;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for ConnectionCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionCore")
            .field("id", &self.id)
            .field("transport", &self.transport)
            .field("peer", &self.peer_addr())
            .field("status", &self.status())
            .finish()
    }
}
