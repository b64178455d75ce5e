use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::EndpointKey;
use crate::connection::{ConnectionId, ConnectionStatus, LinkContext, SipConnection};
use crate::error::{Error, Result};
use crate::establish::Establisher;
use crate::io::{Accepted, DatagramSocket, SharedSocketOpener, StreamAcceptor, StreamConnector, StreamDevice};
use crate::link::{DatagramLink, StreamConnection};
use crate::message::OutboundMessage;
use crate::transport::{Transport, TransportEvent, TransportKind};

// Pause after a failed accept so a persistent error does not spin the loop
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(10);

enum EndpointIo {
    Stream {
        establisher: Establisher,
        connections: DashMap<SocketAddr, StreamConnection>,
    },
    Datagram {
        socket: Arc<dyn DatagramSocket>,
        link: DatagramLink,
    },
}

/// One bound local address for one transport
pub struct ListeningEndpoint {
    this: Weak<ListeningEndpoint>,
    key: EndpointKey,
    ctx: LinkContext,
    io: EndpointIo,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl ListeningEndpoint {
    /// Create a TCP or TLS endpoint over an already bound acceptor and start
    /// accepting
    pub fn stream(
        transport: TransportKind,
        acceptor: Arc<dyn StreamAcceptor>,
        connector: Arc<dyn StreamConnector>,
        ctx: LinkContext,
    ) -> Result<Arc<Self>> {
        if !transport.is_stream() {
            return Err(Error::UnsupportedTransport(transport));
        }
        let local_addr = acceptor.local_addr()?;
        let establisher = Establisher::new(transport, connector, ctx.config.connect_timeout());

        let endpoint = Arc::new_cyclic(|this| Self {
            this: this.clone(),
            key: EndpointKey::new(local_addr, transport),
            ctx,
            io: EndpointIo::Stream {
                establisher,
                connections: DashMap::new(),
            },
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });

        info!("SIP {} endpoint listening on {}", transport, local_addr);
        let task = tokio::spawn(endpoint.clone().accept_loop(acceptor));
        endpoint.tasks.lock().push(task);
        Ok(endpoint)
    }

    /// Create a UDP endpoint over an already bound socket and start receiving
    pub fn datagram(socket: Arc<dyn DatagramSocket>, ctx: LinkContext) -> Result<Arc<Self>> {
        let local_addr = socket.local_addr()?;

        let endpoint = Arc::new_cyclic(|this| {
            let opener = Arc::new(SharedSocketOpener::new(socket.clone()));
            let link = DatagramLink::new(opener, Some(local_addr), this.clone(), ctx.clone());
            Self {
                this: this.clone(),
                key: EndpointKey::new(local_addr, TransportKind::Udp),
                ctx,
                io: EndpointIo::Datagram {
                    socket: socket.clone(),
                    link,
                },
                cancel: CancellationToken::new(),
                tasks: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            }
        });

        info!("SIP UDP endpoint bound to {}", local_addr);
        let task = tokio::spawn(endpoint.clone().receive_loop());
        endpoint.tasks.lock().push(task);
        Ok(endpoint)
    }

    /// Registry key of this endpoint
    pub fn key(&self) -> EndpointKey {
        self.key
    }

    /// Transport kind
    pub fn transport(&self) -> TransportKind {
        self.key.transport
    }

    /// The shared outbound link of a UDP endpoint
    pub fn datagram_link(&self) -> Option<&DatagramLink> {
        match &self.io {
            EndpointIo::Datagram { link, .. } => Some(link),
            EndpointIo::Stream { .. } => None,
        }
    }

    /// The establisher of a stream endpoint
    pub fn establisher(&self) -> Option<&Establisher> {
        match &self.io {
            EndpointIo::Stream { establisher, .. } => Some(establisher),
            EndpointIo::Datagram { .. } => None,
        }
    }

    /// Stream connections currently tracked by this endpoint
    pub fn stream_connections(&self) -> Vec<StreamConnection> {
        match &self.io {
            EndpointIo::Stream { connections, .. } => {
                connections.iter().map(|entry| entry.value().clone()).collect()
            }
            EndpointIo::Datagram { .. } => Vec::new(),
        }
    }

    /// A connection to `target` for sending.
    ///
    /// For UDP this is a handle on the shared link. For streams an existing
    /// usable connection is reused, even one another caller is still
    /// connecting (writes on it queue until the connect finishes); otherwise
    /// a new one is registered and connected before it is returned.
    pub async fn connection_to(&self, target: SocketAddr) -> Result<Arc<dyn SipConnection>> {
        if self.is_closed() {
            return Err(Error::TransportClosed);
        }
        match &self.io {
            EndpointIo::Datagram { link, .. } => Ok(Arc::new(link.connection_for(target))),
            EndpointIo::Stream { .. } => Ok(Arc::new(self.stream_connection_to(target).await?)),
        }
    }

    /// The stream connection to `target`, opening one if none is usable
    pub async fn stream_connection_to(&self, target: SocketAddr) -> Result<StreamConnection> {
        let EndpointIo::Stream { connections, .. } = &self.io else {
            return Err(Error::UnsupportedTransport(self.transport()));
        };

        let (connection, fresh) = match connections.entry(target) {
            Entry::Occupied(mut entry) => {
                if entry.get().status().accepts_writes() {
                    (entry.get().clone(), false)
                } else {
                    let connection = self.new_outbound(target);
                    entry.insert(connection.clone());
                    (connection, true)
                }
            }
            Entry::Vacant(entry) => {
                let connection = self.new_outbound(target);
                entry.insert(connection.clone());
                (connection, true)
            }
        };

        if fresh {
            let Some(endpoint) = self.this.upgrade() else {
                connections.remove_if(&target, |_, c| c.id() == connection.id());
                connection.abort_establishment(Error::TransportClosed);
                return Err(Error::TransportClosed);
            };
            // The attempt runs on its own task so a caller that stops waiting
            // cannot leave the connection stuck in PreConnect.
            let attempt = connection.clone();
            let outcome = tokio::spawn(async move { endpoint.establish_outbound(attempt).await }).await;
            match outcome {
                Ok(result) => result?,
                Err(e) => {
                    error!("Establishment task for {} failed: {}", target, e);
                    let cause = io::Error::new(io::ErrorKind::Other, e.to_string());
                    let error = Error::ConnectFailed(target, Arc::new(cause));
                    connections.remove_if(&target, |_, c| c.id() == connection.id());
                    connection.abort_establishment(error.clone());
                    return Err(error);
                }
            }
        }
        Ok(connection)
    }

    async fn establish_outbound(&self, connection: StreamConnection) -> Result<()> {
        let EndpointIo::Stream {
            establisher,
            connections,
        } = &self.io
        else {
            return Err(Error::UnsupportedTransport(self.transport()));
        };
        let result = establisher.establish(&connection).await;
        if result.is_err() {
            if let Some(peer) = connection.peer_addr() {
                connections.remove_if(&peer, |_, c| c.id() == connection.id());
            }
        }
        result
    }

    fn new_outbound(&self, target: SocketAddr) -> StreamConnection {
        trace!("New outbound {} connection to {}", self.transport(), target);
        StreamConnection::outbound(self.transport(), target, self.this.clone(), self.ctx.clone())
    }

    /// Drop a stream connection from the endpoint once it failed or closed.
    /// A failed connection is closed as it is dropped.
    pub fn forget_connection(&self, id: ConnectionId, peer: Option<SocketAddr>) {
        let (EndpointIo::Stream { connections, .. }, Some(peer)) = (&self.io, peer) else {
            return;
        };
        if let Some((_, connection)) = connections.remove_if(&peer, |_, c| c.id() == id) {
            debug!("Endpoint {} released connection {}", self.key, id);
            if connection.status() == ConnectionStatus::Broken {
                connection.close();
            }
        }
    }

    /// Stop accepting or receiving, close every stream connection and shut
    /// down the datagram link. Calling it again is a no-op.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Shutting down SIP endpoint {}", self.key);
        self.cancel.cancel();

        match &self.io {
            EndpointIo::Stream { connections, .. } => {
                let open: Vec<StreamConnection> =
                    connections.iter().map(|entry| entry.value().clone()).collect();
                connections.clear();
                for connection in open {
                    connection.close();
                }
            }
            EndpointIo::Datagram { link, .. } => link.shutdown(),
        }
    }

    /// Wait for the endpoint's background tasks to finish after
    /// [`ListeningEndpoint::shutdown`]
    pub async fn join(&self) {
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        if let Some(link) = self.datagram_link() {
            link.join().await;
        }
    }

    async fn accept_loop(self: Arc<Self>, acceptor: Arc<dyn StreamAcceptor>) {
        loop {
            let accepted = tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = acceptor.accept() => accepted,
            };

            match accepted {
                Ok(Accepted::Ready(device)) => self.adopt_logged(device),
                Ok(Accepted::Handshake { peer, pending }) => {
                    trace!("Running {} handshake with {} off the accept loop", self.transport(), peer);
                    tokio::spawn(self.clone().complete_handshake(peer, pending));
                }
                Err(e) => {
                    error!("Error accepting {} connection on {}: {}", self.transport(), self.key, e);
                    self.ctx.emit(TransportEvent::Error {
                        error: format!("Accept failed on {}: {}", self.key, e),
                    });
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }

        self.ctx.emit(TransportEvent::Closed);
        info!("{} accept loop on {} terminated", self.transport(), self.key);
    }

    /// Finish the handshake of an accepted stream, bounded by the connect
    /// timeout, then adopt it
    async fn complete_handshake(
        self: Arc<Self>,
        peer: SocketAddr,
        pending: BoxFuture<'static, io::Result<Arc<dyn StreamDevice>>>,
    ) {
        let limit = self.ctx.config.connect_timeout();
        let outcome = tokio::select! {
            _ = self.cancel.cancelled() => return,
            outcome = tokio::time::timeout(limit, pending) => outcome,
        };

        let error = match outcome {
            Ok(Ok(device)) => {
                self.adopt_logged(device);
                return;
            }
            Ok(Err(e)) => format!("{} handshake with {} failed: {}", self.transport(), peer, e),
            Err(_) => format!("{} handshake with {} timed out after {:?}", self.transport(), peer, limit),
        };
        warn!("{}", error);
        self.ctx.emit(TransportEvent::Error { error });
    }

    fn adopt_logged(&self, device: Arc<dyn StreamDevice>) {
        if let Err(e) = self.adopt_inbound(device) {
            warn!("Failed to adopt inbound {} connection: {}", self.transport(), e);
        }
    }

    fn adopt_inbound(&self, device: Arc<dyn StreamDevice>) -> Result<()> {
        let EndpointIo::Stream { connections, .. } = &self.io else {
            return Err(Error::UnsupportedTransport(self.transport()));
        };
        if self.is_closed() {
            return Err(Error::TransportClosed);
        }
        let connection = StreamConnection::inbound(self.transport(), self.this.clone(), self.ctx.clone());
        connection.accept(device)?;
        if let Some(peer) = connection.peer_addr() {
            debug!("Accepted {} connection {} from {}", self.transport(), connection.id(), peer);
            if let Some(replaced) = connections.insert(peer, connection) {
                trace!("Connection {} to {} superseded", replaced.id(), peer);
            }
        }
        Ok(())
    }

    async fn receive_loop(self: Arc<Self>) {
        let EndpointIo::Datagram { socket, link } = &self.io else {
            return;
        };
        let pool = self.ctx.pool.clone();
        let max_datagram = self.ctx.config.max_datagram_size;

        loop {
            let mut buffer = pool.acquire(max_datagram);
            buffer.fill_to_capacity();

            let received = tokio::select! {
                _ = self.cancel.cancelled() => break,
                received = socket.recv_from(&mut buffer[..]) => received,
            };

            match received {
                Ok((0, src)) => trace!("Ignoring empty datagram from {}", src),
                Ok((len, src)) => {
                    buffer.truncate(len);
                    let connection = link.connection_for(src);
                    if let Err(e) = connection.message_received(buffer).await {
                        warn!("Error dispatching datagram from {}: {}", src, e);
                    }
                }
                Err(e) => {
                    error!("Error receiving UDP packet: {}", e);
                    self.ctx.emit(TransportEvent::Error {
                        error: format!("Receive error on {}: {}", self.key, e),
                    });
                }
            }
        }

        self.ctx.emit(TransportEvent::Closed);
        info!("UDP receive loop on {} terminated", self.key);
    }
}

#[async_trait]
impl Transport for ListeningEndpoint {
    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.key.socket_addr())
    }

    async fn send_message(&self, message: Box<dyn OutboundMessage>, destination: SocketAddr) -> Result<()> {
        if self.is_closed() {
            return Err(Error::TransportClosed);
        }
        debug!("Sending {} message to {}", self.transport(), destination);
        let connection = self.connection_to(destination).await?;
        connection.write(message, false)?.await
    }

    async fn close(&self) -> Result<()> {
        self.shutdown();
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl ListeningEndpoint {
    /// Whether [`ListeningEndpoint::shutdown`] has run
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Bound local address
    pub fn local_addr(&self) -> SocketAddr {
        self.key.socket_addr()
    }
}

impl fmt::Debug for ListeningEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.io {
            EndpointIo::Stream { connections, .. } => format!("{} connections", connections.len()),
            EndpointIo::Datagram { .. } => "datagram".to_string(),
        };
        write!(f, "ListeningEndpoint({}, {}, closed={})", self.key, kind, self.is_closed())
    }
}
