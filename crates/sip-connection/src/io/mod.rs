//! Capability contract with the asynchronous I/O substrate
//!
//! Links never touch sockets directly. They drive these traits, which the
//! tokio types implement in [`tokio_io`] (and [`tls`] for established TLS
//! sessions); tests substitute in-memory doubles.

pub mod tokio_io;
#[cfg(feature = "tls")]
pub mod tls;

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::BytesMut;
use futures_util::future::BoxFuture;

pub use tokio_io::{IoStreamDevice, TcpAcceptor, TcpConnector, UdpDatagramSocket, SharedSocketOpener};

/// One established byte stream (TCP, or TLS after its handshake)
#[async_trait]
pub trait StreamDevice: Send + Sync + fmt::Debug {
    /// Read available bytes, appending them to `buf`. `Ok(0)` means end of stream.
    async fn read(&self, buf: &mut BytesMut) -> io::Result<usize>;

    /// Write the whole of `buf`
    async fn write_all(&self, buf: &[u8]) -> io::Result<()>;

    /// Shut down the write side and release the link
    async fn shutdown(&self) -> io::Result<()>;

    /// Local address of the stream
    fn local_addr(&self) -> io::Result<SocketAddr>;

    /// Remote address of the stream
    fn peer_addr(&self) -> io::Result<SocketAddr>;
}

/// Active-open of outbound streams
#[async_trait]
pub trait StreamConnector: Send + Sync + fmt::Debug {
    /// Open a stream to `target`
    async fn connect(&self, target: SocketAddr) -> io::Result<Arc<dyn StreamDevice>>;
}

/// An inbound stream as handed out by a [`StreamAcceptor`]
pub enum Accepted {
    /// Ready to carry SIP traffic
    Ready(Arc<dyn StreamDevice>),
    /// Accepted at the transport level but still owing a handshake. The
    /// endpoint drives `pending` outside its accept loop.
    Handshake {
        /// Remote address of the accepted stream
        peer: SocketAddr,
        /// Completes the handshake and yields the device
        pending: BoxFuture<'static, io::Result<Arc<dyn StreamDevice>>>,
    },
}

impl fmt::Debug for Accepted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Accepted::Ready(device) => f.debug_tuple("Ready").field(device).finish(),
            Accepted::Handshake { peer, .. } => f.debug_struct("Handshake").field("peer", peer).finish_non_exhaustive(),
        }
    }
}

/// Passive-open of inbound streams
#[async_trait]
pub trait StreamAcceptor: Send + Sync + fmt::Debug {
    /// Wait for the next inbound stream. Implementations must not run
    /// per-connection handshakes here; they return [`Accepted::Handshake`].
    async fn accept(&self) -> io::Result<Accepted>;

    /// Address the acceptor listens on
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

/// A bound datagram socket
#[async_trait]
pub trait DatagramSocket: Send + Sync + fmt::Debug {
    /// Send one datagram
    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize>;

    /// Receive one datagram into `buf`
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;

    /// Local address of the socket
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

/// Connects the shared datagram send path on first use
#[async_trait]
pub trait DatagramOpener: Send + Sync + fmt::Debug {
    /// Produce the socket outbound datagrams are sent from
    async fn open(&self) -> io::Result<Arc<dyn DatagramSocket>>;
}
