//! tokio implementations of the substrate traits

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::Mutex;
use tracing::{debug, trace};

use super::{Accepted, DatagramOpener, DatagramSocket, StreamAcceptor, StreamConnector, StreamDevice};

/// Any established tokio byte stream, split into independently locked halves
/// so the read loop and the sender never wait on each other.
pub struct IoStreamDevice<S> {
    reader: Mutex<ReadHalf<S>>,
    writer: Mutex<WriteHalf<S>>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
}

impl<S> IoStreamDevice<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Wrap `stream`, whose addresses the caller already knows
    pub fn new(stream: S, local_addr: SocketAddr, peer_addr: SocketAddr) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            local_addr,
            peer_addr,
        }
    }
}

impl IoStreamDevice<TcpStream> {
    /// Wrap a connected TCP stream
    pub fn from_tcp(stream: TcpStream) -> io::Result<Self> {
        stream.set_nodelay(true)?;
        let local = stream.local_addr()?;
        let peer = stream.peer_addr()?;
        Ok(Self::new(stream, local, peer))
    }
}

#[async_trait]
impl<S> StreamDevice for IoStreamDevice<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn read(&self, buf: &mut BytesMut) -> io::Result<usize> {
        let mut reader = self.reader.lock().await;
        reader.read_buf(buf).await
    }

    async fn write_all(&self, buf: &[u8]) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(buf).await?;
        writer.flush().await
    }

    async fn shutdown(&self) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.shutdown().await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.local_addr)
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.peer_addr)
    }
}

impl<S> fmt::Debug for IoStreamDevice<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IoStreamDevice({} -> {})", self.local_addr, self.peer_addr)
    }
}

/// Opens plain TCP connections
#[derive(Debug, Default, Clone)]
pub struct TcpConnector;

#[async_trait]
impl StreamConnector for TcpConnector {
    async fn connect(&self, target: SocketAddr) -> io::Result<Arc<dyn StreamDevice>> {
        let stream = TcpStream::connect(target).await?;
        debug!("TCP connection opened to {}", target);
        Ok(Arc::new(IoStreamDevice::from_tcp(stream)?))
    }
}

/// Accepts plain TCP connections
#[derive(Debug)]
pub struct TcpAcceptor {
    listener: TcpListener,
}

impl TcpAcceptor {
    /// Bind a TCP listener on `addr`
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener })
    }
}

#[async_trait]
impl StreamAcceptor for TcpAcceptor {
    async fn accept(&self) -> io::Result<Accepted> {
        let (stream, peer) = self.listener.accept().await?;
        trace!("TCP connection accepted from {}", peer);
        Ok(Accepted::Ready(Arc::new(IoStreamDevice::from_tcp(stream)?)))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

/// A bound tokio UDP socket
#[derive(Debug)]
pub struct UdpDatagramSocket {
    socket: UdpSocket,
}

impl UdpDatagramSocket {
    /// Bind a UDP socket on `addr`
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self { socket })
    }
}

#[async_trait]
impl DatagramSocket for UdpDatagramSocket {
    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        self.socket.send_to(buf, target).await
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

/// Sends outbound datagrams from the endpoint's own bound socket, so replies
/// carry the same local identity the endpoint listens on
#[derive(Debug, Clone)]
pub struct SharedSocketOpener {
    socket: Arc<dyn DatagramSocket>,
}

impl SharedSocketOpener {
    /// Share `socket` as the send path
    pub fn new(socket: Arc<dyn DatagramSocket>) -> Self {
        Self { socket }
    }
}

#[async_trait]
impl DatagramOpener for SharedSocketOpener {
    async fn open(&self) -> io::Result<Arc<dyn DatagramSocket>> {
        Ok(self.socket.clone())
    }
}
