//! Using established TLS sessions as stream devices
//!
//! Certificates, trust roots and handshake policy belong to the caller, which
//! hands in ready `rustls` configurations. This module only runs the
//! handshake on new TCP streams and wraps the resulting session.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::FutureExt;
use rustls::{ClientConfig, ServerConfig, ServerName};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::debug;

use super::{Accepted, IoStreamDevice, StreamAcceptor, StreamConnector, StreamDevice};

/// Caller-supplied TLS configurations for one endpoint
#[derive(Clone)]
pub struct TlsSettings {
    /// Used for accepted connections
    pub server: Arc<ServerConfig>,
    /// Used for outbound connections
    pub client: Arc<ClientConfig>,
    /// Name to verify outbound peers against; the peer IP is used when unset
    pub server_name: Option<String>,
}

impl std::fmt::Debug for TlsSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsSettings")
            .field("server_name", &self.server_name)
            .finish_non_exhaustive()
    }
}

/// Opens TLS connections over TCP
#[derive(Clone)]
pub struct TlsStreamConnector {
    connector: TlsConnector,
    server_name: Option<String>,
}

impl TlsStreamConnector {
    /// Create a connector from client settings
    pub fn new(settings: &TlsSettings) -> Self {
        Self {
            connector: TlsConnector::from(settings.client.clone()),
            server_name: settings.server_name.clone(),
        }
    }

    fn server_name_for(&self, target: SocketAddr) -> io::Result<ServerName> {
        match &self.server_name {
            Some(name) => ServerName::try_from(name.as_str())
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e)),
            None => Ok(ServerName::IpAddress(target.ip())),
        }
    }
}

impl std::fmt::Debug for TlsStreamConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TlsStreamConnector({:?})", self.server_name)
    }
}

#[async_trait]
impl StreamConnector for TlsStreamConnector {
    async fn connect(&self, target: SocketAddr) -> io::Result<Arc<dyn StreamDevice>> {
        let name = self.server_name_for(target)?;
        let tcp = TcpStream::connect(target).await?;
        tcp.set_nodelay(true)?;
        let local = tcp.local_addr()?;
        let stream = self.connector.connect(name, tcp).await?;
        debug!("TLS session established with {}", target);
        Ok(Arc::new(IoStreamDevice::new(stream, local, target)))
    }
}

/// Accepts TCP connections; the TLS handshake on each is left to the caller
pub struct TlsStreamAcceptor {
    listener: TcpListener,
    acceptor: TlsAcceptor,
}

impl TlsStreamAcceptor {
    /// Bind a listener on `addr` serving the given settings
    pub async fn bind(addr: SocketAddr, settings: &TlsSettings) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            acceptor: TlsAcceptor::from(settings.server.clone()),
        })
    }
}

impl std::fmt::Debug for TlsStreamAcceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TlsStreamAcceptor({:?})", self.listener.local_addr().ok())
    }
}

#[async_trait]
impl StreamAcceptor for TlsStreamAcceptor {
    async fn accept(&self) -> io::Result<Accepted> {
        let (tcp, peer) = self.listener.accept().await?;
        tcp.set_nodelay(true)?;
        let local = tcp.local_addr()?;
        let acceptor = self.acceptor.clone();
        let pending = async move {
            let stream = acceptor.accept(tcp).await?;
            debug!("TLS session accepted from {}", peer);
            Ok::<_, io::Error>(Arc::new(IoStreamDevice::new(stream, local, peer)) as Arc<dyn StreamDevice>)
        }
        .boxed();
        Ok(Accepted::Handshake { peer, pending })
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}
