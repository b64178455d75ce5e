use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{EndpointKey, ListeningEndpoint};
use crate::connection::LinkContext;
use crate::error::{Error, Result};
use crate::io::{TcpAcceptor, TcpConnector, UdpDatagramSocket};
use crate::transport::TransportKind;

#[cfg(feature = "tls")]
use crate::io::tls::{TlsSettings, TlsStreamAcceptor, TlsStreamConnector};

/// Lazily created, cached listening endpoints keyed by local identity
pub struct ChannelRegistry {
    ctx: LinkContext,
    endpoints: DashMap<EndpointKey, Arc<ListeningEndpoint>>,
    // Serializes binds so two callers never race to bind the same address
    creation: Mutex<()>,
    #[cfg(feature = "tls")]
    tls: parking_lot::RwLock<Option<TlsSettings>>,
    shut_down: AtomicBool,
}

impl ChannelRegistry {
    /// Create an empty registry whose endpoints share `ctx`
    pub fn new(ctx: LinkContext) -> Self {
        Self {
            ctx,
            endpoints: DashMap::new(),
            creation: Mutex::new(()),
            #[cfg(feature = "tls")]
            tls: parking_lot::RwLock::new(None),
            shut_down: AtomicBool::new(false),
        }
    }

    /// TLS configuration used for TLS endpoints created from now on
    #[cfg(feature = "tls")]
    pub fn set_tls_settings(&self, settings: TlsSettings) {
        *self.tls.write() = Some(settings);
    }

    /// Shared resources of this registry
    pub fn context(&self) -> &LinkContext {
        &self.ctx
    }

    /// The endpoint for `transport` on `addr`, binding it on first use.
    ///
    /// A request for port 0 always binds a new endpoint; it is registered
    /// under the port the system actually assigned.
    pub async fn get_or_create(&self, transport: TransportKind, addr: SocketAddr) -> Result<Arc<ListeningEndpoint>> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(Error::TransportClosed);
        }
        let requested = EndpointKey::new(addr, transport);
        let ephemeral = addr.port() == 0;

        if !ephemeral {
            if let Some(endpoint) = self.get(&requested) {
                return Ok(endpoint);
            }
        }

        let _creating = self.creation.lock().await;
        self.prune_closed();
        if !ephemeral {
            if let Some(endpoint) = self.get(&requested) {
                return Ok(endpoint);
            }
        }

        let endpoint = self.bind(transport, addr).await?;
        debug!("Registered endpoint {}", endpoint.key());
        self.endpoints.insert(endpoint.key(), endpoint.clone());
        Ok(endpoint)
    }

    /// Register an endpoint built over a custom substrate
    pub fn register(&self, endpoint: Arc<ListeningEndpoint>) -> Result<()> {
        let key = endpoint.key();
        if self.endpoints.contains_key(&key) {
            return Err(Error::Config(format!("endpoint {} already registered", key)));
        }
        self.endpoints.insert(key, endpoint);
        Ok(())
    }

    /// The endpoint registered under `key`, if it is still open
    pub fn get(&self, key: &EndpointKey) -> Option<Arc<ListeningEndpoint>> {
        self.endpoints
            .get(key)
            .map(|entry| entry.value().clone())
            .filter(|endpoint| !endpoint.is_closed())
    }

    /// Some open endpoint for `transport`, used as the local identity of
    /// outbound traffic
    pub fn find(&self, transport: TransportKind) -> Option<Arc<ListeningEndpoint>> {
        self.endpoints
            .iter()
            .find(|entry| entry.key().transport == transport && !entry.value().is_closed())
            .map(|entry| entry.value().clone())
    }

    /// Every registered endpoint
    pub fn endpoints(&self) -> Vec<Arc<ListeningEndpoint>> {
        self.endpoints.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Number of registered endpoints
    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    /// Whether no endpoint is registered
    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// Unregister and shut down the endpoint under `key`
    pub fn remove(&self, key: &EndpointKey) -> Option<Arc<ListeningEndpoint>> {
        let (_, endpoint) = self.endpoints.remove(key)?;
        endpoint.shutdown();
        Some(endpoint)
    }

    /// Drop endpoints that were shut down outside the registry, releasing
    /// their sockets. Returns how many were dropped.
    pub fn prune_closed(&self) -> usize {
        let before = self.endpoints.len();
        self.endpoints.retain(|key, endpoint| {
            let open = !endpoint.is_closed();
            if !open {
                debug!("Dropping closed endpoint {}", key);
            }
            open
        });
        before.saturating_sub(self.endpoints.len())
    }

    /// Shut down every endpoint; later creation requests fail
    pub fn shutdown(&self) -> Vec<Arc<ListeningEndpoint>> {
        self.shut_down.store(true, Ordering::Release);
        let endpoints: Vec<Arc<ListeningEndpoint>> = self.endpoints();
        self.endpoints.clear();
        for endpoint in &endpoints {
            endpoint.shutdown();
        }
        info!("Channel registry shut down ({} endpoints)", endpoints.len());
        endpoints
    }

    async fn bind(&self, transport: TransportKind, addr: SocketAddr) -> Result<Arc<ListeningEndpoint>> {
        match transport {
            TransportKind::Udp => {
                let socket = UdpDatagramSocket::bind(addr)
                    .await
                    .map_err(|e| Error::BindFailed(addr, Arc::new(e)))?;
                ListeningEndpoint::datagram(Arc::new(socket), self.ctx.clone())
            }
            TransportKind::Tcp => {
                let acceptor = TcpAcceptor::bind(addr)
                    .await
                    .map_err(|e| Error::BindFailed(addr, Arc::new(e)))?;
                ListeningEndpoint::stream(
                    TransportKind::Tcp,
                    Arc::new(acceptor),
                    Arc::new(TcpConnector),
                    self.ctx.clone(),
                )
            }
            TransportKind::Tls => self.bind_tls(addr).await,
        }
    }

    #[cfg(feature = "tls")]
    async fn bind_tls(&self, addr: SocketAddr) -> Result<Arc<ListeningEndpoint>> {
        let settings = self
            .tls
            .read()
            .clone()
            .ok_or_else(|| Error::Tls("no TLS settings configured".to_string()))?;
        let acceptor = TlsStreamAcceptor::bind(addr, &settings)
            .await
            .map_err(|e| Error::BindFailed(addr, Arc::new(e)))?;
        ListeningEndpoint::stream(
            TransportKind::Tls,
            Arc::new(acceptor),
            Arc::new(TlsStreamConnector::new(&settings)),
            self.ctx.clone(),
        )
    }

    #[cfg(not(feature = "tls"))]
    async fn bind_tls(&self, _addr: SocketAddr) -> Result<Arc<ListeningEndpoint>> {
        Err(Error::UnsupportedTransport(TransportKind::Tls))
    }
}

impl fmt::Debug for ChannelRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelRegistry")
            .field("endpoints", &self.endpoints.len())
            .field("shut_down", &self.shut_down.load(Ordering::Relaxed))
            .finish()
    }
}
