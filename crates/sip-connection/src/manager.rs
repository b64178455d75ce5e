//! Transport manager
//!
//! Entry point for upper layers: owns the channel registry, creates listening
//! endpoints on demand and routes outbound messages to the right connection.
//! Every endpoint delivers its events on the single receiver returned by
//! [`TransportManager::new`].

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::future::join_all;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::channel::{ChannelRegistry, ListeningEndpoint};
use crate::config::TransportConfig;
use crate::connection::{LinkContext, SipConnection};
use crate::envelope::SendHandle;
use crate::error::{Error, Result};
use crate::message::OutboundMessage;
use crate::transport::{TransportEvent, TransportKind};

#[cfg(feature = "tls")]
use crate::io::tls::TlsSettings;

/// Creates endpoints and routes messages across transports
#[derive(Debug, Clone)]
pub struct TransportManager {
    registry: Arc<ChannelRegistry>,
}

impl TransportManager {
    /// Create a manager and the receiver of its transport events
    pub async fn new(config: TransportConfig) -> Result<(Self, mpsc::Receiver<TransportEvent>)> {
        config.validate()?;
        let (ctx, events_rx) = LinkContext::new(config);
        let manager = Self {
            registry: Arc::new(ChannelRegistry::new(ctx)),
        };
        Ok((manager, events_rx))
    }

    /// Create a manager with the default configuration
    pub async fn with_defaults() -> Result<(Self, mpsc::Receiver<TransportEvent>)> {
        Self::new(TransportConfig::default()).await
    }

    /// TLS configuration for TLS endpoints created from now on
    #[cfg(feature = "tls")]
    pub fn set_tls_settings(&self, settings: TlsSettings) {
        self.registry.set_tls_settings(settings);
    }

    /// The underlying registry
    pub fn registry(&self) -> &ChannelRegistry {
        &self.registry
    }

    /// Bind an endpoint for `transport` on `bind_addr` and return the address
    /// it actually listens on
    pub async fn create_transport(&self, transport: TransportKind, bind_addr: SocketAddr) -> Result<SocketAddr> {
        let endpoint = self.registry.get_or_create(transport, bind_addr).await?;
        info!("Created {} transport on {}", transport, endpoint.local_addr());
        Ok(endpoint.local_addr())
    }

    /// An endpoint for `transport` to send from
    pub fn endpoint_for(&self, transport: TransportKind) -> Result<Arc<ListeningEndpoint>> {
        self.registry
            .find(transport)
            .ok_or(Error::NoEndpoint(transport))
    }

    /// A connection to `destination` over `transport`, opening it if needed
    pub async fn connection_to(
        &self,
        transport: TransportKind,
        destination: SocketAddr,
    ) -> Result<Arc<dyn SipConnection>> {
        let endpoint = self.endpoint_for(transport)?;
        endpoint.connection_to(destination).await
    }

    /// Queue `message` to `destination` over `transport` and return the
    /// handle that resolves when the write completes
    pub async fn send_via(
        &self,
        transport: TransportKind,
        message: impl OutboundMessage,
        destination: SocketAddr,
        use_compact_headers: bool,
    ) -> Result<SendHandle> {
        debug!("Sending {} message to {}", transport, destination);
        let connection = self.connection_to(transport, destination).await?;
        connection.write(Box::new(message), use_compact_headers)
    }

    /// Send `message` to `destination` over UDP and wait for the write to
    /// complete
    pub async fn send_message(&self, message: impl OutboundMessage, destination: SocketAddr) -> Result<()> {
        self.send_via(TransportKind::Udp, message, destination, false)
            .await?
            .await
    }

    /// Shut down every endpoint and wait for their tasks to finish
    pub async fn close_all(&self) -> Result<()> {
        let endpoints = self.registry.shutdown();
        join_all(endpoints.iter().map(|endpoint| endpoint.join())).await;
        info!("All transports closed");
        Ok(())
    }
}
