//! SIP connection layer for the rvoip stack
//!
//! This crate manages the transport connections SIP messages travel over:
//! per-peer TCP and TLS links with ordered, bounded send queues, a shared UDP
//! link per endpoint, lazy listening endpoints and the status lifecycle of
//! every connection. Received messages are handed to upper layers as raw
//! bytes through [`TransportEvent`]s; parsing is left to them.

pub mod bridge;
pub mod buffer;
pub mod channel;
pub mod config;
pub mod connection;
pub mod envelope;
pub mod error;
pub mod establish;
pub mod framing;
pub mod io;
pub mod link;
pub mod logging;
pub mod manager;
pub mod message;
pub mod transport;

// Internal modules
#[cfg(test)]
mod tests;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::mpsc;

// Re-export commonly used types and functions
pub use channel::{ChannelRegistry, EndpointKey, ListeningEndpoint};
pub use config::TransportConfig;
pub use connection::{ConnectionId, ConnectionStatus, SipConnection};
pub use envelope::SendHandle;
pub use error::{Error, Result};
pub use link::{DatagramConnection, DatagramLink, StreamConnection};
pub use manager::TransportManager;
pub use message::OutboundMessage;
pub use transport::{Transport, TransportEvent, TransportKind};

/// Bind a UDP endpoint to the specified address
pub async fn bind_udp(addr: SocketAddr) -> Result<(Arc<ListeningEndpoint>, mpsc::Receiver<TransportEvent>)> {
    bind(TransportKind::Udp, addr).await
}

/// Bind a TCP endpoint to the specified address
pub async fn bind_tcp(addr: SocketAddr) -> Result<(Arc<ListeningEndpoint>, mpsc::Receiver<TransportEvent>)> {
    bind(TransportKind::Tcp, addr).await
}

async fn bind(
    transport: TransportKind,
    addr: SocketAddr,
) -> Result<(Arc<ListeningEndpoint>, mpsc::Receiver<TransportEvent>)> {
    let (ctx, events_rx) = connection::LinkContext::new(TransportConfig::default());
    let registry = ChannelRegistry::new(ctx);
    let endpoint = registry.get_or_create(transport, addr).await?;
    Ok((endpoint, events_rx))
}

/// Re-export of common types for easier use
pub mod prelude {
    pub use crate::{
        bind_tcp, bind_udp, ConnectionStatus, Error, ListeningEndpoint, OutboundMessage, Result,
        SendHandle, SipConnection, Transport, TransportConfig, TransportEvent, TransportKind,
        TransportManager,
    };
}
