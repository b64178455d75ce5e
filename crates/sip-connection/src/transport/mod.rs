//! Transport kinds, transport events and the endpoint-level `Transport` trait

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::connection::{ConnectionId, SipConnection};
use crate::error::{Error, Result};
use crate::message::OutboundMessage;

/// Largest UDP payload that fits in a single IPv4 datagram
pub const MAX_UDP_PACKET_SIZE: usize = 65_507;

/// Path MTU reported by stream transports, which segment on their own
pub const STREAM_PATH_MTU: usize = 65_535;

/// The transport protocol a connection runs over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TransportKind {
    /// Connectionless datagrams
    Udp,
    /// Plain byte stream
    Tcp,
    /// Byte stream over an established TLS session
    Tls,
}

impl TransportKind {
    /// Whether the transport delivers bytes reliably and in order
    pub fn is_reliable(self) -> bool {
        matches!(self, TransportKind::Tcp | TransportKind::Tls)
    }

    /// Whether the transport is encrypted
    pub fn is_secure(self) -> bool {
        matches!(self, TransportKind::Tls)
    }

    /// Whether the transport is a byte stream that needs framing
    pub fn is_stream(self) -> bool {
        self.is_reliable()
    }

    /// Default SIP port for this transport
    pub fn default_port(self) -> u16 {
        match self {
            TransportKind::Udp | TransportKind::Tcp => 5060,
            TransportKind::Tls => 5061,
        }
    }

    /// Transport token as used in Via headers
    pub fn as_str(self) -> &'static str {
        match self {
            TransportKind::Udp => "UDP",
            TransportKind::Tcp => "TCP",
            TransportKind::Tls => "TLS",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "UDP" => Ok(TransportKind::Udp),
            "TCP" => Ok(TransportKind::Tcp),
            "TLS" => Ok(TransportKind::Tls),
            other => Err(Error::Config(format!("Unknown transport: {}", other))),
        }
    }
}

/// Events delivered from the connection layer to upper layers
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A complete SIP message was received
    MessageReceived {
        /// Raw message bytes, exactly one SIP message
        message: Bytes,
        /// Address of the peer that sent the message
        source: SocketAddr,
        /// Local address the message arrived on
        destination: SocketAddr,
        /// Transport the message arrived over
        transport: TransportKind,
        /// Connection to reply on
        connection: Arc<dyn SipConnection>,
    },

    /// A stream connection became usable
    ConnectionEstablished {
        /// Connection identifier
        id: ConnectionId,
        /// Remote peer
        peer: SocketAddr,
        /// Transport kind
        transport: TransportKind,
    },

    /// A stream connection reached its final state
    ConnectionClosed {
        /// Connection identifier
        id: ConnectionId,
        /// Remote peer, if one was ever learned
        peer: Option<SocketAddr>,
        /// Transport kind
        transport: TransportKind,
    },

    /// An error scoped to one connection or endpoint
    Error {
        /// Error description
        error: String,
    },

    /// A listening endpoint stopped
    Closed,
}

/// Endpoint-level send API, shared by every listening endpoint
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Local address the endpoint is bound to
    fn local_addr(&self) -> Result<SocketAddr>;

    /// Sends a message to `destination` and waits for the write to complete
    async fn send_message(
        &self,
        message: Box<dyn OutboundMessage>,
        destination: SocketAddr,
    ) -> Result<()>;

    /// Stops the endpoint and every connection it owns
    async fn close(&self) -> Result<()>;

    /// Whether the endpoint has been closed
    fn is_closed(&self) -> bool;
}
