//! Listening endpoints and their registry
//!
//! A [`ListeningEndpoint`] is one bound local address for one transport. It
//! owns the inbound side (accept or receive loop) and hands out connections
//! for outbound traffic. The [`ChannelRegistry`] creates endpoints lazily and
//! caches them by [`EndpointKey`].

mod endpoint;
mod registry;

pub use endpoint::ListeningEndpoint;
pub use registry::ChannelRegistry;

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use crate::transport::TransportKind;

/// Local identity of a listening endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EndpointKey {
    /// Bound host
    pub host: IpAddr,
    /// Bound port
    pub port: u16,
    /// Transport kind
    pub transport: TransportKind,
}

impl EndpointKey {
    /// Key for `addr` over `transport`
    pub fn new(addr: SocketAddr, transport: TransportKind) -> Self {
        Self {
            host: addr.ip(),
            port: addr.port(),
            transport,
        }
    }

    /// The bound address
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

impl fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{};transport={}", self.socket_addr(), self.transport.as_str().to_lowercase())
    }
}
