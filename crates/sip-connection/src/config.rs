//! Configuration for the connection layer
//!
//! All knobs have defaults, so a configuration file only needs to name the
//! values it changes:
//!
//! ```rust
//! use rvoip_sip_connection::config::TransportConfig;
//!
//! let config = TransportConfig::from_toml_str(r#"
//!     max_outbound_pending_messages = 32
//!     connect_timeout_ms = 2000
//! "#).unwrap();
//! assert_eq!(config.max_outbound_pending_messages, 32);
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::transport::MAX_UDP_PACKET_SIZE;

// Default event channel capacity
const DEFAULT_CHANNEL_CAPACITY: usize = 100;
// Buffer size for stream reads
const DEFAULT_READ_BUFFER_SIZE: usize = 8192;

/// Connection layer configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Maximum number of accepted-but-uncompleted messages per stream
    /// connection, including the one in flight. `0` means unbounded.
    pub max_outbound_pending_messages: usize,

    /// Timeout for active-open of outbound stream connections
    pub connect_timeout_ms: u64,

    /// Size of the pooled buffers used for stream reads
    pub read_buffer_size: usize,

    /// Size of the buffer used to receive one datagram
    pub max_datagram_size: usize,

    /// Number of idle buffers the pool keeps for reuse
    pub max_pooled_buffers: usize,

    /// Capacity of the transport event channel
    pub event_channel_capacity: usize,

    /// Path MTU reported for UDP connections
    pub udp_path_mtu: usize,

    /// Largest SIP message accepted from a stream
    pub max_message_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_outbound_pending_messages: 0,
            connect_timeout_ms: 5_000,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            max_datagram_size: 65_535,
            max_pooled_buffers: 64,
            event_channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            udp_path_mtu: 1_500,
            max_message_size: 65_535,
        }
    }
}

impl TransportConfig {
    /// Create a configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a configuration from TOML, filling unspecified values with defaults
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: TransportConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Set the outbound queue bound (`0` = unbounded)
    pub fn with_max_outbound_pending_messages(mut self, max: usize) -> Self {
        self.max_outbound_pending_messages = max;
        self
    }

    /// Set the connect timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the stream read buffer size
    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    /// Set the event channel capacity
    pub fn with_event_channel_capacity(mut self, capacity: usize) -> Self {
        self.event_channel_capacity = capacity;
        self
    }

    /// Set the largest accepted stream message
    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    /// Connect timeout as a `Duration`
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Check that the configuration is usable
    pub fn validate(&self) -> Result<()> {
        if self.connect_timeout_ms == 0 {
            return Err(Error::Config("connect_timeout_ms must be greater than 0".into()));
        }
        if self.read_buffer_size == 0 {
            return Err(Error::Config("read_buffer_size must be greater than 0".into()));
        }
        if self.max_datagram_size < MAX_UDP_PACKET_SIZE {
            return Err(Error::Config(format!(
                "max_datagram_size must be at least {}",
                MAX_UDP_PACKET_SIZE
            )));
        }
        if self.event_channel_capacity == 0 {
            return Err(Error::Config("event_channel_capacity must be greater than 0".into()));
        }
        if self.udp_path_mtu == 0 || self.udp_path_mtu > MAX_UDP_PACKET_SIZE {
            return Err(Error::Config(format!("Invalid udp_path_mtu: {}", self.udp_path_mtu)));
        }
        if self.max_message_size == 0 {
            return Err(Error::Config("max_message_size must be greater than 0".into()));
        }
        Ok(())
    }
}
