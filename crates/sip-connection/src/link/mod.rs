//! Per-transport connection links
//!
//! - [`stream`]: TCP and TLS, one link per peer with an ordered send queue
//! - [`datagram`]: UDP, one shared link per endpoint

pub mod datagram;
pub mod stream;

pub use datagram::{DatagramConnection, DatagramLink};
pub use stream::StreamConnection;
