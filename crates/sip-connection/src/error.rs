use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::connection::{ConnectionId, ConnectionStatus};
use crate::transport::TransportKind;

/// A type alias for handling `Result`s with `Error`
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the SIP connection layer
///
/// The enum is `Clone` so that a single I/O failure can be delivered to every
/// envelope drained from an outbound queue. I/O sources are shared through `Arc`.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Generic I/O error from the substrate.
    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),

    /// Binding a listening endpoint failed.
    #[error("Failed to bind to {0}: {1}")]
    BindFailed(SocketAddr, Arc<io::Error>),

    /// Writing to a peer failed.
    #[error("Failed to send to {0}: {1}")]
    SendFailed(SocketAddr, Arc<io::Error>),

    /// Active-open of an outbound connection failed.
    #[error("Failed to connect to {0}: {1}")]
    ConnectFailed(SocketAddr, Arc<io::Error>),

    /// Active-open of an outbound connection did not complete in time.
    #[error("Connection to {0} timed out after {1:?}")]
    ConnectTimeout(SocketAddr, Duration),

    /// The outbound queue is at its configured maximum.
    #[error("Too many pending messages on connection {id} (limit {limit})")]
    TooManyPendingMessages {
        /// Connection that rejected the write
        id: ConnectionId,
        /// Configured maximum
        limit: usize,
    },

    /// The connection has been closed.
    #[error("Connection {0} is closed")]
    ConnectionClosed(ConnectionId),

    /// The connection is draining its queue before closing.
    #[error("Connection {0} is closing")]
    ConnectionClosing(ConnectionId),

    /// The connection failed with an I/O error and no longer accepts writes.
    #[error("Connection {0} is broken")]
    ConnectionBroken(ConnectionId),

    /// The peer closed its side of a stream.
    #[error("Connection reset by peer {0}")]
    ConnectionReset(SocketAddr),

    /// The remote address of a connection can only be learned once.
    #[error("Remote address already set to {0}")]
    RemoteAddressAlreadySet(SocketAddr),

    /// A connection without a peer address was asked to do peer work.
    #[error("Connection {0} has no remote address")]
    NoRemoteAddress(ConnectionId),

    /// Invalid status transition attempted.
    #[error("Invalid connection state transition from {from} to {to}")]
    InvalidStateTransition {
        /// Current status
        from: ConnectionStatus,
        /// Requested status
        to: ConnectionStatus,
    },

    /// The datagram exceeds the maximum UDP payload.
    #[error("Packet too large: {0} bytes (max {1})")]
    PacketTooLarge(usize, usize),

    /// A message encoded to zero bytes.
    #[error("Message payload is empty")]
    EmptyPayload,

    /// A framed stream message exceeds the configured maximum.
    #[error("Message too large: {0} bytes (max {1})")]
    MessageTooLarge(usize, usize),

    /// Inbound stream data could not be framed.
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// A message could not be encoded into its wire form.
    #[error("Failed to encode message: {0}")]
    EncodeFailed(String),

    /// The transport or endpoint has been shut down.
    #[error("Transport is closed")]
    TransportClosed,

    /// No listening endpoint exists for the requested transport.
    #[error("No listening endpoint for {0}")]
    NoEndpoint(TransportKind),

    /// The requested operation is not supported for this transport.
    #[error("Unsupported transport: {0}")]
    UnsupportedTransport(TransportKind),

    /// TLS setup error.
    #[error("TLS error: {0}")]
    Tls(String),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal channel closed (e.g. the completion sender was dropped).
    #[error("Internal channel closed")]
    ChannelClosed,

    /// An envelope was dropped before its send completed.
    #[error("Message was abandoned before it was sent")]
    SendAbandoned,
}

impl Error {
    /// Whether this error belongs to the I/O class surfaced to message senders.
    pub fn is_io(&self) -> bool {
        matches!(
            self,
            Error::Io(_)
                | Error::BindFailed(..)
                | Error::SendFailed(..)
                | Error::ConnectFailed(..)
                | Error::ConnectTimeout(..)
                | Error::ConnectionReset(_)
                | Error::ConnectionClosed(_)
                | Error::ConnectionClosing(_)
                | Error::ConnectionBroken(_)
                | Error::TooManyPendingMessages { .. }
        )
    }

    /// Whether this error signals misuse of the connection state machine.
    pub fn is_illegal_state(&self) -> bool {
        matches!(
            self,
            Error::RemoteAddressAlreadySet(_) | Error::InvalidStateTransition { .. }
        )
    }

    /// Whether the caller can retry the same operation after backing off.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::TooManyPendingMessages { .. })
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(Arc::new(e))
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for Error {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        Error::ChannelClosed
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Error::ChannelClosed
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Config(e.to_string())
    }
}
