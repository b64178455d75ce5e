//! Active-open of outbound stream connections
//!
//! Every attempt is registered while it runs so that attempts in progress can
//! be observed, and the registration is removed however the attempt ends.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::connection::{ConnectionId, SipConnection};
use crate::error::{Error, Result};
use crate::io::StreamConnector;
use crate::link::StreamConnection;
use crate::transport::TransportKind;

/// Identifier of one establishment attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttemptId(Uuid);

/// An establishment attempt in progress
#[derive(Debug, Clone)]
pub struct PendingAttempt {
    /// Connection being established
    pub connection: ConnectionId,
    /// Peer being connected to
    pub target: SocketAddr,
    /// When the attempt started
    pub started: Instant,
}

/// Removes its attempt from the registry when dropped
struct AttemptToken<'a> {
    id: AttemptId,
    attempts: &'a DashMap<AttemptId, PendingAttempt>,
}

impl<'a> AttemptToken<'a> {
    fn register(
        attempts: &'a DashMap<AttemptId, PendingAttempt>,
        connection: ConnectionId,
        target: SocketAddr,
    ) -> Self {
        let id = AttemptId(Uuid::new_v4());
        attempts.insert(
            id,
            PendingAttempt {
                connection,
                target,
                started: Instant::now(),
            },
        );
        Self { id, attempts }
    }
}

impl Drop for AttemptToken<'_> {
    fn drop(&mut self) {
        self.attempts.remove(&self.id);
    }
}

/// Opens outbound streams for a stream endpoint
pub struct Establisher {
    transport: TransportKind,
    connector: Arc<dyn StreamConnector>,
    timeout: Duration,
    attempts: DashMap<AttemptId, PendingAttempt>,
}

impl Establisher {
    /// Create an establisher bounded by `timeout`
    pub fn new(transport: TransportKind, connector: Arc<dyn StreamConnector>, timeout: Duration) -> Self {
        Self {
            transport,
            connector,
            timeout,
            attempts: DashMap::new(),
        }
    }

    /// Connect `connection` to its peer.
    ///
    /// On success the connection is connected and anything queued on it is
    /// flushed. On failure or timeout everything queued fails with the same
    /// error, the connection is closed and the error is returned.
    pub async fn establish(&self, connection: &StreamConnection) -> Result<()> {
        let target = connection
            .peer_addr()
            .ok_or(Error::NoRemoteAddress(connection.id()))?;
        debug!("Connecting {} to {}", self.transport, target);

        let outcome = {
            let _token = AttemptToken::register(&self.attempts, connection.id(), target);
            tokio::time::timeout(self.timeout, self.connector.connect(target)).await
        };

        let error = match outcome {
            Ok(Ok(device)) => {
                connection.attach(device)?;
                info!("{} connection {} to {} ready", self.transport, connection.id(), target);
                return Ok(());
            }
            Ok(Err(e)) => Error::ConnectFailed(target, Arc::new(e)),
            Err(_) => Error::ConnectTimeout(target, self.timeout),
        };

        warn!("{} connect to {} failed: {}", self.transport, target, error);
        connection.abort_establishment(error.clone());
        Err(error)
    }

    /// Number of attempts in progress
    pub fn pending_attempts(&self) -> usize {
        self.attempts.len()
    }

    /// Snapshot of the attempts in progress
    pub fn attempts(&self) -> Vec<PendingAttempt> {
        self.attempts.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Configured connect timeout
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl fmt::Debug for Establisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Establisher")
            .field("transport", &self.transport)
            .field("connector", &self.connector)
            .field("timeout", &self.timeout)
            .field("pending", &self.attempts.len())
            .finish()
    }
}
