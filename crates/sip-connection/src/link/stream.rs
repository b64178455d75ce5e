//! Stream connection link (TCP and TLS)
//!
//! One `StreamConnection` per peer. Outbound messages go through a FIFO queue
//! with at most one write in flight; a sender task drains the queue, one
//! completed write at a time. A read task feeds inbound bytes to the
//! connection core until the connection stops being connected.
//!
//! Close and failure are coordinated with the queue under the same lock:
//! - `close()` with work outstanding moves to `Closing`, and the sender
//!   finalizes once the queue is empty.
//! - A write error, or a read error with no write in flight, moves to
//!   `Broken` and fails every queued message with that error.
//! - A read error that arrives while a write is in flight is parked until
//!   that write completes.

use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::channel::ListeningEndpoint;
use crate::connection::{ConnectionCore, ConnectionId, ConnectionStatus, LinkContext, SipConnection};
use crate::envelope::{Envelope, SendHandle};
use crate::error::{Error, Result};
use crate::io::StreamDevice;
use crate::message::OutboundMessage;
use crate::transport::{TransportEvent, TransportKind};

/// A TCP or TLS connection to one peer
#[derive(Clone)]
pub struct StreamConnection {
    inner: Arc<StreamInner>,
}

struct StreamInner {
    core: ConnectionCore,
    device: OnceLock<Arc<dyn StreamDevice>>,
    state: Mutex<LinkState>,
    read_cancel: CancellationToken,
}

#[derive(Default)]
struct LinkState {
    queue: VecDeque<Envelope>,
    send_pending: bool,
    deferred_error: Option<Error>,
    released: bool,
}

impl LinkState {
    /// Accepted messages not yet completed, including the one in flight
    fn pending_count(&self) -> usize {
        self.queue.len() + usize::from(self.send_pending)
    }
}

impl StreamConnection {
    /// Create a connection that will actively open a stream to `peer`
    pub fn outbound(
        transport: TransportKind,
        peer: SocketAddr,
        endpoint: Weak<ListeningEndpoint>,
        ctx: LinkContext,
    ) -> Self {
        Self::with_core(ConnectionCore::new(transport, Some(peer), endpoint, ctx))
    }

    /// Create a connection for a stream that is being accepted; the peer is
    /// learned from the device in [`StreamConnection::accept`]
    pub fn inbound(transport: TransportKind, endpoint: Weak<ListeningEndpoint>, ctx: LinkContext) -> Self {
        Self::with_core(ConnectionCore::new(transport, None, endpoint, ctx))
    }

    fn with_core(core: ConnectionCore) -> Self {
        Self {
            inner: Arc::new(StreamInner {
                core,
                device: OnceLock::new(),
                state: Mutex::new(LinkState::default()),
                read_cancel: CancellationToken::new(),
            }),
        }
    }

    /// The shared connection core
    pub fn core(&self) -> &ConnectionCore {
        &self.inner.core
    }

    /// Adopt an accepted stream: learn the peer, then attach the device
    pub fn accept(&self, device: Arc<dyn StreamDevice>) -> Result<()> {
        let peer = device.peer_addr()?;
        self.inner.core.set_remote_address(peer)?;
        self.attach(device)
    }

    /// Attach an established stream, mark the connection connected, flush
    /// anything queued while connecting and start the read loop
    pub fn attach(&self, device: Arc<dyn StreamDevice>) -> Result<()> {
        let inner = &self.inner;
        if let Ok(local) = device.local_addr() {
            inner.core.set_local_addr(local);
        }
        if inner.device.set(device.clone()).is_err() {
            return Err(Error::InvalidStateTransition {
                from: inner.core.status(),
                to: ConnectionStatus::Connected,
            });
        }

        let (first, start_reader) = {
            let mut state = inner.state.lock();
            match inner.core.status() {
                ConnectionStatus::PreConnect => {
                    inner.core.connection_established()?;
                }
                // Closed before the connect finished; only queued work is drained.
                ConnectionStatus::Closing => {}
                _ => {
                    drop(state);
                    inner.shutdown_device(device);
                    return Err(Error::ConnectionClosed(inner.core.id()));
                }
            }
            let first = if !state.send_pending {
                state.queue.pop_front()
            } else {
                None
            };
            if first.is_some() {
                state.send_pending = true;
            }
            (first, inner.core.status() == ConnectionStatus::Connected)
        };

        let peer = inner.core.peer_addr();
        info!(
            "{} connection {} established with {:?}",
            inner.core.transport(),
            inner.core.id(),
            peer
        );
        if let Some(peer) = peer {
            inner.core.context().emit(TransportEvent::ConnectionEstablished {
                id: inner.core.id(),
                peer,
                transport: inner.core.transport(),
            });
        }

        if let Some(envelope) = first {
            tokio::spawn(StreamInner::run_sender(inner.clone(), envelope));
        }
        if start_reader {
            tokio::spawn(StreamInner::run_reader(inner.clone(), device));
        }
        Ok(())
    }

    /// Queue an envelope, sending it at once if the link is idle
    pub fn write_envelope(&self, envelope: Envelope) -> Result<()> {
        let inner = &self.inner;
        let id = inner.core.id();
        let send_now = {
            let mut state = inner.state.lock();
            match inner.core.status() {
                ConnectionStatus::Closed => return Err(Error::ConnectionClosed(id)),
                ConnectionStatus::Closing => return Err(Error::ConnectionClosing(id)),
                ConnectionStatus::Broken => return Err(Error::ConnectionBroken(id)),
                ConnectionStatus::PreConnect | ConnectionStatus::Connected => {}
            }

            let limit = inner.core.context().config.max_outbound_pending_messages;
            if limit > 0 && state.pending_count() >= limit {
                warn!(
                    "Rejecting message on connection {}: {} messages pending",
                    id,
                    state.pending_count()
                );
                return Err(Error::TooManyPendingMessages { id, limit });
            }

            if inner.core.status() == ConnectionStatus::Connected && !state.send_pending {
                state.send_pending = true;
                Some(envelope)
            } else {
                trace!("Queueing message on connection {} ({} queued)", id, state.queue.len() + 1);
                state.queue.push_back(envelope);
                None
            }
        };

        if let Some(envelope) = send_now {
            tokio::spawn(StreamInner::run_sender(inner.clone(), envelope));
        }
        Ok(())
    }

    /// Fail a connection whose active-open did not succeed
    pub fn abort_establishment(&self, error: Error) {
        let inner = &self.inner;
        let (drained, closed) = {
            let mut state = inner.state.lock();
            state.send_pending = false;
            let drained: Vec<Envelope> = state.queue.drain(..).collect();
            (drained, inner.core.close())
        };
        for envelope in drained {
            envelope.fail(error.clone());
        }
        if closed {
            inner.on_closed();
        }
    }

    /// Number of accepted messages not yet completed, including the one in flight
    pub fn pending_messages(&self) -> usize {
        self.inner.state.lock().pending_count()
    }

    /// Whether a write is currently in flight
    pub fn is_send_pending(&self) -> bool {
        self.inner.state.lock().send_pending
    }

    /// Wait until the connection reaches `Closed`
    pub async fn closed(&self) {
        let mut status = self.inner.core.watch_status();
        let _ = status.wait_for(|s| *s == ConnectionStatus::Closed).await;
    }
}

impl SipConnection for StreamConnection {
    fn id(&self) -> ConnectionId {
        self.inner.core.id()
    }

    fn transport(&self) -> TransportKind {
        self.inner.core.transport()
    }

    fn path_mtu(&self) -> usize {
        self.inner.core.path_mtu()
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.core.peer_addr()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.core.local_addr()
    }

    fn status(&self) -> ConnectionStatus {
        self.inner.core.status()
    }

    fn write(&self, message: Box<dyn OutboundMessage>, use_compact_headers: bool) -> Result<SendHandle> {
        let (envelope, handle) = Envelope::new(message, use_compact_headers);
        self.write_envelope(envelope)?;
        Ok(handle)
    }

    fn close(&self) {
        let inner = &self.inner;
        let finalize = {
            let state = inner.state.lock();
            match inner.core.status() {
                ConnectionStatus::Closed | ConnectionStatus::Closing => false,
                ConnectionStatus::Broken => inner.core.close(),
                ConnectionStatus::PreConnect | ConnectionStatus::Connected => {
                    if state.queue.is_empty() && !state.send_pending {
                        inner.core.close()
                    } else {
                        debug!(
                            "Connection {} closing after {} pending messages",
                            inner.core.id(),
                            state.pending_count()
                        );
                        let _ = inner.core.transition(ConnectionStatus::Closing);
                        false
                    }
                }
            }
        };
        if finalize {
            inner.on_closed();
        }
    }
}

impl StreamInner {
    async fn run_sender(inner: Arc<StreamInner>, mut envelope: Envelope) {
        loop {
            let Some(device) = inner.device.get().cloned() else {
                error!("Connection {} has no device to send on", inner.core.id());
                inner.fail_connection(Error::ConnectionBroken(inner.core.id()), Some(envelope));
                return;
            };
            let peer = device
                .peer_addr()
                .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)));

            let written = match envelope.prepare(&inner.core.context().pool) {
                Ok(bytes) => {
                    trace!("Writing {} bytes to {}", bytes.len(), peer);
                    device.write_all(bytes).await
                }
                Err(e) => {
                    warn!("Failed to encode message for {}: {}", peer, e);
                    envelope.fail(e);
                    match inner.write_complete(None) {
                        Some(next) => {
                            envelope = next;
                            continue;
                        }
                        None => return,
                    }
                }
            };

            match written {
                Ok(()) => match inner.write_complete(Some(envelope)) {
                    Some(next) => envelope = next,
                    None => return,
                },
                Err(e) => {
                    inner.fail_connection(Error::SendFailed(peer, Arc::new(e)), Some(envelope));
                    return;
                }
            }
        }
    }

    /// Completion of the in-flight write: release its buffer, clear the
    /// pending flag, then either surface a parked read error or hand back the
    /// next queued envelope
    fn write_complete(&self, done: Option<Envelope>) -> Option<Envelope> {
        if let Some(envelope) = done {
            envelope.complete();
        }

        let mut state = self.state.lock();
        state.send_pending = false;

        if let Some(error) = state.deferred_error.take() {
            drop(state);
            self.fail_connection(error, None);
            return None;
        }

        let status = self.core.status();
        if matches!(status, ConnectionStatus::Connected | ConnectionStatus::Closing) {
            if let Some(next) = state.queue.pop_front() {
                state.send_pending = true;
                return Some(next);
            }
        }

        if status == ConnectionStatus::Closing && self.core.close() {
            drop(state);
            self.on_closed();
        }
        None
    }

    async fn run_reader(inner: Arc<StreamInner>, device: Arc<dyn StreamDevice>) {
        let handle: Arc<dyn SipConnection> = Arc::new(StreamConnection { inner: inner.clone() });
        let pool = inner.core.context().pool.clone();
        let read_size = inner.core.context().config.read_buffer_size;

        loop {
            let mut buffer = pool.acquire(read_size);
            let read = tokio::select! {
                _ = inner.read_cancel.cancelled() => break,
                read = device.read(&mut buffer) => read,
            };

            match read {
                Ok(0) => {
                    drop(buffer);
                    let peer = inner
                        .core
                        .peer_addr()
                        .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)));
                    inner.read_failed(Error::ConnectionReset(peer));
                    break;
                }
                Ok(n) => {
                    trace!("Read {} bytes on connection {}", n, inner.core.id());
                    if let Err(e) = inner.core.message_received(buffer, handle.clone()).await {
                        inner.read_failed(e);
                        break;
                    }
                }
                Err(e) => {
                    drop(buffer);
                    inner.read_failed(Error::from(e));
                    break;
                }
            }

            // Keep reading while draining so a reset fails the rest of the queue
            if !matches!(
                inner.core.status(),
                ConnectionStatus::Connected | ConnectionStatus::Closing
            ) {
                break;
            }
        }
        trace!("Read loop of connection {} stopped", inner.core.id());
    }

    fn read_failed(&self, error: Error) {
        let fail_now = {
            let mut state = self.state.lock();
            if !matches!(self.core.status(), ConnectionStatus::Connected | ConnectionStatus::Closing) {
                debug!("Ignoring read error on {} connection {}: {}", self.core.status(), self.core.id(), error);
                return;
            }
            if state.send_pending {
                debug!("Deferring read error on connection {} until the pending write completes", self.core.id());
                state.deferred_error = Some(error.clone());
                false
            } else {
                true
            }
        };
        if fail_now {
            self.fail_connection(error, None);
        }
    }

    /// Mark the connection broken and fail the in-flight and queued envelopes
    fn fail_connection(&self, error: Error, in_flight: Option<Envelope>) {
        let drained: Vec<Envelope> = {
            let mut state = self.state.lock();
            state.send_pending = false;
            state.deferred_error = None;
            self.core.mark_broken();
            state.queue.drain(..).collect()
        };

        warn!(
            "{} connection {} to {:?} broken: {} ({} queued messages failed)",
            self.core.transport(),
            self.core.id(),
            self.core.peer_addr(),
            error,
            drained.len()
        );

        if let Some(envelope) = in_flight {
            envelope.fail(error.clone());
        }
        for envelope in drained {
            envelope.fail(error.clone());
        }

        self.release_device();
        self.core.context().emit(TransportEvent::Error {
            error: format!("Connection {} failed: {}", self.core.id(), error),
        });
        if let Some(endpoint) = self.core.listening_endpoint() {
            endpoint.forget_connection(self.core.id(), self.core.peer_addr());
        }
    }

    /// Stop the read loop and shut the device down; runs once
    fn release_device(&self) {
        {
            let mut state = self.state.lock();
            if state.released {
                return;
            }
            state.released = true;
        }
        self.read_cancel.cancel();

        if let Some(device) = self.device.get().cloned() {
            self.shutdown_device(device);
        }
    }

    fn shutdown_device(&self, device: Arc<dyn StreamDevice>) {
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let id = self.core.id();
                runtime.spawn(async move {
                    if let Err(e) = device.shutdown().await {
                        debug!("Shutdown of connection {} failed: {}", id, e);
                    }
                });
            }
            Err(_) => debug!("No runtime to shut down connection {}", self.core.id()),
        }
    }

    /// Side effects of the single transition to `Closed`
    fn on_closed(&self) {
        self.release_device();
        info!(
            "{} connection {} to {:?} closed",
            self.core.transport(),
            self.core.id(),
            self.core.peer_addr()
        );
        self.core.context().emit(TransportEvent::ConnectionClosed {
            id: self.core.id(),
            peer: self.core.peer_addr(),
            transport: self.core.transport(),
        });
        if let Some(endpoint) = self.core.listening_endpoint() {
            endpoint.forget_connection(self.core.id(), self.core.peer_addr());
        }
    }
}

impl fmt::Debug for StreamConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "StreamConnection({} {} {:?} {})",
            self.inner.core.id(),
            self.inner.core.transport(),
            self.inner.core.peer_addr(),
            self.inner.core.status()
        )
    }
}
