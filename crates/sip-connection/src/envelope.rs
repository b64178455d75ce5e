//! Outbound message envelopes and their completion handles

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::buffer::{BufferPool, PooledBuffer};
use crate::bridge;
use crate::error::{Error, Result};
use crate::message::OutboundMessage;

/// One pending send: the message, its in-flight buffer and the completion
/// signal back to the sender.
///
/// An envelope completes exactly once. Dropping an envelope that never
/// completed reports [`Error::SendAbandoned`] to the sender.
pub struct Envelope {
    message: Box<dyn OutboundMessage>,
    use_compact_headers: bool,
    destination: Option<SocketAddr>,
    buffer: Option<PooledBuffer>,
    completion: Option<oneshot::Sender<Result<()>>>,
}

impl Envelope {
    /// Wrap a message, returning the envelope and the handle its sender awaits
    pub fn new(message: Box<dyn OutboundMessage>, use_compact_headers: bool) -> (Self, SendHandle) {
        let (tx, rx) = oneshot::channel();
        let envelope = Self {
            message,
            use_compact_headers,
            destination: None,
            buffer: None,
            completion: Some(tx),
        };
        (envelope, SendHandle { rx })
    }

    /// Address the envelope to a datagram peer
    pub fn with_destination(mut self, destination: SocketAddr) -> Self {
        self.destination = Some(destination);
        self
    }

    /// Datagram destination, if any
    pub fn destination(&self) -> Option<SocketAddr> {
        self.destination
    }

    /// Encode the message into a freshly leased buffer and return its bytes.
    ///
    /// Any buffer from an earlier attempt is released first.
    pub fn prepare(&mut self, pool: &BufferPool) -> Result<&[u8]> {
        self.buffer = None;
        let buffer = bridge::encode_outbound(&*self.message, self.use_compact_headers, pool)?;
        let buffer: &PooledBuffer = self.buffer.insert(buffer);
        Ok(&buffer[..])
    }

    /// Length of the prepared payload
    pub fn prepared_len(&self) -> usize {
        self.buffer.as_ref().map(|b| b.len()).unwrap_or(0)
    }

    /// Release the buffer and report success
    pub fn complete(mut self) {
        self.finish(Ok(()));
    }

    /// Release the buffer and report `error`
    pub fn fail(mut self, error: Error) {
        self.finish(Err(error));
    }

    fn finish(&mut self, result: Result<()>) {
        self.buffer = None;
        if let Some(tx) = self.completion.take() {
            // The sender may have stopped waiting; nothing to report then.
            let _ = tx.send(result);
        }
    }
}

impl Drop for Envelope {
    fn drop(&mut self) {
        if self.completion.is_some() {
            self.finish(Err(Error::SendAbandoned));
        }
    }
}

impl fmt::Debug for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Envelope")
            .field("message", &self.message)
            .field("destination", &self.destination)
            .field("in_flight", &self.buffer.is_some())
            .finish()
    }
}

/// Resolves once the message has been written, or has failed
#[derive(Debug)]
pub struct SendHandle {
    rx: oneshot::Receiver<Result<()>>,
}

impl SendHandle {
    /// Wait for the send to complete
    pub async fn wait(self) -> Result<()> {
        self.await
    }

    /// Completion result if it is already available
    pub fn try_result(&mut self) -> Option<Result<()>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(Error::ChannelClosed)),
        }
    }
}

impl Future for SendHandle {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|r| r.unwrap_or(Err(Error::ChannelClosed)))
    }
}
