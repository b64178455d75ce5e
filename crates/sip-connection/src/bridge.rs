//! Conversion between messages and pooled I/O buffers

use bytes::Bytes;
use tracing::trace;

use crate::buffer::{BufferPool, PooledBuffer};
use crate::error::{Error, Result};
use crate::message::OutboundMessage;

/// Encode `message` into a buffer leased from `pool`.
///
/// On failure the lease is dropped, and so released, before the error is
/// returned.
pub fn encode_outbound(
    message: &dyn OutboundMessage,
    use_compact_headers: bool,
    pool: &BufferPool,
) -> Result<PooledBuffer> {
    let mut buffer = pool.acquire(message.encoded_len_hint());
    message.encode(use_compact_headers, &mut buffer)?;
    if buffer.is_empty() {
        return Err(Error::EmptyPayload);
    }
    trace!("Encoded {} byte message", buffer.len());
    Ok(buffer)
}

/// Copy the bytes of an inbound buffer into an owned message container and
/// release the buffer.
pub fn copy_inbound(buffer: PooledBuffer) -> Bytes {
    Bytes::copy_from_slice(&buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct FailingMessage;

    impl OutboundMessage for FailingMessage {
        fn encode(&self, _: bool, _: &mut bytes::BytesMut) -> Result<()> {
            Err(Error::EncodeFailed("missing Call-ID".into()))
        }
    }

    #[test]
    fn test_encode_releases_buffer_on_error() {
        let pool = BufferPool::new(64, 4);
        assert!(matches!(
            encode_outbound(&FailingMessage, false, &pool),
            Err(Error::EncodeFailed(_))
        ));
        assert!(matches!(
            encode_outbound(&Bytes::new(), false, &pool),
            Err(Error::EmptyPayload)
        ));
        assert_eq!(pool.stats().outstanding, 0);
        assert_eq!(pool.stats().acquired, 2);
    }

    #[test]
    fn test_copy_inbound_releases_buffer() {
        let pool = BufferPool::new(64, 4);
        let mut buffer = pool.acquire(0);
        buffer.extend_from_slice(b"OPTIONS sip:bob@example.com SIP/2.0\r\n\r\n");
        let bytes = copy_inbound(buffer);
        assert!(bytes.starts_with(b"OPTIONS"));
        assert_eq!(pool.stats().outstanding, 0);
    }
}
