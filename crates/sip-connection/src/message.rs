//! Message abstraction at the boundary with the SIP object model
//!
//! The connection layer never parses or builds SIP messages. Outbound messages
//! only need to know how to write their wire form into a buffer; inbound
//! messages are handed upward as raw bytes.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::Result;

/// A message that can be written to the wire
pub trait OutboundMessage: Send + Sync + fmt::Debug + 'static {
    /// Size hint used to pick a buffer; does not have to be exact
    fn encoded_len_hint(&self) -> usize {
        0
    }

    /// Append the wire form of the message to `dst`.
    ///
    /// `use_compact_headers` asks for single-letter header names where the
    /// message model supports them (RFC 3261 §7.3.3).
    fn encode(&self, use_compact_headers: bool, dst: &mut BytesMut) -> Result<()>;
}

impl OutboundMessage for Bytes {
    fn encoded_len_hint(&self) -> usize {
        self.len()
    }

    fn encode(&self, _use_compact_headers: bool, dst: &mut BytesMut) -> Result<()> {
        dst.put_slice(self);
        Ok(())
    }
}

impl OutboundMessage for Vec<u8> {
    fn encoded_len_hint(&self) -> usize {
        self.len()
    }

    fn encode(&self, _use_compact_headers: bool, dst: &mut BytesMut) -> Result<()> {
        dst.put_slice(self);
        Ok(())
    }
}

impl OutboundMessage for String {
    fn encoded_len_hint(&self) -> usize {
        self.len()
    }

    fn encode(&self, _use_compact_headers: bool, dst: &mut BytesMut) -> Result<()> {
        dst.put_slice(self.as_bytes());
        Ok(())
    }
}

impl OutboundMessage for &'static str {
    fn encoded_len_hint(&self) -> usize {
        self.len()
    }

    fn encode(&self, _use_compact_headers: bool, dst: &mut BytesMut) -> Result<()> {
        dst.put_slice(self.as_bytes());
        Ok(())
    }
}
