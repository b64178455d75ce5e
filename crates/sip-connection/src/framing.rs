//! Splitting an inbound byte stream into SIP messages
//!
//! Stream transports carry messages back to back. A message ends after the
//! blank line that terminates its headers plus `Content-Length` body bytes
//! (RFC 3261 §18.3). CRLFs between messages are keep-alives (RFC 5626 §3.5.1)
//! and are discarded.

use bytes::{Buf, Bytes, BytesMut};

use crate::error::{Error, Result};

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Incremental stream framer, one per stream connection
#[derive(Debug)]
pub struct StreamFramer {
    pending: BytesMut,
    max_message_size: usize,
}

impl StreamFramer {
    /// Create a framer rejecting messages larger than `max_message_size`
    pub fn new(max_message_size: usize) -> Self {
        Self {
            pending: BytesMut::new(),
            max_message_size,
        }
    }

    /// Number of buffered bytes not yet forming a complete message
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    /// Append `data` and return every message it completes, in order
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Bytes>> {
        self.pending.extend_from_slice(data);
        let mut messages = Vec::new();
        while let Some(message) = self.next_message()? {
            messages.push(message);
        }
        Ok(messages)
    }

    fn next_message(&mut self) -> Result<Option<Bytes>> {
        let skip = self
            .pending
            .iter()
            .take_while(|b| **b == b'\r' || **b == b'\n')
            .count();
        self.pending.advance(skip);
        if self.pending.is_empty() {
            return Ok(None);
        }

        let header_end = match find(&self.pending, HEADER_TERMINATOR) {
            Some(pos) => pos + HEADER_TERMINATOR.len(),
            None => {
                if self.pending.len() > self.max_message_size {
                    return Err(Error::MessageTooLarge(self.pending.len(), self.max_message_size));
                }
                return Ok(None);
            }
        };

        let body_len = content_length(&self.pending[..header_end])?;
        let total = header_end + body_len;
        if total > self.max_message_size {
            return Err(Error::MessageTooLarge(total, self.max_message_size));
        }
        if self.pending.len() < total {
            return Ok(None);
        }
        Ok(Some(self.pending.split_to(total).freeze()))
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Body length declared by the header block; a missing header means no body
fn content_length(headers: &[u8]) -> Result<usize> {
    let text = std::str::from_utf8(headers)
        .map_err(|_| Error::MalformedMessage("header block is not UTF-8".into()))?;
    for line in text.split("\r\n").skip(1) {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim();
        if name.eq_ignore_ascii_case("content-length") || name.eq_ignore_ascii_case("l") {
            return value
                .trim()
                .parse::<usize>()
                .map_err(|_| Error::MalformedMessage(format!("bad Content-Length: {}", value.trim())));
        }
    }
    Ok(0)
}
