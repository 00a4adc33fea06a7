//! Append-only byte buffer used by every handshake parser.
//!
//! Handshakes are parsed incrementally: a single `read()` from the client
//! socket may contain less than one complete message, more than one, or land
//! in the middle of a multi-byte field. `FramedBuffer` accumulates whatever
//! arrives and lets callers peek at/consume a prefix once enough bytes are
//! present, without ever losing or re-parsing bytes across calls.

use bytes::{Buf, BytesMut};

#[derive(Default)]
pub struct FramedBuffer {
    buf: BytesMut,
}

impl FramedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends newly-read bytes. Amortized O(1): `BytesMut` only grows its
    /// backing allocation when capacity runs out.
    pub fn append(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Returns up to `n` bytes without consuming them.
    pub fn peek(&self, n: usize) -> &[u8] {
        &self.buf[..n.min(self.buf.len())]
    }

    /// Drops the first `n` bytes from the buffer.
    pub fn consume(&mut self, n: usize) {
        self.buf.advance(n.min(self.buf.len()));
    }

    /// Finds the first occurrence of `needle`, returning its start offset.
    pub fn find(&self, needle: &[u8]) -> Option<usize> {
        if needle.is_empty() || self.buf.len() < needle.len() {
            return None;
        }
        self.buf
            .windows(needle.len())
            .position(|window| window == needle)
    }

    /// Splits off and returns the first `n` bytes, consuming them.
    pub fn split_at(&mut self, n: usize) -> BytesMut {
        self.buf.split_to(n.min(self.buf.len()))
    }

    /// Whatever remains after a handshake has consumed its own bytes; this
    /// is the "pipelined payload" a client may have sent ahead of a reply
    /// (e.g. TLS ClientHello right after `CONNECT`).
    pub fn take_remaining(&mut self) -> BytesMut {
        std::mem::take(&mut self.buf)
    }
}
