//! # Stream Framing
//!
//! `[magic "RO": 2b][len: u32 LE][payload: len]`
//!
//! ## Invariants
//! - An incomplete frame is never an error. The bytes are retained until the
//!   rest arrives.
//! - A stream that cannot be resynchronised (bad magic, oversize length,
//!   undecodable payload, runaway buffering) is reported as a `FrameError`.

use crate::codec::decode_payload;
use crate::codec::encode_payload;
use crate::error::FrameError;
use crate::error::Result;
use crate::message::Message;

/// Two bytes opening every frame.
pub const MAGIC: [u8; 2] = *b"RO";

/// Magic plus length prefix.
pub const HEADER_LEN: usize = 6;

/// Bounds on what a peer may make us buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLimits {
    /// Largest payload a single frame may declare.
    pub max_frame_len: usize,
    /// Largest number of bytes held while waiting for a frame to complete.
    pub max_buffered: usize,
}

impl Default for FrameLimits {
    fn default() -> Self {
        Self {
            max_frame_len: 16 * 1024 * 1024,
            max_buffered: 32 * 1024 * 1024,
        }
    }
}

impl FrameLimits {
    pub fn with_max_frame_len(mut self, max: usize) -> Self {
        self.max_frame_len = max;
        self
    }

    pub fn with_max_buffered(mut self, max: usize) -> Self {
        self.max_buffered = max;
        self
    }
}

/// Outcome of attempting to decode the front of a buffer.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// More bytes are needed.
    Incomplete,
    /// One message, and how many bytes of the buffer it occupied.
    Message { message: Message, consumed: usize },
}

/// Encodes a message as one complete frame.
pub fn encode(msg: &Message) -> Result<Vec<u8>> {
    let payload = encode_payload(msg)?;
    let len = u32::try_from(payload.len())
        .map_err(|_| remopack::Error::BlobTooLarge(payload.len()))?;

    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&MAGIC);
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Attempts to decode one frame from the front of `buf`.
pub fn decode(buf: &[u8], limits: &FrameLimits) -> std::result::Result<Decoded, FrameError> {
    // Check the magic as soon as its bytes are available.
    let seen = buf.len().min(MAGIC.len());
    if buf[..seen] != MAGIC[..seen] {
        let mut found = [0u8; 2];
        found[..seen].copy_from_slice(&buf[..seen]);
        return Err(FrameError::BadMagic(found));
    }
    if buf.len() < HEADER_LEN {
        return Ok(Decoded::Incomplete);
    }

    let len = u32::from_le_bytes([buf[2], buf[3], buf[4], buf[5]]) as usize;
    if len > limits.max_frame_len {
        return Err(FrameError::FrameTooLarge { len, max: limits.max_frame_len });
    }
    let total = HEADER_LEN + len;
    if buf.len() < total {
        return Ok(Decoded::Incomplete);
    }

    let message = decode_payload(&buf[HEADER_LEN..total])?;
    Ok(Decoded::Message { message, consumed: total })
}

/// Reassembles messages from arbitrarily split socket reads.
///
/// Once an error is returned the buffer is poisoned: the caller is expected to
/// drop the connection.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: Vec<u8>,
    limits: FrameLimits,
}

impl FrameBuffer {
    pub fn new(limits: FrameLimits) -> Self {
        Self { buf: Vec::new(), limits }
    }

    /// Bytes held for a frame that is not complete yet.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Appends a chunk read from the stream.
    pub fn extend(&mut self, chunk: &[u8]) -> std::result::Result<(), FrameError> {
        let buffered = self.buf.len() + chunk.len();
        if buffered > self.limits.max_buffered {
            return Err(FrameError::BufferOverflow { buffered, max: self.limits.max_buffered });
        }
        self.buf.extend_from_slice(chunk);
        Ok(())
    }

    /// Pops the next complete message, or `None` if the buffer holds a partial frame.
    pub fn next_message(&mut self) -> std::result::Result<Option<Message>, FrameError> {
        if self.buf.is_empty() {
            return Ok(None);
        }
        match decode(&self.buf, &self.limits)? {
            Decoded::Incomplete => Ok(None),
            Decoded::Message { message, consumed } => {
                self.buf.drain(..consumed);
                Ok(Some(message))
            }
        }
    }
}
