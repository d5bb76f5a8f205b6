//! Framing: 4-byte big-endian length prefix + opaque payload.

use crate::protocol::{Message, MessageError};

/// Size of the length header in front of every envelope.
pub const LEN_SIZE: usize = 4;

/// Default cap applied by [`FrameBuffer`] to inbound envelopes (16 MiB).
pub const DEFAULT_MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

/// Encode a payload into a single envelope: 4 bytes BE length + payload.
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>, FrameEncodeError> {
    let len = u32::try_from(payload.len()).map_err(|_| FrameEncodeError::TooLarge(payload.len()))?;
    let mut out = Vec::new();
    out.try_reserve_exact(LEN_SIZE + payload.len())
        .map_err(|_| FrameEncodeError::OutOfMemory)?;
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

/// Serialize a message and frame it.
pub fn encode_message(msg: &Message) -> Result<Vec<u8>, FrameEncodeError> {
    let payload = msg.to_bytes()?;
    encode_frame(&payload)
}

/// Error encoding a payload into an envelope.
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("out of memory while building frame")]
    OutOfMemory,
    #[error("payload of {0} bytes does not fit a 32-bit length header")]
    TooLarge(usize),
    #[error(transparent)]
    Message(#[from] MessageError),
}

/// Decode one envelope from the front of `bytes`. Returns the payload and the number of bytes
/// consumed. Nothing is consumed on `NeedMore`; call again with the same bytes plus whatever
/// arrived since. No upper bound on the length is applied here.
pub fn decode_frame(bytes: &[u8]) -> Result<(&[u8], usize), FrameDecodeError> {
    let len = peek_len(bytes).ok_or(FrameDecodeError::NeedMore)? as usize;
    let end = LEN_SIZE + len;
    if bytes.len() < end {
        return Err(FrameDecodeError::NeedMore);
    }
    Ok((&bytes[LEN_SIZE..end], end))
}

fn peek_len(bytes: &[u8]) -> Option<u32> {
    let header: [u8; LEN_SIZE] = bytes.get(..LEN_SIZE)?.try_into().ok()?;
    Some(u32::from_be_bytes(header))
}

/// Error decoding an envelope.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    /// Only raised by [`FrameBuffer`], which applies a length cap as policy.
    #[error("frame of {len} bytes exceeds limit of {max}")]
    TooLarge { len: u32, max: u32 },
}

/// Accumulates stream reads and yields complete payloads in order.
#[derive(Debug)]
pub struct FrameBuffer {
    buf: Vec<u8>,
    max_len: u32,
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}

impl FrameBuffer {
    pub fn new(max_len: u32) -> Self {
        Self {
            buf: Vec::new(),
            max_len,
        }
    }

    /// Append bytes read from the transport.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes buffered but not yet returned as a payload.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Pop the next complete payload, if any. `TooLarge` is raised as soon as the header is
    /// visible so the caller can drop the session without buffering the oversized body.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, FrameDecodeError> {
        if let Some(len) = peek_len(&self.buf) {
            if len > self.max_len {
                return Err(FrameDecodeError::TooLarge {
                    len,
                    max: self.max_len,
                });
            }
        }
        match decode_frame(&self.buf) {
            Ok((payload, consumed)) => {
                let payload = payload.to_vec();
                self.buf.drain(..consumed);
                Ok(Some(payload))
            }
            Err(FrameDecodeError::NeedMore) => Ok(None),
            Err(e) => Err(e),
        }
    }
}
