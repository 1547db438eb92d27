//! Length-prefixed framing for the TCP transport.
//!
//! # Frame Format
//!
//! ```text
//! ┌──────────────┬────────────────────┬───────────┬──────────────────────┐
//! │ magic "FSBR" │ length (u32, BE)   │ flags (1) │ payload (length - 1) │
//! └──────────────┴────────────────────┴───────────┴──────────────────────┘
//! ```
//!
//! `length` counts the flags byte plus the payload. A reader never relies on
//! the granularity of socket reads: it buffers bytes in a [`FrameBuffer`] and
//! pulls out complete frames as they become available.
//!
//! Payloads larger than [`COMPRESSION_THRESHOLD`] are LZ4-compressed when that
//! actually makes them smaller.

use crate::error::{ProtocolError, Result};

/// Magic bytes identifying an FSBridge frame.
pub const FRAME_MAGIC: [u8; 4] = *b"FSBR";

/// Payloads above this size are candidates for compression.
pub const COMPRESSION_THRESHOLD: usize = 1024;

/// Maximum encoded frame size (16 MB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Header size: 4 (magic) + 4 (length) + 1 (flags).
pub const FRAME_HEADER_SIZE: usize = 9;

/// Magic plus length, the part of the header that precedes `length`'s span.
const PREFIX_SIZE: usize = 8;

/// Flags byte of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameFlags(u8);

impl FrameFlags {
    /// Payload is LZ4 compressed.
    pub const COMPRESSED: u8 = 0b0000_0001;

    /// Empty flag set.
    #[inline]
    pub fn new() -> Self {
        Self(0)
    }

    #[inline]
    pub fn from_byte(byte: u8) -> Self {
        Self(byte)
    }

    #[inline]
    pub fn as_byte(self) -> u8 {
        self.0
    }

    #[inline]
    pub fn is_compressed(self) -> bool {
        self.0 & Self::COMPRESSED != 0
    }

    /// Return a copy with the compressed bit set or cleared.
    #[inline]
    pub fn with_compressed(self, compressed: bool) -> Self {
        if compressed {
            Self(self.0 | Self::COMPRESSED)
        } else {
            Self(self.0 & !Self::COMPRESSED)
        }
    }
}

/// A decoded frame. The payload is always in its uncompressed form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub flags: FrameFlags,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            flags: FrameFlags::new(),
            payload,
        }
    }
}

/// Encoder and decoder for frames.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    compression_enabled: bool,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    /// Codec with compression enabled.
    pub fn new() -> Self {
        Self {
            compression_enabled: true,
        }
    }

    /// Codec that never compresses.
    pub fn without_compression() -> Self {
        Self {
            compression_enabled: false,
        }
    }

    /// Encode a frame into bytes ready for the wire.
    pub fn encode(&self, frame: &Frame) -> Result<Vec<u8>> {
        let payload = &frame.payload;
        if payload.len() > MAX_FRAME_SIZE - FRAME_HEADER_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: payload.len() + FRAME_HEADER_SIZE,
                max: MAX_FRAME_SIZE,
            });
        }

        let mut flags = frame.flags.with_compressed(false);
        let mut body = None;
        if self.compression_enabled && payload.len() > COMPRESSION_THRESHOLD {
            let compressed = lz4_flex::compress_prepend_size(payload);
            if compressed.len() < payload.len() {
                flags = flags.with_compressed(true);
                body = Some(compressed);
            }
        }
        let body = body.as_deref().unwrap_or(payload);

        let content_len = 1 + body.len();
        let mut output = Vec::with_capacity(PREFIX_SIZE + content_len);
        output.extend_from_slice(&FRAME_MAGIC);
        output.extend_from_slice(&(content_len as u32).to_be_bytes());
        output.push(flags.as_byte());
        output.extend_from_slice(body);
        Ok(output)
    }

    /// Decode one frame from the start of `data`.
    ///
    /// Returns `Ok(None)` when `data` holds only part of a frame, otherwise the
    /// frame and the number of bytes it occupied.
    pub fn try_decode(&self, data: &[u8]) -> Result<Option<(Frame, usize)>> {
        let content_len = match parse_prefix(data)? {
            Some(len) => len,
            None => return Ok(None),
        };
        let total = PREFIX_SIZE + content_len;
        if data.len() < total {
            return Ok(None);
        }

        let flags = FrameFlags::from_byte(data[PREFIX_SIZE]);
        let body = &data[FRAME_HEADER_SIZE..total];
        let payload = if flags.is_compressed() {
            inflate(body)?
        } else {
            body.to_vec()
        };

        Ok(Some((
            Frame {
                flags: flags.with_compressed(false),
                payload,
            },
            total,
        )))
    }

    /// Decode one complete frame, failing if `data` is truncated.
    pub fn decode(&self, data: &[u8]) -> Result<(Frame, usize)> {
        self.try_decode(data)?.ok_or_else(|| {
            ProtocolError::Protocol(format!("insufficient data for frame: have {}", data.len()))
        })
    }
}

/// Validate magic and length; `None` if the prefix is not complete yet.
fn parse_prefix(data: &[u8]) -> Result<Option<usize>> {
    if data.len() < FRAME_HEADER_SIZE {
        // Reject a wrong magic as early as possible.
        let seen = data.len().min(FRAME_MAGIC.len());
        if data[..seen] != FRAME_MAGIC[..seen] {
            return Err(invalid_magic(&data[..seen]));
        }
        return Ok(None);
    }

    if data[..4] != FRAME_MAGIC {
        return Err(invalid_magic(&data[..4]));
    }

    let content_len = u32::from_be_bytes([data[4], data[5], data[6], data[7]]) as usize;
    if content_len == 0 {
        return Err(ProtocolError::Protocol(
            "frame content must include the flags byte".to_string(),
        ));
    }
    if PREFIX_SIZE + content_len > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: PREFIX_SIZE + content_len,
            max: MAX_FRAME_SIZE,
        });
    }
    Ok(Some(content_len))
}

/// Decompress an LZ4 body whose first four bytes (LE) give the inflated
/// size. The claimed size is checked before anything is allocated.
fn inflate(body: &[u8]) -> Result<Vec<u8>> {
    let max = MAX_FRAME_SIZE - FRAME_HEADER_SIZE;
    let claimed = match body {
        [a, b, c, d, ..] => u32::from_le_bytes([*a, *b, *c, *d]) as usize,
        _ => {
            return Err(ProtocolError::Protocol(
                "failed to decompress payload: missing size prefix".to_string(),
            ))
        }
    };
    if claimed > max {
        return Err(ProtocolError::FrameTooLarge {
            size: claimed + FRAME_HEADER_SIZE,
            max: MAX_FRAME_SIZE,
        });
    }
    lz4_flex::decompress_size_prepended(body)
        .map_err(|e| ProtocolError::Protocol(format!("failed to decompress payload: {}", e)))
}

fn invalid_magic(got: &[u8]) -> ProtocolError {
    ProtocolError::Protocol(format!("invalid frame magic: got {:02x?}", got))
}

/// Accumulates raw bytes from a stream and yields whole frames.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    codec: FrameCodec,
    pending: Vec<u8>,
}

impl FrameBuffer {
    pub fn new(codec: FrameCodec) -> Self {
        Self {
            codec,
            pending: Vec::new(),
        }
    }

    /// Append bytes as they were read from the socket.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
    }

    /// Pop the next complete frame, if one is buffered.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        match self.codec.try_decode(&self.pending)? {
            Some((frame, consumed)) => {
                self.pending.drain(..consumed);
                Ok(Some(frame))
            }
            None => Ok(None),
        }
    }

    /// Bytes received but not yet part of a complete frame.
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }
}
