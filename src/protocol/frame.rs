//! Text frame protocol with newline-delimited messages
//!
//! Frame format:
//! ```text
//! +------------------+------+
//! | UTF-8 line       | '\n' |
//! | (variable)       |      |
//! +------------------+------+
//! ```
//!
//! An optional `'\r'` before the terminator is stripped, so both raw
//! clients and line-mode telnet peers produce identical frames.

use bytes::{Buf, Bytes, BytesMut};
use std::io;

/// Default maximum frame size in bytes, excluding the terminator
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024;

/// Streaming decoder that turns a byte stream into complete frames
///
/// Reads may split or coalesce frames arbitrarily; the codec buffers
/// fed bytes and yields one complete line per [`LineCodec::decode_next`].
#[derive(Debug)]
pub struct LineCodec {
    buffer: BytesMut,
    max_frame_size: usize,
}

impl LineCodec {
    /// Create a new codec with the default frame size limit
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    /// Create a new codec with a specific frame size limit
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(max_frame_size.min(4096)),
            max_frame_size,
        }
    }

    /// Feed data into the codec
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Try to decode the next frame
    ///
    /// Returns `Ok(Some(line))` when a complete frame is buffered,
    /// `Ok(None)` when more data is needed.
    pub fn decode_next(&mut self) -> io::Result<Option<String>> {
        let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') else {
            if self.buffer.len() > self.max_frame_size {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!(
                        "Frame exceeds {} bytes without terminator",
                        self.max_frame_size
                    ),
                ));
            }
            return Ok(None);
        };

        if pos > self.max_frame_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Frame too large: {} bytes (max: {})", pos, self.max_frame_size),
            ));
        }

        let mut line = self.buffer.split_to(pos);
        self.buffer.advance(1); // terminator
        if line.last() == Some(&b'\r') {
            line.truncate(line.len() - 1);
        }

        let line = String::from_utf8(line.to_vec())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("Invalid UTF-8: {}", e)))?;

        Ok(Some(line))
    }

    /// Encode a frame as a terminated line
    pub fn encode(line: &str) -> Bytes {
        let mut buf = BytesMut::with_capacity(line.len() + 1);
        buf.extend_from_slice(line.as_bytes());
        buf.extend_from_slice(b"\n");
        buf.freeze()
    }

    /// Get the current buffer length
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new()
    }
}
