//! Marker codec for WiFi stream framing
//!
//! Inbound messages are delimited inside the byte stream as:
//! ```text
//! ...noise... S <payload> E ...next frame...
//! ```
//! Outbound messages are plain text terminated by a single `\n`.
//!
//! The decoder surfaces only the newest complete frame of each chunk: when a
//! chunk carries `SaESbE`, `b` is delivered and `a` is dropped. This suits a
//! telemetry feed where the latest state wins. Consecutive identical payloads
//! are delivered once.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::protocol::{END_MARKER, START_MARKER};

/// Accumulator size at which unframed input starts being discarded
pub const MAX_ACCUMULATOR_LEN: usize = 64 * 1024;

/// Start and end bytes delimiting a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameMarkers {
    pub start: u8,
    pub end: u8,
}

impl Default for FrameMarkers {
    fn default() -> Self {
        Self {
            start: START_MARKER,
            end: END_MARKER,
        }
    }
}

/// Encode an outbound message as a newline-terminated line
pub fn encode_line(payload: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(payload.len() + 1);
    buf.put_slice(payload.as_bytes());
    buf.put_u8(b'\n');
    buf.freeze()
}

/// Wrap a message in start/end markers, as a peer does before writing it
pub fn encode_frame(message: &str, markers: FrameMarkers) -> Bytes {
    let mut buf = BytesMut::with_capacity(message.len() + 2);
    buf.put_u8(markers.start);
    buf.put_slice(message.as_bytes());
    buf.put_u8(markers.end);
    buf.freeze()
}

/// Streaming decoder turning raw socket chunks into messages
///
/// One decoder lives for exactly one connection.
#[derive(Debug)]
pub struct FrameDecoder {
    markers: FrameMarkers,
    /// Unconsumed input
    buffer: BytesMut,
    /// Last delivered payload, for duplicate suppression
    last_message: Option<String>,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    /// Create a decoder using the reference `S`/`E` markers
    pub fn new() -> Self {
        Self::with_markers(FrameMarkers::default())
    }

    /// Create a decoder with custom markers
    pub fn with_markers(markers: FrameMarkers) -> Self {
        Self {
            markers,
            buffer: BytesMut::with_capacity(1024),
            last_message: None,
        }
    }

    /// Append a chunk and return the newest complete message, if any
    ///
    /// Returns `None` when no frame is complete yet or when the frame repeats
    /// the previously delivered message. Incomplete or unbalanced input is
    /// kept until more data arrives.
    pub fn push(&mut self, chunk: &[u8]) -> Option<String> {
        self.buffer.extend_from_slice(chunk);

        let Some((start, end)) = self.find_frame() else {
            self.enforce_limit();
            return None;
        };

        let message = String::from_utf8_lossy(&self.buffer[start + 1..end]).into_owned();

        // Everything through the end marker is consumed; trailing bytes may
        // already hold the next start marker.
        self.buffer.advance(end + 1);

        if self.last_message.as_deref() == Some(message.as_str()) {
            return None;
        }
        self.last_message = Some(message.clone());
        Some(message)
    }

    /// Locate the last end marker and the nearest start marker before it
    fn find_frame(&self) -> Option<(usize, usize)> {
        let end = self.buffer.iter().rposition(|&b| b == self.markers.end)?;
        let start = self.buffer[..end]
            .iter()
            .rposition(|&b| b == self.markers.start)?;
        Some((start, end))
    }

    /// Bound the accumulator when a peer streams without ever closing a frame
    fn enforce_limit(&mut self) {
        if self.buffer.len() <= MAX_ACCUMULATOR_LEN {
            return;
        }
        match self.buffer.iter().rposition(|&b| b == self.markers.start) {
            Some(pos) if pos > 0 => self.buffer.advance(pos),
            _ => self.buffer.clear(),
        }
        if self.buffer.len() > MAX_ACCUMULATOR_LEN {
            self.buffer.clear();
        }
    }

    /// The most recently delivered message
    pub fn last_message(&self) -> Option<&str> {
        self.last_message.as_deref()
    }

    /// Get the current buffer length (for debugging)
    pub fn buffer_len(&self) -> usize {
        self.buffer.len()
    }

    /// Forget buffered input and the duplicate-suppression state
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.last_message = None;
    }
}
