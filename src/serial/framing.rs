//! Line framing for serial traffic
//!
//! With a delimiter configured, outbound lines get the delimiter appended
//! and inbound bytes are split on it (delimiter stripped, empty lines kept).
//! Without one, bytes pass through untouched in whatever chunks the
//! transport delivers.

use bytes::{Buf, Bytes, BytesMut};

/// Framing policy for one device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Framing {
    /// Raw byte sequences, no terminator
    Raw,
    /// Delimited lines
    Lines(Bytes),
}

impl Framing {
    /// Build a framing policy from an optional configured delimiter
    pub fn from_delimiter(delimiter: Option<&str>) -> Self {
        match delimiter {
            Some(d) if !d.is_empty() => Framing::Lines(Bytes::copy_from_slice(d.as_bytes())),
            _ => Framing::Raw,
        }
    }

    pub fn is_line_based(&self) -> bool {
        matches!(self, Framing::Lines(_))
    }

    /// Encode one outbound frame for the wire
    pub fn encode(&self, frame: &[u8]) -> Bytes {
        match self {
            Framing::Raw => Bytes::copy_from_slice(frame),
            Framing::Lines(delimiter) => {
                let mut buf = BytesMut::with_capacity(frame.len() + delimiter.len());
                buf.extend_from_slice(frame);
                buf.extend_from_slice(delimiter);
                buf.freeze()
            }
        }
    }

    /// Create the matching inbound decoder
    pub fn decoder(&self) -> FrameDecoder {
        match self {
            Framing::Raw => FrameDecoder::Raw,
            Framing::Lines(delimiter) => FrameDecoder::Lines(LineDecoder::new(delimiter.clone())),
        }
    }
}

/// Streaming decoder for inbound bytes
#[derive(Debug)]
pub enum FrameDecoder {
    Raw,
    Lines(LineDecoder),
}

impl FrameDecoder {
    /// Feed a chunk, returning every frame it completes
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        match self {
            FrameDecoder::Raw if chunk.is_empty() => Vec::new(),
            FrameDecoder::Raw => vec![Bytes::copy_from_slice(chunk)],
            FrameDecoder::Lines(lines) => lines.push(chunk),
        }
    }
}

/// Buffers input and emits a line whenever the delimiter is seen.
///
/// Multi-byte delimiters may straddle chunk boundaries.
#[derive(Debug)]
pub struct LineDecoder {
    delimiter: Bytes,
    buffer: BytesMut,
}

impl LineDecoder {
    pub fn new(delimiter: Bytes) -> Self {
        debug_assert!(!delimiter.is_empty());
        Self {
            delimiter,
            buffer: BytesMut::with_capacity(1024),
        }
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        // Only rescan the tail that could contain a delimiter start.
        let rescan_from = self.buffer.len().saturating_sub(self.delimiter.len() - 1);
        self.buffer.extend_from_slice(chunk);

        let mut lines = Vec::new();
        let mut search_from = rescan_from;
        while let Some(pos) = find(&self.buffer[search_from..], &self.delimiter) {
            let end = search_from + pos;
            let line = self.buffer.split_to(end).freeze();
            self.buffer.advance(self.delimiter.len());
            lines.push(line);
            search_from = 0;
        }
        lines
    }

    /// Bytes received since the last delimiter
    pub fn pending(&self) -> &[u8] {
        &self.buffer
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.len() > haystack.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
