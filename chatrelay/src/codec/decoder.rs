//! Incremental frame decoding.
//!
//! The transport hands over arbitrary byte slices that may cut a frame (or a
//! multi-byte character) anywhere. [`LineBuffer`] holds the incomplete tail
//! between reads and only releases whole lines; [`FrameDecoder`] turns those
//! lines into chunks.

use tracing::{debug, warn};

use super::frame::DATA_PREFIX;
use crate::models::StreamChunk;

/// Buffers raw bytes and yields complete lines with their terminator removed.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes and drain every complete line.
    ///
    /// Lines end at `\n`; a trailing `\r` is stripped. A newline byte never
    /// occurs inside a UTF-8 sequence, so each released line is whole.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);

        let mut lines = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.pending[start..].iter().position(|&b| b == b'\n') {
            let end = start + offset;
            let line = self.pending[start..end]
                .strip_suffix(b"\r")
                .unwrap_or(&self.pending[start..end]);
            lines.push(String::from_utf8_lossy(line).into_owned());
            start = end + 1;
        }
        self.pending.drain(..start);
        lines
    }

    /// Discard an unterminated tail, returning how many bytes were dropped.
    pub fn discard(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        dropped
    }

    /// Number of buffered bytes not yet forming a line.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// Classification of one received line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Line<'a> {
    /// Empty line: frame boundary.
    Boundary,
    /// Comment line such as a heartbeat.
    Comment(&'a str),
    /// Payload of a `data:` line.
    Data(&'a str),
    /// Any other field (`event:`, `id:`, `retry:`).
    Other(&'a str),
}

impl<'a> Line<'a> {
    pub fn classify(line: &'a str) -> Self {
        if line.is_empty() {
            return Self::Boundary;
        }
        if let Some(comment) = line.strip_prefix(':') {
            return Self::Comment(comment.trim_start());
        }
        if let Some(data) = line.strip_prefix(DATA_PREFIX) {
            return Self::Data(data.strip_prefix(' ').unwrap_or(data));
        }
        Self::Other(line)
    }
}

/// Decodes a relay frame stream into chunks.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    lines: LineBuffer,
    heartbeats: usize,
    skipped: usize,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the next read and return the chunks it completed, in order.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<StreamChunk> {
        let lines = self.lines.push(bytes);
        lines.iter().filter_map(|line| self.decode_line(line)).collect()
    }

    /// Close the decoder once the transport has ended.
    ///
    /// A frame is only complete once its line terminator arrived, so an
    /// unterminated tail is a frame cut mid-transfer and is dropped.
    pub fn finish(&mut self) -> usize {
        let pending = self.lines.pending_len();
        if pending > 0 {
            warn!(bytes = pending, "dropping frame cut off by end of stream");
        }
        self.lines.discard()
    }

    /// Heartbeat or other comment lines seen so far.
    pub const fn heartbeats(&self) -> usize {
        self.heartbeats
    }

    /// Malformed data lines dropped so far.
    pub const fn skipped(&self) -> usize {
        self.skipped
    }

    fn decode_line(&mut self, line: &str) -> Option<StreamChunk> {
        match Line::classify(line) {
            Line::Data(payload) => match serde_json::from_str::<StreamChunk>(payload) {
                Ok(chunk) => Some(chunk),
                Err(e) => {
                    self.skipped += 1;
                    warn!(error = %e, line = %truncate(payload, 120), "skipping malformed frame");
                    None
                }
            },
            Line::Comment(comment) => {
                self.heartbeats += 1;
                debug!(comment, "keep-alive received");
                None
            }
            Line::Boundary | Line::Other(_) => None,
        }
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
