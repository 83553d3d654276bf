//! Stream framing.
//!
//! Instruments deliver samples, command echoes, prompts and error replies on a single
//! byte stream with no outer envelope. [`FrameBuffer`] accumulates raw bytes and asks
//! a set of [`Recognizer`]s where complete frames are. Each extraction call removes
//! exactly one frame (or the noise preceding it) from the front of the buffer, so
//! frames come out in arrival order and no byte is ever reported twice.
//!
//! Recognizers must only report frames that are fully buffered. A regex that ends in
//! the frame terminator (`\r\n`, a closing tag, a prompt literal) has that property
//! for free.
//!
//! # Example
//!
//! ```rust
//! use mi_core::chunker::{FrameBuffer, FrameKind, Recognizer};
//!
//! let sample = Recognizer::regex(FrameKind::Sample, "sample", r"#[0-9A-F]{6}\r\n").unwrap();
//! let prompt = Recognizer::literal(FrameKind::Prompt, "prompt", "S>");
//! let mut chunker = FrameBuffer::new(vec![sample, prompt]);
//!
//! chunker.add_data(b"noise#0A1B2C\r\nS>", chrono::Utc::now());
//! let (frame, range) = chunker.get_next_data().unwrap();
//! assert_eq!(&frame.bytes[..], b"#0A1B2C\r\n");
//! assert_eq!(range, 5..14);
//! assert_eq!(chunker.get_next_data().unwrap().0.kind, FrameKind::Prompt);
//! ```

use crate::error::{ProtocolError, ProtocolResult};
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use regex::bytes::Regex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::ops::Range;
use std::sync::Arc;
use tracing::{trace, warn};

// =============================================================================
// Frames and Recognizers
// =============================================================================

/// How a recognized frame is interpreted by the receive path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameKind {
    /// Asynchronously delivered data, always published upward
    Sample,
    /// Reply to a command, consumed by a pending transaction when there is one
    Response,
    /// Instrument is ready for the next command
    Prompt,
    /// Instrument rejected the last command
    Error,
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FrameKind::Sample => "sample",
            FrameKind::Response => "response",
            FrameKind::Prompt => "prompt",
            FrameKind::Error => "error",
        };
        f.write_str(label)
    }
}

/// A complete frame cut out of the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Classification from the recognizer that matched
    pub kind: FrameKind,
    /// Recognizer label, e.g. `"status"` or `"ctd_sample"`
    pub label: Arc<str>,
    /// Frame bytes, terminator included
    pub bytes: Bytes,
    /// Arrival time of the read that completed the frame
    pub timestamp: DateTime<Utc>,
}

impl Frame {
    /// Frame contents as text, invalid UTF-8 replaced.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

type MatchFn = dyn Fn(&[u8]) -> Vec<Range<usize>> + Send + Sync;

/// Locates complete frames of one type in a buffer.
///
/// The matcher must be pure: given the same buffer it returns the same ranges, and it
/// never reports a range that extends past data already received.
#[derive(Clone)]
pub struct Recognizer {
    kind: FrameKind,
    label: Arc<str>,
    matcher: Arc<MatchFn>,
}

impl Recognizer {
    /// Wraps an arbitrary matcher function.
    pub fn new<F>(kind: FrameKind, label: impl Into<Arc<str>>, matcher: F) -> Self
    where
        F: Fn(&[u8]) -> Vec<Range<usize>> + Send + Sync + 'static,
    {
        Self {
            kind,
            label: label.into(),
            matcher: Arc::new(matcher),
        }
    }

    /// Every non-overlapping match of `pattern` is a frame.
    pub fn regex(kind: FrameKind, label: impl Into<Arc<str>>, pattern: &str) -> ProtocolResult<Self> {
        let label = label.into();
        let re = Regex::new(pattern).map_err(|e| {
            ProtocolError::Configuration(format!("recognizer '{label}': invalid pattern: {e}"))
        })?;
        Ok(Self::new(kind, label, move |buf: &[u8]| {
            re.find_iter(buf).map(|m| m.range()).collect()
        }))
    }

    /// Every occurrence of the literal `text` is a frame.
    pub fn literal(kind: FrameKind, label: impl Into<Arc<str>>, text: &str) -> Self {
        let needle = text.as_bytes().to_vec();
        Self::new(kind, label, move |buf: &[u8]| find_all(buf, &needle))
    }

    /// Frames start with `start` and run through the first following `end`.
    pub fn delimited(
        kind: FrameKind,
        label: impl Into<Arc<str>>,
        start: &str,
        end: &str,
    ) -> ProtocolResult<Self> {
        let pattern = format!("(?s){}.*?{}", regex::escape(start), regex::escape(end));
        Self::regex(kind, label, &pattern)
    }

    /// Frame classification.
    pub fn kind(&self) -> FrameKind {
        self.kind
    }

    /// Recognizer label.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Ranges of complete frames in `buf`.
    pub fn find(&self, buf: &[u8]) -> Vec<Range<usize>> {
        (self.matcher)(buf)
    }
}

impl fmt::Debug for Recognizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Recognizer")
            .field("kind", &self.kind)
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

fn find_all(haystack: &[u8], needle: &[u8]) -> Vec<Range<usize>> {
    if needle.is_empty() {
        return Vec::new();
    }
    let mut ranges = Vec::new();
    let mut pos = 0;
    while pos + needle.len() <= haystack.len() {
        if &haystack[pos..pos + needle.len()] == needle {
            ranges.push(pos..pos + needle.len());
            pos += needle.len();
        } else {
            pos += 1;
        }
    }
    ranges
}

// =============================================================================
// Frame Buffer
// =============================================================================

/// Byte accumulator plus recognizer set.
///
/// Offsets returned by the extraction calls are relative to the buffer contents at
/// the time of the call.
#[derive(Debug)]
pub struct FrameBuffer {
    recognizers: Vec<Recognizer>,
    buf: BytesMut,
    /// Absolute stream offset of `buf[0]`
    consumed: u64,
    /// Absolute end offset of each `add_data` call still in the buffer
    arrivals: VecDeque<(u64, DateTime<Utc>)>,
    max_len: Option<usize>,
    discarded: u64,
}

impl FrameBuffer {
    /// Empty buffer using `recognizers`, earlier entries win ties.
    pub fn new(recognizers: Vec<Recognizer>) -> Self {
        Self {
            recognizers,
            buf: BytesMut::new(),
            consumed: 0,
            arrivals: VecDeque::new(),
            max_len: None,
            discarded: 0,
        }
    }

    /// Caps the unframed tail. Once the buffer holds more than `max_len` bytes with
    /// no frame in it, the oldest bytes are discarded as noise.
    pub fn with_max_len(mut self, max_len: usize) -> Self {
        self.max_len = Some(max_len.max(1));
        self
    }

    /// Appends freshly received bytes.
    pub fn add_data(&mut self, data: &[u8], timestamp: DateTime<Utc>) {
        if data.is_empty() {
            return;
        }
        self.buf.extend_from_slice(data);
        self.arrivals
            .push_back((self.consumed + self.buf.len() as u64, timestamp));
        self.enforce_cap();
    }

    /// Removes and returns the noise in front of the next complete frame.
    ///
    /// Returns `None` when the next frame starts at offset 0, or when no frame is
    /// buffered (trailing bytes may still be the start of one).
    pub fn get_next_non_data(&mut self) -> Option<(Bytes, Range<usize>)> {
        let (_, range) = self.earliest()?;
        if range.start == 0 {
            return None;
        }
        let noise = self.take(range.start);
        Some((noise, 0..range.start))
    }

    /// Removes and returns the next complete frame, dropping any noise before it.
    pub fn get_next_data(&mut self) -> Option<(Frame, Range<usize>)> {
        let (index, range) = self.earliest()?;
        let recognizer = &self.recognizers[index];
        let kind = recognizer.kind;
        let label = recognizer.label.clone();
        let timestamp = self.arrival_of(range.end);

        if range.start > 0 {
            trace!(bytes = range.start, "Discarding noise before frame");
            self.discarded += range.start as u64;
        }
        let taken = self.take(range.end);
        let frame = Frame {
            kind,
            label,
            bytes: taken.slice(range.start..),
            timestamp,
        };
        Some((frame, range))
    }

    /// Drops everything buffered.
    pub fn clear(&mut self) {
        let len = self.buf.len();
        if len > 0 {
            self.take(len);
        }
    }

    /// Bytes buffered but not yet extracted.
    pub fn pending(&self) -> &[u8] {
        &self.buf
    }

    /// Bytes currently buffered.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Total bytes thrown away as noise or overflow.
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    /// Earliest valid match across all recognizers as (recognizer index, range).
    fn earliest(&self) -> Option<(usize, Range<usize>)> {
        let len = self.buf.len();
        let mut best: Option<(usize, Range<usize>)> = None;
        for (index, recognizer) in self.recognizers.iter().enumerate() {
            for range in recognizer.find(&self.buf) {
                if range.start >= range.end || range.end > len {
                    warn!(
                        recognizer = %recognizer.label,
                        start = range.start,
                        end = range.end,
                        len,
                        "Recognizer returned an invalid range"
                    );
                    continue;
                }
                let better = match &best {
                    None => true,
                    Some((_, current)) => range.start < current.start,
                };
                if better {
                    best = Some((index, range));
                }
            }
        }
        best
    }

    fn take(&mut self, n: usize) -> Bytes {
        let taken = self.buf.split_to(n).freeze();
        self.consumed += n as u64;
        while self
            .arrivals
            .front()
            .is_some_and(|(end, _)| *end <= self.consumed)
        {
            self.arrivals.pop_front();
        }
        taken
    }

    fn arrival_of(&self, end: usize) -> DateTime<Utc> {
        let absolute = self.consumed + end as u64;
        self.arrivals
            .iter()
            .find(|(arrival_end, _)| *arrival_end >= absolute)
            .map(|(_, ts)| *ts)
            .unwrap_or_else(Utc::now)
    }

    fn enforce_cap(&mut self) {
        let Some(max_len) = self.max_len else {
            return;
        };
        if self.buf.len() <= max_len || self.earliest().is_some() {
            return;
        }
        let excess = self.buf.len() - max_len;
        warn!(bytes = excess, max_len, "Frame buffer overflow, discarding oldest bytes");
        self.discarded += excess as u64;
        self.take(excess);
    }
}
