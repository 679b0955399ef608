//! Frame reconstruction for both transport shapes.
//!
//! Transports deliver bytes in arbitrary pieces. The parsers here keep the
//! unterminated tail between `feed` calls so a record split across deliveries
//! is emitted exactly once, after its terminator arrives.

use crate::decode::DONE_SENTINEL;
use crate::errors::StreamError;

/// Event name used when a record carries no `event:` field.
pub const DEFAULT_EVENT_NAME: &str = "message";

/// Default bound on buffered, not-yet-terminated input.
pub const DEFAULT_MAX_PENDING_BYTES: usize = 1024 * 1024;

/// One wire-level record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Event name (`message` unless the transport named it).
    pub event_name: String,
    /// Payload; multi-line event-stream bodies are joined with `\n`.
    pub data: String,
}

impl Frame {
    /// Creates a frame with the default event name.
    pub fn message(data: impl Into<String>) -> Self {
        Self {
            event_name: DEFAULT_EVENT_NAME.to_string(),
            data: data.into(),
        }
    }

    /// Creates a frame with an explicit event name.
    pub fn named(event_name: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event_name: event_name.into(),
            data: data.into(),
        }
    }
}

/// Unterminated input outgrew the parser's limit.
///
/// Frames completed by the same `feed` call are still handed back; they
/// precede the overflow in the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedError {
    /// Frames completed before the overflow.
    pub frames: Vec<Frame>,
    /// Always `StreamError::MalformedStream`.
    pub error: StreamError,
}

/// Common contract of the per-transport parsers.
pub trait FrameParser: Send {
    /// Appends raw bytes and returns every frame completed by them.
    fn feed(&mut self, chunk: &[u8]) -> Result<Vec<Frame>, FeedError>;

    /// Drains buffered input at end of stream. Only frames that end the
    /// stream are recovered from an unterminated tail.
    fn finish(&mut self) -> Vec<Frame>;

    /// Drops all buffered state.
    fn reset(&mut self);
}

/// Incremental UTF-8 decoder.
///
/// A multi-byte character split across chunks is held back until its
/// remaining bytes arrive. Invalid sequences become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8StreamDecoder {
    pending: Vec<u8>,
}

impl Utf8StreamDecoder {
    /// Decodes as much of `chunk` (plus any held-back bytes) as possible.
    pub fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let mut out = String::new();
        loop {
            let err = match std::str::from_utf8(&self.pending) {
                Ok(valid) => {
                    out.push_str(valid);
                    self.pending.clear();
                    return out;
                }
                Err(err) => err,
            };
            let valid_up_to = err.valid_up_to();
            out.push_str(&String::from_utf8_lossy(&self.pending[..valid_up_to]));
            match err.error_len() {
                Some(invalid_len) => {
                    out.push(char::REPLACEMENT_CHARACTER);
                    self.pending.drain(..valid_up_to + invalid_len);
                }
                None => {
                    // incomplete sequence at the end; wait for more bytes
                    self.pending.drain(..valid_up_to);
                    return out;
                }
            }
        }
    }

    /// Flushes a dangling incomplete sequence as U+FFFD.
    pub fn finish(&mut self) -> String {
        if self.pending.is_empty() {
            return String::new();
        }
        self.pending.clear();
        char::REPLACEMENT_CHARACTER.to_string()
    }

    /// Number of held-back bytes.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Drops held-back bytes.
    pub fn reset(&mut self) {
        self.pending.clear();
    }
}

/// Parser for newline-delimited `data:` records read from a chunked body.
#[derive(Debug)]
pub struct ChunkedFrameParser {
    utf8: Utf8StreamDecoder,
    carry: String,
    max_pending_bytes: usize,
}

impl Default for ChunkedFrameParser {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PENDING_BYTES)
    }
}

impl ChunkedFrameParser {
    /// Creates a parser that fails once an unterminated line exceeds
    /// `max_pending_bytes`.
    pub fn new(max_pending_bytes: usize) -> Self {
        Self {
            utf8: Utf8StreamDecoder::default(),
            carry: String::new(),
            max_pending_bytes,
        }
    }

    /// Feeds already-decoded text.
    pub fn feed_text(&mut self, text: &str) -> Result<Vec<Frame>, FeedError> {
        self.carry.push_str(text);
        let mut frames = Vec::new();
        if let Some(last_newline) = self.carry.rfind('\n') {
            let tail = self.carry.split_off(last_newline + 1);
            let complete = std::mem::replace(&mut self.carry, tail);
            frames.extend(complete.split('\n').filter_map(parse_data_line));
        }
        if self.carry.len() > self.max_pending_bytes {
            self.carry.clear();
            return Err(FeedError {
                frames,
                error: StreamError::malformed(format!(
                    "unterminated record exceeds {} bytes",
                    self.max_pending_bytes
                )),
            });
        }
        Ok(frames)
    }

    /// Text buffered after the last line boundary.
    pub fn carry_over(&self) -> &str {
        &self.carry
    }
}

impl FrameParser for ChunkedFrameParser {
    fn feed(&mut self, chunk: &[u8]) -> Result<Vec<Frame>, FeedError> {
        let text = self.utf8.decode(chunk);
        self.feed_text(&text)
    }

    /// A final `data: [DONE]` without its newline still ends the stream;
    /// any other unterminated line is dropped.
    fn finish(&mut self) -> Vec<Frame> {
        let tail = self.utf8.finish();
        self.carry.push_str(&tail);
        let rest = std::mem::take(&mut self.carry);
        parse_data_line(&rest)
            .filter(|frame| frame.data == DONE_SENTINEL)
            .into_iter()
            .collect()
    }

    fn reset(&mut self) {
        self.utf8.reset();
        self.carry.clear();
    }
}

fn parse_data_line(line: &str) -> Option<Frame> {
    let payload = line.trim().strip_prefix("data:")?;
    Some(Frame::message(payload.trim()))
}

/// Parser for `text/event-stream` bodies.
///
/// Records end at a blank line; `\r\n`, `\n` and a bare `\r` all end a line.
/// `event:` names the frame, repeated `data:` lines are joined with `\n`, and
/// comments (`:`) or unknown fields are skipped. A record still open when the
/// stream ends is discarded.
#[derive(Debug)]
pub struct SseFrameParser {
    buf: Vec<u8>,
    scanned: usize,
    after_cr: bool,
    max_pending_bytes: usize,
}

impl Default for SseFrameParser {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PENDING_BYTES)
    }
}

impl SseFrameParser {
    /// Creates a parser that fails once an unterminated record exceeds
    /// `max_pending_bytes`.
    pub fn new(max_pending_bytes: usize) -> Self {
        Self {
            buf: Vec::new(),
            scanned: 0,
            after_cr: false,
            max_pending_bytes,
        }
    }

    /// Appends `chunk` with every line ending rewritten to `\n`.
    fn push_normalized(&mut self, chunk: &[u8]) {
        self.buf.reserve(chunk.len());
        for &byte in chunk {
            let after_cr = std::mem::replace(&mut self.after_cr, byte == b'\r');
            match byte {
                b'\r' => self.buf.push(b'\n'),
                b'\n' if after_cr => {}
                _ => self.buf.push(byte),
            }
        }
    }
}

impl FrameParser for SseFrameParser {
    fn feed(&mut self, chunk: &[u8]) -> Result<Vec<Frame>, FeedError> {
        self.push_normalized(chunk);
        let mut frames = Vec::new();
        while let Some(idx) = find_blank_line(&self.buf, self.scanned) {
            let record: Vec<u8> = self.buf.drain(..idx + 2).collect();
            self.scanned = 0;
            if let Some(frame) = parse_sse_record(&record[..idx]) {
                frames.push(frame);
            }
        }
        // the first half of a blank line may end this chunk
        self.scanned = self.buf.len().saturating_sub(1);
        if self.buf.len() > self.max_pending_bytes {
            self.buf.clear();
            self.scanned = 0;
            return Err(FeedError {
                frames,
                error: StreamError::malformed(format!(
                    "unterminated event exceeds {} bytes",
                    self.max_pending_bytes
                )),
            });
        }
        Ok(frames)
    }

    fn finish(&mut self) -> Vec<Frame> {
        self.reset();
        Vec::new()
    }

    fn reset(&mut self) {
        self.buf.clear();
        self.scanned = 0;
        self.after_cr = false;
    }
}

fn find_blank_line(buf: &[u8], from: usize) -> Option<usize> {
    buf.get(from..)?
        .windows(2)
        .position(|pair| pair == b"\n\n")
        .map(|pos| from + pos)
}

fn parse_sse_record(bytes: &[u8]) -> Option<Frame> {
    if bytes.is_empty() {
        return None;
    }
    let text = String::from_utf8_lossy(bytes);
    let mut event: Option<String> = None;
    let mut data_lines: Vec<&str> = Vec::new();
    for line in text.split('\n') {
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = line.split_once(':').unwrap_or((line, ""));
        let value = value.strip_prefix(' ').unwrap_or(value);
        match field {
            "event" => event = Some(value.to_string()),
            "data" => data_lines.push(value),
            _ => {}
        }
    }
    if event.is_none() && data_lines.is_empty() {
        return None;
    }
    Some(Frame {
        event_name: event
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| DEFAULT_EVENT_NAME.to_string()),
        data: data_lines.join("\n"),
    })
}
