//! Partial object scanner
//!
//! String-aware depth scanning over a buffer that may end anywhere, including
//! inside a string literal or an escape sequence. Nothing here blocks or
//! allocates per byte; callers re-run a scan from the same offset once more
//! bytes have arrived.
//!
//! Two levels are scanned:
//! - the top-level frame (one upstream event object), tracked incrementally
//!   by [`FrameTracker`];
//! - the elements of the frame's `"parts": [...]` array, extracted one at a
//!   time by [`PartsCursor::find_next_complete_object`] while the frame is
//!   still open.

use std::ops::Range;

use serde_json::Value;

/// Explicit end-of-stream marker some upstreams write between objects
pub const DONE_MARKER: &str = "[DONE]";

/// Key whose array holds the content units
const PARTS_KEY: &[u8] = b"\"parts\"";

/// Result of looking for the next element of the parts array
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanOutcome {
    /// A balanced `{...}` span; scanning resumes at `span.end`
    Complete(Range<usize>),

    /// The array (or its enclosing object) closed; resume at `next`
    Exhausted { next: usize },

    /// The buffer ran out first; retry from the same offset later
    Incomplete,
}

/// Whether the bytes at a quote start the `"parts": [` key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyMatch {
    /// Offset just past the array's `[`
    Found(usize),
    NoMatch,

    /// The buffer ends before it can be decided
    NeedMore,
}

fn match_parts_key(bytes: &[u8], quote: usize) -> KeyMatch {
    let key_end = quote + PARTS_KEY.len();
    if bytes.len() < key_end {
        return if PARTS_KEY.starts_with(&bytes[quote..]) {
            KeyMatch::NeedMore
        } else {
            KeyMatch::NoMatch
        };
    }
    if &bytes[quote..key_end] != PARTS_KEY {
        return KeyMatch::NoMatch;
    }

    let colon = skip_whitespace(bytes, key_end);
    match bytes.get(colon) {
        None => KeyMatch::NeedMore,
        Some(b':') => {
            let bracket = skip_whitespace(bytes, colon + 1);
            match bytes.get(bracket) {
                None => KeyMatch::NeedMore,
                Some(b'[') => KeyMatch::Found(bracket + 1),
                Some(_) => KeyMatch::NoMatch,
            }
        }
        Some(_) => KeyMatch::NoMatch,
    }
}

/// String-literal state of a byte-at-a-time scan
#[derive(Debug, Clone, Copy, Default)]
struct Lexer {
    in_string: bool,
    escaped: bool,
}

impl Lexer {
    /// Consume one byte; `true` when it is structural (outside any string)
    fn step(&mut self, b: u8) -> bool {
        if self.in_string {
            if self.escaped {
                self.escaped = false;
            } else if b == b'\\' {
                self.escaped = true;
            } else if b == b'"' {
                self.in_string = false;
            }
            return false;
        }
        if b == b'"' {
            self.in_string = true;
            return false;
        }
        true
    }
}

/// Resumable scan over one frame's parts array.
///
/// Offsets are relative to the frame start. The frame text handed in on
/// each call must extend the text of the previous call; every byte is
/// examined once however many chunks the frame arrives in.
#[derive(Debug, Clone, Default)]
pub struct PartsCursor {
    pos: usize,
    lexer: Lexer,
    array_start: Option<usize>,
    depth: usize,
    element_start: Option<usize>,
    done: bool,
}

impl PartsCursor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offset just past the parts array's `[`, once it has been seen
    pub fn array_start(&self) -> Option<usize> {
        self.array_start
    }

    /// The parts array (or its enclosing object) has closed
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Find the next complete object element of the parts array in `frame`.
    ///
    /// Only a `"parts"` key outside any string literal, followed by `:` and
    /// `[` (whitespace allowed), introduces the array. Braces and quotes
    /// inside strings are ignored, escapes included. Nested arrays at
    /// element level are skipped; a closing bracket at element level ends
    /// the array. `Incomplete` leaves the cursor ready to continue once
    /// more bytes are in.
    pub fn find_next_complete_object(&mut self, frame: &str) -> ScanOutcome {
        let bytes = frame.as_bytes();
        if self.done {
            return ScanOutcome::Exhausted { next: self.pos };
        }

        if self.array_start.is_none() {
            while self.pos < bytes.len() {
                let b = bytes[self.pos];
                if b == b'"' && !self.lexer.in_string {
                    match match_parts_key(bytes, self.pos) {
                        KeyMatch::Found(start) => {
                            self.array_start = Some(start);
                            self.pos = start;
                            break;
                        }
                        KeyMatch::NeedMore => return ScanOutcome::Incomplete,
                        KeyMatch::NoMatch => {}
                    }
                }
                self.lexer.step(b);
                self.pos += 1;
            }
            if self.array_start.is_none() {
                return ScanOutcome::Incomplete;
            }
        }

        while self.pos < bytes.len() {
            let i = self.pos;
            let b = bytes[i];
            self.pos += 1;
            if !self.lexer.step(b) {
                continue;
            }

            match b {
                b'{' | b'[' => {
                    if self.depth == 0 && b == b'{' {
                        self.element_start = Some(i);
                    }
                    self.depth += 1;
                }
                b'}' | b']' => {
                    if self.depth == 0 {
                        self.done = true;
                        return ScanOutcome::Exhausted { next: self.pos };
                    }
                    self.depth -= 1;
                    if self.depth == 0 {
                        if let Some(start) = self.element_start.take() {
                            return ScanOutcome::Complete(start..self.pos);
                        }
                    }
                }
                _ => {}
            }
        }

        ScanOutcome::Incomplete
    }
}

/// What lies next at the top level of the stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopLevel {
    /// A frame opens at this offset
    Object(usize),

    /// The explicit end marker; `next` is just past it
    Done { next: usize },

    /// Nothing yet; bytes before `safe` can be discarded
    Pending { safe: usize },
}

/// Skip framing noise (whitespace, commas, array brackets, `data:` prefixes)
/// and report the next frame start or end marker at or after `from`.
pub fn find_top_level(buf: &str, from: usize) -> TopLevel {
    let tail = buf.get(from..).unwrap_or("");
    let brace = tail.find('{');
    let done = tail.find(DONE_MARKER);

    match (brace, done) {
        (Some(b), Some(d)) if d < b => TopLevel::Done {
            next: from + d + DONE_MARKER.len(),
        },
        (Some(b), _) => TopLevel::Object(from + b),
        (None, Some(d)) => TopLevel::Done {
            next: from + d + DONE_MARKER.len(),
        },
        (None, None) => {
            // Keep enough bytes to recognise a marker split across chunks
            let mut safe = buf.len().saturating_sub(DONE_MARKER.len() - 1).max(from);
            while !buf.is_char_boundary(safe) {
                safe -= 1;
            }
            TopLevel::Pending { safe }
        }
    }
}

/// State of a top-level frame after scanning the bytes seen so far
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    /// Depth returned to zero; the frame ends just before this offset
    Complete(usize),

    /// A raw newline appeared inside a string literal; resume at this offset
    Broken(usize),

    /// More bytes needed
    Pending,
}

/// Incremental depth tracker for one top-level frame.
///
/// Resumes where the previous call stopped, so a long frame arriving in many
/// chunks is scanned once overall.
#[derive(Debug, Clone)]
pub struct FrameTracker {
    pos: usize,
    depth: usize,
    in_string: bool,
    escaped: bool,
}

impl FrameTracker {
    /// Start tracking at the frame's opening brace
    pub fn new(start: usize) -> Self {
        Self {
            pos: start,
            depth: 0,
            in_string: false,
            escaped: false,
        }
    }

    pub fn advance(&mut self, buf: &str) -> FrameStatus {
        let bytes = buf.as_bytes();

        while self.pos < bytes.len() {
            let b = bytes[self.pos];
            self.pos += 1;

            if self.in_string {
                if self.escaped {
                    self.escaped = false;
                } else if b == b'\\' {
                    self.escaped = true;
                } else if b == b'"' {
                    self.in_string = false;
                } else if b == b'\n' {
                    return FrameStatus::Broken(self.pos);
                }
                continue;
            }

            match b {
                b'"' => self.in_string = true,
                b'{' | b'[' => self.depth += 1,
                b'}' | b']' => {
                    self.depth = self.depth.saturating_sub(1);
                    if self.depth == 0 {
                        return FrameStatus::Complete(self.pos);
                    }
                }
                _ => {}
            }
        }

        FrameStatus::Pending
    }
}

/// Read a string-valued field of the outermost object in `buf`.
///
/// `buf` starts at the object's `{` and may be truncated; `None` when the
/// field is absent, not a string, or not fully received.
pub fn peek_string_field(buf: &str, key: &str) -> Option<String> {
    let bytes = buf.as_bytes();
    let mut depth = 0usize;
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'"' => {
                let end = string_end(bytes, i)?;
                if depth == 1 && &buf[i + 1..end] == key {
                    let mut j = skip_whitespace(bytes, end + 1);
                    if bytes.get(j) == Some(&b':') {
                        j = skip_whitespace(bytes, j + 1);
                        if bytes.get(j) == Some(&b'"') {
                            let value_end = string_end(bytes, j)?;
                            return serde_json::from_str(&buf[j..=value_end]).ok();
                        }
                    }
                }
                i = end + 1;
                continue;
            }
            b'{' | b'[' => depth += 1,
            b'}' | b']' => depth = depth.saturating_sub(1),
            _ => {}
        }
        i += 1;
    }

    None
}

/// Best-effort parse of a frame cut off mid-stream.
///
/// Closes an open string and every open bracket. When that is still not
/// valid JSON (say, a dangling key), retries with the fragment cut back to
/// each earlier separator.
pub fn parse_truncated(fragment: &str) -> Option<Value> {
    const MAX_ATTEMPTS: usize = 8;

    let mut end = fragment.len();
    for _ in 0..MAX_ATTEMPTS {
        let (candidate, last_separator) = close_truncated(&fragment[..end]);
        if let Ok(value) = serde_json::from_str(&candidate) {
            return Some(value);
        }
        end = last_separator?;
    }

    None
}

/// Close an open string and all open brackets of `fragment`.
///
/// Also returns the offset of the last `,` seen outside a string, where a
/// shorter retry can cut.
fn close_truncated(fragment: &str) -> (String, Option<usize>) {
    let bytes = fragment.as_bytes();
    let mut closers = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    let mut last_separator = None;

    for (i, &b) in bytes.iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => closers.push('}'),
            b'[' => closers.push(']'),
            b'}' | b']' => {
                closers.pop();
            }
            b',' => last_separator = Some(i),
            _ => {}
        }
    }

    let mut repaired = fragment.to_string();
    if in_string {
        if escaped {
            repaired.pop();
        }
        repaired.push('"');
    } else {
        let trimmed_len = repaired.trim_end().len();
        repaired.truncate(trimmed_len);
        if repaired.ends_with(',') {
            repaired.pop();
        } else if repaired.ends_with(':') {
            repaired.push_str("null");
        }
    }
    repaired.extend(closers.iter().rev());

    (repaired, last_separator)
}

/// Index of the quote closing the string opened at `open`
fn string_end(bytes: &[u8], open: usize) -> Option<usize> {
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate().skip(open + 1) {
        if escaped {
            escaped = false;
        } else if b == b'\\' {
            escaped = true;
        } else if b == b'"' {
            return Some(i);
        }
    }
    None
}

fn skip_whitespace(bytes: &[u8], mut i: usize) -> usize {
    while i < bytes.len() && bytes[i].is_ascii_whitespace() {
        i += 1;
    }
    i
}
