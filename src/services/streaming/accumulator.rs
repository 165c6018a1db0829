//! Growable text buffer fed by upstream chunks
//!
//! Upstream chunk boundaries are arbitrary, so a multi-byte UTF-8 sequence may
//! be split across two chunks. The accumulator holds back an incomplete
//! trailing sequence until the rest arrives; invalid bytes are replaced with
//! U+FFFD rather than failing the stream.

/// Append-only text store with front compaction
#[derive(Debug, Default)]
pub struct ByteAccumulator {
    /// Decoded text
    buffer: String,

    /// Trailing bytes of an incomplete UTF-8 sequence
    pending: Vec<u8>,

    /// Bytes dropped from the front by [`ByteAccumulator::compact`]
    discarded: usize,
}

impl ByteAccumulator {
    /// Create an empty accumulator
    pub fn new() -> Self {
        Self::default()
    }

    /// Concatenate a chunk onto the buffer
    pub fn append(&mut self, chunk: &[u8]) {
        self.pending.extend_from_slice(chunk);

        let mut start = 0;
        loop {
            match std::str::from_utf8(&self.pending[start..]) {
                Ok(text) => {
                    self.buffer.push_str(text);
                    self.pending.clear();
                    return;
                }
                Err(e) => {
                    let valid_end = start + e.valid_up_to();
                    if let Ok(text) = std::str::from_utf8(&self.pending[start..valid_end]) {
                        self.buffer.push_str(text);
                    }

                    match e.error_len() {
                        Some(len) => {
                            self.buffer.push(char::REPLACEMENT_CHARACTER);
                            start = valid_end + len;
                        }
                        None => {
                            // Incomplete sequence at the end: wait for more bytes
                            self.pending.drain(..valid_end);
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Decode whatever is still held back, replacing it lossily
    pub fn flush_pending(&mut self) {
        if !self.pending.is_empty() {
            let tail = String::from_utf8_lossy(&self.pending).into_owned();
            self.buffer.push_str(&tail);
            self.pending.clear();
        }
    }

    /// View from `offset` to the end of the buffer
    #[must_use]
    pub fn suffix_from(&self, offset: usize) -> &str {
        self.buffer.get(offset..).unwrap_or("")
    }

    /// The whole retained buffer
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.buffer
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Total bytes ever dropped from the front
    #[must_use]
    pub fn discarded(&self) -> usize {
        self.discarded
    }

    /// Drop everything before `offset`, returning how many bytes were dropped.
    ///
    /// Callers must rebase any offsets they hold by the returned amount.
    pub fn compact(&mut self, offset: usize) -> usize {
        let mut offset = offset.min(self.buffer.len());
        while !self.buffer.is_char_boundary(offset) {
            offset -= 1;
        }
        self.buffer.drain(..offset);
        self.discarded += offset;
        offset
    }
}
