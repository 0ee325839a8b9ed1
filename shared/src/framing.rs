//! Newline-delimited framing for the stream transport.
//!
//! TCP has no message boundaries, so bytes accumulate in a [`LineFramer`]
//! until a `\n` arrives. Each complete line is cleaned up (surrounding
//! whitespace and leading non-printable bytes removed) and handed back as
//! text. The trailing, possibly incomplete line stays buffered for the next
//! read.

use crate::MAX_LINE_BYTES;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("line is not valid UTF-8")]
    InvalidUtf8,
    #[error("line exceeded {limit} bytes without a terminator ({len} buffered)")]
    Overflow { len: usize, limit: usize },
}

/// Accumulates stream bytes and yields complete, cleaned lines.
#[derive(Debug)]
pub struct LineFramer {
    buffer: Vec<u8>,
    /// Bytes of `buffer` already known to contain no `\n`.
    scanned: usize,
    limit: usize,
}

impl LineFramer {
    pub fn new() -> Self {
        Self::with_limit(MAX_LINE_BYTES)
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            buffer: Vec::new(),
            scanned: 0,
            limit,
        }
    }

    /// Appends freshly read bytes to the partial buffer.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Returns the next complete non-empty line, if one is buffered.
    ///
    /// Lines that are empty after cleanup are skipped. A line that fails to
    /// decode is reported as an error and consumed, so the caller can keep
    /// pulling the lines behind it. When the unterminated remainder grows
    /// past the limit it is discarded and reported as an overflow.
    pub fn next_line(&mut self) -> Option<Result<String, FrameError>> {
        loop {
            let Some(offset) = self.buffer[self.scanned..].iter().position(|&b| b == b'\n')
            else {
                self.scanned = self.buffer.len();
                if self.buffer.len() > self.limit {
                    let len = self.buffer.len();
                    self.clear();
                    return Some(Err(FrameError::Overflow {
                        len,
                        limit: self.limit,
                    }));
                }
                return None;
            };

            let end = self.scanned + offset;
            let raw: Vec<u8> = self.buffer.drain(..=end).collect();
            self.scanned = 0;

            match clean_line(&raw[..raw.len() - 1]) {
                Ok(Some(line)) => return Some(Ok(line)),
                Ok(None) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
    }

    /// Bytes held back waiting for a terminator.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
        self.scanned = 0;
    }
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::new()
    }
}

/// Strips leading non-printable bytes and trailing whitespace, then decodes.
fn clean_line(raw: &[u8]) -> Result<Option<String>, FrameError> {
    let start = raw
        .iter()
        .position(|b| b.is_ascii_graphic())
        .unwrap_or(raw.len());
    let end = raw
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1)
        .max(start);

    let trimmed = &raw[start..end];
    if trimmed.is_empty() {
        return Ok(None);
    }

    std::str::from_utf8(trimmed)
        .map(|s| Some(s.to_string()))
        .map_err(|_| FrameError::InvalidUtf8)
}
