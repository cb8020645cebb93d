// ABOUTME: Incremental line framer decoupling pipe chunking from protocol framing
//
// Engine stdout arrives in arbitrary byte chunks. LineBuffer accepts those chunks
// and yields complete newline-terminated lines in program order, keeping any
// unterminated tail until more bytes (or end of stream) arrive.

use std::collections::VecDeque;

/// Maximum bytes retained for a single unterminated line.
///
/// Engines never emit lines anywhere near this long; a runaway line is cut
/// here so a misbehaving process cannot grow the buffer without bound.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// Byte-chunk to line framer
#[derive(Debug, Default)]
pub struct LineBuffer {
    /// Bytes of the current unterminated line
    partial: Vec<u8>,

    /// Complete lines not yet handed out
    ready: VecDeque<String>,

    /// Number of lines that were cut at `MAX_LINE_BYTES`
    truncated: u64,
}

impl LineBuffer {
    /// Create an empty buffer
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of bytes read from the engine
    ///
    /// Both `\n` and `\r\n` terminate a line. Invalid UTF-8 is replaced
    /// rather than rejected.
    pub fn push(&mut self, chunk: &[u8]) {
        for &byte in chunk {
            if byte == b'\n' {
                self.complete_line();
            } else if self.partial.len() < MAX_LINE_BYTES {
                self.partial.push(byte);
            } else if self.partial.len() == MAX_LINE_BYTES {
                // Mark once; the rest of the line is dropped until the newline
                self.truncated += 1;
                self.partial.push(byte);
            }
        }
    }

    /// Take the next complete line, if any
    pub fn next_line(&mut self) -> Option<String> {
        self.ready.pop_front()
    }

    /// Flush the unterminated tail as a final line (used at end of stream)
    pub fn finish(&mut self) -> Option<String> {
        if self.partial.is_empty() {
            return None;
        }
        self.complete_line();
        self.ready.pop_back()
    }

    /// Number of complete lines waiting to be taken
    #[must_use]
    pub fn pending_lines(&self) -> usize {
        self.ready.len()
    }

    /// Whether an unterminated tail is buffered
    #[must_use]
    pub fn has_partial(&self) -> bool {
        !self.partial.is_empty()
    }

    /// Number of over-long lines that were cut
    #[must_use]
    pub const fn truncated_lines(&self) -> u64 {
        self.truncated
    }

    /// Drop everything buffered
    pub fn clear(&mut self) {
        self.partial.clear();
        self.ready.clear();
    }

    fn complete_line(&mut self) {
        self.partial.truncate(MAX_LINE_BYTES);
        if self.partial.last() == Some(&b'\r') {
            self.partial.pop();
        }
        let line = String::from_utf8_lossy(&self.partial).into_owned();
        self.partial.clear();
        self.ready.push_back(line);
    }
}
