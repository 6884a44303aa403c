//! Bounded diagnostic log filled during instantiation.
//!
//! The log is a fixed-capacity byte buffer. Text is written into every byte
//! but the last one, which is a sentinel: `1` if something did not fit, `0`
//! if the log is complete.

use std::fmt;

pub const DEFAULT_LOG_CAPACITY: usize = 512;

const TRUNCATED: u8 = 1;

#[derive(Clone, PartialEq, Eq)]
pub struct DiagnosticLog {
    buf: Vec<u8>,
    len: usize,
}

impl DiagnosticLog {
    /// Creates an empty log. A capacity of zero is raised to one, which
    /// leaves room for the sentinel only.
    pub fn with_capacity(capacity: usize) -> Self {
        DiagnosticLog {
            buf: vec![0; capacity.max(1)],
            len: 0,
        }
    }

    /// Appends `line` followed by a newline, truncating if the buffer is full.
    pub fn push_line(&mut self, line: &str) {
        if self.is_truncated() {
            return;
        }
        let room = self.buf.len() - 1 - self.len;
        let needed = line.len() + 1;
        if needed <= room {
            self.buf[self.len..self.len + line.len()].copy_from_slice(line.as_bytes());
            self.buf[self.len + line.len()] = b'\n';
            self.len += needed;
        } else {
            let take = floor_char_boundary(line, room);
            self.buf[self.len..self.len + take].copy_from_slice(&line.as_bytes()[..take]);
            self.len += take;
            let last = self.buf.len() - 1;
            self.buf[last] = TRUNCATED;
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn is_truncated(&self) -> bool {
        self.buf[self.buf.len() - 1] == TRUNCATED
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The whole buffer, sentinel byte included.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// The text written so far.
    pub fn text(&self) -> &str {
        // Only whole characters are ever copied in.
        std::str::from_utf8(&self.buf[..self.len]).unwrap_or_default()
    }

    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.text().lines()
    }
}

impl Default for DiagnosticLog {
    fn default() -> Self {
        DiagnosticLog::with_capacity(DEFAULT_LOG_CAPACITY)
    }
}

impl fmt::Debug for DiagnosticLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiagnosticLog")
            .field("capacity", &self.capacity())
            .field("truncated", &self.is_truncated())
            .field("text", &self.text())
            .finish()
    }
}

impl fmt::Display for DiagnosticLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.text())
    }
}

fn floor_char_boundary(s: &str, max: usize) -> usize {
    if max >= s.len() {
        return s.len();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    end
}
