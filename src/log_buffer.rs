//! Bounded rolling window of the child's recent output.
//!
//! Bytes arrive in arbitrary chunks from the process channel. They are decoded
//! as UTF-8 incrementally (a multi-byte sequence split across two chunks is held
//! back until it completes), split on line terminators, and pushed onto a
//! fixed-capacity FIFO. Progress-bar output that rewrites the current line with
//! a bare `\r` replaces the in-progress line instead of piling up copies.

use std::collections::VecDeque;

/// Where the line assembler is relative to the last carriage return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineState {
    /// Characters extend the partial line.
    Appending,
    /// A `\r` was seen. The next printable character starts the line over;
    /// a `\n` commits the partial line as-is (CRLF).
    Rewinding,
}

#[derive(Debug, Clone)]
pub struct LogBuffer {
    capacity: usize,
    lines: VecDeque<String>,
    partial: String,
    state: LineState,
    /// Trailing bytes of an incomplete UTF-8 sequence from the previous chunk.
    pending: Vec<u8>,
}

impl LogBuffer {
    /// Create a buffer holding at most `capacity` lines (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            lines: VecDeque::with_capacity(capacity),
            partial: String::new(),
            state: LineState::Appending,
            pending: Vec::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Feed a raw chunk of process output.
    pub fn append(&mut self, chunk: &[u8]) {
        if chunk.is_empty() {
            return;
        }

        let mut bytes = std::mem::take(&mut self.pending);
        bytes.extend_from_slice(chunk);

        let mut rest = bytes.as_slice();
        loop {
            match std::str::from_utf8(rest) {
                Ok(text) => {
                    self.feed_text(text);
                    break;
                }
                Err(err) => {
                    let (valid, tail) = rest.split_at(err.valid_up_to());
                    if let Ok(text) = std::str::from_utf8(valid) {
                        self.feed_text(text);
                    }
                    match err.error_len() {
                        Some(bad) => {
                            self.feed_char(char::REPLACEMENT_CHARACTER);
                            rest = &tail[bad..];
                        }
                        None => {
                            // Incomplete sequence at the end of the chunk.
                            self.pending = tail.to_vec();
                            break;
                        }
                    }
                }
            }
        }
    }

    /// Commit the in-progress line, if any. Called once the process has exited
    /// and no more output will arrive.
    pub fn flush(&mut self) {
        if !self.pending.is_empty() {
            self.pending.clear();
            self.feed_char(char::REPLACEMENT_CHARACTER);
        }
        if !self.partial.is_empty() {
            let line = std::mem::take(&mut self.partial);
            self.commit(line);
        }
        self.state = LineState::Appending;
    }

    /// Copy of the committed lines, oldest first.
    #[allow(dead_code)]
    pub fn snapshot(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }

    /// Committed lines followed by the in-progress line, trimmed to capacity.
    /// This is what the dashboard shows: a progress bar that has not printed
    /// its newline yet is still visible.
    pub fn view(&self) -> impl Iterator<Item = &str> {
        let partial = self.partial();
        let shown = self.lines.len() + usize::from(partial.is_some());
        let skip = shown.saturating_sub(self.capacity);
        self.lines
            .iter()
            .map(String::as_str)
            .chain(partial)
            .skip(skip)
    }

    /// The uncommitted line, if any.
    pub fn partial(&self) -> Option<&str> {
        (!self.partial.is_empty()).then_some(self.partial.as_str())
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty() && self.partial.is_empty()
    }

    fn feed_text(&mut self, text: &str) {
        for c in text.chars() {
            self.feed_char(c);
        }
    }

    fn feed_char(&mut self, c: char) {
        match (c, self.state) {
            ('\n', _) => {
                let line = std::mem::take(&mut self.partial);
                self.commit(line);
                self.state = LineState::Appending;
            }
            ('\r', _) => self.state = LineState::Rewinding,
            (c, LineState::Rewinding) => {
                self.partial.clear();
                self.partial.push(c);
                self.state = LineState::Appending;
            }
            (c, LineState::Appending) => self.partial.push(c),
        }
    }

    fn commit(&mut self, line: String) {
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evicts_oldest_lines_past_capacity() {
        let mut buf = LogBuffer::new(3);
        for chunk in ["a\n", "b\n", "c\n", "d\n"] {
            buf.append(chunk.as_bytes());
        }
        assert_eq!(buf.snapshot(), vec!["b", "c", "d"]);
    }

    #[test]
    fn test_carriage_return_overwrites_partial_line() {
        let mut buf = LogBuffer::new(10);
        buf.append(b"Epoch 1\r");
        buf.append(b"Epoch 2\r");
        assert!(buf.snapshot().is_empty());
        assert_eq!(buf.partial(), Some("Epoch 2"));

        buf.append(b"Epoch 2\n");
        assert_eq!(buf.snapshot(), vec!["Epoch 2"]);
        assert_eq!(buf.partial(), None);
    }

    #[test]
    fn test_progress_bar_in_single_chunk() {
        let mut buf = LogBuffer::new(10);
        buf.append(b"\r 10%|#\r 50%|#####\r100%|##########\n");
        assert_eq!(buf.snapshot(), vec!["100%|##########"]);
    }

    #[test]
    fn test_crlf_commits_line_unchanged() {
        let mut buf = LogBuffer::new(10);
        buf.append(b"first\r\nsecond\r\n");
        assert_eq!(buf.snapshot(), vec!["first", "second"]);
    }

    #[test]
    fn test_crlf_split_across_chunks() {
        let mut buf = LogBuffer::new(10);
        buf.append(b"first\r");
        buf.append(b"\nsecond\n");
        assert_eq!(buf.snapshot(), vec!["first", "second"]);
    }

    #[test]
    fn test_partial_line_prefixes_next_append() {
        let mut buf = LogBuffer::new(10);
        buf.append(b"hel");
        buf.append(b"lo wor");
        buf.append(b"ld\nnext");
        assert_eq!(buf.snapshot(), vec!["hello world"]);
        assert_eq!(buf.partial(), Some("next"));
    }

    #[test]
    fn test_empty_chunk_is_noop() {
        let mut buf = LogBuffer::new(10);
        buf.append(b"x");
        buf.append(b"");
        assert_eq!(buf.partial(), Some("x"));
        assert!(buf.snapshot().is_empty());
    }

    #[test]
    fn test_multibyte_sequence_split_across_chunks() {
        let mut buf = LogBuffer::new(10);
        let text = "caffè ☕\n".as_bytes();
        // Split inside the three-byte cup and inside the two-byte è.
        let cup = text.len() - 3;
        buf.append(&text[..5]);
        buf.append(&text[5..cup]);
        buf.append(&text[cup..]);
        assert_eq!(buf.snapshot(), vec!["caffè ☕"]);
    }

    #[test]
    fn test_byte_by_byte_decoding() {
        let mut buf = LogBuffer::new(10);
        for byte in "über 🚀\n".as_bytes() {
            buf.append(std::slice::from_ref(byte));
        }
        assert_eq!(buf.snapshot(), vec!["über 🚀"]);
    }

    #[test]
    fn test_invalid_bytes_become_replacement_char() {
        let mut buf = LogBuffer::new(10);
        buf.append(b"ok \xff\xfe done\n");
        assert_eq!(buf.snapshot(), vec!["ok \u{fffd}\u{fffd} done"]);
    }

    #[test]
    fn test_flush_commits_partial_line() {
        let mut buf = LogBuffer::new(10);
        buf.append(b"no newline at end");
        buf.flush();
        assert_eq!(buf.snapshot(), vec!["no newline at end"]);
        assert_eq!(buf.partial(), None);

        // Flushing again is harmless.
        buf.flush();
        assert_eq!(buf.len(), 1);
    }

    #[test]
    fn test_flush_with_truncated_multibyte_tail() {
        let mut buf = LogBuffer::new(10);
        buf.append(b"cut \xe2\x98");
        buf.flush();
        assert_eq!(buf.snapshot(), vec!["cut \u{fffd}"]);
    }

    #[test]
    fn test_view_includes_partial_and_respects_capacity() {
        let mut buf = LogBuffer::new(3);
        buf.append(b"a\nb\nc\n 42%");
        let view: Vec<&str> = buf.view().collect();
        assert_eq!(view, vec!["b", "c", " 42%"]);
    }

    #[test]
    fn test_capacity_never_exceeded_for_many_chunks() {
        let mut buf = LogBuffer::new(5);
        for i in 0..200 {
            let chunk = format!("line {i}\n{}", if i % 7 == 0 { "\r" } else { "" });
            buf.append(chunk.as_bytes());
            assert!(buf.len() <= 5);
            assert!(buf.view().count() <= 5);
        }
        assert_eq!(
            buf.snapshot(),
            vec!["line 195", "line 196", "line 197", "line 198", "line 199"]
        );
    }

    #[test]
    fn test_zero_capacity_is_clamped_to_one() {
        let mut buf = LogBuffer::new(0);
        assert_eq!(buf.capacity(), 1);
        buf.append(b"a\nb\n");
        assert_eq!(buf.snapshot(), vec!["b"]);
    }

    #[test]
    fn test_blank_lines_are_kept() {
        let mut buf = LogBuffer::new(10);
        buf.append(b"a\n\nb\n");
        assert_eq!(buf.snapshot(), vec!["a", "", "b"]);
    }
}
