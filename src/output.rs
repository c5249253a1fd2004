//! Server log storage and text handling.
//!
//! Output arrives as raw byte lines from the child. [`decode_line`] turns each one into
//! text without ever failing, and [`LogBuffer`] keeps a bounded history for the log view.

use std::collections::VecDeque;

use strip_ansi_escapes::strip;

/// Where a log line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
    /// Printed by the server process.
    Server,
    /// Written by llamarack itself (start banner, stop notices, errors).
    Notice,
}

/// A single line in the log view.
#[derive(Debug, Clone)]
pub struct LogLine {
    pub text: String,
    pub kind: LineKind,
}

impl LogLine {
    pub fn server(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            kind: LineKind::Server,
        }
    }

    pub fn notice(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            kind: LineKind::Notice,
        }
    }
}

/// A fixed-capacity ring buffer of log lines.
#[derive(Debug, Clone)]
pub struct LogBuffer {
    max_lines: usize,
    lines: VecDeque<LogLine>,
}

impl LogBuffer {
    pub fn new(max_lines: usize) -> Self {
        let max_lines = max_lines.max(1);
        Self {
            max_lines,
            lines: VecDeque::with_capacity(max_lines.min(1024)),
        }
    }

    /// Adds a line, returning `true` if the oldest line was dropped to make room.
    pub fn push(&mut self, line: LogLine) -> bool {
        let mut dropped = false;
        self.lines.push_back(line);
        while self.lines.len() > self.max_lines {
            self.lines.pop_front();
            dropped = true;
        }
        dropped
    }

    pub fn clear(&mut self) {
        self.lines.clear();
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LogLine> {
        self.lines.iter()
    }
}

/// Decodes one line of child output.
///
/// UTF-8 is tried first; anything else is read as Latin-1, which maps every byte to a
/// character, so decoding cannot fail. A trailing `\n` or `\r\n` is removed.
pub fn decode_line(mut bytes: Vec<u8>) -> String {
    if bytes.last() == Some(&b'\n') {
        bytes.pop();
        if bytes.last() == Some(&b'\r') {
            bytes.pop();
        }
    }
    match String::from_utf8(bytes) {
        Ok(text) => text,
        Err(err) => err.into_bytes().into_iter().map(char::from).collect(),
    }
}

/// Strips ANSI escape sequences and carriage-return overwrites for display.
pub fn sanitize_text(text: &str) -> String {
    let stripped = strip(text.as_bytes());
    let plain = String::from_utf8_lossy(&stripped);
    match plain.rfind('\r') {
        Some(idx) => plain[idx + 1..].to_string(),
        None => plain.into_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_buffer_drops_oldest() {
        let mut buffer = LogBuffer::new(2);
        buffer.push(LogLine::server("a"));
        buffer.push(LogLine::notice("b"));
        let dropped = buffer.push(LogLine::server("c"));
        assert!(dropped);
        let lines = buffer.iter().map(|l| l.text.clone()).collect::<Vec<_>>();
        assert_eq!(lines, vec!["b", "c"]);
        buffer.clear();
        assert!(buffer.is_empty());
    }

    #[test]
    fn decode_line_prefers_utf8() {
        assert_eq!(decode_line("héllo ✓\n".as_bytes().to_vec()), "héllo ✓");
        assert_eq!(decode_line(b"crlf\r\n".to_vec()), "crlf");
        assert_eq!(decode_line(b"no newline".to_vec()), "no newline");
    }

    #[test]
    fn decode_line_falls_back_to_latin1() {
        // 0xE9 alone is invalid UTF-8 but is 'é' in Latin-1.
        assert_eq!(decode_line(vec![b'c', b'a', b'f', 0xE9, b'\n']), "café");
        assert_eq!(decode_line(vec![0xFF, 0xFE]), "ÿþ");
    }

    #[test]
    fn sanitize_strips_ansi_and_carriage_returns() {
        assert_eq!(sanitize_text("\u{1b}[32mok\u{1b}[0m"), "ok");
        assert_eq!(sanitize_text("10%\r55%"), "55%");
    }
}
