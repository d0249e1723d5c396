//! Line framing for `text/event-stream` bodies read chunk by chunk.
//!
//! Bytes are buffered raw and only complete lines are decoded, so a
//! multi-byte character split across two network chunks stays intact.
//! `\n` never occurs inside a UTF-8 sequence, which makes every complete line
//! a complete string.

/// Accumulates raw bytes and yields decoded lines.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
}

fn decode(bytes: Vec<u8>) -> String {
    String::from_utf8(bytes).unwrap_or_else(|e| String::from_utf8_lossy(e.as_bytes()).into_owned())
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// The next complete line without its `\n` / `\r\n` terminator.
    pub fn next_line(&mut self) -> Option<String> {
        let end = self.buf.iter().position(|b| *b == b'\n')?;
        let mut line: Vec<u8> = self.buf.drain(..=end).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Some(decode(line))
    }

    /// Whatever is left after the body ended without a final newline.
    pub fn take_rest(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let mut rest = std::mem::take(&mut self.buf);
        if rest.last() == Some(&b'\r') {
            rest.pop();
        }
        Some(decode(rest))
    }
}
