//! Stdout message framing.
//!
//! Servers write one JSON message per line, but some pretty-print their
//! responses across several lines and most interleave plain-text log lines.
//! The decoder buffers raw bytes across reads and yields complete JSON values,
//! discarding anything that is not JSON.

use serde_json::Value;

/// Incremental decoder over a byte stream of JSON values.
#[derive(Debug, Default)]
pub struct MessageDecoder {
    buf: Vec<u8>,
}

impl MessageDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes read from the stream.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes currently buffered (an incomplete message or log line).
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Pop the next complete JSON value, or `None` if more input is needed.
    pub fn next_message(&mut self) -> Option<Value> {
        loop {
            let start = self.buf.iter().position(|b| !b.is_ascii_whitespace())?;
            if start > 0 {
                self.buf.drain(..start);
            }

            if !matches!(self.buf.first(), Some(b'{') | Some(b'[')) {
                // Plain-text log output.
                if !self.skip_line() {
                    return None;
                }
                continue;
            }

            let mut stream = serde_json::Deserializer::from_slice(&self.buf).into_iter::<Value>();
            match stream.next() {
                Some(Ok(value)) => {
                    let consumed = stream.byte_offset();
                    self.buf.drain(..consumed);
                    return Some(value);
                }
                Some(Err(e)) if e.is_eof() => return None,
                Some(Err(_)) => {
                    // Looked like JSON but wasn't (e.g. "[INFO] starting").
                    if !self.skip_line() {
                        return None;
                    }
                }
                None => return None,
            }
        }
    }

    /// Drop through the next newline. Returns false if no full line is buffered.
    fn skip_line(&mut self) -> bool {
        match self.buf.iter().position(|&b| b == b'\n') {
            Some(end) => {
                self.buf.drain(..=end);
                true
            }
            None => false,
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
