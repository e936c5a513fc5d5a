//! Incremental line framer.
//!
//! Reassembles newline-terminated messages out of arbitrarily sliced read
//! chunks. Bytes with no terminator yet stay buffered; the framer itself
//! never drops data and never bounds the residual buffer. A stream that
//! stops terminating lines is a protocol fault for the caller to time out.

/// Splits a raw byte stream into complete lines.
#[derive(Debug, Default)]
pub struct MessageFramer {
    residual: Vec<u8>,
}

impl MessageFramer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and drain every complete line it finishes, in
    /// arrival order. A trailing `\r` before the terminator is stripped.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.residual.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.residual.iter().position(|byte| *byte == b'\n') {
            let mut line: Vec<u8> = self.residual.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }

    /// Bytes buffered since the last terminator.
    #[must_use]
    pub fn residual(&self) -> &[u8] {
        &self.residual
    }
}
