//! Incremental newline-delimited frame decoder.
//!
//! Generalizes the teacher's `BufReader::lines()` usage (which assumes each
//! chunk arrives as whole, valid-UTF-8 lines) to handle partial reads and
//! encoding errors explicitly: the proxy must still forward non-UTF-8 child
//! output verbatim rather than silently dropping it (passthrough is
//! authoritative, see [`crate::stream_pump`]).

/// A decoded line: either valid UTF-8 text, or the raw bytes of a line that
/// failed to decode as UTF-8.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FramedLine {
    Text(String),
    Invalid(Vec<u8>),
}

/// Splits a byte stream into `\n`-delimited frames, carrying a partial
/// trailing fragment across `feed` calls.
#[derive(Debug, Default)]
pub struct LineFramer {
    carry: Vec<u8>,
}

impl LineFramer {
    pub fn new() -> Self {
        Self { carry: Vec::new() }
    }

    /// Feed a chunk of bytes, returning zero or more complete lines.
    /// Any trailing partial line is retained until the next `feed`/`finish`.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<FramedLine> {
        self.carry.extend_from_slice(chunk);
        let mut lines = Vec::new();

        loop {
            let Some(pos) = self.carry.iter().position(|&b| b == b'\n') else {
                break;
            };
            let mut raw: Vec<u8> = self.carry.drain(..=pos).collect();
            raw.pop(); // drop the '\n'
            if raw.last() == Some(&b'\r') {
                raw.pop();
            }
            if raw.is_empty() {
                continue; // blank lines are skipped
            }
            lines.push(decode(raw));
        }

        lines
    }

    /// Flush any remaining partial fragment (e.g. on EOF without a trailing newline).
    pub fn finish(&mut self) -> Option<FramedLine> {
        if self.carry.is_empty() {
            return None;
        }
        let mut raw = std::mem::take(&mut self.carry);
        if raw.last() == Some(&b'\r') {
            raw.pop();
        }
        if raw.is_empty() {
            return None;
        }
        Some(decode(raw))
    }
}

fn decode(raw: Vec<u8>) -> FramedLine {
    match String::from_utf8(raw) {
        Ok(text) => FramedLine::Text(text),
        Err(err) => FramedLine::Invalid(err.into_bytes()),
    }
}

/// Truncate a raw line to at most `limit` bytes for logging, per the malformed-line
/// reporting rule in §4.3 (default 256 bytes).
pub fn truncate_for_log(line: &str, limit: usize) -> String {
    if line.len() <= limit {
        line.to_string()
    } else {
        let mut end = limit;
        while !line.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &line[..end])
    }
}
