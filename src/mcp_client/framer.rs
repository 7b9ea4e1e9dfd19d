//! Newline-delimited JSON framing for server stdout.
//!
//! Chunks arrive in arbitrary sizes; only complete lines are parsed. A line
//! that is not valid JSON is logged and skipped so later lines still flow.

use serde_json::Value;

/// Longest slice of a bad line included in the warning.
const MAX_LOGGED_LINE: usize = 200;

/// Accumulates stdout bytes and yields one JSON value per complete line.
#[derive(Debug)]
pub struct LineFramer {
    server_name: String,
    buf: Vec<u8>,
    /// Prefix of `buf` already known to hold no newline.
    scanned: usize,
}

impl LineFramer {
    pub fn new(server_name: &str) -> Self {
        Self {
            server_name: server_name.to_string(),
            buf: Vec::new(),
            scanned: 0,
        }
    }

    /// Feed a chunk and return every value completed by it, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Value> {
        self.buf.extend_from_slice(chunk);

        let mut values = Vec::new();
        let mut start = 0;
        let mut search_from = self.scanned;
        while let Some(offset) = self.buf[search_from..].iter().position(|b| *b == b'\n') {
            let end = search_from + offset;
            if let Some(value) = self.parse_line(&self.buf[start..end]) {
                values.push(value);
            }
            start = end + 1;
            search_from = start;
        }
        self.buf.drain(..start);
        self.scanned = self.buf.len();

        values
    }

    /// Parse whatever is left without a trailing newline (called at EOF).
    pub fn finish(&mut self) -> Option<Value> {
        let rest = std::mem::take(&mut self.buf);
        self.scanned = 0;
        self.parse_line(&rest)
    }

    /// Bytes currently held back waiting for a newline.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    fn parse_line(&self, line: &[u8]) -> Option<Value> {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.iter().all(u8::is_ascii_whitespace) {
            return None;
        }

        match serde_json::from_slice::<Value>(line) {
            Ok(value) => Some(value),
            Err(e) => {
                let text = String::from_utf8_lossy(line);
                let shown: String = text.chars().take(MAX_LOGGED_LINE).collect();
                tracing::warn!(
                    server = %self.server_name,
                    error = %e,
                    line = %shown,
                    "discarding malformed line from server stdout"
                );
                None
            }
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_single_complete_line() {
        let mut framer = LineFramer::new("test");
        let values = framer.push(b"{\"id\":1}\n");
        assert_eq!(values, vec![json!({"id": 1})]);
        assert_eq!(framer.buffered(), 0);
    }

    #[test]
    fn test_partial_line_across_chunks() {
        let mut framer = LineFramer::new("test");
        assert!(framer.push(b"{\"id\":").is_empty());
        assert!(framer.push(b"2,\"result\"").is_empty());
        let values = framer.push(b":true}\n{\"id\":3");
        assert_eq!(values, vec![json!({"id": 2, "result": true})]);
        assert_eq!(framer.buffered(), "{\"id\":3".len());
    }

    #[test]
    fn test_multiple_lines_in_one_chunk() {
        let mut framer = LineFramer::new("test");
        let values = framer.push(b"{\"a\":1}\n{\"b\":2}\n{\"c\":3}\n");
        assert_eq!(values.len(), 3);
        assert_eq!(values[2], json!({"c": 3}));
    }

    #[test]
    fn test_malformed_line_does_not_stop_following_lines() {
        let mut framer = LineFramer::new("test");
        let values = framer.push(b"not json at all\n{\"id\":5,\"result\":{}}\n");
        assert_eq!(values, vec![json!({"id": 5, "result": {}})]);
    }

    #[test]
    fn test_crlf_and_blank_lines() {
        let mut framer = LineFramer::new("test");
        let values = framer.push(b"\r\n\n{\"id\":1}\r\n   \n");
        assert_eq!(values, vec![json!({"id": 1})]);
    }

    #[test]
    fn test_invalid_utf8_is_skipped() {
        let mut framer = LineFramer::new("test");
        let values = framer.push(b"\xff\xfe\n{\"ok\":true}\n");
        assert_eq!(values, vec![json!({"ok": true})]);
    }

    #[test]
    fn test_finish_flushes_unterminated_line() {
        let mut framer = LineFramer::new("test");
        assert!(framer.push(b"{\"id\":4}").is_empty());
        assert_eq!(framer.finish(), Some(json!({"id": 4})));
        assert_eq!(framer.finish(), None);
    }

    #[test]
    fn test_large_line_in_small_chunks() {
        let text = "x".repeat(256 * 1024);
        let line = format!("{{\"id\":9,\"result\":{{\"text\":\"{text}\"}}}}\n");
        let mut framer = LineFramer::new("test");

        let mut values = Vec::new();
        for chunk in line.as_bytes().chunks(8 * 1024) {
            values.extend(framer.push(chunk));
            // Only bytes that arrived since the last push are searched again.
            assert_eq!(framer.scanned, framer.buffered());
        }

        assert_eq!(values.len(), 1);
        assert_eq!(values[0]["result"]["text"].as_str().map(str::len), Some(text.len()));
        assert_eq!(framer.buffered(), 0);
    }
}
