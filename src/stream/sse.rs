//! Incremental Server-Sent-Events parser.
//!
//! Consumes arbitrary byte chunks from an HTTP response body and yields
//! parsed JSON payloads. Events are delimited by a blank line; multiple
//! `data:` lines within one event are concatenated. Incomplete trailing
//! data stays buffered until the next chunk or [`SseParser::flush`].

use serde_json::Value;

#[derive(Default)]
pub struct SseParser {
    buffer: String,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk of bytes; returns every JSON payload completed by
    /// this chunk, in stream order. Non-JSON data lines (keep-alives,
    /// `[DONE]` markers) are skipped silently.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Value> {
        // CR is stripped up front so CRLF streams parse like LF ones.
        let text = String::from_utf8_lossy(chunk);
        for c in text.chars() {
            if c != '\r' {
                self.buffer.push(c);
            }
        }

        let mut payloads = Vec::new();
        while let Some(end) = self.buffer.find("\n\n") {
            let event: String = self.buffer.drain(..end + 2).collect();
            if let Some(v) = parse_event(&event) {
                payloads.push(v);
            }
        }
        payloads
    }

    /// Recover a trailing event that was never terminated by a blank
    /// line. Must be called at stream end.
    pub fn flush(&mut self) -> Option<Value> {
        let rest = std::mem::take(&mut self.buffer);
        if rest.trim().is_empty() {
            return None;
        }
        parse_event(&rest)
    }
}

fn parse_event(event: &str) -> Option<Value> {
    let mut data_lines: Vec<&str> = Vec::new();
    for line in event.lines() {
        if let Some(rest) = line.strip_prefix("data:") {
            data_lines.push(rest.strip_prefix(' ').unwrap_or(rest));
        }
        // `event:`, `id:`, comments — structural only, no payload
    }
    if data_lines.is_empty() {
        return None;
    }
    let data = data_lines.join("\n");
    if data.trim().is_empty() || data.trim() == "[DONE]" {
        return None;
    }
    serde_json::from_str(data.trim()).ok()
}
