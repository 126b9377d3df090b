//! Incremental top-level JSON field detection.
//!
//! Accumulates model-emitted text and reports each top-level field the
//! moment its value token is complete and balanced, so the client can
//! render `producer` while the model is still writing `grapes`. Malformed
//! input stops further emission without panicking; everything already
//! delivered stays delivered.

use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq)]
enum State {
    /// Before the opening `{`.
    Start,
    /// Expecting a key quote or `}`.
    ExpectKey,
    InKey,
    ExpectColon,
    ExpectValue,
    InValue,
    /// Expecting `,` or the closing `}`.
    AfterValue,
    /// Top-level object closed.
    Done,
    /// Malformed input; scanning stopped for good.
    Broken,
}

pub struct FieldDetector {
    buffer: String,
    /// Byte offset of the next unscanned char. Structural JSON chars are
    /// ASCII, so byte indexing is safe; multibyte text only ever appears
    /// inside strings, which the scanner skips over.
    pos: usize,
    state: State,
    key: String,
    key_escape: bool,
    value_start: usize,
    depth: u32,
    in_string: bool,
    escape: bool,
    emitted: Vec<(String, Value)>,
}

impl Default for FieldDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl FieldDetector {
    pub fn new() -> Self {
        Self {
            buffer: String::new(),
            pos: 0,
            state: State::Start,
            key: String::new(),
            key_escape: false,
            value_start: 0,
            depth: 0,
            in_string: false,
            escape: false,
            emitted: Vec::new(),
        }
    }

    /// Everything fed so far, verbatim.
    pub fn buffer(&self) -> &str {
        &self.buffer
    }

    /// Fields emitted so far, in completion order.
    pub fn emitted(&self) -> &[(String, Value)] {
        &self.emitted
    }

    /// Append a chunk of model text; returns fields newly completed by
    /// this chunk, in source order.
    pub fn feed(&mut self, text: &str) -> Vec<(String, Value)> {
        self.buffer.push_str(text);
        self.scan()
    }

    /// Signal end of stream: a pending top-level number (no trailing
    /// terminator) completes here.
    pub fn finish(&mut self) -> Vec<(String, Value)> {
        let mut out = self.scan();
        if self.state == State::InValue && !self.in_string && self.depth == 0 {
            let slice = &self.buffer[self.value_start..];
            if looks_like_scalar(slice) {
                if let Ok(v) = serde_json::from_str::<Value>(slice.trim()) {
                    let key = std::mem::take(&mut self.key);
                    self.emitted.push((key.clone(), v.clone()));
                    out.push((key, v));
                    self.state = State::Done;
                }
            }
        }
        out
    }

    /// Parse the whole accumulated buffer as one JSON document. On
    /// success this is the canonical final payload.
    pub fn try_parse_complete(&self) -> Option<Value> {
        serde_json::from_str(self.buffer.trim()).ok()
    }

    fn scan(&mut self) -> Vec<(String, Value)> {
        let mut out = Vec::new();
        while self.pos < self.buffer.len() {
            if matches!(self.state, State::Broken | State::Done) {
                break;
            }
            let b = self.buffer.as_bytes()[self.pos];
            match self.state {
                State::Start => match b {
                    b'{' => self.state = State::ExpectKey,
                    _ if (b as char).is_whitespace() => {}
                    _ => self.state = State::Broken,
                },
                State::ExpectKey => match b {
                    b'"' => {
                        self.key.clear();
                        self.key_escape = false;
                        self.state = State::InKey;
                    }
                    b'}' => self.state = State::Done,
                    b',' => {}
                    _ if (b as char).is_whitespace() => {}
                    _ => self.state = State::Broken,
                },
                State::InKey => {
                    if self.key_escape {
                        self.key_escape = false;
                        self.key.push(b as char);
                    } else if b == b'\\' {
                        self.key_escape = true;
                    } else if b == b'"' {
                        self.state = State::ExpectColon;
                    } else {
                        // Multibyte key chars arrive as raw bytes; keys in
                        // model schemas are ASCII, and a lossy key only
                        // affects the label, never the scan position.
                        self.key.push(b as char);
                    }
                }
                State::ExpectColon => match b {
                    b':' => self.state = State::ExpectValue,
                    _ if (b as char).is_whitespace() => {}
                    _ => self.state = State::Broken,
                },
                State::ExpectValue => {
                    if (b as char).is_whitespace() {
                        // keep scanning
                    } else {
                        self.value_start = self.pos;
                        self.depth = 0;
                        self.escape = false;
                        self.in_string = b == b'"';
                        match b {
                            b'{' | b'[' => {
                                self.depth = 1;
                                self.state = State::InValue;
                            }
                            b'"' => self.state = State::InValue,
                            b'-' | b'0'..=b'9' | b't' | b'f' | b'n' => {
                                self.state = State::InValue;
                            }
                            _ => self.state = State::Broken,
                        }
                    }
                }
                State::InValue => {
                    if self.in_string {
                        if self.escape {
                            self.escape = false;
                        } else if b == b'\\' {
                            self.escape = true;
                        } else if b == b'"' {
                            if self.depth == 0 {
                                // Top-level string value complete.
                                self.complete_value(self.pos + 1, &mut out);
                            } else {
                                self.in_string = false;
                            }
                        }
                    } else {
                        match b {
                            b'"' => self.in_string = true,
                            b'{' | b'[' => self.depth += 1,
                            b'}' | b']' => {
                                if self.depth > 0 {
                                    self.depth -= 1;
                                    if self.depth == 0 {
                                        self.complete_value(self.pos + 1, &mut out);
                                    }
                                } else {
                                    // Terminator of a bare scalar; also the
                                    // top-level close when it's `}`.
                                    self.complete_value(self.pos, &mut out);
                                    if self.state != State::Broken {
                                        self.state = if b == b'}' {
                                            State::Done
                                        } else {
                                            State::Broken
                                        };
                                    }
                                }
                            }
                            b',' if self.depth == 0 => {
                                // The comma is both terminator and field
                                // separator; it is consumed here.
                                self.complete_value(self.pos, &mut out);
                                if self.state == State::AfterValue {
                                    self.state = State::ExpectKey;
                                }
                            }
                            c if self.depth == 0 && (c as char).is_whitespace() => {
                                self.complete_value(self.pos, &mut out);
                            }
                            _ => {}
                        }
                    }
                }
                State::AfterValue => match b {
                    b',' => self.state = State::ExpectKey,
                    b'}' => self.state = State::Done,
                    _ if (b as char).is_whitespace() => {}
                    _ => self.state = State::Broken,
                },
                State::Done | State::Broken => unreachable!(),
            }
            self.pos += 1;
        }
        out
    }

    /// Slice out `[value_start..end)`, parse, emit. `end` is exclusive.
    fn complete_value(&mut self, end: usize, out: &mut Vec<(String, Value)>) {
        let slice = self.buffer[self.value_start..end].trim();
        match serde_json::from_str::<Value>(slice) {
            Ok(v) => {
                let key = std::mem::take(&mut self.key);
                self.emitted.push((key.clone(), v.clone()));
                out.push((key, v));
                self.state = State::AfterValue;
            }
            Err(_) => self.state = State::Broken,
        }
    }
}

fn looks_like_scalar(slice: &str) -> bool {
    let t = slice.trim();
    !t.is_empty()
        && t.chars().next().map_or(false, |c| {
            c.is_ascii_digit() || c == '-' || c == 't' || c == 'f' || c == 'n'
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn feed_all(chunks: &[&str]) -> (FieldDetector, Vec<(String, Value)>) {
        let mut d = FieldDetector::new();
        let mut fields = Vec::new();
        for c in chunks {
            fields.extend(d.feed(c));
        }
        fields.extend(d.finish());
        (d, fields)
    }

    #[test]
    fn test_string_field_completes_at_closing_quote() {
        let mut d = FieldDetector::new();
        assert!(d.feed("{\"producer\": \"Penfo").is_empty());
        let fields = d.feed("lds\", ");
        assert_eq!(fields, vec![("producer".to_string(), json!("Penfolds"))]);
    }

    #[test]
    fn test_number_field_completes_at_terminator() {
        let mut d = FieldDetector::new();
        assert!(d.feed("{\"confidence\": 8").is_empty());
        // 85 could still become 850 — only the comma settles it
        assert!(d.feed("5").is_empty());
        let fields = d.feed(",");
        assert_eq!(fields, vec![("confidence".to_string(), json!(85))]);
    }

    #[test]
    fn test_number_field_completes_at_closing_brace() {
        let (_, fields) = feed_all(&["{\"confidence\": 92}"]);
        assert_eq!(fields, vec![("confidence".to_string(), json!(92))]);
    }

    #[test]
    fn test_array_completes_when_depth_returns() {
        let mut d = FieldDetector::new();
        assert!(d.feed("{\"grapes\": [\"Syrah\", [1,2]").is_empty());
        let fields = d.feed("]");
        assert_eq!(
            fields,
            vec![("grapes".to_string(), json!(["Syrah", [1, 2]]))]
        );
    }

    #[test]
    fn test_nested_object_value() {
        let (_, fields) = feed_all(&["{\"styleProfile\": {\"body\": \"Full\", \"tannin\": \"High\"}, \"x\": 1}"]);
        assert_eq!(fields[0].0, "styleProfile");
        assert_eq!(fields[0].1, json!({"body": "Full", "tannin": "High"}));
        assert_eq!(fields[1], ("x".to_string(), json!(1)));
    }

    #[test]
    fn test_escaped_quote_inside_string() {
        let (_, fields) = feed_all(&["{\"wineName\": \"Cuv\\u00e9e \\\"R\\\"\"}"]);
        assert_eq!(fields[0].1, json!("Cuvée \"R\""));
    }

    #[test]
    fn test_brace_inside_string_does_not_close() {
        let (_, fields) = feed_all(&["{\"overview\": \"big} wine\", \"n\": 1}"]);
        assert_eq!(fields[0].1, json!("big} wine"));
        assert_eq!(fields[1].1, json!(1));
    }

    #[test]
    fn test_emission_order_is_source_order() {
        let (_, fields) = feed_all(&[
            "{\"producer\":\"A\",\"wineName\":\"B\",\"vintage\":\"2019\",\"confidence\":85}",
        ]);
        let names: Vec<&str> = fields.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["producer", "wineName", "vintage", "confidence"]);
    }

    #[test]
    fn test_each_field_emitted_exactly_once() {
        let text = "{\"a\":1,\"b\":[2,3],\"c\":\"x\"}";
        // One byte at a time — the cruelest chunking
        let mut d = FieldDetector::new();
        let mut fields = Vec::new();
        for i in 0..text.len() {
            fields.extend(d.feed(&text[i..i + 1]));
        }
        fields.extend(d.finish());
        assert_eq!(fields.len(), 3);
        let names: Vec<&str> = fields.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_null_and_bool_values() {
        let (_, fields) = feed_all(&["{\"vintage\": null, \"nv\": true}"]);
        assert_eq!(fields[0].1, Value::Null);
        assert_eq!(fields[1].1, json!(true));
    }

    #[test]
    fn test_malformed_stops_without_panic() {
        let mut d = FieldDetector::new();
        let fields = d.feed("{\"a\": 1, !!garbage!!");
        assert_eq!(fields, vec![("a".to_string(), json!(1))]);
        // No further emission, no panic
        assert!(d.feed("\"b\": 2}").is_empty());
        assert_eq!(d.emitted().len(), 1);
    }

    #[test]
    fn test_matches_try_parse_complete_on_valid_doc() {
        let doc = r#"{"producer":"Château Margaux","vintage":"2019","grapes":["Cabernet Sauvignon","Merlot"],"confidence":97}"#;
        let (d, fields) = feed_all(&[doc]);

        let parsed = d.try_parse_complete().unwrap();
        let obj = parsed.as_object().unwrap();
        assert_eq!(fields.len(), obj.len());
        for (name, value) in &fields {
            assert_eq!(obj.get(name), Some(value), "field {name} diverges");
        }
    }

    #[test]
    fn test_try_parse_complete_fails_on_truncated() {
        let mut d = FieldDetector::new();
        d.feed("{\"a\": 1, \"b\": [");
        assert!(d.try_parse_complete().is_none());
    }

    #[test]
    fn test_finish_completes_trailing_number() {
        let mut d = FieldDetector::new();
        assert!(d.feed("{\"confidence\": 85").is_empty());
        let fields = d.finish();
        assert_eq!(fields, vec![("confidence".to_string(), json!(85))]);
    }

    #[test]
    fn test_leading_whitespace_tolerated() {
        let (_, fields) = feed_all(&["  \n {\"a\": 1}"]);
        assert_eq!(fields, vec![("a".to_string(), json!(1))]);
    }

    #[test]
    fn test_unicode_in_values() {
        let (_, fields) = feed_all(&["{\"producer\": \"Château Margaux\", \"region\": \"Margaux\"}"]);
        assert_eq!(fields[0].1, json!("Château Margaux"));
        assert_eq!(fields[1].1, json!("Margaux"));
    }
}
