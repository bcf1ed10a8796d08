//! Incremental JSON-object extraction from an arbitrary byte stream.
//!
//! Mirrors the brace-counting approach of the upstream agent CLI's own
//! stream reader, but counts braces outside of JSON string literals and
//! escape sequences only — a naive counter that also counts braces
//! inside string values mis-slices any payload containing a literal
//! `{`/`}` in a string (e.g. a tool result embedding JSON-looking text).

use serde_json::Value;

#[derive(Debug, Default)]
pub struct StreamParser {
    buf: String,
    /// Byte offset into `buf` where scanning should resume.
    scan_pos: usize,
    /// Byte offset of the start of the current in-progress object, if any.
    obj_start: Option<usize>,
    depth: u32,
    in_string: bool,
    escape_next: bool,
}

impl StreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Discard all accumulated state.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Feed a chunk of bytes (assumed valid UTF-8 text, as produced by a
    /// line-buffered subprocess stdout reader) and return every complete
    /// JSON object decoded so far. Malformed slices are dropped with a
    /// warning; scanning continues after the closing brace.
    pub fn feed(&mut self, chunk: &str) -> Vec<Value> {
        self.buf.push_str(chunk);
        let mut out = Vec::new();

        let bytes = self.buf.as_bytes();
        let mut i = self.scan_pos;

        loop {
            if self.obj_start.is_none() {
                // Skip arbitrary prefix bytes until the next '{'.
                while i < bytes.len() && bytes[i] != b'{' {
                    i += 1;
                }
                if i >= bytes.len() {
                    break;
                }
                self.obj_start = Some(i);
                self.depth = 0;
                self.in_string = false;
                self.escape_next = false;
            }

            while i < bytes.len() {
                let b = bytes[i];

                if self.escape_next {
                    self.escape_next = false;
                    i += 1;
                    continue;
                }

                match b {
                    b'\\' if self.in_string => {
                        self.escape_next = true;
                    }
                    b'"' => {
                        self.in_string = !self.in_string;
                    }
                    b'{' if !self.in_string => {
                        self.depth += 1;
                    }
                    b'}' if !self.in_string => {
                        self.depth -= 1;
                        if self.depth == 0 {
                            let start = self.obj_start.take().expect("obj_start set");
                            let end = i + 1;
                            let slice = &self.buf[start..end];
                            match serde_json::from_str::<Value>(slice) {
                                Ok(v) => out.push(v),
                                Err(e) => {
                                    tracing::warn!(error = %e, slice, "stream parser: dropped malformed object");
                                }
                            }
                            i += 1;
                            break;
                        }
                    }
                    _ => {}
                }
                i += 1;
            }

            if self.obj_start.is_some() {
                // Still inside an object; wait for more input.
                break;
            }
        }

        // Compact the buffer: drop everything before the active object
        // (or before `i` if no object is in progress) so it doesn't grow
        // without bound across many feed() calls.
        let keep_from = self.obj_start.unwrap_or(i);
        if keep_from > 0 {
            self.buf.drain(..keep_from);
            if let Some(start) = self.obj_start.as_mut() {
                *start -= keep_from;
            }
            i -= keep_from;
        }
        self.scan_pos = i;

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_object_in_one_feed() {
        let mut p = StreamParser::new();
        let out = p.feed(r#"{"type":"test"}"#);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0]["type"], "test");
    }

    #[test]
    fn tolerates_prefix_noise() {
        let mut p = StreamParser::new();
        let out = p.feed(r#"noise {"a":1}"#);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0]["a"], 1);
    }

    #[test]
    fn splits_across_feed_boundary() {
        let mut p = StreamParser::new();
        let mut out = p.feed(r#"{"type":"test""#);
        assert!(out.is_empty());
        out.extend(p.feed(r#", "value":123}{"type":"bye"}"#));
        assert_eq!(out.len(), 2);
        assert_eq!(out[0]["value"], 123);
        assert_eq!(out[1]["type"], "bye");
    }

    #[test]
    fn braces_inside_strings_are_not_structural() {
        let mut p = StreamParser::new();
        let out = p.feed(r#"{"text":"looks like {json} but isn't"}{"next":true}"#);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0]["text"], "looks like {json} but isn't");
        assert_eq!(out[1]["next"], true);
    }

    #[test]
    fn escaped_quote_does_not_end_string() {
        let mut p = StreamParser::new();
        let out = p.feed(r#"{"text":"he said \"hi {there}\""}"#);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0]["text"], "he said \"hi {there}\"");
    }

    #[test]
    fn partial_state_survives_mid_string() {
        let mut p = StreamParser::new();
        let out1 = p.feed(r#"{"text":"unterminated with brace {"#);
        assert!(out1.is_empty());
        let out2 = p.feed(r#" still in string}"}"#);
        assert_eq!(out2.len(), 1);
        assert_eq!(out2[0]["text"], "unterminated with brace { still in string}");
    }

    #[test]
    fn malformed_object_dropped_and_scanning_continues() {
        let mut p = StreamParser::new();
        let out = p.feed(r#"{"bad": ,}{"good":1}"#);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0]["good"], 1);
    }

    #[test]
    fn reset_discards_state() {
        let mut p = StreamParser::new();
        let out = p.feed(r#"{"unfinished":"#);
        assert!(out.is_empty());
        p.reset();
        let out2 = p.feed(r#"{"fresh":1}"#);
        assert_eq!(out2.len(), 1);
        assert_eq!(out2[0]["fresh"], 1);
    }

    #[test]
    fn byte_partition_matches_whole_buffer_feed() {
        let whole = r#"{"a":1}{"b":{"nested":"x{}y"}}{"c":[1,2,3]}"#;
        let mut whole_parser = StreamParser::new();
        let expected = whole_parser.feed(whole);

        for split in 1..whole.len() {
            if !whole.is_char_boundary(split) {
                continue;
            }
            let mut p = StreamParser::new();
            let mut got = p.feed(&whole[..split]);
            got.extend(p.feed(&whole[split..]));
            assert_eq!(got, expected, "mismatch splitting at byte {split}");
        }
    }
}
