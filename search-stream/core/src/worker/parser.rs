//! Incremental message decoder
//!
//! Accumulates decoded text for one trace and splits it into messages as it
//! arrives. Network chunk boundaries do not line up with message boundaries,
//! so the trailing fragment of every chunk stays buffered until its delimiter
//! (a blank line) shows up.
//!
//! Each message block is either SSE-framed:
//!
//! ```text
//! event: search_response_hits
//! data: {"results":{"hits":[...]}}
//! ```
//!
//! or bare JSON (one value per block, or one per line).

use serde_json::{json, Value};

use super::StreamEvent;

/// Plain-text marker some servers send before closing the body
pub const DONE_MARKER: &str = "[[DONE]]";

const EVENT_METADATA: &str = "search_response_metadata";
const EVENT_HITS: &str = "search_response_hits";
const EVENT_PROGRESS: &str = "progress";
const EVENT_ERROR: &str = "error";
const EVENT_END: &str = "end";

/// Per-trace text buffer and message splitter
///
/// Each chunk is normalised and scanned once, so a message delivered in many
/// chunks costs time linear in its size.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: String,
    /// A `\r` ending the previous chunk, held until the next byte is known
    pending_cr: bool,
    json: DepthScanner,
}

impl SseDecoder {
    /// Create an empty decoder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes of text currently buffered
    #[must_use]
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Append `text` and return every message it completes, in order
    pub fn feed(&mut self, text: &str) -> Vec<StreamEvent> {
        let appended_at = self.push_normalized(text);

        // The buffer held no delimiter before this chunk, so a new one can
        // start no earlier than a trailing newline of the old contents
        let mut search_from = appended_at;
        if appended_at > 0 && self.buffer.as_bytes()[appended_at - 1] == b'\n' {
            search_from -= 1;
        }

        let mut events = Vec::new();
        let mut consumed = 0;
        while let Some(pos) = self.buffer[search_from..].find("\n\n") {
            let end = search_from + pos + 2;
            events.extend(parse_block(&self.buffer[consumed..end]));
            consumed = end;
            search_from = end;
        }

        let closed = if consumed > 0 {
            self.buffer.drain(..consumed);
            self.json = DepthScanner::default();
            self.json.scan(&self.buffer)
        } else {
            self.json.scan(&self.buffer[appended_at..])
        };

        // An unframed JSON value needs no delimiter once it is complete
        if closed {
            if let Some(event) = self.take_complete_json() {
                events.push(event);
            }
        }

        events
    }

    /// Flush whatever is left when the body ends
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        if std::mem::take(&mut self.pending_cr) {
            self.buffer.push('\r');
        }
        self.json = DepthScanner::default();
        let rest = std::mem::take(&mut self.buffer);
        parse_block(&rest)
    }

    /// Append `text` with CRLF folded to LF; returns where it was appended
    fn push_normalized(&mut self, text: &str) -> usize {
        let start = self.buffer.len();
        if text.is_empty() {
            return start;
        }

        if std::mem::take(&mut self.pending_cr) && !text.starts_with('\n') {
            self.buffer.push('\r');
        }
        let body = match text.strip_suffix('\r') {
            Some(body) => {
                self.pending_cr = true;
                body
            }
            None => text,
        };
        if body.contains("\r\n") {
            self.buffer.push_str(&body.replace("\r\n", "\n"));
        } else {
            self.buffer.push_str(body);
        }

        start
    }

    fn take_complete_json(&mut self) -> Option<StreamEvent> {
        let trimmed = self.buffer.trim();
        if !(trimmed.starts_with('{') || trimmed.starts_with('[')) {
            return None;
        }
        let value: Value = serde_json::from_str(trimmed).ok()?;
        self.buffer.clear();
        self.json = DepthScanner::default();
        Some(classify(None, value))
    }
}

/// Bracket depth of buffered text, tracked incrementally
///
/// Quotes and escapes are followed so brackets inside strings do not count.
/// Only ASCII bytes are inspected, which never occur inside multi-byte UTF-8
/// sequences.
#[derive(Debug, Default)]
struct DepthScanner {
    depth: usize,
    in_string: bool,
    escaped: bool,
}

impl DepthScanner {
    /// Advance over `text`; true if a top-level value closed within it
    fn scan(&mut self, text: &str) -> bool {
        let mut closed = false;
        for byte in text.bytes() {
            if self.in_string {
                if self.escaped {
                    self.escaped = false;
                } else if byte == b'\\' {
                    self.escaped = true;
                } else if byte == b'"' {
                    self.in_string = false;
                }
                continue;
            }
            match byte {
                b'"' => self.in_string = true,
                b'{' | b'[' => self.depth += 1,
                b'}' | b']' if self.depth > 0 => {
                    self.depth -= 1;
                    closed |= self.depth == 0;
                }
                _ => {}
            }
        }
        closed
    }
}

/// Parse one delimited block into zero or more events
fn parse_block(block: &str) -> Vec<StreamEvent> {
    let mut event_name: Option<&str> = None;
    let mut data_lines: Vec<&str> = Vec::new();
    let mut raw_lines: Vec<&str> = Vec::new();
    let mut framed = false;

    for line in block.lines() {
        if line.trim().is_empty() {
            continue;
        }
        if line.starts_with(':') {
            framed = true;
        } else if let Some(rest) = line.strip_prefix("data:") {
            framed = true;
            data_lines.push(rest.strip_prefix(' ').unwrap_or(rest));
        } else if let Some(rest) = line.strip_prefix("event:") {
            framed = true;
            event_name = Some(rest.trim());
        } else if line.starts_with("id:") || line.starts_with("retry:") {
            framed = true;
        } else {
            raw_lines.push(line);
        }
    }

    if framed {
        if data_lines.is_empty() {
            return Vec::new();
        }
        return decode_message(event_name, &data_lines.join("\n"))
            .into_iter()
            .collect();
    }

    let whole = block.trim();
    if whole.is_empty() {
        return Vec::new();
    }
    if let Ok(value) = serde_json::from_str::<Value>(whole) {
        return vec![classify(None, value)];
    }

    // Newline-delimited JSON
    raw_lines
        .into_iter()
        .filter_map(|line| decode_message(None, line))
        .collect()
}

/// Decode one message payload, dropping anything unrecognised
fn decode_message(event_name: Option<&str>, data: &str) -> Option<StreamEvent> {
    let data = data.trim();
    if data.is_empty() || data == DONE_MARKER {
        return None;
    }
    // The terminal event comes from the end of the body, not from the server
    if event_name == Some(EVENT_END) {
        return None;
    }

    match serde_json::from_str::<Value>(data) {
        Ok(value) => Some(classify(event_name, value)),
        Err(_) if event_name == Some(EVENT_ERROR) => {
            Some(StreamEvent::Error(json!({ "message": data })))
        }
        Err(err) => {
            tracing::trace!(error = %err, len = data.len(), "Dropping malformed stream message");
            None
        }
    }
}

/// Classify a parsed message
///
/// An error status code always wins; otherwise the SSE event name decides, and
/// unnamed messages are classified by shape.
pub fn classify(event_name: Option<&str>, value: Value) -> StreamEvent {
    if event_name == Some(EVENT_ERROR) || has_error_status(&value) {
        return StreamEvent::Error(value);
    }

    match event_name {
        Some(EVENT_PROGRESS) => StreamEvent::Progress(value),
        Some(EVENT_HITS) => StreamEvent::SearchResponseHits(value),
        Some(EVENT_METADATA) => StreamEvent::SearchResponseMetadata(value),
        _ if value.get("percent").is_some() => StreamEvent::Progress(value),
        _ if has_hits(&value) => StreamEvent::SearchResponseHits(value),
        _ => StreamEvent::SearchResponseMetadata(value),
    }
}

fn has_error_status(value: &Value) -> bool {
    ["code", "status_code", "status"].iter().any(|key| {
        value
            .get(key)
            .and_then(Value::as_u64)
            .is_some_and(|code| code >= 400)
    })
}

fn has_hits(value: &Value) -> bool {
    value.get("hits").is_some()
        || value
            .get("results")
            .and_then(|results| results.get("hits"))
            .is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn payloads(events: &[StreamEvent]) -> Vec<Value> {
        events
            .iter()
            .filter_map(|e| e.payload().cloned())
            .collect()
    }

    #[test]
    fn test_json_split_across_chunks() {
        let mut decoder = SseDecoder::new();

        assert!(decoder.feed("{\"a\"").is_empty());
        let events = decoder.feed(":1}");

        assert_eq!(payloads(&events), vec![json!({"a": 1})]);
        assert!(decoder.finish().is_empty());
    }

    #[test]
    fn test_order_across_chunk_boundaries() {
        let mut decoder = SseDecoder::new();

        let mut events = decoder.feed("{\"m\":1}\n\n{\"m\":2}\n\n{\"m\"");
        events.extend(decoder.feed(":3}\n\n"));
        events.extend(decoder.finish());

        assert_eq!(
            payloads(&events),
            vec![json!({"m": 1}), json!({"m": 2}), json!({"m": 3})]
        );
    }

    #[test]
    fn test_sse_event_names() {
        let mut decoder = SseDecoder::new();
        let events = decoder.feed(
            "event: search_response_metadata\ndata: {\"results\":{\"total\":3}}\n\n\
             event: search_response_hits\ndata: {\"results\":{\"hits\":[1,2,3]}}\n\n\
             event: progress\ndata: {\"percent\":50}\n\n",
        );

        assert_eq!(events.len(), 3);
        assert!(matches!(events[0], StreamEvent::SearchResponseMetadata(_)));
        assert!(matches!(events[1], StreamEvent::SearchResponseHits(_)));
        assert_eq!(events[2], StreamEvent::Progress(json!({"percent": 50})));
    }

    #[test]
    fn test_sse_split_mid_line() {
        let mut decoder = SseDecoder::new();

        assert!(decoder.feed("event: search_response_hi").is_empty());
        assert!(decoder.feed("ts\ndata: {\"hits\":").is_empty());
        let events = decoder.feed("[]}\n\n");

        assert_eq!(events, vec![StreamEvent::SearchResponseHits(json!({"hits": []}))]);
    }

    #[test]
    fn test_crlf_delimiters() {
        let mut decoder = SseDecoder::new();
        let mut events = decoder.feed("data: {\"x\":1}\r\n\r");
        events.extend(decoder.feed("\ndata: {\"x\":2}\r\n\r\n"));

        assert_eq!(payloads(&events), vec![json!({"x": 1}), json!({"x": 2})]);
    }

    #[test]
    fn test_multiline_data_joined() {
        let mut decoder = SseDecoder::new();
        let events = decoder.feed("data: {\"a\":\ndata: 1}\n\n");
        assert_eq!(payloads(&events), vec![json!({"a": 1})]);
    }

    #[test]
    fn test_error_status_wins_over_event_name() {
        let mut decoder = SseDecoder::new();
        let events = decoder.feed(
            "event: search_response_hits\ndata: {\"code\":500,\"message\":\"boom\"}\n\n",
        );
        assert_eq!(
            events,
            vec![StreamEvent::Error(json!({"code": 500, "message": "boom"}))]
        );
    }

    #[test]
    fn test_plain_text_error_event() {
        let mut decoder = SseDecoder::new();
        let events = decoder.feed("event: error\ndata: query timed out\n\n");
        assert_eq!(
            events,
            vec![StreamEvent::Error(json!({"message": "query timed out"}))]
        );
    }

    #[test]
    fn test_malformed_message_dropped_stream_continues() {
        let mut decoder = SseDecoder::new();
        let events = decoder.feed("data: {not json\n\ndata: {\"ok\":true}\n\n");
        assert_eq!(payloads(&events), vec![json!({"ok": true})]);
    }

    #[test]
    fn test_done_marker_and_comments_ignored() {
        let mut decoder = SseDecoder::new();
        let events = decoder.feed(": keep-alive\n\ndata: [[DONE]]\n\nevent: end\ndata: {}\n\n");
        assert!(events.is_empty());
        assert_eq!(decoder.buffered_len(), 0);
    }

    #[test]
    fn test_newline_delimited_json_flushed_at_finish() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.feed("{\"n\":1}\n{\"n\":2}").is_empty());
        let events = decoder.finish();
        assert_eq!(payloads(&events), vec![json!({"n": 1}), json!({"n": 2})]);
    }

    /// A hits message of roughly `target` bytes with brackets inside strings
    fn large_message(target: usize) -> (Value, String) {
        let hit = json!({"log": "level=info msg=\"{[ok]}\" path=/a/b\\c", "n": 1});
        let per_hit = serde_json::to_string(&hit).unwrap().len() + 1;
        let hits: Vec<Value> = (0..target / per_hit).map(|_| hit.clone()).collect();
        let value = json!({"results": {"hits": hits}});
        let text = serde_json::to_string(&value).unwrap();
        (value, text)
    }

    fn feed_in_chunks(decoder: &mut SseDecoder, text: &str, chunk: usize) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        for piece in text.as_bytes().chunks(chunk) {
            // Test payloads are ASCII, so every byte boundary is a char boundary
            events.extend(decoder.feed(std::str::from_utf8(piece).unwrap()));
        }
        events
    }

    #[test]
    fn test_large_json_message_in_small_chunks() {
        let (value, text) = large_message(4 * 1024 * 1024);
        assert!(text.len() > 3 * 1024 * 1024);
        let mut decoder = SseDecoder::new();

        let started = Instant::now();
        let events = feed_in_chunks(&mut decoder, &text, 4096);
        let elapsed = started.elapsed();

        assert_eq!(events, vec![StreamEvent::SearchResponseHits(value)]);
        assert_eq!(decoder.buffered_len(), 0);
        assert!(decoder.finish().is_empty());
        assert!(elapsed < Duration::from_secs(10), "took {elapsed:?}");
    }

    #[test]
    fn test_large_sse_message_in_small_chunks() {
        let (value, text) = large_message(4 * 1024 * 1024);
        let framed = format!("event: search_response_hits\r\ndata: {text}\r\n\r\n");
        let mut decoder = SseDecoder::new();

        let started = Instant::now();
        let events = feed_in_chunks(&mut decoder, &framed, 4096);
        let elapsed = started.elapsed();

        assert_eq!(events, vec![StreamEvent::SearchResponseHits(value)]);
        assert_eq!(decoder.buffered_len(), 0);
        assert!(elapsed < Duration::from_secs(10), "took {elapsed:?}");
    }

    #[test]
    fn test_brackets_inside_strings_do_not_close_value() {
        let mut decoder = SseDecoder::new();

        assert!(decoder.feed("{\"s\":\"}").is_empty());
        assert!(decoder.feed("]\\\"").is_empty());
        let events = decoder.feed("\"}");

        assert_eq!(payloads(&events), vec![json!({"s": "}]\""})]);
        assert_eq!(decoder.buffered_len(), 0);
    }

    #[test]
    fn test_carriage_return_split_from_line_feed() {
        let mut decoder = SseDecoder::new();

        assert!(decoder.feed("data: {\"x\":1}\r").is_empty());
        assert!(decoder.feed("\n\r").is_empty());
        let mut events = decoder.feed("\n");
        // A carriage return not followed by a line feed is kept
        assert!(decoder.feed("event: error\ndata: a\r").is_empty());
        events.extend(decoder.feed("b\n\n"));

        assert_eq!(events.len(), 2);
        assert_eq!(payloads(&events[..1]), vec![json!({"x": 1})]);
        assert_eq!(events[1], StreamEvent::Error(json!({"message": "a\rb"})));
        assert_eq!(decoder.buffered_len(), 0);
    }

    #[test]
    fn test_content_classification() {
        assert!(matches!(
            classify(None, json!({"percent": 10})),
            StreamEvent::Progress(_)
        ));
        assert!(matches!(
            classify(None, json!({"results": {"hits": []}})),
            StreamEvent::SearchResponseHits(_)
        ));
        assert!(matches!(
            classify(None, json!({"results": {"total": 10, "took": 4}})),
            StreamEvent::SearchResponseMetadata(_)
        ));
        assert!(matches!(
            classify(None, json!({"status_code": 429})),
            StreamEvent::Error(_)
        ));
        // Success codes are not errors
        assert!(matches!(
            classify(None, json!({"code": 200, "hits": []})),
            StreamEvent::SearchResponseHits(_)
        ));
    }
}
