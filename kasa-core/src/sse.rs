//! Incremental decoder for the assistant's event stream.
//!
//! The chat function replies with an SSE body where each event is one line
//! `data: <json>\n` and the json carries a text delta at
//! `choices[0].delta.content`. The accumulator turns raw byte chunks into a
//! growing reply string, one snapshot per delta, independent of how the
//! transport happened to split the body.
//!
//! Contract:
//! - A code point split across two chunks decodes intact (stateful UTF-8).
//! - `content()` only ever grows while streaming.
//! - After `feed` returns, `line_buf` holds no complete line unless a parse
//!   pushback stopped extraction early.

use serde::Deserialize;

const DATA_PREFIX: &str = "data: ";
const DONE_SENTINEL: &str = "[DONE]";

/// A complete line that fails to parse is retried this many times (more bytes
/// may legitimately complete a payload that straddled a buffer boundary)
/// before it is dropped. Without the bound a permanently malformed line would
/// starve everything queued behind it.
const MAX_PARSE_RETRIES: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    Idle,
    Streaming,
    Completed,
    Failed,
}

// Wire shape of one streamed event. Unknown fields are ignored.
#[derive(Deserialize)]
struct ChunkEvent {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Deserialize, Default)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Deserialize, Default)]
struct ChunkDelta {
    content: Option<String>,
}

/// Per-request stream state: byte decoder carry, unresolved line buffer, and
/// the accumulated assistant reply. Created at request start, discarded when
/// the stream completes, errors, or is abandoned.
#[derive(Debug)]
pub struct SseAccumulator {
    phase: StreamPhase,
    utf8_carry: Vec<u8>,
    line_buf: String,
    content: String,
    last_failed: Option<String>,
    fail_count: u8,
}

impl Default for SseAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

impl SseAccumulator {
    pub fn new() -> Self {
        Self {
            phase: StreamPhase::Idle,
            utf8_carry: Vec::new(),
            line_buf: String::new(),
            content: String::new(),
            last_failed: None,
            fail_count: 0,
        }
    }

    pub fn phase(&self) -> StreamPhase {
        self.phase
    }

    /// The full reply accumulated so far.
    pub fn content(&self) -> &str {
        &self.content
    }

    /// Feed one raw chunk from the transport. Returns one full-content
    /// snapshot per delta appended by this chunk, in order. Feeding a
    /// terminal accumulator is a no-op.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        match self.phase {
            StreamPhase::Completed | StreamPhase::Failed => return Vec::new(),
            _ => self.phase = StreamPhase::Streaming,
        }
        self.decode(chunk);
        self.drain_lines()
    }

    /// Normal end of stream: the content becomes final. An unterminated tail
    /// line is discarded, matching the line-oriented protocol.
    pub fn finish(&mut self) -> &str {
        if self.phase != StreamPhase::Failed {
            self.phase = StreamPhase::Completed;
        }
        &self.content
    }

    /// Transport failure: no further feeds are accepted.
    pub fn fail(&mut self) {
        self.phase = StreamPhase::Failed;
    }

    // Stateful UTF-8 decode. An incomplete trailing sequence is carried to
    // the next chunk; genuinely invalid bytes decode to U+FFFD.
    fn decode(&mut self, chunk: &[u8]) {
        let mut bytes = std::mem::take(&mut self.utf8_carry);
        bytes.extend_from_slice(chunk);
        let mut input = bytes.as_slice();
        loop {
            match std::str::from_utf8(input) {
                Ok(s) => {
                    self.line_buf.push_str(s);
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    self.line_buf
                        .push_str(&String::from_utf8_lossy(&input[..valid]));
                    match e.error_len() {
                        None => {
                            self.utf8_carry = input[valid..].to_vec();
                            break;
                        }
                        Some(len) => {
                            self.line_buf.push('\u{FFFD}');
                            input = &input[valid + len..];
                        }
                    }
                }
            }
        }
    }

    fn drain_lines(&mut self) -> Vec<String> {
        let mut snapshots = Vec::new();
        while let Some(idx) = self.line_buf.find('\n') {
            let mut line: String = self.line_buf.drain(..=idx).collect();
            line.pop();
            if line.ends_with('\r') {
                line.pop();
            }

            // Heartbeats and blank keep-alive lines.
            if line.starts_with(':') || line.trim().is_empty() {
                continue;
            }
            let Some(payload) = line.strip_prefix(DATA_PREFIX) else {
                continue;
            };
            let payload = payload.trim();
            if payload == DONE_SENTINEL {
                // Logical end for this batch; the outer read loop decides
                // when the stream is actually over.
                break;
            }

            match serde_json::from_str::<ChunkEvent>(payload) {
                Ok(event) => {
                    self.last_failed = None;
                    self.fail_count = 0;
                    let delta = event
                        .choices
                        .into_iter()
                        .next()
                        .and_then(|c| c.delta.content);
                    if let Some(delta) = delta {
                        if !delta.is_empty() {
                            self.content.push_str(&delta);
                            snapshots.push(self.content.clone());
                        }
                    }
                }
                Err(e) => {
                    if self.exhausted_retries(&line) {
                        tracing::warn!(error = %e, "dropping malformed stream line after retries");
                        continue;
                    }
                    // The payload may have straddled a buffer boundary; put
                    // the line (with its delimiter) back and wait for bytes.
                    self.line_buf.insert(0, '\n');
                    self.line_buf.insert_str(0, &line);
                    break;
                }
            }
        }
        snapshots
    }

    fn exhausted_retries(&mut self, line: &str) -> bool {
        if self.last_failed.as_deref() == Some(line) {
            self.fail_count += 1;
        } else {
            self.last_failed = Some(line.to_string());
            self.fail_count = 1;
        }
        if self.fail_count >= MAX_PARSE_RETRIES {
            self.last_failed = None;
            self.fail_count = 0;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delta_line(text: &str) -> String {
        format!(
            "data: {}\n",
            serde_json::json!({"choices":[{"delta":{"content": text}}]})
        )
    }

    fn feed_all(acc: &mut SseAccumulator, body: &[u8]) -> Vec<String> {
        acc.feed(body)
    }

    #[test]
    fn single_chunk_accumulates_in_order() {
        let mut acc = SseAccumulator::new();
        let body = format!("{}{}data: [DONE]\n", delta_line("Hel"), delta_line("lo"));
        let snaps = feed_all(&mut acc, body.as_bytes());
        assert_eq!(snaps, vec!["Hel".to_string(), "Hello".to_string()]);
        assert_eq!(acc.finish(), "Hello");
        assert_eq!(acc.phase(), StreamPhase::Completed);
    }

    #[test]
    fn chunk_boundary_invariance_byte_by_byte() {
        let body = format!(
            "{}{}{}data: [DONE]\n",
            delta_line("Héllo "),
            delta_line("w✓rld "),
            delta_line("世界")
        );

        let mut whole = SseAccumulator::new();
        whole.feed(body.as_bytes());
        let expected = whole.finish().to_string();
        assert_eq!(expected, "Héllo w✓rld 世界");

        // Worst case: every byte its own chunk, splitting every multi-byte
        // code point and every JSON payload.
        let mut bytewise = SseAccumulator::new();
        let mut last = String::new();
        for b in body.as_bytes() {
            for snap in bytewise.feed(&[*b]) {
                assert!(snap.len() >= last.len(), "content shrank");
                last = snap;
            }
        }
        assert_eq!(bytewise.finish(), expected);
    }

    #[test]
    fn chunk_boundary_invariance_arbitrary_splits() {
        let body = format!("{}{}", delta_line("αβγ"), delta_line("δε"));
        let bytes = body.as_bytes();
        let mut expected_acc = SseAccumulator::new();
        expected_acc.feed(bytes);
        let expected = expected_acc.finish().to_string();

        for split in 1..bytes.len() {
            let mut acc = SseAccumulator::new();
            acc.feed(&bytes[..split]);
            acc.feed(&bytes[split..]);
            assert_eq!(acc.finish(), expected, "split at {split}");
        }
    }

    #[test]
    fn multibyte_char_split_across_chunks() {
        // "é" is 0xC3 0xA9; split between the two bytes.
        let line = delta_line("é");
        let bytes = line.as_bytes();
        let split = line.find('\u{e9}').unwrap() + 1;
        let mut acc = SseAccumulator::new();
        assert!(acc.feed(&bytes[..split]).is_empty());
        let snaps = acc.feed(&bytes[split..]);
        assert_eq!(snaps, vec!["é".to_string()]);
    }

    #[test]
    fn comments_and_blank_lines_are_ignored() {
        let mut acc = SseAccumulator::new();
        let body = format!(": keep-alive\n\n   \n{}\n", delta_line("ok"));
        let snaps = acc.feed(body.as_bytes());
        assert_eq!(snaps, vec!["ok".to_string()]);
        assert_eq!(acc.content(), "ok");
    }

    #[test]
    fn non_data_lines_are_ignored() {
        let mut acc = SseAccumulator::new();
        let body = format!("event: message\nid: 7\n{}", delta_line("hi"));
        let snaps = acc.feed(body.as_bytes());
        assert_eq!(snaps, vec!["hi".to_string()]);
    }

    #[test]
    fn done_alone_yields_empty_content() {
        let mut acc = SseAccumulator::new();
        let snaps = acc.feed(b"data: [DONE]\n");
        assert!(snaps.is_empty());
        assert_eq!(acc.finish(), "");
        assert_eq!(acc.phase(), StreamPhase::Completed);
    }

    #[test]
    fn done_breaks_only_the_current_feed() {
        let mut acc = SseAccumulator::new();
        let body = format!("data: [DONE]\n{}", delta_line("after"));
        assert!(acc.feed(body.as_bytes()).is_empty());
        // The line after the sentinel is still buffered; the next read-loop
        // pass picks it up.
        let snaps = acc.feed(b"");
        assert_eq!(snaps, vec!["after".to_string()]);
    }

    #[test]
    fn crlf_lines_are_stripped() {
        let mut acc = SseAccumulator::new();
        let line = delta_line("win").replace('\n', "\r\n");
        let snaps = acc.feed(line.as_bytes());
        assert_eq!(snaps, vec!["win".to_string()]);
    }

    #[test]
    fn split_json_payload_appends_exactly_once() {
        let mut acc = SseAccumulator::new();
        let first = br#"data: {"choices":[{"delta":{"content":"Hel"#;
        let second = b"lo\"}}]}\n";
        assert!(acc.feed(first).is_empty());
        let snaps = acc.feed(second);
        assert_eq!(snaps, vec!["Hello".to_string()]);
        assert_eq!(acc.finish(), "Hello");
    }

    #[test]
    fn malformed_line_is_dropped_after_retry_budget() {
        let mut acc = SseAccumulator::new();
        let body = format!("data: {{not json\n{}", delta_line("good"));
        // First pass: the bad line is pushed back, the good line stays queued.
        assert!(acc.feed(body.as_bytes()).is_empty());
        assert!(acc.feed(b"").is_empty());
        // Third consecutive failure exhausts the budget; the queued line
        // finally parses.
        let snaps = acc.feed(b"");
        assert_eq!(snaps, vec!["good".to_string()]);
    }

    #[test]
    fn empty_delta_produces_no_snapshot() {
        let mut acc = SseAccumulator::new();
        let body = format!("{}{}", delta_line(""), delta_line("x"));
        let snaps = acc.feed(body.as_bytes());
        assert_eq!(snaps, vec!["x".to_string()]);
    }

    #[test]
    fn missing_delta_content_is_tolerated() {
        let mut acc = SseAccumulator::new();
        let body = "data: {\"choices\":[{\"delta\":{}}]}\ndata: {\"choices\":[]}\n";
        assert!(acc.feed(body.as_bytes()).is_empty());
        assert_eq!(acc.content(), "");
    }

    #[test]
    fn terminal_accumulator_ignores_feeds() {
        let mut acc = SseAccumulator::new();
        acc.feed(delta_line("a").as_bytes());
        acc.finish();
        assert!(acc.feed(delta_line("b").as_bytes()).is_empty());
        assert_eq!(acc.content(), "a");

        let mut failed = SseAccumulator::new();
        failed.fail();
        assert!(failed.feed(delta_line("x").as_bytes()).is_empty());
        assert_eq!(failed.phase(), StreamPhase::Failed);
    }

    #[test]
    fn invalid_utf8_bytes_decode_lossily() {
        let mut acc = SseAccumulator::new();
        // 0xFF can never begin a UTF-8 sequence; it must not poison the
        // stream, only turn into U+FFFD inside an ignorable line.
        let mut body = b": ".to_vec();
        body.push(0xFF);
        body.push(b'\n');
        body.extend_from_slice(delta_line("ok").as_bytes());
        let snaps = acc.feed(&body);
        assert_eq!(snaps, vec!["ok".to_string()]);
    }

    #[test]
    fn phase_transitions() {
        let mut acc = SseAccumulator::new();
        assert_eq!(acc.phase(), StreamPhase::Idle);
        acc.feed(b"");
        assert_eq!(acc.phase(), StreamPhase::Streaming);
        acc.fail();
        assert_eq!(acc.phase(), StreamPhase::Failed);
        // fail() is sticky: finish() does not resurrect a failed stream.
        acc.finish();
        assert_eq!(acc.phase(), StreamPhase::Failed);
    }
}
