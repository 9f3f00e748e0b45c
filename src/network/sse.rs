//! Incremental event-stream (SSE) frame parser
//!
//! Bytes go in as they arrive off the wire, complete frames come out. Partial
//! lines and partially built frames stay buffered between calls, so the same
//! input yields the same frames no matter how it was chunked.

use serde::{Deserialize, Serialize};

use crate::constants::DEFAULT_SSE_EVENT;

/// One decoded event-stream frame
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SseFrame {
    pub id: Option<String>,
    pub event: String,
    pub data: String,
    pub retry: Option<u64>,
}

/// Fields collected for the frame currently being read
#[derive(Debug, Default)]
struct PendingFrame {
    id: Option<String>,
    event: Option<String>,
    data: String,
    has_data: bool,
    retry: Option<u64>,
}

impl PendingFrame {
    fn apply(&mut self, field: &str, value: &str) {
        match field {
            "data" => {
                self.data.push_str(value);
                self.data.push('\n');
                self.has_data = true;
            }
            "event" => self.event = Some(value.to_string()),
            "id" => {
                // Ids containing NUL are ignored by conforming clients
                if !value.contains('\0') {
                    self.id = Some(value.to_string());
                }
            }
            "retry" => {
                if !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit()) {
                    if let Ok(ms) = value.parse() {
                        self.retry = Some(ms);
                    }
                }
            }
            _ => {}
        }
    }

    fn finish(self) -> Option<SseFrame> {
        if !self.has_data {
            return None;
        }
        let mut data = self.data;
        data.pop();
        let event = self
            .event
            .filter(|e| !e.is_empty())
            .unwrap_or_else(|| DEFAULT_SSE_EVENT.to_string());
        Some(SseFrame {
            id: self.id,
            event,
            data,
            retry: self.retry,
        })
    }
}

/// Stateful parser for a single stream. Drop or [`reset`](Self::reset) it with the connection.
#[derive(Debug, Default)]
pub struct FrameParser {
    line: Vec<u8>,
    /// Previous byte was `\r`; a following `\n` belongs to the same terminator
    after_cr: bool,
    pending: PendingFrame,
}

impl FrameParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the next chunk, returning every frame it completes
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        let mut frames = Vec::new();
        let mut rest = chunk;

        if self.after_cr && !rest.is_empty() {
            self.after_cr = false;
            if rest[0] == b'\n' {
                rest = &rest[1..];
            }
        }

        while let Some(pos) = rest.iter().position(|&b| b == b'\n' || b == b'\r') {
            self.line.extend_from_slice(&rest[..pos]);
            let terminator = rest[pos];
            rest = &rest[pos + 1..];

            if terminator == b'\r' {
                match rest.first() {
                    Some(b'\n') => rest = &rest[1..],
                    Some(_) => {}
                    None => self.after_cr = true,
                }
            }

            if let Some(frame) = self.end_line() {
                frames.push(frame);
            }
        }

        self.line.extend_from_slice(rest);
        frames
    }

    /// Discard buffered bytes and the half-built frame
    pub fn reset(&mut self) {
        self.line.clear();
        self.after_cr = false;
        self.pending = PendingFrame::default();
    }

    /// Bytes of an unterminated line still waiting for more input
    pub fn buffered_len(&self) -> usize {
        self.line.len()
    }

    fn end_line(&mut self) -> Option<SseFrame> {
        if self.line.is_empty() {
            return std::mem::take(&mut self.pending).finish();
        }

        let line = String::from_utf8_lossy(&self.line).into_owned();
        self.line.clear();

        if line.starts_with(':') {
            return None;
        }

        // Lines without a field prefix carry nothing
        if let Some((field, value)) = line.split_once(':') {
            self.pending.apply(field, value.strip_prefix(' ').unwrap_or(value));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn frame(event: &str, data: &str) -> SseFrame {
        SseFrame {
            id: None,
            event: event.to_string(),
            data: data.to_string(),
            retry: None,
        }
    }

    #[test]
    fn test_data_lines_split_across_chunks() {
        let mut parser = FrameParser::new();
        assert!(parser.feed(b"data: a\n").is_empty());
        let frames = parser.feed(b"data: b\n\n");
        assert_eq!(frames, vec![frame("message", "a\nb")]);
    }

    #[test]
    fn test_frame_without_data_is_dropped() {
        let mut parser = FrameParser::new();
        let frames = parser.feed(b"event: ping\nid: 4\nretry: 100\n\n");
        assert!(frames.is_empty());
    }

    #[test]
    fn test_fields_in_any_order_last_id_wins() {
        let mut parser = FrameParser::new();
        let frames = parser.feed(b"id: 1\ndata: x\nevent: update\nretry: 250\nid: 2\n\n");
        assert_eq!(
            frames,
            vec![SseFrame {
                id: Some("2".into()),
                event: "update".into(),
                data: "x".into(),
                retry: Some(250),
            }]
        );
    }

    #[test]
    fn test_comments_and_unknown_fields_ignored() {
        let mut parser = FrameParser::new();
        let frames = parser.feed(b": keep-alive\nfoo: bar\ndata: ok\nretry: soon\n\n");
        assert_eq!(frames, vec![frame("message", "ok")]);
    }

    #[test]
    fn test_crlf_and_cr_terminators() {
        let mut parser = FrameParser::new();
        let frames = parser.feed(b"data: one\r\n\r\ndata: two\r\rdata: three\n\n");
        assert_eq!(
            frames,
            vec![frame("message", "one"), frame("message", "two"), frame("message", "three")]
        );
    }

    #[test]
    fn test_cr_at_chunk_end_then_lf() {
        let mut parser = FrameParser::new();
        assert!(parser.feed(b"data: x\r").is_empty());
        assert!(parser.feed(b"\n").is_empty());
        assert_eq!(parser.feed(b"\r\n"), vec![frame("message", "x")]);
    }

    #[test]
    fn test_only_one_leading_space_stripped() {
        let mut parser = FrameParser::new();
        let frames = parser.feed(b"data:  padded\ndata:tight\ndata:\n\n");
        assert_eq!(frames, vec![frame("message", " padded\ntight\n")]);
    }

    #[test]
    fn test_lines_without_colon_ignored() {
        let mut parser = FrameParser::new();
        assert!(parser.feed(b"event: ping\ndata\n\n").is_empty());

        let frames = parser.feed(b"data: kept\ngarbage\ndata\n\n");
        assert_eq!(frames, vec![frame("message", "kept")]);
    }

    #[test]
    fn test_incomplete_tail_stays_buffered() {
        let mut parser = FrameParser::new();
        assert!(parser.feed(b"data: first\n\ndata: sec").len() == 1);
        assert_eq!(parser.buffered_len(), 9);
        assert_eq!(parser.feed(b"ond\n\n"), vec![frame("message", "second")]);
    }

    #[test]
    fn test_reset_discards_partial_frame() {
        let mut parser = FrameParser::new();
        parser.feed(b"data: stale\ndata: par");
        parser.reset();
        assert_eq!(parser.buffered_len(), 0);
        assert_eq!(parser.feed(b"data: fresh\n\n"), vec![frame("message", "fresh")]);
    }

    #[test]
    fn test_multibyte_utf8_split_across_chunks() {
        let bytes = "data: héllo ✓\n\n".as_bytes();
        let mut parser = FrameParser::new();
        let mut frames = Vec::new();
        for b in bytes {
            frames.extend(parser.feed(std::slice::from_ref(b)));
        }
        assert_eq!(frames, vec![frame("message", "héllo ✓")]);
    }

    fn arb_frame() -> impl Strategy<Value = (Option<String>, Option<String>, Vec<String>)> {
        (
            proptest::option::of("[a-z0-9]{1,6}"),
            proptest::option::of("[a-z]{1,8}"),
            proptest::collection::vec("[ -~&&[^:]]{0,12}", 1..4),
        )
    }

    fn encode(frames: &[(Option<String>, Option<String>, Vec<String>)], crlf: bool) -> Vec<u8> {
        let nl = if crlf { "\r\n" } else { "\n" };
        let mut out = String::new();
        for (id, event, data) in frames {
            if let Some(id) = id {
                out.push_str(&format!("id: {}{}", id, nl));
            }
            if let Some(event) = event {
                out.push_str(&format!("event: {}{}", event, nl));
            }
            for line in data {
                out.push_str(&format!("data: {}{}", line, nl));
            }
            out.push_str(nl);
        }
        out.into_bytes()
    }

    proptest! {
        #[test]
        fn prop_split_invariance(
            frames in proptest::collection::vec(arb_frame(), 1..6),
            crlf in any::<bool>(),
            cuts in proptest::collection::vec(any::<prop::sample::Index>(), 0..8),
        ) {
            let bytes = encode(&frames, crlf);

            let whole = FrameParser::new().feed(&bytes);
            prop_assert_eq!(whole.len(), frames.len());

            let mut points: Vec<usize> = cuts.iter().map(|i| i.index(bytes.len() + 1)).collect();
            points.sort_unstable();
            points.dedup();

            let mut parser = FrameParser::new();
            let mut split = Vec::new();
            let mut start = 0;
            for point in points.into_iter().chain(std::iter::once(bytes.len())) {
                split.extend(parser.feed(&bytes[start..point]));
                start = point;
            }
            prop_assert_eq!(split, whole);
        }
    }
}
