//! Line protocol codec
//!
//! A handler process writes free-form text to stdout. Exactly one line per
//! invocation is a JSON object carrying [`PAYLOAD_KEY`]; that line holds the
//! invocation result. Every other line is the handler's own output and is
//! relayed untouched.

use bytes::{Buf, BytesMut};
use offline_core::Platform;
use serde::Deserialize;
use serde_json::Value;

/// Reserved key wrapping the invocation result
pub const PAYLOAD_KEY: &str = "__offline_payload__";

/// Longest line held back waiting for its terminator
pub const MAX_LINE_BYTES: usize = 16 * 1024 * 1024;

/// A classified stdout line
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// The invocation result
    Payload(Value),
    /// Output to relay to the host's log sink
    PassThrough(String),
}

/// Line terminator expected from the child
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LineTerminator {
    /// Whatever the host platform uses
    #[default]
    Platform,
    Lf,
    Crlf,
}

impl LineTerminator {
    pub fn as_str(self, platform: Platform) -> &'static str {
        match self {
            Self::Platform => platform.line_terminator(),
            Self::Lf => "\n",
            Self::Crlf => "\r\n",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "platform" | "native" => Some(Self::Platform),
            "lf" | "unix" => Some(Self::Lf),
            "crlf" | "windows" => Some(Self::Crlf),
            _ => None,
        }
    }
}

/// Classify a single line.
///
/// Only a JSON object containing [`PAYLOAD_KEY`] is a payload. Anything
/// else, including JSON the handler logs for itself, passes through.
pub fn classify_line(line: &str) -> Frame {
    let json_text = line.strip_suffix('\r').unwrap_or(line);

    if let Ok(Value::Object(mut object)) = serde_json::from_str::<Value>(json_text) {
        if let Some(payload) = object.remove(PAYLOAD_KEY) {
            return Frame::Payload(payload);
        }
    }

    Frame::PassThrough(line.to_string())
}

/// Classify every line of one output chunk, in order.
///
/// The chunk is treated as complete: its final segment is classified even
/// without a trailing terminator, and an empty segment after a final
/// terminator is dropped.
pub fn classify(chunk: &[u8], terminator: &str) -> Vec<Frame> {
    let decoded = String::from_utf8_lossy(chunk);
    let text = decoded.strip_suffix(terminator).unwrap_or(&*decoded);
    if text.is_empty() {
        return Vec::new();
    }

    text.split(terminator).map(classify_line).collect()
}

/// Incremental splitter for a child's stdout.
///
/// Partial lines are held back until their terminator arrives, so a line
/// split across two reads is classified once, whole. A line that outgrows
/// the size limit is passed through as it stands and the rest of it starts
/// a new line.
#[derive(Debug)]
pub struct LineCodec {
    terminator: &'static [u8],
    buffer: BytesMut,
    /// Prefix of `buffer` already known to hold no terminator
    scanned: usize,
    max_line: usize,
}

impl LineCodec {
    pub fn new(terminator: LineTerminator, platform: Platform) -> Self {
        Self {
            terminator: terminator.as_str(platform).as_bytes(),
            buffer: BytesMut::new(),
            scanned: 0,
            max_line: MAX_LINE_BYTES,
        }
    }

    #[must_use]
    pub fn with_max_line(mut self, max_line: usize) -> Self {
        self.max_line = max_line.max(1);
        self
    }

    /// Feed a chunk and return the frames it completed
    pub fn decode(&mut self, chunk: &[u8]) -> Vec<Frame> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while let Some(pos) = find(&self.buffer[self.scanned..], self.terminator) {
            let line = self.buffer.split_to(self.scanned + pos);
            self.buffer.advance(self.terminator.len());
            self.scanned = 0;
            frames.push(classify_line(&String::from_utf8_lossy(&line)));
        }

        while self.buffer.len() > self.max_line {
            let line = self.buffer.split_to(self.max_line);
            frames.push(Frame::PassThrough(String::from_utf8_lossy(&line).into_owned()));
        }

        // A terminator may straddle this chunk and the next
        self.scanned = self
            .buffer
            .len()
            .saturating_sub(self.terminator.len() - 1);
        frames
    }

    /// Flush whatever is left once the stream has ended
    pub fn finish(&mut self) -> Option<Frame> {
        self.scanned = 0;
        if self.buffer.is_empty() {
            return None;
        }
        let rest = self.buffer.split();
        Some(classify_line(&String::from_utf8_lossy(&rest)))
    }

    /// Bytes waiting for a terminator
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pass(line: &str) -> Frame {
        Frame::PassThrough(line.to_string())
    }

    #[test]
    fn test_extracts_payload_between_output() {
        let chunk = b"booting\n{\"level\":\"info\",\"msg\":\"hi\"}\n{\"__offline_payload__\": {\"result\": 42}}\nbye\n";
        let frames = classify(chunk, "\n");

        assert_eq!(
            frames,
            vec![
                pass("booting"),
                pass("{\"level\":\"info\",\"msg\":\"hi\"}"),
                Frame::Payload(json!({"result": 42})),
                pass("bye"),
            ]
        );
    }

    #[test]
    fn test_non_object_json_passes_through() {
        for line in ["42", "\"__offline_payload__\"", "[{\"__offline_payload__\": 1}]", "null", "true"] {
            assert_eq!(classify_line(line), pass(line), "line {line}");
        }
    }

    #[test]
    fn test_nested_reserved_key_is_not_payload() {
        let line = r#"{"data": {"__offline_payload__": 1}}"#;
        assert_eq!(classify_line(line), pass(line));

        let line = r#"{"__offline_payload": 1}"#;
        assert_eq!(classify_line(line), pass(line));
    }

    #[test]
    fn test_null_payload_is_payload() {
        assert_eq!(
            classify_line(r#"{"__offline_payload__": null}"#),
            Frame::Payload(Value::Null)
        );
    }

    #[test]
    fn test_invalid_json_passes_through() {
        assert_eq!(classify_line("{not json"), pass("{not json"));
        assert_eq!(classify_line(""), pass(""));
    }

    #[test]
    fn test_splits_on_configured_terminator() {
        let frames = classify(b"a\r\nb\r\n", "\r\n");
        assert_eq!(frames, vec![pass("a"), pass("b")]);

        // A bare newline is not a terminator under CRLF
        let frames = classify(b"a\nb", "\r\n");
        assert_eq!(frames, vec![pass("a\nb")]);
    }

    #[test]
    fn test_crlf_payload_under_lf_terminator() {
        let frames = classify(b"{\"__offline_payload__\": 7}\r\n", "\n");
        assert_eq!(frames, vec![Frame::Payload(json!(7))]);
    }

    #[test]
    fn test_interior_empty_lines_are_kept() {
        let frames = classify(b"a\n\nb", "\n");
        assert_eq!(frames, vec![pass("a"), pass(""), pass("b")]);
        assert!(classify(b"", "\n").is_empty());
    }

    #[test]
    fn test_codec_buffers_partial_lines() {
        let mut codec = LineCodec::new(LineTerminator::Lf, Platform::Unix);

        assert!(codec.decode(b"boot").is_empty());
        assert_eq!(codec.pending(), 4);
        assert_eq!(codec.decode(b"ing\n{\"__offline_pay"), vec![pass("booting")]);
        assert_eq!(
            codec.decode(b"load__\": [1, 2]}\ntail"),
            vec![Frame::Payload(json!([1, 2]))]
        );
        assert_eq!(codec.finish(), Some(pass("tail")));
        assert_eq!(codec.finish(), None);
    }

    #[test]
    fn test_codec_terminator_split_across_chunks() {
        let mut codec = LineCodec::new(LineTerminator::Crlf, Platform::Unix);

        assert!(codec.decode(b"one\r").is_empty());
        assert_eq!(codec.decode(b"\ntwo\r\n"), vec![pass("one"), pass("two")]);
        assert_eq!(codec.pending(), 0);
    }

    #[test]
    fn test_codec_multibyte_split() {
        let mut codec = LineCodec::new(LineTerminator::Lf, Platform::Unix);
        let text = "héllo\n".as_bytes();

        assert!(codec.decode(&text[..2]).is_empty());
        assert_eq!(codec.decode(&text[2..]), vec![pass("héllo")]);
    }

    #[test]
    fn test_codec_long_line_arrives_in_pieces() {
        let mut codec = LineCodec::new(LineTerminator::Crlf, Platform::Unix);

        for _ in 0..100 {
            assert!(codec.decode(b"xxxxxxxxxx").is_empty());
        }
        assert!(codec.decode(b"\r").is_empty());
        assert_eq!(codec.pending(), 1001);

        let frames = codec.decode(b"\nnext\r\n");
        assert_eq!(frames, vec![pass(&"x".repeat(1000)), pass("next")]);
        assert_eq!(codec.pending(), 0);
    }

    #[test]
    fn test_codec_oversized_line_passes_through() {
        let mut codec = LineCodec::new(LineTerminator::Lf, Platform::Unix).with_max_line(8);

        assert_eq!(codec.decode(b"0123456789"), vec![pass("01234567")]);
        assert_eq!(codec.pending(), 2);
        assert_eq!(
            codec.decode(b"\n{\"__offline_payload__\": 1}\n"),
            vec![pass("89"), Frame::Payload(json!(1))]
        );
    }

    #[test]
    fn test_terminator_from_str() {
        assert_eq!(LineTerminator::from_str("CRLF"), Some(LineTerminator::Crlf));
        assert_eq!(LineTerminator::from_str("lf"), Some(LineTerminator::Lf));
        assert_eq!(LineTerminator::from_str("platform"), Some(LineTerminator::Platform));
        assert_eq!(LineTerminator::from_str("cr"), None);
        assert_eq!(LineTerminator::Platform.as_str(Platform::Windows), "\r\n");
    }
}
