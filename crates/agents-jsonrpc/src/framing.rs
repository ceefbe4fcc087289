//! Content-Length framing
//!
//! Stream transports delimit messages the same way LSP does:
//!
//! ```text
//! Content-Length: <N>\r\n
//! \r\n
//! <N bytes of UTF-8 JSON>
//! ```
//!
//! `N` counts encoded bytes. Frames are concatenated with no separator beyond
//! their own headers, and a read from the pipe may end anywhere inside one, so
//! [`FrameParser`] keeps an owned buffer plus an explicit [`ParserState`] that
//! survives across chunks.

use bytes::{Buf, BytesMut};
use serde::Serialize;
use tracing::trace;

use crate::protocol::{parse_payload, JsonRpcMessage, RpcError, RpcResult};

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";
const CONTENT_LENGTH: &str = "Content-Length";

/// Longest header block accepted before the terminator shows up
pub const MAX_HEADER_LEN: usize = 8 * 1024;

/// Where the parser is within the current frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserState {
    /// Scanning for the blank line that ends a header block
    AwaitingHeaders,
    /// Headers consumed; waiting until `remaining` body bytes are buffered
    AwaitingBody { remaining: usize },
}

/// Incremental Content-Length frame decoder.
///
/// Feed it raw chunks in arrival order; each call returns every message that
/// became complete, in wire order. A frame whose body is not valid JSON-RPC
/// yields an `Err` entry in place of its message and parsing resumes at the
/// next frame.
#[derive(Debug)]
pub struct FrameParser {
    buffer: BytesMut,
    state: ParserState,
    /// Prefix of `buffer` already searched for the header terminator
    scanned: usize,
}

impl FrameParser {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::new(),
            state: ParserState::AwaitingHeaders,
            scanned: 0,
        }
    }

    /// Current state, for diagnostics and tests
    pub fn state(&self) -> ParserState {
        self.state
    }

    /// Bytes received but not yet consumed by a complete frame
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Append `chunk` and drain every frame that is now complete.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<RpcResult<JsonRpcMessage>> {
        self.buffer.extend_from_slice(chunk);
        let mut out = Vec::new();

        loop {
            match self.state {
                ParserState::AwaitingHeaders => {
                    // Resume where the last scan stopped; the terminator may straddle it.
                    let start = self.scanned.saturating_sub(HEADER_TERMINATOR.len() - 1);
                    let Some(end) =
                        find(&self.buffer[start..], HEADER_TERMINATOR).map(|at| start + at)
                    else {
                        self.scanned = self.buffer.len();
                        if self.buffer.len() > MAX_HEADER_LEN {
                            out.push(Err(RpcError::protocol(format!(
                                "no frame header terminator within {} bytes, discarding input",
                                self.buffer.len()
                            ))));
                            self.buffer.clear();
                            self.scanned = 0;
                        }
                        break;
                    };
                    self.scanned = 0;
                    let header = self.buffer.split_to(end);
                    self.buffer.advance(HEADER_TERMINATOR.len());

                    match content_length(&header) {
                        Ok(length) => {
                            trace!(length, "frame header parsed");
                            self.state = ParserState::AwaitingBody { remaining: length };
                        }
                        // The header block is already consumed; the next frame starts clean.
                        Err(e) => out.push(Err(e)),
                    }
                }
                ParserState::AwaitingBody { remaining } => {
                    if self.buffer.len() < remaining {
                        break;
                    }
                    let body = self.buffer.split_to(remaining);
                    self.state = ParserState::AwaitingHeaders;
                    out.extend(parse_payload(&body));
                }
            }
        }

        out
    }
}

impl Default for FrameParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Serialize `payload` as JSON and wrap it in a Content-Length frame.
///
/// Accepts a single message or a slice of messages (a batch).
pub fn encode_frame<T: Serialize + ?Sized>(payload: &T) -> RpcResult<Vec<u8>> {
    let body = serde_json::to_vec(payload)?;
    let mut frame = format!("{}: {}\r\n\r\n", CONTENT_LENGTH, body.len()).into_bytes();
    frame.extend_from_slice(&body);
    Ok(frame)
}

fn content_length(header: &[u8]) -> RpcResult<usize> {
    let text = std::str::from_utf8(header)
        .map_err(|_| RpcError::protocol("frame header is not valid UTF-8"))?;

    for line in text.split("\r\n") {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        if name.trim() == CONTENT_LENGTH {
            return value.trim().parse::<usize>().map_err(|_| {
                RpcError::protocol(format!("invalid Content-Length value: {:?}", value.trim()))
            });
        }
    }

    Err(RpcError::protocol(format!(
        "frame header without Content-Length: {:?}",
        text
    )))
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{JsonRpcResponse, RequestId};
    use serde_json::json;

    fn ok(results: Vec<RpcResult<JsonRpcMessage>>) -> Vec<JsonRpcMessage> {
        results.into_iter().map(|r| r.unwrap()).collect()
    }

    #[test]
    fn test_round_trip_ascii() {
        let msg = JsonRpcMessage::request(1u64, "ping", Some(json!({"hello": "world"})));
        let frame = encode_frame(&msg).unwrap();

        let mut parser = FrameParser::new();
        assert_eq!(ok(parser.push(&frame)), vec![msg]);
        assert_eq!(parser.buffered_len(), 0);
    }

    #[test]
    fn test_round_trip_multibyte_counts_bytes() {
        let msg = JsonRpcMessage::notification("log", Some(json!({"text": "héllo wörld ✓ 日本語 🎉"})));
        let frame = encode_frame(&msg).unwrap();

        let body_len = serde_json::to_vec(&msg).unwrap().len();
        let header = String::from_utf8_lossy(&frame[..frame.len() - body_len]).to_string();
        assert_eq!(header, format!("Content-Length: {}\r\n\r\n", body_len));

        let mut parser = FrameParser::new();
        assert_eq!(ok(parser.push(&frame)), vec![msg]);
    }

    #[test]
    fn test_split_at_every_offset() {
        let msg = JsonRpcMessage::Response(JsonRpcResponse::success(
            42u64,
            json!({"text": "ünïcödé across the split"}),
        ));
        let frame = encode_frame(&msg).unwrap();

        for offset in 0..=frame.len() {
            let mut parser = FrameParser::new();
            let mut got = ok(parser.push(&frame[..offset]));
            got.extend(ok(parser.push(&frame[offset..])));
            assert_eq!(got, vec![msg.clone()], "split at offset {}", offset);
            assert_eq!(parser.state(), ParserState::AwaitingHeaders);
        }
    }

    #[test]
    fn test_two_frames_in_one_chunk() {
        let first = JsonRpcMessage::request(1u64, "a", None);
        let second = JsonRpcMessage::notification("b", None);
        let mut chunk = encode_frame(&first).unwrap();
        chunk.extend(encode_frame(&second).unwrap());

        let mut parser = FrameParser::new();
        assert_eq!(ok(parser.push(&chunk)), vec![first, second]);
    }

    #[test]
    fn test_state_transitions_across_boundary() {
        let frame = encode_frame(&JsonRpcMessage::notification("x", None)).unwrap();
        let header_end = find(&frame, HEADER_TERMINATOR).unwrap() + HEADER_TERMINATOR.len();

        let mut parser = FrameParser::new();
        assert!(parser.push(&frame[..header_end - 2]).is_empty());
        assert_eq!(parser.state(), ParserState::AwaitingHeaders);

        assert!(parser.push(&frame[header_end - 2..header_end]).is_empty());
        assert_eq!(
            parser.state(),
            ParserState::AwaitingBody {
                remaining: frame.len() - header_end
            }
        );

        assert_eq!(parser.push(&frame[header_end..]).len(), 1);
        assert_eq!(parser.state(), ParserState::AwaitingHeaders);
    }

    #[test]
    fn test_malformed_json_does_not_poison_next_frame() {
        let bad = b"Content-Length: 9\r\n\r\n{not json";
        let good = encode_frame(&JsonRpcMessage::notification("after", None)).unwrap();
        let mut chunk = bad.to_vec();
        chunk.extend(&good);

        let mut parser = FrameParser::new();
        let results = parser.push(&chunk);
        assert_eq!(results.len(), 2);
        assert!(results[0].as_ref().unwrap_err().is_protocol());
        assert_eq!(results[1].as_ref().unwrap().method(), Some("after"));
    }

    #[test]
    fn test_unknown_headers_are_ignored() {
        let body = br#"{"jsonrpc":"2.0","id":"x","result":true}"#;
        let mut frame = format!(
            "Content-Type: application/vscode-jsonrpc; charset=utf-8\r\nContent-Length: {}\r\n\r\n",
            body.len()
        )
        .into_bytes();
        frame.extend_from_slice(body);

        let mut parser = FrameParser::new();
        let messages = ok(parser.push(&frame));
        assert_eq!(messages[0].id(), Some(&RequestId::String("x".into())));
    }

    #[test]
    fn test_missing_content_length_is_reported_and_skipped() {
        let mut chunk = b"X-Other: 1\r\n\r\n".to_vec();
        chunk.extend(encode_frame(&JsonRpcMessage::notification("ok", None)).unwrap());

        let mut parser = FrameParser::new();
        let results = parser.push(&chunk);
        assert_eq!(results.len(), 2);
        assert!(results[0].is_err());
        assert!(results[1].is_ok());
    }

    #[test]
    fn test_oversized_header_is_reported_and_discarded() {
        let mut parser = FrameParser::new();
        // Arrives in pieces, each one under the limit on its own.
        assert!(parser.push(&[b'x'; 4096]).is_empty());
        assert!(parser.push(&[b'x'; 4096]).is_empty());
        let results = parser.push(&[b'x'; 4096]);
        assert_eq!(results.len(), 1);
        assert!(results[0].as_ref().unwrap_err().is_protocol());
        assert_eq!(parser.buffered_len(), 0);

        let frame = encode_frame(&JsonRpcMessage::notification("recovered", None)).unwrap();
        let messages = ok(parser.push(&frame));
        assert_eq!(messages[0].method(), Some("recovered"));
    }

    #[test]
    fn test_header_trickled_one_byte_at_a_time() {
        let frame = encode_frame(&JsonRpcMessage::request(3u64, "slow", None)).unwrap();
        let mut parser = FrameParser::new();
        let mut got = Vec::new();
        for byte in &frame {
            got.extend(ok(parser.push(std::slice::from_ref(byte))));
        }
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].method(), Some("slow"));
    }

    #[test]
    fn test_batch_frame_expands_to_members() {
        let batch = vec![
            JsonRpcMessage::Response(JsonRpcResponse::success(1u64, json!("a"))),
            JsonRpcMessage::Response(JsonRpcResponse::success(2u64, json!("b"))),
        ];
        let frame = encode_frame(&batch).unwrap();

        let mut parser = FrameParser::new();
        assert_eq!(ok(parser.push(&frame)), batch);
    }
}
