//! Length-prefixed JSON-RPC codec for child stdio
//!
//! Wire format: a header block terminated by `\r\n\r\n` containing at least
//! `Content-Length: N` (case-insensitive), followed by exactly `N` bytes of
//! UTF-8 JSON. The decoder is a streaming state machine over arbitrary byte
//! chunks; the encoder emits header and body as one buffer so a frame is a
//! single write.

use bytes::{Buf, BufMut, BytesMut};
use serde_json::Value;
use std::io;
use tokio_util::codec::{Decoder, Encoder};
use tracing::debug;

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Codec speaking `Content-Length`-framed JSON both ways.
///
/// Stateless between frames: each decode call rescans the buffer from the
/// start, so a malformed header block can be skipped without poisoning
/// later frames.
#[derive(Debug, Default, Clone, Copy)]
pub struct FramedJsonCodec;

impl FramedJsonCodec {
    pub fn new() -> Self {
        Self
    }

    /// Encode one value into a standalone frame buffer.
    pub fn encode_frame(value: &Value) -> Vec<u8> {
        let body = serde_json::to_vec(value).unwrap_or_else(|_| b"null".to_vec());
        let mut frame = Vec::with_capacity(body.len() + 32);
        frame.extend_from_slice(format!("Content-Length: {}\r\n\r\n", body.len()).as_bytes());
        frame.extend_from_slice(&body);
        frame
    }
}

impl Encoder<Value> for FramedJsonCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Value, dst: &mut BytesMut) -> Result<(), io::Error> {
        let body = serde_json::to_vec(&item)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        dst.reserve(body.len() + 32);
        dst.put_slice(format!("Content-Length: {}\r\n\r\n", body.len()).as_bytes());
        dst.put_slice(&body);
        Ok(())
    }
}

impl Decoder for FramedJsonCodec {
    type Item = Value;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Value>, io::Error> {
        loop {
            let Some(separator) = find_subsequence(src, HEADER_TERMINATOR) else {
                // No complete header block yet; wait for more bytes.
                return Ok(None);
            };

            let body_start = separator + HEADER_TERMINATOR.len();

            let Some(content_length) = parse_content_length(&src[..separator]) else {
                // Malformed header block: advance past the bad separator and
                // try again on whatever follows.
                debug!("skipping malformed frame header block");
                src.advance(body_start);
                continue;
            };

            if src.len() < body_start + content_length {
                // Partial body; reserve what the frame still needs.
                src.reserve(body_start + content_length - src.len());
                return Ok(None);
            }

            src.advance(body_start);
            let body = src.split_to(content_length);

            match serde_json::from_slice::<Value>(&body) {
                Ok(value) => return Ok(Some(value)),
                Err(e) => {
                    // Invalid JSON body is dropped silently; framing stays
                    // intact so the next frame decodes normally.
                    debug!(error = %e, "dropping frame with invalid JSON body");
                    continue;
                },
            }
        }
    }
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|window| window == needle)
}

fn parse_content_length(headers: &[u8]) -> Option<usize> {
    let text = std::str::from_utf8(headers).ok()?;
    for line in text.split("\r\n") {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        if name.trim().eq_ignore_ascii_case("content-length") {
            return value.trim().parse::<usize>().ok();
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn decode_all(codec: &mut FramedJsonCodec, buf: &mut BytesMut) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(Some(value)) = codec.decode(buf) {
            out.push(value);
        }
        out
    }

    #[test]
    fn round_trip_single_frame() {
        let value = json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"});
        let mut codec = FramedJsonCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(value.clone(), &mut buf).unwrap();

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, value);
        assert!(buf.is_empty());
    }

    #[test]
    fn decodes_across_arbitrary_chunk_boundaries() {
        let value = json!({"jsonrpc": "2.0", "id": 7, "result": {"ok": true}});
        let frame = FramedJsonCodec::encode_frame(&value);

        let mut codec = FramedJsonCodec::new();
        let mut buf = BytesMut::new();
        for byte in &frame[..frame.len() - 1] {
            buf.put_u8(*byte);
            assert!(codec.decode(&mut buf).unwrap().is_none());
        }
        buf.put_u8(frame[frame.len() - 1]);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), value);
    }

    #[test]
    fn multiple_frames_in_one_chunk_preserve_order() {
        let first = json!({"id": 1});
        let second = json!({"id": 2});
        let third = json!({"id": 3});

        let mut buf = BytesMut::new();
        for v in [&first, &second, &third] {
            buf.put_slice(&FramedJsonCodec::encode_frame(v));
        }

        let mut codec = FramedJsonCodec::new();
        assert_eq!(decode_all(&mut codec, &mut buf), vec![first, second, third]);
    }

    #[test]
    fn header_is_case_insensitive() {
        let mut buf = BytesMut::from(&b"content-length: 2\r\n\r\n{}"[..]);
        let mut codec = FramedJsonCodec::new();
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), json!({}));
    }

    #[test]
    fn extra_headers_are_ignored() {
        let mut buf =
            BytesMut::from(&b"Content-Type: application/json\r\nContent-Length: 2\r\n\r\n{}"[..]);
        let mut codec = FramedJsonCodec::new();
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), json!({}));
    }

    #[test]
    fn malformed_header_block_is_skipped() {
        let good = FramedJsonCodec::encode_frame(&json!({"ok": 1}));
        let mut buf = BytesMut::from(&b"garbage without length\r\n\r\n"[..]);
        buf.put_slice(&good);

        let mut codec = FramedJsonCodec::new();
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), json!({"ok": 1}));
    }

    #[test]
    fn non_numeric_length_is_skipped() {
        let good = FramedJsonCodec::encode_frame(&json!({"ok": 2}));
        let mut buf = BytesMut::from(&b"Content-Length: nope\r\n\r\n"[..]);
        buf.put_slice(&good);

        let mut codec = FramedJsonCodec::new();
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), json!({"ok": 2}));
    }

    #[test]
    fn invalid_json_body_is_dropped_silently() {
        let mut buf = BytesMut::from(&b"Content-Length: 9\r\n\r\nnot json!"[..]);
        buf.put_slice(&FramedJsonCodec::encode_frame(&json!({"ok": 3})));

        let mut codec = FramedJsonCodec::new();
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), json!({"ok": 3}));
    }

    #[test]
    fn partial_frames_never_emit() {
        let frame = FramedJsonCodec::encode_frame(&json!({"big": "payload"}));
        let mut buf = BytesMut::from(&frame[..frame.len() / 2]);
        let mut codec = FramedJsonCodec::new();
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn zero_length_body() {
        // Content-Length: 0 carries no JSON; the empty body fails to parse
        // and is dropped without consuming anything that follows.
        let mut buf = BytesMut::from(&b"Content-Length: 0\r\n\r\n"[..]);
        buf.put_slice(&FramedJsonCodec::encode_frame(&json!(null)));

        let mut codec = FramedJsonCodec::new();
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), json!(null));
    }
}
