//! Framed codec for automation-server communication.
//!
//! Uses LinesCodec for newline framing + serde_json for serialization.
//! Works over any AsyncRead/AsyncWrite (child pipes, in-memory duplex streams).
//!
//! Decoding never fails on bad content: an unparseable or oversized line is
//! yielded as `Err(MalformedFrame)` so the reader loop can drop it and keep
//! going. Only I/O errors terminate the stream.

use std::io;

use serde::Serialize;
use tokio_util::bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

use super::protocol::Inbound;
use crate::error::ClientError;

/// Upper bound for one inbound line. Snapshots with inline images are large.
pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// A frame that could not be turned into an [`Inbound`] message.
#[derive(Debug, Clone, PartialEq)]
pub struct MalformedFrame {
    pub reason: String,
    /// Leading bytes of the offending line, for logs.
    pub excerpt: String,
}

impl MalformedFrame {
    const EXCERPT_CHARS: usize = 200;

    fn new(reason: impl Into<String>, line: &str) -> Self {
        Self {
            reason: reason.into(),
            excerpt: line.chars().take(Self::EXCERPT_CHARS).collect(),
        }
    }
}

impl std::fmt::Display for MalformedFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.reason)
    }
}

impl From<MalformedFrame> for ClientError {
    fn from(frame: MalformedFrame) -> Self {
        ClientError::MalformedFrame(frame.reason)
    }
}

/// Codec that frames messages with a trailing newline and serializes with JSON.
///
/// Wraps LinesCodec and adds serde_json serialization.
pub struct JsonLinesCodec {
    inner: LinesCodec,
}

impl Default for JsonLinesCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl JsonLinesCodec {
    pub fn new() -> Self {
        Self::with_max_length(MAX_FRAME_BYTES)
    }

    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            inner: LinesCodec::new_with_max_length(max_length),
        }
    }

    fn parse(line: &str) -> Result<Inbound, MalformedFrame> {
        let value: serde_json::Value =
            serde_json::from_str(line).map_err(|e| MalformedFrame::new(e.to_string(), line))?;
        Inbound::from_value(value).map_err(|reason| MalformedFrame::new(reason, line))
    }
}

impl Decoder for JsonLinesCodec {
    type Item = Result<Inbound, MalformedFrame>;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.inner.decode(src) {
                Ok(Some(line)) => {
                    let trimmed = line.trim();
                    // Blank keep-alive lines carry nothing.
                    if trimmed.is_empty() {
                        continue;
                    }
                    return Ok(Some(Self::parse(trimmed)));
                }
                Ok(None) => return Ok(None),
                Err(LinesCodecError::MaxLineLengthExceeded) => {
                    return Ok(Some(Err(MalformedFrame::new(
                        "frame exceeds maximum length",
                        "",
                    ))));
                }
                Err(LinesCodecError::Io(e)) => return Err(e),
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode_eof(buf) {
            Ok(Some(line)) if line.trim().is_empty() => Ok(None),
            Ok(Some(line)) => Ok(Some(Self::parse(line.trim()))),
            Ok(None) => Ok(None),
            Err(LinesCodecError::MaxLineLengthExceeded) => Ok(Some(Err(MalformedFrame::new(
                "frame exceeds maximum length",
                "",
            )))),
            Err(LinesCodecError::Io(e)) => Err(e),
        }
    }
}

impl<T: Serialize> Encoder<T> for JsonLinesCodec {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json = serde_json::to_string(&item)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        tracing::trace!(json_size_bytes = json.len(), "Encoding frame");
        // serde_json never emits raw newlines, so one document is one line.
        self.inner.encode(json, dst).map_err(|e| match e {
            LinesCodecError::Io(e) => e,
            LinesCodecError::MaxLineLengthExceeded => {
                io::Error::new(io::ErrorKind::InvalidData, "frame exceeds maximum length")
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::{Outbound, OutboundNotification, Request, Response};
    use serde_json::json;

    #[test]
    fn encode_appends_newline() {
        let mut codec = JsonLinesCodec::new();
        let mut buf = BytesMut::new();

        let req = Outbound::Request(Request::new(1, "initialize", None));
        codec.encode(req, &mut buf).unwrap();

        assert_eq!(
            &buf[..],
            br#"{"jsonrpc":"2.0","id":1,"method":"initialize"}
"#
        );
    }

    #[test]
    fn frames_are_never_interleaved_in_one_buffer() {
        let mut codec = JsonLinesCodec::new();
        let mut buf = BytesMut::new();

        codec
            .encode(Outbound::Request(Request::new(1, "a", None)), &mut buf)
            .unwrap();
        codec
            .encode(
                Outbound::Notification(OutboundNotification::new("b", Some(json!({"x": 1})))),
                &mut buf,
            )
            .unwrap();

        let text = std::str::from_utf8(&buf).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains(r#""method":"a""#));
        assert!(lines[1].contains(r#""method":"b""#));
    }

    #[test]
    fn decodes_response_frame() {
        let mut codec = JsonLinesCodec::new();
        let mut buf = BytesMut::from(&b"{\"jsonrpc\":\"2.0\",\"id\":9,\"result\":{\"ok\":true}}\n"[..]);

        let frame = codec.decode(&mut buf).unwrap().unwrap().unwrap();
        assert_eq!(
            frame,
            Inbound::Response(Response {
                id: 9,
                outcome: Ok(json!({"ok": true})),
            })
        );
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn malformed_frame_does_not_end_stream() {
        let mut codec = JsonLinesCodec::new();
        let mut buf = BytesMut::from(&b"not json at all\n{\"id\":2,\"result\":null}\n"[..]);

        let first = codec.decode(&mut buf).unwrap().unwrap();
        let err = first.unwrap_err();
        assert!(err.excerpt.starts_with("not json"));
        assert!(
            ClientError::from(err)
                .to_string()
                .starts_with("malformed frame: ")
        );

        let second = codec.decode(&mut buf).unwrap().unwrap().unwrap();
        assert!(matches!(second, Inbound::Response(Response { id: 2, .. })));
    }

    #[test]
    fn blank_lines_are_skipped() {
        let mut codec = JsonLinesCodec::new();
        let mut buf = BytesMut::from(&b"\n   \n{\"method\":\"ping\"}\n"[..]);

        let frame = codec.decode(&mut buf).unwrap().unwrap().unwrap();
        assert!(matches!(frame, Inbound::Notification(_)));
    }

    #[test]
    fn oversized_frame_is_reported_and_skipped() {
        let mut codec = JsonLinesCodec::with_max_length(16);
        let mut buf = BytesMut::from(
            &b"{\"id\":1,\"result\":\"this line is far too long\"}\n{\"id\":2}\n"[..],
        );

        let first = codec.decode(&mut buf).unwrap().unwrap();
        assert!(first.is_err());

        // LinesCodec discards the rest of the oversized line before resuming.
        let mut next = codec.decode(&mut buf).unwrap();
        while let Some(Err(_)) = next {
            next = codec.decode(&mut buf).unwrap();
        }
        let frame = next.unwrap().unwrap();
        assert!(matches!(frame, Inbound::Response(Response { id: 2, .. })));
    }

    #[test]
    fn unterminated_trailing_frame_is_decoded_at_eof() {
        let mut codec = JsonLinesCodec::new();
        let mut buf = BytesMut::from(&b"{\"id\":5,\"result\":1}"[..]);

        assert!(codec.decode(&mut buf).unwrap().is_none());
        let frame = codec.decode_eof(&mut buf).unwrap().unwrap().unwrap();
        assert!(matches!(frame, Inbound::Response(Response { id: 5, .. })));
    }
}
