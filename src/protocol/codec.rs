// Warden - Framing
//
// Newline-delimited JSON on top of `tokio_util`'s `LinesCodec`. The
// decoder yields `Result<Envelope, Rejection>` items: a rejected frame
// is an ordinary item, while a fatal framing error ends the stream.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

use super::envelope::{DecodeError, Envelope, RawEnvelope, Rejection};
use super::ProtocolError;

/// Largest accepted frame, excluding the newline.
pub const MAX_FRAME_LENGTH: usize = 1024 * 1024;

/// Serialize an envelope to a single line (without the trailing newline).
pub fn encode(envelope: &Envelope) -> Result<String, ProtocolError> {
    let raw = envelope.to_raw()?;
    serde_json::to_string(&raw).map_err(|e| ProtocolError::Encode(e.to_string()))
}

/// Parse and type-check one line.
pub fn decode(line: &str) -> Result<Envelope, DecodeError> {
    let raw: RawEnvelope = serde_json::from_str(line)
        .map_err(|e| DecodeError::Fatal(ProtocolError::Malformed(e.to_string())))?;
    Envelope::from_raw(raw).map_err(DecodeError::Rejected)
}

pub struct EnvelopeCodec {
    lines: LinesCodec,
}

impl EnvelopeCodec {
    pub fn new() -> Self {
        Self {
            lines: LinesCodec::new_with_max_length(MAX_FRAME_LENGTH),
        }
    }
}

impl Default for EnvelopeCodec {
    fn default() -> Self {
        Self::new()
    }
}

fn lines_error(err: LinesCodecError) -> ProtocolError {
    match err {
        LinesCodecError::MaxLineLengthExceeded => ProtocolError::FrameTooLarge,
        LinesCodecError::Io(e) => ProtocolError::Io(e),
    }
}

fn next_item(line: Option<String>) -> Result<Option<Result<Envelope, Rejection>>, ProtocolError> {
    let Some(line) = line else {
        return Ok(None);
    };
    match decode(&line) {
        Ok(envelope) => Ok(Some(Ok(envelope))),
        Err(DecodeError::Rejected(rejection)) => Ok(Some(Err(rejection))),
        Err(DecodeError::Fatal(e)) => Err(e),
    }
}

impl Decoder for EnvelopeCodec {
    type Item = Result<Envelope, Rejection>;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let line = self.lines.decode(src).map_err(lines_error)?;
        next_item(line)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let line = self.lines.decode_eof(src).map_err(lines_error)?;
        next_item(line)
    }
}

impl Encoder<Envelope> for EnvelopeCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Envelope, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let line = encode(&item)?;
        if line.len() > MAX_FRAME_LENGTH {
            return Err(ProtocolError::FrameTooLarge);
        }
        self.lines.encode(line, dst).map_err(lines_error)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ErrorCode, Message, MessageKind};

    #[test]
    fn test_encode_is_single_line() {
        let env = Envelope::new(Message::PingRequest);
        let line = encode(&env).unwrap();
        assert!(!line.contains('\n'));
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["type"], "ping_request");
        assert_eq!(value["version"], "1.0");
        assert_eq!(value["id"], env.id.as_str());
    }

    #[test]
    fn test_malformed_line_is_fatal() {
        assert!(matches!(decode("not json"), Err(DecodeError::Fatal(_))));
        assert!(matches!(decode(r#"{"type":"ping_request"}"#), Err(DecodeError::Fatal(_))));
    }

    #[test]
    fn test_codec_yields_rejection_then_continues() {
        let mut codec = EnvelopeCodec::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(
            br#"{"version":"1.0","type":"warp","id":"a","timestamp":"2024-01-01T00:00:00Z"}"#,
        );
        buf.extend_from_slice(b"\n");
        let ping = encode(&Envelope::reply("b", Message::PingRequest)).unwrap();
        buf.extend_from_slice(ping.as_bytes());
        buf.extend_from_slice(b"\n");

        let first = codec.decode(&mut buf).unwrap().unwrap();
        let rejection = first.unwrap_err();
        assert_eq!(rejection.code, ErrorCode::UnknownMessageType);
        assert_eq!(rejection.id, "a");

        let second = codec.decode(&mut buf).unwrap().unwrap().unwrap();
        assert_eq!(second.id, "b");
        assert_eq!(second.kind(), MessageKind::PingRequest);

        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_partial_frame_waits_for_newline() {
        let mut codec = EnvelopeCodec::new();
        let line = encode(&Envelope::new(Message::StatusRequest)).unwrap();
        let (head, tail) = line.split_at(line.len() / 2);

        let mut buf = BytesMut::from(head.as_bytes());
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(tail.as_bytes());
        buf.extend_from_slice(b"\n");
        assert!(codec.decode(&mut buf).unwrap().unwrap().is_ok());
    }

    #[test]
    fn test_oversized_frame_is_an_error() {
        let mut codec = EnvelopeCodec::new();
        let mut buf = BytesMut::from(vec![b'x'; MAX_FRAME_LENGTH + 10].as_slice());
        assert!(matches!(codec.decode(&mut buf), Err(ProtocolError::FrameTooLarge)));
    }

    #[test]
    fn test_encoder_appends_newline() {
        let mut codec = EnvelopeCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(Envelope::new(Message::PingRequest), &mut buf).unwrap();
        assert_eq!(buf.last(), Some(&b'\n'));
    }
}
