// Warden - Envelope
//
// Decoding is two-stage. A line first becomes a `RawEnvelope`; if that
// fails the stream is unusable and the error is fatal. The raw envelope
// is then checked for version, type tag, and payload shape. Those
// failures are `Rejection`s: they still carry the caller's correlation
// id, so the server can answer with an error response and keep serving.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::messages::{ErrorPayload, Message, MessageKind};
use super::{ErrorCode, ProtocolError, PROTOCOL_VERSION};

/// The envelope as it appears on the wire, before the payload is typed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEnvelope {
    pub version: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

/// A typed envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub version: String,
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub message: Message,
    /// Reserved for integrity checks; carried but not verified.
    pub signature: Option<String>,
}

impl Envelope {
    /// Wrap `message` in a new envelope with a fresh correlation id.
    pub fn new(message: Message) -> Self {
        Self::reply(Uuid::new_v4().to_string(), message)
    }

    /// Wrap `message` in an envelope answering the request `id`.
    pub fn reply(id: impl Into<String>, message: Message) -> Self {
        Self {
            version: PROTOCOL_VERSION.to_string(),
            id: id.into(),
            timestamp: Utc::now(),
            message,
            signature: None,
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.message.kind()
    }

    pub fn to_raw(&self) -> Result<RawEnvelope, ProtocolError> {
        let payload = self
            .message
            .payload()
            .map_err(|e| ProtocolError::Encode(e.to_string()))?;
        Ok(RawEnvelope {
            version: self.version.clone(),
            kind: self.kind().as_str().to_string(),
            id: self.id.clone(),
            timestamp: self.timestamp,
            payload,
            signature: self.signature.clone(),
        })
    }

    /// Type-check a raw envelope.
    pub fn from_raw(raw: RawEnvelope) -> Result<Self, Rejection> {
        if raw.version != PROTOCOL_VERSION {
            return Err(Rejection::new(
                raw.id,
                ErrorCode::UnsupportedVersion,
                format!(
                    "unsupported protocol version '{}', expected '{}'",
                    raw.version, PROTOCOL_VERSION
                ),
            ));
        }

        let kind: MessageKind = match raw.kind.parse() {
            Ok(kind) => kind,
            Err(unknown) => {
                return Err(Rejection::new(
                    raw.id,
                    ErrorCode::UnknownMessageType,
                    format!("unknown message type '{}'", unknown),
                ))
            }
        };

        let message = match Message::from_parts(kind, raw.payload) {
            Ok(message) => message,
            Err(e) => {
                return Err(Rejection::new(
                    raw.id,
                    ErrorCode::InvalidPayload,
                    format!("invalid {} payload: {}", kind, e),
                ))
            }
        };

        Ok(Self {
            version: raw.version,
            id: raw.id,
            timestamp: raw.timestamp,
            message,
            signature: raw.signature,
        })
    }
}

/// A well-framed envelope that could not be typed.
#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
    pub id: String,
    pub code: ErrorCode,
    pub message: String,
}

impl Rejection {
    pub fn new(id: impl Into<String>, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            code,
            message: message.into(),
        }
    }

    /// The error response a server sends back for this rejection.
    pub fn into_response(self) -> Envelope {
        Envelope::reply(self.id, Message::Error(ErrorPayload::new(self.code, self.message)))
    }

    pub fn into_protocol_error(self) -> ProtocolError {
        match self.code {
            ErrorCode::UnsupportedVersion => ProtocolError::UnsupportedVersion(self.message),
            ErrorCode::UnknownMessageType => ProtocolError::UnknownType(self.message),
            _ => ProtocolError::Malformed(self.message),
        }
    }
}

/// Failure to decode one frame.
#[derive(Debug)]
pub enum DecodeError {
    /// The frame is not an envelope at all. The connection cannot continue.
    Fatal(ProtocolError),
    /// The frame is an envelope but cannot be served.
    Rejected(Rejection),
}

impl From<DecodeError> for ProtocolError {
    fn from(err: DecodeError) -> Self {
        match err {
            DecodeError::Fatal(e) => e,
            DecodeError::Rejected(r) => r.into_protocol_error(),
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(version: &str, kind: &str, payload: Value) -> RawEnvelope {
        RawEnvelope {
            version: version.to_string(),
            kind: kind.to_string(),
            id: "req-1".to_string(),
            timestamp: Utc::now(),
            payload,
            signature: None,
        }
    }

    #[test]
    fn test_reply_keeps_correlation_id() {
        let env = Envelope::reply("abc", Message::PingRequest);
        assert_eq!(env.id, "abc");
        assert_eq!(env.version, PROTOCOL_VERSION);
    }

    #[test]
    fn test_unsupported_version_is_rejected_with_id() {
        let rejection = Envelope::from_raw(raw("2.0", "ping_request", Value::Null)).unwrap_err();
        assert_eq!(rejection.code, ErrorCode::UnsupportedVersion);
        assert_eq!(rejection.id, "req-1");
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let rejection = Envelope::from_raw(raw("1.0", "teleport", Value::Null)).unwrap_err();
        assert_eq!(rejection.code, ErrorCode::UnknownMessageType);

        let response = rejection.into_response();
        assert_eq!(response.id, "req-1");
        assert_eq!(response.kind(), MessageKind::ErrorResponse);
    }

    #[test]
    fn test_invalid_payload_is_rejected() {
        let rejection = Envelope::from_raw(raw(
            "1.0",
            "capability_revoke",
            serde_json::json!({"reason": "x"}),
        ))
        .unwrap_err();
        assert_eq!(rejection.code, ErrorCode::InvalidPayload);
    }

    #[test]
    fn test_raw_round_trip_preserves_message() {
        let env = Envelope::new(Message::error(ErrorCode::InternalError, "boom"));
        let back = Envelope::from_raw(env.to_raw().unwrap()).unwrap();
        assert_eq!(back, env);
    }
}
