// Warden - Wire protocol
//
// One JSON envelope per line. The envelope carries a version, a message
// type tag, a caller-generated correlation id, a timestamp, and a
// type-specific payload. Decoding happens once, at the boundary, into
// the closed `Message` sum type.

pub mod codec;
pub mod envelope;
pub mod messages;

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use codec::{decode, encode, EnvelopeCodec, MAX_FRAME_LENGTH};
pub use envelope::{DecodeError, Envelope, RawEnvelope, Rejection};
pub use messages::{
    AuthMethod, AuthRequest, AuthResponse, CapabilityResponse, CapabilityStatus, ErrorPayload,
    ListResponse, Message, MessageKind, PingResponse, RevokeRequest, RevokeResponse,
    StatusResponse, ValidateRequest,
};

/// The only protocol version this build speaks.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Machine-readable code carried by `error_response` payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ProtocolError,
    UnsupportedVersion,
    UnknownMessageType,
    InvalidPayload,
    AuthenticationFailed,
    AuthenticationRequired,
    CapabilityNotFound,
    CapabilityExpired,
    PolicyEvaluationFailed,
    CapabilityEngineError,
    InternalError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ProtocolError => "PROTOCOL_ERROR",
            Self::UnsupportedVersion => "UNSUPPORTED_VERSION",
            Self::UnknownMessageType => "UNKNOWN_MESSAGE_TYPE",
            Self::InvalidPayload => "INVALID_PAYLOAD",
            Self::AuthenticationFailed => "AUTHENTICATION_FAILED",
            Self::AuthenticationRequired => "AUTHENTICATION_REQUIRED",
            Self::CapabilityNotFound => "CAPABILITY_NOT_FOUND",
            Self::CapabilityExpired => "CAPABILITY_EXPIRED",
            Self::PolicyEvaluationFailed => "POLICY_EVALUATION_FAILED",
            Self::CapabilityEngineError => "CAPABILITY_ENGINE_ERROR",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed envelope: {0}")]
    Malformed(String),

    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(String),

    #[error("unknown message type: {0}")]
    UnknownType(String),

    #[error("invalid {kind} payload: {reason}")]
    InvalidPayload { kind: MessageKind, reason: String },

    #[error("frame exceeds maximum length of {} bytes", MAX_FRAME_LENGTH)]
    FrameTooLarge,

    #[error("correlation id mismatch: sent {sent}, received {received}")]
    CorrelationMismatch { sent: String, received: String },

    #[error("unexpected response: expected {expected}, got {actual}")]
    UnexpectedResponse {
        expected: MessageKind,
        actual: MessageKind,
    },

    #[error("failed to encode envelope: {0}")]
    Encode(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_wire_names() {
        let json = serde_json::to_string(&ErrorCode::CapabilityNotFound).unwrap();
        assert_eq!(json, "\"CAPABILITY_NOT_FOUND\"");
        assert_eq!(ErrorCode::UnknownMessageType.to_string(), "UNKNOWN_MESSAGE_TYPE");
        let back: ErrorCode = serde_json::from_str("\"POLICY_EVALUATION_FAILED\"").unwrap();
        assert_eq!(back, ErrorCode::PolicyEvaluationFailed);
    }
}
