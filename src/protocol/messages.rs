// Warden - Message kinds and payloads
//
// Every request kind has exactly one success response kind. Any request
// may instead be answered by `error_response`.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ErrorCode;
use crate::capability::{
    CapabilityFilter, CapabilityRequest, GrantedCapability, RevocationInfo, ValidationResult,
};
use crate::context::Context;

/// Wire tag of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    AuthRequest,
    AuthResponse,
    CapabilityRequest,
    CapabilityResponse,
    CapabilityValidate,
    ValidationResponse,
    CapabilityRevoke,
    RevokeResponse,
    CapabilityList,
    ListResponse,
    StatusRequest,
    StatusResponse,
    PingRequest,
    PingResponse,
    ErrorResponse,
}

impl MessageKind {
    pub const ALL: [MessageKind; 15] = [
        Self::AuthRequest,
        Self::AuthResponse,
        Self::CapabilityRequest,
        Self::CapabilityResponse,
        Self::CapabilityValidate,
        Self::ValidationResponse,
        Self::CapabilityRevoke,
        Self::RevokeResponse,
        Self::CapabilityList,
        Self::ListResponse,
        Self::StatusRequest,
        Self::StatusResponse,
        Self::PingRequest,
        Self::PingResponse,
        Self::ErrorResponse,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AuthRequest => "auth_request",
            Self::AuthResponse => "auth_response",
            Self::CapabilityRequest => "capability_request",
            Self::CapabilityResponse => "capability_response",
            Self::CapabilityValidate => "capability_validate",
            Self::ValidationResponse => "validation_response",
            Self::CapabilityRevoke => "capability_revoke",
            Self::RevokeResponse => "revoke_response",
            Self::CapabilityList => "capability_list",
            Self::ListResponse => "list_response",
            Self::StatusRequest => "status_request",
            Self::StatusResponse => "status_response",
            Self::PingRequest => "ping_request",
            Self::PingResponse => "ping_response",
            Self::ErrorResponse => "error_response",
        }
    }

    /// The success response paired with a request kind. None for responses.
    pub fn response_kind(&self) -> Option<MessageKind> {
        match self {
            Self::AuthRequest => Some(Self::AuthResponse),
            Self::CapabilityRequest => Some(Self::CapabilityResponse),
            Self::CapabilityValidate => Some(Self::ValidationResponse),
            Self::CapabilityRevoke => Some(Self::RevokeResponse),
            Self::CapabilityList => Some(Self::ListResponse),
            Self::StatusRequest => Some(Self::StatusResponse),
            Self::PingRequest => Some(Self::PingResponse),
            _ => None,
        }
    }

    pub fn is_request(&self) -> bool {
        self.response_kind().is_some()
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| s.to_string())
    }
}

// ─── Payloads ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethod {
    /// Trust the peer credentials of the socket.
    Peer,
    /// Present a shared token from the server's configured set.
    Token,
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Peer => write!(f, "peer"),
            Self::Token => write!(f, "token"),
        }
    }
}

#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthRequest {
    pub identity: String,
    pub method: AuthMethod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

// Manual Debug keeps the token out of logs.
impl fmt::Debug for AuthRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthRequest")
            .field("identity", &self.identity)
            .field("method", &self.method)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthResponse {
    pub authenticated: bool,
    pub identity: String,
    pub method: AuthMethod,
    pub connection_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityStatus {
    Granted,
    Denied,
}

/// Answer to a capability request. A denial carries a reason and no capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityResponse {
    pub status: CapabilityStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability: Option<GrantedCapability>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Policy rule that decided the request, when one did.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule: Option<String>,
}

impl CapabilityResponse {
    pub fn granted(capability: GrantedCapability) -> Self {
        Self {
            status: CapabilityStatus::Granted,
            capability: Some(capability),
            reason: None,
            rule: None,
        }
    }

    pub fn denied(reason: impl Into<String>, rule: Option<String>) -> Self {
        Self {
            status: CapabilityStatus::Denied,
            capability: None,
            reason: Some(reason.into()),
            rule,
        }
    }

    pub fn is_granted(&self) -> bool {
        self.status == CapabilityStatus::Granted && self.capability.is_some()
    }

    pub fn capability_id(&self) -> Option<&str> {
        self.capability.as_ref().map(|c| c.id.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidateRequest {
    pub capability_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Context>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevokeRequest {
    pub capability_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Defaults to the connection identity on the server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revoked_by: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevokeResponse {
    pub capability_id: String,
    pub revoked: bool,
    pub revocation: RevocationInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListResponse {
    pub capabilities: Vec<GrantedCapability>,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub version: String,
    pub connections: usize,
    pub max_connections: usize,
    pub socket_path: String,
    pub authenticated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,
    pub connection_id: String,
    pub uptime_secs: u64,
    /// Metadata recorded on the caller's connection.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PingResponse {
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl PingResponse {
    pub fn pong() -> Self {
        Self {
            message: "pong".to_string(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ErrorPayload {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }
}

// ─── Message ─────────────────────────────────────────────────────────────────

/// A decoded, typed message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    AuthRequest(AuthRequest),
    AuthResponse(AuthResponse),
    CapabilityRequest(CapabilityRequest),
    CapabilityResponse(CapabilityResponse),
    CapabilityValidate(ValidateRequest),
    ValidationResponse(ValidationResult),
    CapabilityRevoke(RevokeRequest),
    RevokeResponse(RevokeResponse),
    CapabilityList(CapabilityFilter),
    ListResponse(ListResponse),
    StatusRequest,
    StatusResponse(StatusResponse),
    PingRequest,
    PingResponse(PingResponse),
    Error(ErrorPayload),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::AuthRequest(_) => MessageKind::AuthRequest,
            Self::AuthResponse(_) => MessageKind::AuthResponse,
            Self::CapabilityRequest(_) => MessageKind::CapabilityRequest,
            Self::CapabilityResponse(_) => MessageKind::CapabilityResponse,
            Self::CapabilityValidate(_) => MessageKind::CapabilityValidate,
            Self::ValidationResponse(_) => MessageKind::ValidationResponse,
            Self::CapabilityRevoke(_) => MessageKind::CapabilityRevoke,
            Self::RevokeResponse(_) => MessageKind::RevokeResponse,
            Self::CapabilityList(_) => MessageKind::CapabilityList,
            Self::ListResponse(_) => MessageKind::ListResponse,
            Self::StatusRequest => MessageKind::StatusRequest,
            Self::StatusResponse(_) => MessageKind::StatusResponse,
            Self::PingRequest => MessageKind::PingRequest,
            Self::PingResponse(_) => MessageKind::PingResponse,
            Self::Error(_) => MessageKind::ErrorResponse,
        }
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error(ErrorPayload::new(code, message))
    }

    /// Serialize the payload half of the message.
    pub fn payload(&self) -> Result<Value, serde_json::Error> {
        match self {
            Self::AuthRequest(p) => serde_json::to_value(p),
            Self::AuthResponse(p) => serde_json::to_value(p),
            Self::CapabilityRequest(p) => serde_json::to_value(p),
            Self::CapabilityResponse(p) => serde_json::to_value(p),
            Self::CapabilityValidate(p) => serde_json::to_value(p),
            Self::ValidationResponse(p) => serde_json::to_value(p),
            Self::CapabilityRevoke(p) => serde_json::to_value(p),
            Self::RevokeResponse(p) => serde_json::to_value(p),
            Self::CapabilityList(p) => serde_json::to_value(p),
            Self::ListResponse(p) => serde_json::to_value(p),
            Self::StatusResponse(p) => serde_json::to_value(p),
            Self::PingResponse(p) => serde_json::to_value(p),
            Self::Error(p) => serde_json::to_value(p),
            Self::StatusRequest | Self::PingRequest => Ok(Value::Object(Default::default())),
        }
    }

    /// Rebuild a message from its kind and payload.
    pub fn from_parts(kind: MessageKind, payload: Value) -> Result<Self, serde_json::Error> {
        Ok(match kind {
            MessageKind::AuthRequest => Self::AuthRequest(from_payload(payload)?),
            MessageKind::AuthResponse => Self::AuthResponse(from_payload(payload)?),
            MessageKind::CapabilityRequest => Self::CapabilityRequest(from_payload(payload)?),
            MessageKind::CapabilityResponse => Self::CapabilityResponse(from_payload(payload)?),
            MessageKind::CapabilityValidate => Self::CapabilityValidate(from_payload(payload)?),
            MessageKind::ValidationResponse => Self::ValidationResponse(from_payload(payload)?),
            MessageKind::CapabilityRevoke => Self::CapabilityRevoke(from_payload(payload)?),
            MessageKind::RevokeResponse => Self::RevokeResponse(from_payload(payload)?),
            MessageKind::CapabilityList => Self::CapabilityList(from_payload(payload)?),
            MessageKind::ListResponse => Self::ListResponse(from_payload(payload)?),
            MessageKind::StatusRequest => Self::StatusRequest,
            MessageKind::StatusResponse => Self::StatusResponse(from_payload(payload)?),
            MessageKind::PingRequest => Self::PingRequest,
            MessageKind::PingResponse => Self::PingResponse(from_payload(payload)?),
            MessageKind::ErrorResponse => Self::Error(from_payload(payload)?),
        })
    }
}

/// A missing payload reads as an empty object so all-optional payloads
/// (such as a list filter) may be omitted.
fn from_payload<T: DeserializeOwned>(payload: Value) -> Result<T, serde_json::Error> {
    match payload {
        Value::Null => serde_json::from_value(Value::Object(Default::default())),
        other => serde_json::from_value(other),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
