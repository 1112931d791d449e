// Warden - Top-level error types
//
// Aggregates errors from the protocol, capability, policy, and config
// modules into a single error enum for the library and CLI boundary.
// A policy denial is not an error and never appears here.

use thiserror::Error;

use crate::capability::CapabilityError;
use crate::protocol::ErrorCode;

/// Top-level error type for all Warden operations.
#[derive(Debug, Error)]
pub enum WardenError {
    #[error("Protocol error: {0}")]
    Protocol(#[from] crate::protocol::ProtocolError),

    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Capability expired: {0}")]
    CapabilityExpired(String),

    #[error("Capability not found: {0}")]
    CapabilityNotFound(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Configuration error: {0}")]
    Configuration(#[from] crate::config::ConfigError),

    #[error("Policy error: {0}")]
    Policy(#[from] crate::policy::PolicyError),

    #[error("Capability engine error: {0}")]
    Capability(CapabilityError),

    /// An error response from the broker that has no dedicated variant.
    #[error("Broker error [{code}]: {message}")]
    Remote { code: ErrorCode, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl WardenError {
    /// Map an `error_response` payload onto the matching typed error.
    pub fn from_remote(code: ErrorCode, message: String) -> Self {
        match code {
            ErrorCode::CapabilityNotFound => Self::CapabilityNotFound(message),
            ErrorCode::CapabilityExpired => Self::CapabilityExpired(message),
            ErrorCode::AuthenticationFailed | ErrorCode::AuthenticationRequired => {
                Self::Authentication(message)
            }
            code => Self::Remote { code, message },
        }
    }

    /// True for failures that leave the client connection unusable.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

impl From<CapabilityError> for WardenError {
    fn from(err: CapabilityError) -> Self {
        match err {
            CapabilityError::NotFound(id) => Self::CapabilityNotFound(id),
            CapabilityError::Expired(id) => Self::CapabilityExpired(id),
            other => Self::Capability(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, WardenError>;

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_not_found_maps_to_typed_variant() {
        let err = WardenError::from_remote(ErrorCode::CapabilityNotFound, "cap-1".to_string());
        assert!(matches!(err, WardenError::CapabilityNotFound(ref id) if id == "cap-1"));
    }

    #[test]
    fn test_remote_auth_codes_map_to_authentication() {
        let err = WardenError::from_remote(ErrorCode::AuthenticationRequired, "nope".to_string());
        assert!(matches!(err, WardenError::Authentication(_)));
    }

    #[test]
    fn test_remote_other_codes_keep_code() {
        let err = WardenError::from_remote(ErrorCode::InternalError, "boom".to_string());
        match err {
            WardenError::Remote { code, message } => {
                assert_eq!(code, ErrorCode::InternalError);
                assert_eq!(message, "boom");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_capability_not_found_converts_to_typed_variant() {
        let err: WardenError = CapabilityError::NotFound("cap_x".to_string()).into();
        assert!(matches!(err, WardenError::CapabilityNotFound(_)));
        let err: WardenError = CapabilityError::Signing("bad".to_string()).into();
        assert!(matches!(err, WardenError::Capability(_)));
    }

    #[test]
    fn test_only_transport_errors_are_transport() {
        assert!(WardenError::Transport("closed".to_string()).is_transport());
        assert!(!WardenError::CapabilityExpired("x".to_string()).is_transport());
    }
}
