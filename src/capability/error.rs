// Warden - Capability error types

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CapabilityError {
    #[error("capability not found: {0}")]
    NotFound(String),

    #[error("capability expired: {0}")]
    Expired(String),

    #[error("capability revoked: {0}")]
    Revoked(String),

    #[error("capability signature invalid: {0}")]
    InvalidSignature(String),

    #[error("capability constraint violated: {0}")]
    ConstraintViolation(String),

    #[error("capability usage limit exceeded: {0}")]
    UsageLimitExceeded(String),

    #[error("signing failed: {0}")]
    Signing(String),

    #[error("{0}")]
    Internal(String),
}
