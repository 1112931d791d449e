// Warden - Policy error types

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("failed to read policy {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse policy {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid policy '{policy}': {reason}")]
    Invalid { policy: String, reason: String },

    #[error("duplicate policy id: {0}")]
    Duplicate(String),

    #[error("{0}")]
    Internal(String),
}
