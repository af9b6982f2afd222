//! Error types for the control plane

use thiserror::Error;

use crate::transport::TransportError;

pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for control-plane operations.
///
/// Variants map one-to-one onto the categories clients are expected to react
/// to differently: bad input is never retried, conflicts prompt for a
/// different value, transport failures surface as gateway errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Malformed or missing fields
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Duplicate identifier or other uniqueness violation
    #[error("conflict: {0}")]
    Conflict(String),

    /// An enabled forwarding rule or live instance already owns the port
    #[error("listen port {port} is already in use on this host")]
    PortConflict { port: u16 },

    #[error("{0} not found")]
    NotFound(String),

    /// Another switch holds the host's claim
    #[error("a core switch is already in progress on host {host_id}")]
    SwitchInProgress { host_id: uuid::Uuid },

    #[error("invalid agent token")]
    InvalidToken,

    #[error("no converter registered for {source_core} -> {target_core}")]
    UnsupportedCorePair {
        source_core: String,
        target_core: String,
    },

    /// Agent did not pass verification within the allotted attempts/time
    #[error("verification failed: {0}")]
    VerificationFailed(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid switch transition from {from} on {event}")]
    InvalidTransition { from: String, event: String },

    #[error("agent transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn verification(msg: impl Into<String>) -> Self {
        Self::VerificationFailed(msg.into())
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Error::NotFound("row".to_string()),
            other => Error::Storage(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_carry_detail() {
        let err = Error::PortConflict { port: 8443 };
        assert!(err.to_string().contains("8443"));

        let err = Error::UnsupportedCorePair {
            source_core: "xray".to_string(),
            target_core: "hysteria".to_string(),
        };
        assert_eq!(err.to_string(), "no converter registered for xray -> hysteria");
    }

    #[test]
    fn test_row_not_found_maps_to_not_found() {
        let err: Error = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
