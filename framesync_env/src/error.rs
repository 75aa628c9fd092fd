//! Error types for the simulator collaborator interfaces.

use thiserror::Error;

/// Errors reported by a simulator collaborator.
#[derive(Debug, Error)]
pub enum EnvError {
    /// The connection to the simulator was lost or never established
    #[error("Connection error: {0}")]
    Connection(String),

    /// A blueprint, actor or sensor does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// The simulator refused the request (collision, bad attribute, ...)
    #[error("Rejected: {0}")]
    Rejected(String),

    /// Operation timed out
    #[error("Timeout after {0}ms")]
    Timeout(u64),

    /// Local I/O failure (storage sinks)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EnvError {
    /// Creates a connection error.
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Creates a not-found error.
    pub fn not_found(what: impl std::fmt::Display) -> Self {
        Self::NotFound(what.to_string())
    }

    /// Creates a rejection error.
    pub fn rejected(msg: impl Into<String>) -> Self {
        Self::Rejected(msg.into())
    }

    /// True when the simulator can no longer be reached.
    pub fn is_connection_loss(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Timeout(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_loss_classification() {
        assert!(EnvError::connection("socket closed").is_connection_loss());
        assert!(EnvError::Timeout(2000).is_connection_loss());
        assert!(!EnvError::not_found("vehicle.foo").is_connection_loss());
        assert!(!EnvError::rejected("collision").is_connection_loss());
    }

    #[test]
    fn test_error_display() {
        let err = EnvError::not_found("vehicle.unknown");
        assert_eq!(err.to_string(), "Not found: vehicle.unknown");
    }
}
