use crate::config::ConfigError;
use thiserror::Error;

/// Categorizes errors for caller decision-making.
///
/// This is a lightweight, cloneable representation of the error type
/// that callers can match on without inspecting messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The HTTP transport failed to produce a response
    Transport,
    /// A shard index did not match any owned shard
    ShardNotFound,
    /// The component has been stopped
    ShuttingDown,
    /// A shard reported a failure
    Shard,
    /// Invalid configuration
    Config,
}

/// Failure reported by the HTTP transport collaborator.
///
/// Forwarded to request callbacks verbatim; the rate limiter never retries
/// or inspects it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The request could not be sent or the connection broke mid-flight
    #[error("Request failed: {0}")]
    Request(String),

    /// No response arrived in time
    #[error("Request timed out")]
    Timeout,

    /// The transport has been shut down
    #[error("Transport disconnected")]
    Disconnected,
}

/// Errors that can occur in gateway-flow
#[derive(Error, Debug)]
pub enum Error {
    /// HTTP transport error
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// No shard owns the requested index
    #[error("Shard {index} not found ({count} shards)")]
    ShardNotFound { index: usize, count: usize },

    /// Shard index outside `0..total`
    #[error("Invalid shard info: index {index} with {total} total shards")]
    InvalidShardInfo { index: usize, total: usize },

    /// The owning component was dropped or stopped
    #[error("Shutting down")]
    ShuttingDown,

    /// Shard-specific error (user-defined)
    #[error("Shard error: {0}")]
    Shard(String),

    /// Configuration rejected by a builder
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl Error {
    /// Get the kind of this error for decision-making.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Transport(_) => ErrorKind::Transport,
            Error::ShardNotFound { .. } => ErrorKind::ShardNotFound,
            Error::InvalidShardInfo { .. } => ErrorKind::Config,
            Error::ShuttingDown => ErrorKind::ShuttingDown,
            Error::Shard(_) => ErrorKind::Shard,
            Error::Config(_) => ErrorKind::Config,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_mapping() {
        let err: Error = TransportError::Timeout.into();
        assert_eq!(err.kind(), ErrorKind::Transport);

        let err = Error::ShardNotFound { index: 4, count: 2 };
        assert_eq!(err.kind(), ErrorKind::ShardNotFound);
        assert_eq!(err.to_string(), "Shard 4 not found (2 shards)");

        assert_eq!(Error::ShuttingDown.kind(), ErrorKind::ShuttingDown);
        assert_eq!(
            Error::InvalidShardInfo { index: 3, total: 2 }.kind(),
            ErrorKind::Config
        );
    }

    #[test]
    fn test_transport_error_is_forwarded_verbatim() {
        let original = TransportError::Request("connection reset".to_string());
        let err = Error::from(original.clone());
        match err {
            Error::Transport(inner) => assert_eq!(inner, original),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
