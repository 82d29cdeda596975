//! Error types for the consumer source

use std::fmt;
use thiserror::Error;

/// Result alias used across the consumer module
pub type SourceResult<T> = Result<T, SourceError>;

/// How the client library classifies a broker or local error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Transient condition the client recovers from on its own
    Retriable,
    /// Not retried by the client; the supervision strategy decides
    NonRetriable,
    /// Unrecoverable (authentication, fatal misconfiguration, fenced consumer)
    Fatal,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorClass::Retriable => "retriable",
            ErrorClass::NonRetriable => "non-retriable",
            ErrorClass::Fatal => "fatal",
        };
        f.write_str(s)
    }
}

/// Error reported by the broker client outside of a specific record
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{class} broker error ({code}): {reason}")]
pub struct BrokerError {
    /// Client library error code, e.g. `BrokerTransportFailure`
    pub code: String,
    /// Human readable reason
    pub reason: String,
    /// Retriable classification assigned by the client adapter
    pub class: ErrorClass,
}

impl BrokerError {
    /// Create a broker error
    pub fn new(code: impl Into<String>, reason: impl Into<String>, class: ErrorClass) -> Self {
        Self {
            code: code.into(),
            reason: reason.into(),
            class,
        }
    }

    /// Whether the client library retries this error by itself
    pub fn is_retriable(&self) -> bool {
        self.class == ErrorClass::Retriable
    }

    /// Whether the error can never be recovered from
    pub fn is_fatal(&self) -> bool {
        self.class == ErrorClass::Fatal
    }
}

/// Errors surfaced by the source stage
#[derive(Debug, Error)]
pub enum SourceError {
    /// Invalid settings
    #[error("configuration error: {0}")]
    Config(String),

    /// The client could not be created or refused an operation
    #[error("client error: {0}")]
    Client(String),

    /// Subscribing or assigning failed
    #[error("subscription error: {0}")]
    Subscription(String),

    /// A record could not be consumed or deserialized
    #[error("failed to deserialize record {topic}[{partition}]@{offset}: {reason}")]
    Deserialization {
        /// Topic of the failed record
        topic: String,
        /// Partition of the failed record
        partition: i32,
        /// Offset of the failed record
        offset: i64,
        /// Why it failed
        reason: String,
    },

    /// Error reported by the broker client
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// Committing an offset failed
    #[error("commit error: {0}")]
    Commit(String),
}

impl SourceError {
    /// Broker error payload, if this is a broker error
    pub fn as_broker(&self) -> Option<&BrokerError> {
        match self {
            SourceError::Broker(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broker_error_display() {
        let err = BrokerError::new("Authentication", "SASL handshake failed", ErrorClass::Fatal);
        assert_eq!(
            err.to_string(),
            "fatal broker error (Authentication): SASL handshake failed"
        );
        assert!(err.is_fatal());
        assert!(!err.is_retriable());
    }

    #[test]
    fn test_deserialization_error_display() {
        let err = SourceError::Deserialization {
            topic: "alerts".to_string(),
            partition: 3,
            offset: 42,
            reason: "invalid utf-8".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "failed to deserialize record alerts[3]@42: invalid utf-8"
        );
        assert!(err.as_broker().is_none());
    }
}
