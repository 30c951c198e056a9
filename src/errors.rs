// Copyright (c) 2025 - Cowboy AI, Inc.
//! Error types for outbox capture and relay operations

use thiserror::Error;

use crate::publisher::PublishError;
use crate::state_machine::TransitionError;

/// Errors that can occur while capturing or relaying outbox events
#[derive(Debug, Error)]
pub enum OutboxError {
    /// A domain event could not be serialized into an outbox payload
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A change-log entry could not be decoded
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// Change-log transport error
    ///
    /// Fatal transport errors (authentication, protocol violations) stop the
    /// relay loop; everything else is retried on the next poll.
    #[error("Transport error: {message}")]
    Transport { message: String, fatal: bool },

    /// Advancing the consumer position failed
    #[error("Acknowledge error: {0}")]
    Acknowledge(String),

    /// Publishing to the message bus failed
    #[error("Publish error: {0}")]
    Publish(#[from] PublishError),

    /// Outbox table or status store error
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// The unit of work failed to commit
    #[error("Commit failed: {0}")]
    Commit(String),

    /// Status change not permitted by the outbox state machine
    #[error("Invalid status transition: {0}")]
    InvalidTransition(#[from] TransitionError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl OutboxError {
    /// Build a transport error that the relay loop can recover from
    pub fn transient(message: impl Into<String>) -> Self {
        OutboxError::Transport {
            message: message.into(),
            fatal: false,
        }
    }

    /// Build a transport error that must terminate the relay loop
    pub fn fatal(message: impl Into<String>) -> Self {
        OutboxError::Transport {
            message: message.into(),
            fatal: true,
        }
    }

    /// Whether this error must propagate out of the relay loop
    pub fn is_fatal(&self) -> bool {
        match self {
            OutboxError::Transport { fatal, .. } => *fatal,
            OutboxError::Acknowledge(_) | OutboxError::Configuration(_) => true,
            _ => false,
        }
    }
}

/// Result type for outbox operations
pub type OutboxResult<T> = Result<T, OutboxError>;

impl From<serde_json::Error> for OutboxError {
    fn from(err: serde_json::Error) -> Self {
        OutboxError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_display() {
        assert_eq!(
            OutboxError::fatal("authorization violation").to_string(),
            "Transport error: authorization violation"
        );
        assert_eq!(
            OutboxError::transient("no responders").to_string(),
            "Transport error: no responders"
        );
    }

    #[test]
    fn test_fatality() {
        assert!(OutboxError::fatal("auth").is_fatal());
        assert!(OutboxError::Acknowledge("broken pipe".into()).is_fatal());
        assert!(!OutboxError::transient("timeout").is_fatal());
        assert!(!OutboxError::Deserialization("bad json".into()).is_fatal());
        assert!(!OutboxError::Publish(PublishError::Cancelled).is_fatal());
    }
}
