// Copyright (c) 2025 - Cowboy AI, Inc.
//! Integration event publishing
//!
//! The relay hands every captured event to an [`IntegrationEventPublisher`].
//! A publish either succeeds (the bus accepted the message) or fails with a
//! classified [`PublishError`]; the relay retries only retryable failures.

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::changelog::EventHeaders;

pub mod nats;

pub use nats::NatsIntegrationPublisher;

/// Classified publish failure
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PublishError {
    /// Broker unavailable, timeout, connection reset
    #[error("Transient publish failure: {0}")]
    Transient(String),

    /// Rejected message or missing destination; retrying does not help
    #[error("Permanent publish failure: {0}")]
    Permanent(String),

    /// Shutdown was requested while publishing
    #[error("Publish cancelled")]
    Cancelled,
}

impl PublishError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, PublishError::Transient(_))
    }
}

/// Destination bus of integration events
///
/// `headers` always carry `message-id` (the outbox record id) so the bus or
/// its consumers can deduplicate redeliveries.
#[async_trait]
pub trait IntegrationEventPublisher: Send + Sync {
    /// Publish one event and wait for the bus to accept it
    ///
    /// Must return [`PublishError::Cancelled`] promptly once `cancel` fires.
    async fn publish(
        &self,
        event_type: &str,
        payload: &str,
        headers: &EventHeaders,
        cancel: &CancellationToken,
    ) -> Result<(), PublishError>;
}
