// Copyright (c) 2025 - Cowboy AI, Inc.
//! Outbox Record and Status Lifecycle
//!
//! An [`OutboxRecord`] is the durable fact "this domain event happened",
//! written in the same transaction as the state change that raised it.
//!
//! # Status Lifecycle
//!
//! ```text
//!            ┌──────────── Publish ───────────► Published ──ConsumerProcessed──┐
//!            │                                                                 ▼
//! Pending ───┼──────── ConsumerProcessed ─────────────────────────► ProcessedByConsumer
//!    ▲       │                                                          (terminal)
//!    │       └── FailPublish ──► FailedToPublish ──Requeue──► Requeued
//!    │                                                           │
//!    └───────────────────────────── Rearm ───────────────────────┘
//! ```
//!
//! Status is advisory. The relay never reads it back to decide what to
//! deliver; it only records outcomes for audit and cleanup tooling.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::state_machine::{StateMachine, TransitionError, TransitionResult};

/// Delivery status of an outbox record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OutboxStatus {
    /// Captured, not yet confirmed on the bus
    Pending,
    /// The relay confirmed bus delivery
    Published,
    /// A downstream consumer acknowledged processing
    ProcessedByConsumer,
    /// The relay gave up on this record
    FailedToPublish,
    /// Marked for another delivery attempt, waiting to be re-armed
    Requeued,
}

impl fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutboxStatus::Pending => write!(f, "Pending"),
            OutboxStatus::Published => write!(f, "Published"),
            OutboxStatus::ProcessedByConsumer => write!(f, "ProcessedByConsumer"),
            OutboxStatus::FailedToPublish => write!(f, "FailedToPublish"),
            OutboxStatus::Requeued => write!(f, "Requeued"),
        }
    }
}

/// Status change request (FSM input)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusCommand {
    /// Relay confirmed bus delivery
    Publish,
    /// Downstream consumer confirmed processing
    ConsumerProcessed,
    /// Relay routed the record to failure handling
    FailPublish(String),
    /// Operator asked for another attempt
    Requeue,
    /// Operator or scheduled job re-armed a requeued record
    Rearm,
}

impl fmt::Display for StatusCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusCommand::Publish => write!(f, "Publish"),
            StatusCommand::ConsumerProcessed => write!(f, "ConsumerProcessed"),
            StatusCommand::FailPublish(_) => write!(f, "FailPublish"),
            StatusCommand::Requeue => write!(f, "Requeue"),
            StatusCommand::Rearm => write!(f, "Rearm"),
        }
    }
}

impl StateMachine for OutboxStatus {
    type Input = StatusCommand;
    type Output = ();

    fn transition(&self, input: &Self::Input) -> TransitionResult<(Self, Self::Output)> {
        use OutboxStatus::*;
        use StatusCommand::*;

        match (self, input) {
            (ProcessedByConsumer, _) => Err(TransitionError::Terminal(self.to_string())),

            // Pending and Requeued share the same delivery semantics
            (Pending | Requeued, Publish) => Ok((Published, ())),
            (Pending | Requeued, ConsumerProcessed) => Ok((ProcessedByConsumer, ())),
            (Pending | Requeued, FailPublish(_)) => Ok((FailedToPublish, ())),

            // Redelivery after a confirmed publish is expected under at-least-once
            (Published, Publish) => Ok((Published, ())),
            (Published, ConsumerProcessed) => Ok((ProcessedByConsumer, ())),

            (FailedToPublish, Requeue) => Ok((Requeued, ())),
            (Requeued, Rearm) => Ok((Pending, ())),

            (from, input) => Err(TransitionError::InvalidTransition {
                from: from.to_string(),
                input: input.to_string(),
            }),
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(self, OutboxStatus::ProcessedByConsumer)
    }
}

/// One captured domain event, durably persisted
///
/// Identity and event content are fixed at creation; only the status
/// fields change, and only through [`OutboxRecord::apply`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxRecord {
    id: Uuid,
    aggregate_type: String,
    aggregate_id: String,
    event_type: String,
    payload: String,
    occurred_at_utc: DateTime<Utc>,
    processed_at_utc: Option<DateTime<Utc>>,
    status: OutboxStatus,
    error_details: Option<String>,
    retry_count: u32,
    correlation_id: Option<String>,
}

impl OutboxRecord {
    /// Create a new pending record with a fresh time-ordered id
    pub fn new(
        aggregate_type: impl Into<String>,
        aggregate_id: impl Into<String>,
        event_type: impl Into<String>,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            aggregate_type: aggregate_type.into(),
            aggregate_id: aggregate_id.into(),
            event_type: event_type.into(),
            payload: payload.into(),
            occurred_at_utc: Utc::now(),
            processed_at_utc: None,
            status: OutboxStatus::Pending,
            error_details: None,
            retry_count: 0,
            correlation_id: None,
        }
    }

    /// Attach a correlation id
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn aggregate_type(&self) -> &str {
        &self.aggregate_type
    }

    pub fn aggregate_id(&self) -> &str {
        &self.aggregate_id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }

    pub fn occurred_at_utc(&self) -> DateTime<Utc> {
        self.occurred_at_utc
    }

    pub fn processed_at_utc(&self) -> Option<DateTime<Utc>> {
        self.processed_at_utc
    }

    pub fn status(&self) -> OutboxStatus {
        self.status
    }

    pub fn error_details(&self) -> Option<&str> {
        self.error_details.as_deref()
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    /// Advance the status, updating the bookkeeping fields that go with it
    ///
    /// Terminal statuses (`Published`, `ProcessedByConsumer`,
    /// `FailedToPublish`) stamp `processed_at_utc`. `Requeue` bumps
    /// `retry_count` and clears the stamp.
    pub fn apply(&mut self, command: &StatusCommand, at: DateTime<Utc>) -> TransitionResult<()> {
        let (next, ()) = self.status.transition(command)?;

        match command {
            StatusCommand::Publish | StatusCommand::ConsumerProcessed => {
                self.processed_at_utc = Some(at);
                self.error_details = None;
            }
            StatusCommand::FailPublish(reason) => {
                self.processed_at_utc = Some(at);
                self.error_details = Some(reason.clone());
            }
            StatusCommand::Requeue => {
                self.processed_at_utc = None;
                self.retry_count += 1;
            }
            StatusCommand::Rearm => {}
        }

        self.status = next;
        Ok(())
    }
}
