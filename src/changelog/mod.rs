// Copyright (c) 2025 - Cowboy AI, Inc.
//! Change-Log Source
//!
//! The change log mirrors committed outbox inserts in commit order. This
//! module presents it as a pull API where every item carries its own
//! acknowledge/fail capability bound to the consumer-group position.
//!
//! # Delivery Contract
//!
//! - Items of one partition arrive in commit order.
//! - [`CapturedEvent::acknowledge`] advances the group position past the item.
//!   Call it only after the item's effects are confirmed.
//! - [`CapturedEvent::fail`] records the failure and leaves the position where
//!   it is, so the item is delivered again after a restart or rebalance.
//! - Redelivery is possible, loss is not.
//!
//! # Implementations
//!
//! - [`memory::InMemoryChangeLog`] - partitioned in-process log with groups
//! - [`jetstream::JetStreamChangeLogSource`] - durable JetStream pull consumer

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

use crate::config::RelayGroup;
use crate::errors::OutboxResult;
use crate::outbox::OutboxRecord;

pub mod envelope;
pub mod jetstream;
pub mod memory;

pub use jetstream::JetStreamChangeLogSource;
pub use memory::{InMemoryChangeLog, InMemoryChangeLogSource};

/// Well-known header names
pub mod headers {
    /// Outbox record id; used for bus-side deduplication
    pub const MESSAGE_ID: &str = "message-id";
    pub const CORRELATION_ID: &str = "correlation-id";
    pub const CAUSATION_ID: &str = "causation-id";
    pub const AGGREGATE_TYPE: &str = "aggregate-type";
    pub const AGGREGATE_ID: &str = "aggregate-id";
}

/// Ordered key → value header list
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventHeaders(Vec<(String, String)>);

impl EventHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a header, replacing an existing value in place
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.0.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.0.push((key, value)),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.get(headers::CORRELATION_ID)
    }
}

/// One committed outbox insert as it appears on the change log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeLogEntry {
    pub record_id: Uuid,
    pub event_type: String,
    pub payload: String,
    pub headers: EventHeaders,
    /// Key the log partitions by; the aggregate identity
    pub partition_key: String,
}

impl From<&OutboxRecord> for ChangeLogEntry {
    fn from(record: &OutboxRecord) -> Self {
        let mut headers = EventHeaders::new()
            .with(headers::MESSAGE_ID, record.id().to_string())
            .with(headers::AGGREGATE_TYPE, record.aggregate_type())
            .with(headers::AGGREGATE_ID, record.aggregate_id());
        if let Some(correlation_id) = record.correlation_id() {
            headers.insert(headers::CORRELATION_ID, correlation_id);
        }

        Self {
            record_id: record.id(),
            event_type: record.event_type().to_string(),
            payload: record.payload().to_string(),
            headers,
            partition_key: format!("{}/{}", record.aggregate_type(), record.aggregate_id()),
        }
    }
}

/// Where an item sits in the change log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamPosition {
    pub partition: u32,
    pub offset: u64,
    /// How many times this item has been handed out, this delivery included
    pub delivery_attempt: u64,
}

impl fmt::Display for StreamPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.partition, self.offset)
    }
}

/// Item handed to the dead-letter path by [`CapturedEvent::fail`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub record_id: Uuid,
    pub event_type: String,
    pub payload: String,
    pub headers: EventHeaders,
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}

/// Position-bound callbacks of one delivered item
#[async_trait]
pub trait Acknowledger: Send + Sync {
    /// Durably advance the group position past the item
    async fn acknowledge(&self) -> OutboxResult<()>;

    /// Tell the transport the item is still being worked on
    ///
    /// Transports that redeliver after an ack deadline reset it here.
    async fn in_progress(&self) -> OutboxResult<()> {
        Ok(())
    }

    /// Record the failure without advancing the position
    async fn fail(&self, dead_letter: DeadLetter) -> OutboxResult<()>;
}

/// Read-side projection of an outbox record, valid for one relay iteration
pub struct CapturedEvent {
    record_id: Uuid,
    event_type: String,
    payload: String,
    headers: EventHeaders,
    position: StreamPosition,
    acknowledger: Box<dyn Acknowledger>,
}

impl CapturedEvent {
    pub fn new(
        entry: ChangeLogEntry,
        position: StreamPosition,
        acknowledger: Box<dyn Acknowledger>,
    ) -> Self {
        Self {
            record_id: entry.record_id,
            event_type: entry.event_type,
            payload: entry.payload,
            headers: entry.headers,
            position,
            acknowledger,
        }
    }

    pub fn record_id(&self) -> Uuid {
        self.record_id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }

    pub fn headers(&self) -> &EventHeaders {
        &self.headers
    }

    pub fn position(&self) -> StreamPosition {
        self.position
    }

    /// Advance the group position past this item
    pub async fn acknowledge(self) -> OutboxResult<()> {
        self.acknowledger.acknowledge().await
    }

    /// Extend the item's ack deadline while publishing is retried
    pub async fn in_progress(&self) -> OutboxResult<()> {
        self.acknowledger.in_progress().await
    }

    /// Record a failure and leave the position untouched
    pub async fn fail(self, reason: &str) -> OutboxResult<()> {
        let dead_letter = DeadLetter {
            record_id: self.record_id,
            event_type: self.event_type,
            payload: self.payload,
            headers: self.headers,
            reason: reason.to_string(),
            failed_at: Utc::now(),
        };
        self.acknowledger.fail(dead_letter).await
    }
}

impl fmt::Debug for CapturedEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapturedEvent")
            .field("record_id", &self.record_id)
            .field("event_type", &self.event_type)
            .field("headers", &self.headers)
            .field("position", &self.position)
            .finish_non_exhaustive()
    }
}

/// Pull API over the change log
#[async_trait]
pub trait ChangeLogSource: Send + Sync {
    /// Wait up to `timeout` for the next item
    ///
    /// `Ok(None)` means nothing arrived in time. Transport failures are
    /// errors; fatal ones (see [`crate::OutboxError::is_fatal`]) must end the
    /// consuming loop.
    async fn consume_next(&self, timeout: Duration) -> OutboxResult<Option<CapturedEvent>>;

    /// Consumer group this source reads for
    fn group(&self) -> &RelayGroup;
}
