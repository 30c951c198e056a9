// Copyright (c) 2025 - Cowboy AI, Inc.
//! Test Fixtures for cim-outbox-relay
//!
//! Provides a small order domain, a scripted integration publisher and
//! relay settings tuned for fast tests.
//!
//! # Design Principles
//! - Aggregate ids and payloads are fixed so assertions can name them
//! - The scripted publisher records every attempt, successful or not
//! - Timeouts and backoff delays are milliseconds, never seconds
#![allow(dead_code)]

use async_trait::async_trait;
use serde::{Serialize, Serializer};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use cim_outbox_relay::{
    Aggregate, DomainEvent, EventBuffer, EventHeaders, InMemoryChangeLog,
    IntegrationEventPublisher, PublishError, RelayConfig, RelayGroup,
};

pub const ORDER_ID_1: &str = "42";
pub const ORDER_ID_2: &str = "43";
pub const CORRELATION_ID_1: &str = "01934f4a-c001-7000-8000-00000000c001";

/// Relay settings for tests: short polls, millisecond backoff, 3 attempts
pub fn fast_relay_config() -> RelayConfig {
    RelayConfig {
        enabled: true,
        poll_timeout: Duration::from_millis(20),
        max_retry_attempts: 3,
        retry_base_delay: Duration::from_millis(1),
        retry_max_delay: Duration::from_millis(4),
    }
}

pub fn relay_group(name: &str) -> RelayGroup {
    RelayGroup::new(name).expect("Invalid relay group in test fixture")
}

// ============================================================================
// Order domain
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum OrderEvent {
    OrderCreated { order_id: String, total_cents: u64 },
    OrderLineAdded { order_id: String, sku: String },
    OrderShipped { order_id: String },
}

impl DomainEvent for OrderEvent {
    fn event_type(&self) -> &str {
        match self {
            OrderEvent::OrderCreated { .. } => "OrderCreated",
            OrderEvent::OrderLineAdded { .. } => "OrderLineAdded",
            OrderEvent::OrderShipped { .. } => "OrderShipped",
        }
    }
}

#[derive(Debug)]
pub struct Order {
    pub id: String,
    pub lines: Vec<String>,
    pub shipped: bool,
    events: EventBuffer<OrderEvent>,
}

impl Order {
    pub fn create(id: &str, total_cents: u64) -> Self {
        let mut order = Self {
            id: id.to_string(),
            lines: Vec::new(),
            shipped: false,
            events: EventBuffer::new(),
        };
        order.events.raise(OrderEvent::OrderCreated {
            order_id: id.to_string(),
            total_cents,
        });
        order
    }

    pub fn add_line(&mut self, sku: &str) {
        self.lines.push(sku.to_string());
        self.events.raise(OrderEvent::OrderLineAdded {
            order_id: self.id.clone(),
            sku: sku.to_string(),
        });
    }

    pub fn ship(&mut self) {
        self.shipped = true;
        self.events.raise(OrderEvent::OrderShipped {
            order_id: self.id.clone(),
        });
    }

    pub fn pending_events(&self) -> usize {
        self.events.len()
    }

    pub fn row(&self) -> serde_json::Value {
        serde_json::json!({
            "id": self.id,
            "lines": self.lines,
            "shipped": self.shipped,
        })
    }
}

impl Aggregate for Order {
    type Event = OrderEvent;
    const AGGREGATE_TYPE: &'static str = "Order";

    fn aggregate_id(&self) -> String {
        self.id.clone()
    }

    fn take_events(&mut self) -> Vec<OrderEvent> {
        self.events.take()
    }
}

/// A value whose serialization always fails
#[derive(Debug, Clone, PartialEq)]
pub struct Unserializable;

impl Serialize for Unserializable {
    fn serialize<S: Serializer>(&self, _serializer: S) -> Result<S::Ok, S::Error> {
        Err(serde::ser::Error::custom("unsupported value"))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum AuditEvent {
    Noted(String),
    Corrupted(Unserializable),
}

impl DomainEvent for AuditEvent {
    fn event_type(&self) -> &str {
        match self {
            AuditEvent::Noted(_) => "AuditNoted",
            AuditEvent::Corrupted(_) => "AuditCorrupted",
        }
    }
}

/// Aggregate that raises one good and one unserializable event
pub struct AuditLog {
    pub id: String,
    events: EventBuffer<AuditEvent>,
}

impl AuditLog {
    pub fn with_corrupt_event(id: &str) -> Self {
        let mut events = EventBuffer::new();
        events.raise(AuditEvent::Noted("login".to_string()));
        events.raise(AuditEvent::Corrupted(Unserializable));
        Self {
            id: id.to_string(),
            events,
        }
    }
}

impl Aggregate for AuditLog {
    type Event = AuditEvent;
    const AGGREGATE_TYPE: &'static str = "AuditLog";

    fn aggregate_id(&self) -> String {
        self.id.clone()
    }

    fn take_events(&mut self) -> Vec<AuditEvent> {
        self.events.take()
    }
}

// ============================================================================
// Scripted publisher
// ============================================================================

/// One call the relay made into the publisher
#[derive(Debug, Clone, PartialEq)]
pub struct PublishAttempt {
    pub event_type: String,
    pub payload: String,
    pub headers: EventHeaders,
    pub succeeded: bool,
    /// Committed offsets summed over all partitions when the call was made
    pub committed_at_call: Option<u64>,
}

enum Script {
    /// Fail this many times, then succeed
    FailTimes(PublishError, usize),
    /// Fail on every call
    FailAlways(PublishError),
    /// Wait for cancellation
    Hang,
}

#[derive(Default)]
struct PublisherState {
    attempts: Vec<PublishAttempt>,
    scripts: HashMap<String, Script>,
}

/// Publisher whose behavior is scripted per event type
///
/// Unscripted event types always succeed.
#[derive(Clone, Default)]
pub struct ScriptedPublisher {
    state: Arc<Mutex<PublisherState>>,
    watched_position: Option<(InMemoryChangeLog, RelayGroup)>,
}

impl ScriptedPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the group's committed position on every call
    pub fn with_position_watch(mut self, log: InMemoryChangeLog, group: RelayGroup) -> Self {
        self.watched_position = Some((log, group));
        self
    }

    pub fn fail_times(self, event_type: &str, error: PublishError, times: usize) -> Self {
        self.script(event_type, Script::FailTimes(error, times))
    }

    pub fn fail_always(self, event_type: &str, error: PublishError) -> Self {
        self.script(event_type, Script::FailAlways(error))
    }

    pub fn hang_on(self, event_type: &str) -> Self {
        self.script(event_type, Script::Hang)
    }

    fn script(self, event_type: &str, script: Script) -> Self {
        self.state
            .lock()
            .unwrap()
            .scripts
            .insert(event_type.to_string(), script);
        self
    }

    pub fn attempts(&self) -> Vec<PublishAttempt> {
        self.state.lock().unwrap().attempts.clone()
    }

    /// Event types of successful publishes, in call order
    pub fn published(&self) -> Vec<String> {
        self.attempts()
            .into_iter()
            .filter(|a| a.succeeded)
            .map(|a| a.event_type)
            .collect()
    }

    /// Message ids of successful publishes, in call order
    pub fn published_ids(&self) -> Vec<String> {
        self.attempts()
            .into_iter()
            .filter(|a| a.succeeded)
            .filter_map(|a| a.headers.get("message-id").map(str::to_string))
            .collect()
    }

    pub fn attempts_for(&self, event_type: &str) -> usize {
        self.attempts()
            .iter()
            .filter(|a| a.event_type == event_type)
            .count()
    }

    fn record(&self, event_type: &str, payload: &str, headers: &EventHeaders, succeeded: bool) {
        let committed_at_call = self
            .watched_position
            .as_ref()
            .map(|(log, group)| log.total_committed(group));
        self.state.lock().unwrap().attempts.push(PublishAttempt {
            event_type: event_type.to_string(),
            payload: payload.to_string(),
            headers: headers.clone(),
            succeeded,
            committed_at_call,
        });
    }
}

#[async_trait]
impl IntegrationEventPublisher for ScriptedPublisher {
    async fn publish(
        &self,
        event_type: &str,
        payload: &str,
        headers: &EventHeaders,
        cancel: &CancellationToken,
    ) -> Result<(), PublishError> {
        let outcome = {
            let mut state = self.state.lock().unwrap();
            match state.scripts.get_mut(event_type) {
                None => Ok(()),
                Some(Script::FailAlways(error)) => Err(Some(error.clone())),
                Some(Script::FailTimes(error, remaining)) => {
                    if *remaining > 0 {
                        *remaining -= 1;
                        Err(Some(error.clone()))
                    } else {
                        Ok(())
                    }
                }
                Some(Script::Hang) => Err(None),
            }
        };

        match outcome {
            Ok(()) => {
                self.record(event_type, payload, headers, true);
                Ok(())
            }
            Err(Some(error)) => {
                self.record(event_type, payload, headers, false);
                Err(error)
            }
            Err(None) => {
                self.record(event_type, payload, headers, false);
                cancel.cancelled().await;
                Err(PublishError::Cancelled)
            }
        }
    }
}
