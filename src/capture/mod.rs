// Copyright (c) 2025 - Cowboy AI, Inc.
//! Event Capture
//!
//! Turns the domain events buffered on aggregates into outbox rows inside
//! the unit of work that is about to commit the aggregates themselves.
//!
//! ```text
//! Aggregate ──take_events──► EventCaptureInterceptor ──add_outbox_record──► UnitOfWork
//!                                                                              │
//!                                                    business rows + outbox ◄──┘ one commit
//! ```
//!
//! Because both writes share one transaction, "the state changed" and "an
//! event must be delivered" can never disagree.

use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::errors::OutboxResult;
use crate::outbox::OutboxRecord;

pub mod unit_of_work;

pub use unit_of_work::{CommitReceipt, TransactionalOutbox, UnitOfWork};

/// A domain event that can be captured into the outbox
pub trait DomainEvent: Serialize + Send + Sync {
    /// Fully-qualified logical event name, e.g. `OrderCreated`
    fn event_type(&self) -> &str;
}

/// Object-safe view of a buffered domain event
pub trait CapturableEvent: Send + Sync {
    fn name(&self) -> &str;

    /// Serialize the event body for the outbox payload column
    fn to_payload(&self) -> Result<String, serde_json::Error>;
}

impl<E: DomainEvent> CapturableEvent for E {
    fn name(&self) -> &str {
        self.event_type()
    }

    fn to_payload(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// An aggregate that raises domain events and exposes a stable identity
///
/// The identity is a required capability, checked at compile time, so the
/// capture step never has to guess an aggregate id.
pub trait Aggregate: Send {
    type Event: DomainEvent + 'static;

    /// Logical aggregate name written to `aggregate_type`, e.g. `Order`
    const AGGREGATE_TYPE: &'static str;

    /// Stable string identity written to `aggregate_id`
    fn aggregate_id(&self) -> String;

    /// Drain the pending event buffer
    fn take_events(&mut self) -> Vec<Self::Event>;
}

/// Object-safe participant of a unit of work
///
/// Every [`Aggregate`] is an `EventSource`; the trait exists so one unit of
/// work can hold aggregates of different types.
pub trait EventSource: Send {
    fn aggregate_type(&self) -> &str;
    fn aggregate_id(&self) -> String;
    fn take_pending_events(&mut self) -> Vec<Box<dyn CapturableEvent>>;
}

impl<A: Aggregate> EventSource for A {
    fn aggregate_type(&self) -> &str {
        A::AGGREGATE_TYPE
    }

    fn aggregate_id(&self) -> String {
        Aggregate::aggregate_id(self)
    }

    fn take_pending_events(&mut self) -> Vec<Box<dyn CapturableEvent>> {
        self.take_events()
            .into_iter()
            .map(|event| Box::new(event) as Box<dyn CapturableEvent>)
            .collect()
    }
}

/// Pending-event buffer for aggregates to embed
#[derive(Debug, Clone)]
pub struct EventBuffer<E> {
    events: Vec<E>,
}

impl<E> EventBuffer<E> {
    pub fn new() -> Self {
        Self { events: Vec::new() }
    }

    /// Buffer an event raised by a state change
    pub fn raise(&mut self, event: E) {
        self.events.push(event);
    }

    pub fn take(&mut self) -> Vec<E> {
        std::mem::take(&mut self.events)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

impl<E> Default for EventBuffer<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// An event left out of the commit because its payload could not be produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DroppedEvent {
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub event_type: String,
    pub reason: String,
}

/// What one capture pass staged
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaptureReport {
    /// Ids of the staged outbox records, in staging order
    pub record_ids: Vec<Uuid>,
    /// Events that failed serialization
    pub dropped: Vec<DroppedEvent>,
}

impl CaptureReport {
    pub fn captured(&self) -> usize {
        self.record_ids.len()
    }
}

/// Converts pending domain events into outbox rows of the current unit of work
///
/// Runs once per commit attempt. Each entity's buffer is drained as it is
/// converted, so a second pass without new events stages nothing.
#[derive(Debug, Clone, Default)]
pub struct EventCaptureInterceptor;

impl EventCaptureInterceptor {
    pub fn new() -> Self {
        Self
    }

    /// Stage one outbox record per pending event of `entities` into `uow`
    ///
    /// A serialization failure drops only that event: it is logged and
    /// reported in [`CaptureReport::dropped`]. Failing to stage a record is
    /// a unit-of-work error and is returned, which aborts the commit.
    pub async fn capture<U>(
        &self,
        uow: &mut U,
        entities: &mut [&mut dyn EventSource],
    ) -> OutboxResult<CaptureReport>
    where
        U: UnitOfWork + ?Sized,
    {
        let mut report = CaptureReport::default();

        for entity in entities.iter_mut() {
            let events = entity.take_pending_events();
            if events.is_empty() {
                continue;
            }

            let aggregate_type = entity.aggregate_type().to_string();
            let aggregate_id = entity.aggregate_id();

            for event in events {
                let payload = match event.to_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(
                            aggregate_type = %aggregate_type,
                            aggregate_id = %aggregate_id,
                            event_type = %event.name(),
                            error = %e,
                            "Dropping domain event that failed to serialize"
                        );
                        report.dropped.push(DroppedEvent {
                            aggregate_type: aggregate_type.clone(),
                            aggregate_id: aggregate_id.clone(),
                            event_type: event.name().to_string(),
                            reason: e.to_string(),
                        });
                        continue;
                    }
                };

                let mut record = OutboxRecord::new(
                    aggregate_type.as_str(),
                    aggregate_id.as_str(),
                    event.name(),
                    payload,
                );
                if let Some(correlation_id) = uow.correlation_id() {
                    record = record.with_correlation_id(correlation_id);
                }

                let record_id = record.id();
                uow.add_outbox_record(record).await?;
                report.record_ids.push(record_id);

                debug!(
                    record_id = %record_id,
                    aggregate_type = %aggregate_type,
                    aggregate_id = %aggregate_id,
                    event_type = %event.name(),
                    "Domain event captured"
                );
            }
        }

        Ok(report)
    }
}
