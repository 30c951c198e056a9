// Copyright (c) 2025 - Cowboy AI, Inc.
//! Transactional outbox and change-data-capture relay
//!
//! Domain events are written as outbox rows in the same transaction as the
//! business rows that produced them. A change-data-capture stream mirrors
//! those inserts in commit order, and a relay loop publishes each one to the
//! integration bus, acknowledging its stream position only after the bus
//! confirmed the publish.
//!
//! ```text
//! Aggregate ─► EventCaptureInterceptor ─► UnitOfWork (rows + outbox, one commit)
//!                                                   │
//!                                                   ▼ CDC
//!            IntegrationEventPublisher ◄─ RelayEngine ◄─ ChangeLogSource
//! ```
//!
//! Delivery is at-least-once and ordered per aggregate; every message carries
//! the outbox record id as `message-id` for consumer-side deduplication.

pub mod capture;
pub mod changelog;
pub mod config;
pub mod errors;
pub mod outbox;
pub mod publisher;
pub mod relay;
pub mod state_machine;
pub mod subjects;

// Re-export commonly used types
pub use capture::{
    Aggregate, CaptureReport, CommitReceipt, DomainEvent, DroppedEvent, EventBuffer,
    EventCaptureInterceptor, EventSource, TransactionalOutbox, UnitOfWork,
};
pub use changelog::{
    CapturedEvent, ChangeLogEntry, ChangeLogSource, DeadLetter, EventHeaders, InMemoryChangeLog,
    InMemoryChangeLogSource, JetStreamChangeLogSource, StreamPosition,
};
pub use config::{ChangeLogConfig, PublisherConfig, RelayConfig, RelayGroup};
pub use errors::{OutboxError, OutboxResult};
pub use outbox::{
    InMemoryOutboxStore, InMemoryUnitOfWork, OutboxRecord, OutboxStatus, OutboxStatusStore,
    StatusCommand,
};
pub use publisher::{IntegrationEventPublisher, NatsIntegrationPublisher, PublishError};
pub use relay::{IterationOutcome, RelayEngine, RelayStats, RetryPolicy};
pub use state_machine::{StateMachine, TransitionError};
