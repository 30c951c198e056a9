// Copyright (c) 2025 - Cowboy AI, Inc.
//! Transactional outbox
//!
//! - [`record`] - the durable outbox row and its status lifecycle
//! - [`store`] - status tracking port and the in-memory outbox table

pub mod record;
pub mod store;

pub use record::{OutboxRecord, OutboxStatus, StatusCommand};
pub use store::{InMemoryOutboxStore, InMemoryUnitOfWork, OutboxStatusStore};
