// Copyright (c) 2025 - Cowboy AI, Inc.
//! Relay Engine
//!
//! The background loop that turns change-log items into confirmed bus
//! deliveries.
//!
//! ```text
//! Idle ─► Consuming ─┬─ no item ─────────────────────────────► Idle
//!                    └─ item ─► Publishing ─┬─ ok ─► Acknowledging ─► Idle
//!                                  ▲        ├─ retryable ─┐
//!                                  └────────┼─────────────┘ (backoff)
//!                                           └─ exhausted / permanent ─► Failing ─► Idle
//! ```
//!
//! # Guarantees
//!
//! - An item is acknowledged only after the publisher confirmed it.
//! - A failing item is handed to `fail` and the loop moves on; one poisoned
//!   item never halts the relay.
//! - Before each backoff wait the item's ack deadline is extended, so a
//!   retrying item is not redelivered behind the relay's back.
//! - Cancellation is checked between polls and passed into the publish and
//!   the backoff wait. A cancelled item is neither acknowledged nor failed,
//!   so it is delivered again after restart.
//! - Fatal transport and acknowledgment errors end [`RelayEngine::run`].

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::changelog::{CapturedEvent, ChangeLogSource};
use crate::config::RelayConfig;
use crate::errors::{OutboxError, OutboxResult};
use crate::outbox::OutboxStatusStore;
use crate::publisher::{IntegrationEventPublisher, PublishError};

pub mod retry;

pub use retry::RetryPolicy;

/// Relay counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RelayStats {
    /// Items published and acknowledged
    pub published: u64,
    /// Items routed to `fail`
    pub failed: u64,
    /// Publish attempts beyond the first
    pub retries: u64,
    /// Polls that returned no item
    pub idle_polls: u64,
}

/// Result of one loop iteration
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IterationOutcome {
    /// Nothing arrived within the poll timeout
    Idle,
    /// Published and acknowledged
    Acknowledged { record_id: Uuid, attempts: u32 },
    /// Routed to failure handling; the position did not move
    Failed { record_id: Uuid, reason: String },
    /// Shutdown requested
    Cancelled,
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    failed: AtomicU64,
    retries: AtomicU64,
    idle_polls: AtomicU64,
}

/// Orchestrates consume → publish → acknowledge
pub struct RelayEngine {
    source: Arc<dyn ChangeLogSource>,
    publisher: Arc<dyn IntegrationEventPublisher>,
    status_store: Option<Arc<dyn OutboxStatusStore>>,
    config: RelayConfig,
    retry: RetryPolicy,
    counters: Counters,
}

impl RelayEngine {
    pub fn new(
        source: Arc<dyn ChangeLogSource>,
        publisher: Arc<dyn IntegrationEventPublisher>,
        config: RelayConfig,
    ) -> Self {
        let retry = RetryPolicy::from(&config);
        Self {
            source,
            publisher,
            status_store: None,
            config,
            retry,
            counters: Counters::default(),
        }
    }

    /// Record delivery outcomes on the outbox rows
    pub fn with_status_store(mut self, store: Arc<dyn OutboxStatusStore>) -> Self {
        self.status_store = Some(store);
        self
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn stats(&self) -> RelayStats {
        RelayStats {
            published: self.counters.published.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            retries: self.counters.retries.load(Ordering::Relaxed),
            idle_polls: self.counters.idle_polls.load(Ordering::Relaxed),
        }
    }

    /// Run until `cancel` fires or a fatal error occurs
    ///
    /// Returns the counters on clean shutdown. A disabled relay returns at
    /// once without touching the change log.
    pub async fn run(&self, cancel: CancellationToken) -> OutboxResult<RelayStats> {
        if !self.config.enabled {
            info!(group = %self.source.group(), "Outbox relay disabled, not starting");
            return Ok(RelayStats::default());
        }
        self.config.validate()?;

        info!(
            group = %self.source.group(),
            poll_timeout_ms = self.config.poll_timeout.as_millis() as u64,
            max_attempts = self.retry.max_attempts,
            "Outbox relay started"
        );

        loop {
            if cancel.is_cancelled() {
                break;
            }

            match self.run_once(&cancel).await {
                Ok(IterationOutcome::Cancelled) => break,
                Ok(_) => {}
                Err(e) if e.is_fatal() => {
                    error!(group = %self.source.group(), error = %e, "Outbox relay stopped");
                    return Err(e);
                }
                Err(OutboxError::Deserialization(reason)) => {
                    warn!(reason = %reason, "Skipping unreadable change log item");
                }
                Err(e) => {
                    warn!(
                        error = %e,
                        pause_ms = self.config.poll_timeout.as_millis() as u64,
                        "Change log unavailable, pausing"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.config.poll_timeout) => {}
                    }
                }
            }
        }

        let stats = self.stats();
        info!(
            published = stats.published,
            failed = stats.failed,
            retries = stats.retries,
            "Outbox relay stopped"
        );
        Ok(stats)
    }

    /// One Idle → … → Idle pass
    pub async fn run_once(&self, cancel: &CancellationToken) -> OutboxResult<IterationOutcome> {
        if cancel.is_cancelled() {
            return Ok(IterationOutcome::Cancelled);
        }

        let next = tokio::select! {
            _ = cancel.cancelled() => return Ok(IterationOutcome::Cancelled),
            next = self.source.consume_next(self.config.poll_timeout) => next?,
        };

        let Some(event) = next else {
            self.counters.idle_polls.fetch_add(1, Ordering::Relaxed);
            return Ok(IterationOutcome::Idle);
        };

        let record_id = event.record_id();
        debug!(
            record_id = %record_id,
            event_type = %event.event_type(),
            position = %event.position(),
            delivery = event.position().delivery_attempt,
            "Relaying captured event"
        );

        match self.publish_with_retry(&event, cancel).await {
            Ok(attempts) => {
                event.acknowledge().await.map_err(|e| match e {
                    OutboxError::Acknowledge(_) => e,
                    other => OutboxError::Acknowledge(other.to_string()),
                })?;
                self.counters.published.fetch_add(1, Ordering::Relaxed);
                info!(record_id = %record_id, attempts, "Integration event relayed");

                if let Some(store) = &self.status_store {
                    match store.mark_published(record_id).await {
                        Ok(_) => {}
                        Err(OutboxError::InvalidTransition(e)) => {
                            // A redelivered record failed earlier stays FailedToPublish
                            debug!(record_id = %record_id, reason = %e, "Record status left as is");
                        }
                        Err(e) => {
                            warn!(record_id = %record_id, error = %e, "Could not mark record published");
                        }
                    }
                }
                Ok(IterationOutcome::Acknowledged {
                    record_id,
                    attempts,
                })
            }
            Err(PublishError::Cancelled) => {
                info!(record_id = %record_id, "Publish cancelled, item left unacknowledged");
                Ok(IterationOutcome::Cancelled)
            }
            Err(e) => {
                let reason = e.to_string();
                event.fail(&reason).await.map_err(|e| match e {
                    OutboxError::Acknowledge(_) => e,
                    other => OutboxError::Acknowledge(other.to_string()),
                })?;
                self.counters.failed.fetch_add(1, Ordering::Relaxed);

                if let Some(store) = &self.status_store {
                    if let Err(e) = store.mark_failed(record_id, &reason).await {
                        warn!(record_id = %record_id, error = %e, "Could not mark record failed");
                    }
                }
                Ok(IterationOutcome::Failed { record_id, reason })
            }
        }
    }

    /// Publish with bounded exponential backoff, returning the attempt count
    async fn publish_with_retry(
        &self,
        event: &CapturedEvent,
        cancel: &CancellationToken,
    ) -> Result<u32, PublishError> {
        let mut attempt = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(PublishError::Cancelled);
            }
            attempt += 1;

            let result = self
                .publisher
                .publish(event.event_type(), event.payload(), event.headers(), cancel)
                .await;

            match result {
                Ok(()) => return Ok(attempt),
                Err(PublishError::Cancelled) => return Err(PublishError::Cancelled),
                Err(e) if e.is_retryable() && self.retry.allows_retry_after(attempt) => {
                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        record_id = %event.record_id(),
                        attempt,
                        max_attempts = self.retry.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Publish failed, retrying"
                    );
                    self.counters.retries.fetch_add(1, Ordering::Relaxed);
                    if let Err(e) = event.in_progress().await {
                        warn!(record_id = %event.record_id(), error = %e, "Could not extend ack deadline");
                    }
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(PublishError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => {
                    error!(
                        record_id = %event.record_id(),
                        attempt,
                        retryable = e.is_retryable(),
                        error = %e,
                        "Publish failed for good"
                    );
                    return Err(e);
                }
            }
        }
    }
}
