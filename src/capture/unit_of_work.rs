// Copyright (c) 2025 - Cowboy AI, Inc.
//! Unit-of-work boundary for event capture
//!
//! The surrounding persistence layer owns the transaction. This module only
//! defines the primitives capture needs from it and a small façade that
//! runs capture and commit in the right order.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{error, info};
use uuid::Uuid;

use crate::capture::{CaptureReport, DroppedEvent, EventCaptureInterceptor, EventSource};
use crate::errors::{OutboxError, OutboxResult};
use crate::outbox::OutboxRecord;

/// The transaction an outbox record is written into
///
/// Implementations stage rows; nothing becomes visible before [`commit`]
/// and nothing at all if the commit fails.
///
/// [`commit`]: UnitOfWork::commit
#[async_trait]
pub trait UnitOfWork: Send {
    /// Stage an outbox row in this transaction
    async fn add_outbox_record(&mut self, record: OutboxRecord) -> OutboxResult<()>;

    /// Correlation id of the request that opened this unit of work
    fn correlation_id(&self) -> Option<&str> {
        None
    }

    /// Make every staged row durable at once
    async fn commit(&mut self) -> OutboxResult<()>;

    /// Discard every staged row
    async fn rollback(&mut self) -> OutboxResult<()>;
}

/// Completion signal of a committed save
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitReceipt {
    /// Outbox records that became durable with the business rows
    pub record_ids: Vec<Uuid>,
    /// Events dropped at capture time
    pub dropped: Vec<DroppedEvent>,
    pub committed_at: DateTime<Utc>,
}

/// Capture-then-commit façade
///
/// ```rust,ignore
/// let receipt = outbox.save_changes(&mut uow, &mut [&mut order]).await?;
/// assert_eq!(receipt.record_ids.len(), 1);
/// ```
#[derive(Debug, Clone, Default)]
pub struct TransactionalOutbox {
    interceptor: EventCaptureInterceptor,
}

impl TransactionalOutbox {
    pub fn new(interceptor: EventCaptureInterceptor) -> Self {
        Self { interceptor }
    }

    /// Capture pending events of `entities` into `uow` and commit it
    ///
    /// Returns a receipt only once the commit succeeded. On any failure the
    /// unit of work is rolled back (or was never committed) and no outbox
    /// record is visible.
    pub async fn save_changes<U>(
        &self,
        uow: &mut U,
        entities: &mut [&mut dyn EventSource],
    ) -> OutboxResult<CommitReceipt>
    where
        U: UnitOfWork + ?Sized,
    {
        let report: CaptureReport = match self.interceptor.capture(uow, entities).await {
            Ok(report) => report,
            Err(e) => {
                error!(error = %e, "Event capture failed, rolling back unit of work");
                uow.rollback().await?;
                return Err(e);
            }
        };

        if let Err(e) = uow.commit().await {
            error!(
                error = %e,
                staged = report.captured(),
                "Unit of work commit failed, captured events discarded"
            );
            return Err(match e {
                OutboxError::Commit(_) => e,
                other => OutboxError::Commit(other.to_string()),
            });
        }

        info!(
            captured = report.captured(),
            dropped = report.dropped.len(),
            "Changes saved with outbox records"
        );

        Ok(CommitReceipt {
            record_ids: report.record_ids,
            dropped: report.dropped,
            committed_at: Utc::now(),
        })
    }
}
