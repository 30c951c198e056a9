// Copyright (c) 2025 - Cowboy AI, Inc.
//! Outbox table access
//!
//! [`OutboxStatusStore`] is the port the relay uses to record delivery
//! outcomes. [`InMemoryOutboxStore`] is a transactional in-process table
//! pair (business rows + outbox rows) used by tests and local runs; when a
//! change log is attached it plays the CDC connector and appends every
//! committed outbox insert to that log in commit order.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;
use uuid::Uuid;

use crate::capture::UnitOfWork;
use crate::changelog::{ChangeLogEntry, InMemoryChangeLog};
use crate::errors::{OutboxError, OutboxResult};
use crate::outbox::record::{OutboxRecord, OutboxStatus, StatusCommand};

/// Records delivery outcomes on outbox rows
///
/// Status is advisory: relay correctness never depends on it, so callers
/// log failures from this port instead of aborting.
#[async_trait]
pub trait OutboxStatusStore: Send + Sync {
    /// Apply a status command to one record, returning the new status
    async fn update_status(
        &self,
        record_id: Uuid,
        command: StatusCommand,
    ) -> OutboxResult<OutboxStatus>;

    /// Relay confirmed bus delivery
    ///
    /// A record already in `FailedToPublish` is rejected with
    /// [`OutboxError::InvalidTransition`] even when a later redelivery got
    /// it onto the bus; only [`requeue`](Self::requeue) moves it on.
    async fn mark_published(&self, record_id: Uuid) -> OutboxResult<OutboxStatus> {
        self.update_status(record_id, StatusCommand::Publish).await
    }

    /// Relay routed the record to failure handling
    async fn mark_failed(&self, record_id: Uuid, reason: &str) -> OutboxResult<OutboxStatus> {
        self.update_status(record_id, StatusCommand::FailPublish(reason.to_string()))
            .await
    }

    /// A downstream consumer confirmed processing
    async fn mark_processed_by_consumer(&self, record_id: Uuid) -> OutboxResult<OutboxStatus> {
        self.update_status(record_id, StatusCommand::ConsumerProcessed)
            .await
    }

    /// Operator retry of a failed record
    async fn requeue(&self, record_id: Uuid) -> OutboxResult<OutboxStatus> {
        self.update_status(record_id, StatusCommand::Requeue).await
    }

    /// Return a requeued record to `Pending`
    async fn rearm(&self, record_id: Uuid) -> OutboxResult<OutboxStatus> {
        self.update_status(record_id, StatusCommand::Rearm).await
    }
}

#[derive(Default)]
struct StoreState {
    rows: HashMap<String, serde_json::Value>,
    outbox: Vec<OutboxRecord>,
    fail_next_commit: Option<String>,
}

/// In-process outbox table with all-or-nothing commits
#[derive(Clone, Default)]
pub struct InMemoryOutboxStore {
    state: Arc<Mutex<StoreState>>,
    change_log: Option<InMemoryChangeLog>,
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mirror committed outbox inserts into `change_log`
    pub fn with_change_log(mut self, change_log: InMemoryChangeLog) -> Self {
        self.change_log = Some(change_log);
        self
    }

    /// Start a unit of work against this store
    pub fn begin(&self) -> InMemoryUnitOfWork {
        InMemoryUnitOfWork {
            store: self.clone(),
            rows: Vec::new(),
            outbox: Vec::new(),
            correlation_id: None,
            finished: false,
        }
    }

    /// Make the next commit fail after everything has been staged
    pub fn fail_next_commit(&self, reason: impl Into<String>) {
        self.lock().fail_next_commit = Some(reason.into());
    }

    /// Committed outbox rows in commit order
    pub fn outbox_records(&self) -> Vec<OutboxRecord> {
        self.lock().outbox.clone()
    }

    /// One committed outbox row
    pub fn record(&self, record_id: Uuid) -> Option<OutboxRecord> {
        self.lock()
            .outbox
            .iter()
            .find(|r| r.id() == record_id)
            .cloned()
    }

    /// One committed business row
    pub fn row(&self, key: &str) -> Option<serde_json::Value> {
        self.lock().rows.get(key).cloned()
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl OutboxStatusStore for InMemoryOutboxStore {
    async fn update_status(
        &self,
        record_id: Uuid,
        command: StatusCommand,
    ) -> OutboxResult<OutboxStatus> {
        let mut state = self.lock();
        let record = state
            .outbox
            .iter_mut()
            .find(|r| r.id() == record_id)
            .ok_or_else(|| {
                OutboxError::Persistence(format!("outbox record {} not found", record_id))
            })?;

        record.apply(&command, Utc::now())?;
        debug!(record_id = %record_id, status = %record.status(), "Outbox status updated");
        Ok(record.status())
    }
}

/// Pending transaction against an [`InMemoryOutboxStore`]
///
/// Business rows and outbox rows are staged together and become visible in
/// a single step on commit, or not at all.
pub struct InMemoryUnitOfWork {
    store: InMemoryOutboxStore,
    rows: Vec<(String, serde_json::Value)>,
    outbox: Vec<OutboxRecord>,
    correlation_id: Option<String>,
    finished: bool,
}

impl InMemoryUnitOfWork {
    /// Correlation id stamped on every record captured in this unit of work
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Stage a business row write
    pub fn put(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.rows.push((key.into(), value));
    }

    /// Outbox rows staged so far
    pub fn staged_records(&self) -> &[OutboxRecord] {
        &self.outbox
    }

    fn ensure_open(&self) -> OutboxResult<()> {
        if self.finished {
            return Err(OutboxError::Commit(
                "unit of work already finished".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl UnitOfWork for InMemoryUnitOfWork {
    async fn add_outbox_record(&mut self, record: OutboxRecord) -> OutboxResult<()> {
        self.ensure_open()?;
        self.outbox.push(record);
        Ok(())
    }

    fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    async fn commit(&mut self) -> OutboxResult<()> {
        self.ensure_open()?;
        self.finished = true;

        let rows = std::mem::take(&mut self.rows);
        let outbox = std::mem::take(&mut self.outbox);

        let mut state = self.store.lock();
        if let Some(reason) = state.fail_next_commit.take() {
            return Err(OutboxError::Commit(reason));
        }

        let records = outbox.len();
        state.rows.extend(rows);
        // Appended under the store lock so the log sees commits in commit order
        if let Some(change_log) = &self.store.change_log {
            for record in &outbox {
                change_log.append(ChangeLogEntry::from(record));
            }
        }
        state.outbox.extend(outbox);
        drop(state);

        debug!(records, "Unit of work committed");
        Ok(())
    }

    async fn rollback(&mut self) -> OutboxResult<()> {
        self.finished = true;
        self.rows.clear();
        self.outbox.clear();
        Ok(())
    }
}
