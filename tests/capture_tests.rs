// Copyright (c) 2025 - Cowboy AI, Inc.
//! Tests for event capture aligned with user stories

mod fixtures;

use async_trait::async_trait;
use pretty_assertions::assert_eq;

use cim_outbox_relay::{
    EventCaptureInterceptor, EventSource, InMemoryChangeLog, InMemoryOutboxStore, OutboxError,
    OutboxRecord, OutboxResult, OutboxStatus, TransactionalOutbox, UnitOfWork,
};
use fixtures::*;

/// User Story: Capturing domain events with the business change
///
/// As a service developer
/// I want domain events written in the same transaction as my aggregate
/// So that "the state changed" and "an event must be sent" never disagree
///
/// Acceptance Criteria:
/// - One outbox record per pending event, with the aggregate's identity
/// - Records start out Pending
/// - The aggregate's event buffer is empty afterwards
#[tokio::test]
async fn test_order_created_is_captured_as_one_pending_record() {
    // Given a new order #42 raising OrderCreated
    let store = InMemoryOutboxStore::new();
    let mut uow = store.begin();
    let mut order = Order::create(ORDER_ID_1, 1999);
    uow.put("order/42", order.row());

    // When the changes are saved
    let receipt = TransactionalOutbox::default()
        .save_changes(&mut uow, &mut [&mut order])
        .await
        .unwrap();

    // Then exactly one outbox record exists for Order#42
    let records = store.outbox_records();
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.aggregate_type(), "Order");
    assert_eq!(record.aggregate_id(), "42");
    assert_eq!(record.event_type(), "OrderCreated");
    assert_eq!(record.status(), OutboxStatus::Pending);
    assert_eq!(record.retry_count(), 0);
    assert!(record.processed_at_utc().is_none());

    // And the receipt names it
    assert_eq!(receipt.record_ids, vec![record.id()]);
    assert!(receipt.dropped.is_empty());

    // And the business row committed with it
    assert!(store.row("order/42").is_some());
    assert_eq!(order.pending_events(), 0);
}

#[tokio::test]
async fn test_payload_is_the_serialized_event() {
    // Given an order
    let store = InMemoryOutboxStore::new();
    let mut uow = store.begin();
    let mut order = Order::create(ORDER_ID_1, 1999);

    // When saved
    TransactionalOutbox::default()
        .save_changes(&mut uow, &mut [&mut order])
        .await
        .unwrap();

    // Then the payload is the JSON body of the event
    let payload: serde_json::Value =
        serde_json::from_str(store.outbox_records()[0].payload()).unwrap();
    assert_eq!(
        payload,
        serde_json::json!({"type": "OrderCreated", "order_id": "42", "total_cents": 1999})
    );
}

/// User Story: All-or-nothing commits
///
/// As an operator
/// I want a failed commit to leave no outbox rows behind
/// So that no event is ever published for a change that did not happen
#[tokio::test]
async fn test_commit_failure_after_capture_persists_nothing() {
    // Given an order raising three events and a store whose next commit fails
    let change_log = InMemoryChangeLog::new(1);
    let store = InMemoryOutboxStore::new().with_change_log(change_log.clone());
    store.fail_next_commit("connection reset during commit");
    let mut uow = store.begin();
    let mut order = Order::create(ORDER_ID_1, 500);
    order.add_line("SKU-1");
    order.ship();
    uow.put("order/42", order.row());

    // When the changes are saved
    let result = TransactionalOutbox::default()
        .save_changes(&mut uow, &mut [&mut order])
        .await;

    // Then the save fails as a commit error
    assert!(matches!(result, Err(OutboxError::Commit(_))));

    // And neither outbox rows nor business rows became visible
    assert!(store.outbox_records().is_empty());
    assert!(store.row("order/42").is_none());
    assert!(change_log.is_empty());
}

#[tokio::test]
async fn test_all_events_of_a_commit_become_visible_together() {
    // Given two aggregates with four events between them
    let store = InMemoryOutboxStore::new();
    let mut uow = store.begin();
    let mut first = Order::create(ORDER_ID_1, 100);
    first.add_line("SKU-1");
    let mut second = Order::create(ORDER_ID_2, 200);
    second.ship();

    // When they are saved in one unit of work
    let receipt = TransactionalOutbox::default()
        .save_changes(&mut uow, &mut [&mut first, &mut second])
        .await
        .unwrap();

    // Then all four records exist, in capture order
    let records = store.outbox_records();
    let ids: Vec<_> = records.iter().map(OutboxRecord::id).collect();
    assert_eq!(ids, receipt.record_ids);
    let types: Vec<_> = records.iter().map(|r| r.event_type().to_string()).collect();
    assert_eq!(
        types,
        vec!["OrderCreated", "OrderLineAdded", "OrderCreated", "OrderShipped"]
    );
}

/// User Story: Idempotent capture
///
/// As a service developer
/// I want repeated capture passes to add nothing new
/// So that commit retries never duplicate events
#[tokio::test]
async fn test_second_capture_without_new_events_adds_nothing() {
    // Given an order whose events were already captured once
    let store = InMemoryOutboxStore::new();
    let mut uow = store.begin();
    let mut order = Order::create(ORDER_ID_1, 100);
    let interceptor = EventCaptureInterceptor::new();
    let first = interceptor.capture(&mut uow, &mut [&mut order]).await.unwrap();

    // When capture runs again without new events
    let second = interceptor.capture(&mut uow, &mut [&mut order]).await.unwrap();
    uow.commit().await.unwrap();

    // Then the second pass staged nothing
    assert_eq!(first.captured(), 1);
    assert_eq!(second.captured(), 0);
    assert_eq!(store.outbox_records().len(), 1);
}

/// User Story: Serialization failures drop only the bad event
///
/// As an operator
/// I want one unserializable event to be logged and dropped
/// So that the business transaction still succeeds
#[tokio::test]
async fn test_unserializable_event_is_dropped_and_reported() {
    // Given an aggregate with one good and one unserializable event
    let store = InMemoryOutboxStore::new();
    let mut uow = store.begin();
    let mut audit = AuditLog::with_corrupt_event("audit-1");

    // When saved
    let receipt = TransactionalOutbox::default()
        .save_changes(&mut uow, &mut [&mut audit])
        .await
        .unwrap();

    // Then the good event is committed
    let records = store.outbox_records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].event_type(), "AuditNoted");

    // And the bad one is reported as dropped
    assert_eq!(receipt.dropped.len(), 1);
    let dropped = &receipt.dropped[0];
    assert_eq!(dropped.aggregate_type, "AuditLog");
    assert_eq!(dropped.aggregate_id, "audit-1");
    assert_eq!(dropped.event_type, "AuditCorrupted");
    assert!(dropped.reason.contains("unsupported value"));
}

#[tokio::test]
async fn test_correlation_id_flows_into_records_and_change_log() {
    // Given a unit of work opened for a correlated request
    let change_log = InMemoryChangeLog::new(1);
    let store = InMemoryOutboxStore::new().with_change_log(change_log.clone());
    let mut uow = store.begin().with_correlation_id(CORRELATION_ID_1);
    let mut order = Order::create(ORDER_ID_1, 100);

    // When saved
    TransactionalOutbox::default()
        .save_changes(&mut uow, &mut [&mut order])
        .await
        .unwrap();

    // Then the record carries the correlation id
    let record = &store.outbox_records()[0];
    assert_eq!(record.correlation_id(), Some(CORRELATION_ID_1));

    // And so does the change log entry the relay will read
    let source = change_log.subscribe(relay_group("relay"));
    let item = cim_outbox_relay::ChangeLogSource::consume_next(
        &source,
        std::time::Duration::from_millis(20),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(item.headers().correlation_id(), Some(CORRELATION_ID_1));
    assert_eq!(item.record_id(), record.id());
}

/// Unit of work whose storage rejects outbox rows
#[derive(Default)]
struct RejectingUnitOfWork {
    committed: bool,
    rolled_back: bool,
}

#[async_trait]
impl UnitOfWork for RejectingUnitOfWork {
    async fn add_outbox_record(&mut self, _record: OutboxRecord) -> OutboxResult<()> {
        Err(OutboxError::Persistence("outbox table is read-only".to_string()))
    }

    async fn commit(&mut self) -> OutboxResult<()> {
        self.committed = true;
        Ok(())
    }

    async fn rollback(&mut self) -> OutboxResult<()> {
        self.rolled_back = true;
        Ok(())
    }
}

#[tokio::test]
async fn test_staging_failure_rolls_back_and_never_commits() {
    // Given a unit of work that cannot stage outbox rows
    let mut uow = RejectingUnitOfWork::default();
    let mut order = Order::create(ORDER_ID_1, 100);

    // When saving
    let sources: &mut [&mut dyn EventSource] = &mut [&mut order];
    let result = TransactionalOutbox::default()
        .save_changes(&mut uow, sources)
        .await;

    // Then the error surfaces and the unit of work was rolled back
    assert!(matches!(result, Err(OutboxError::Persistence(_))));
    assert!(uow.rolled_back);
    assert!(!uow.committed);
}
