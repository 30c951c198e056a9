// Copyright (c) 2025 - Cowboy AI, Inc.
//! CDC envelope decoding
//!
//! CDC connectors publish one envelope per row change:
//!
//! ```json
//! {"before": null, "after": {...row...}, "op": "c", "source": {...}, "ts_ms": 0}
//! ```
//!
//! Some connectors wrap it as `{"schema": ..., "payload": {envelope}}`. Only
//! inserts (`c`) and snapshot reads (`r`) of outbox rows are relayed; the
//! status updates the relay itself writes come back as `u` and are skipped.

use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use crate::changelog::{headers, ChangeLogEntry, EventHeaders};
use crate::errors::{OutboxError, OutboxResult};

/// Row-level operation of a change event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOperation {
    Create,
    Read,
    Update,
    Delete,
    Truncate,
}

impl ChangeOperation {
    fn parse(op: &str) -> OutboxResult<Self> {
        match op {
            "c" => Ok(Self::Create),
            "r" => Ok(Self::Read),
            "u" => Ok(Self::Update),
            "d" => Ok(Self::Delete),
            "t" => Ok(Self::Truncate),
            other => Err(OutboxError::Deserialization(format!(
                "unknown change operation '{}'",
                other
            ))),
        }
    }

    /// Whether the change introduces a row the relay has to publish
    pub fn is_insert(&self) -> bool {
        matches!(self, Self::Create | Self::Read)
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    op: String,
    #[serde(default)]
    after: Option<OutboxRow>,
}

#[derive(Debug, Deserialize)]
struct OutboxRow {
    id: Uuid,
    event_type: String,
    payload: Value,
    aggregate_type: String,
    aggregate_id: String,
    #[serde(default)]
    correlation_id: Option<String>,
    #[serde(default)]
    causation_id: Option<String>,
}

impl From<OutboxRow> for ChangeLogEntry {
    fn from(row: OutboxRow) -> Self {
        // The payload column is text, but connectors with JSON column
        // handling hand it over already parsed.
        let payload = match row.payload {
            Value::String(text) => text,
            other => other.to_string(),
        };

        let mut event_headers = EventHeaders::new()
            .with(headers::MESSAGE_ID, row.id.to_string())
            .with(headers::AGGREGATE_TYPE, row.aggregate_type.as_str())
            .with(headers::AGGREGATE_ID, row.aggregate_id.as_str());
        if let Some(correlation_id) = row.correlation_id {
            event_headers.insert(headers::CORRELATION_ID, correlation_id);
        }
        if let Some(causation_id) = row.causation_id {
            event_headers.insert(headers::CAUSATION_ID, causation_id);
        }

        Self {
            record_id: row.id,
            event_type: row.event_type,
            payload,
            headers: event_headers,
            partition_key: format!("{}/{}", row.aggregate_type, row.aggregate_id),
        }
    }
}

/// Decode one change event
///
/// Returns `Ok(None)` for changes that are not outbox inserts.
pub fn decode(bytes: &[u8]) -> OutboxResult<Option<ChangeLogEntry>> {
    let mut value: Value = serde_json::from_slice(bytes)
        .map_err(|e| OutboxError::Deserialization(format!("invalid change event: {}", e)))?;

    if value.get("op").is_none() {
        if let Some(inner) = value.get_mut("payload").map(Value::take) {
            value = inner;
        }
    }

    let envelope: Envelope = serde_json::from_value(value)
        .map_err(|e| OutboxError::Deserialization(format!("invalid change envelope: {}", e)))?;

    let operation = ChangeOperation::parse(&envelope.op)?;
    if !operation.is_insert() {
        return Ok(None);
    }

    let row = envelope.after.ok_or_else(|| {
        OutboxError::Deserialization("insert change without an 'after' row".to_string())
    })?;
    Ok(Some(row.into()))
}
