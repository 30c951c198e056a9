// Copyright (c) 2025 - Cowboy AI, Inc.
//! JetStream integration publisher
//!
//! Publishes integration events to `{prefix}.{aggregate}.{event}` subjects
//! and waits for the stream's publish acknowledgment. The outbox record id is
//! sent as `Nats-Msg-Id`, so JetStream's duplicate window drops redeliveries
//! of an already published record.

use async_nats::header::{HeaderMap, NATS_MESSAGE_ID};
use async_nats::jetstream::{self, context::PublishErrorKind};
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::changelog::{headers, EventHeaders};
use crate::config::PublisherConfig;
use crate::errors::OutboxResult;
use crate::publisher::{IntegrationEventPublisher, PublishError};
use crate::subjects::SubjectBuilder;

/// Publishes integration events to JetStream
#[derive(Clone)]
pub struct NatsIntegrationPublisher {
    context: jetstream::Context,
    subject_prefix: String,
    ack_timeout: Duration,
}

impl NatsIntegrationPublisher {
    pub fn new(context: jetstream::Context, config: PublisherConfig) -> Self {
        Self {
            context,
            subject_prefix: config.subject_prefix,
            ack_timeout: config.ack_timeout,
        }
    }

    /// Make sure a stream captures the published subjects
    pub async fn ensure_stream(&self, stream_name: &str) -> OutboxResult<()> {
        self.context
            .get_or_create_stream(jetstream::stream::Config {
                name: stream_name.to_string(),
                subjects: vec![SubjectBuilder::new(self.subject_prefix.as_str()).build_wildcard()],
                duplicate_window: Duration::from_secs(120),
                ..Default::default()
            })
            .await
            .map_err(|e| crate::changelog::jetstream::classify_transport_error(&e.to_string()))?;
        Ok(())
    }

    fn subject_for(&self, event_type: &str, headers: &EventHeaders) -> Result<String, PublishError> {
        let builder = SubjectBuilder::new(self.subject_prefix.as_str()).event_type(event_type);
        match headers.get(headers::AGGREGATE_TYPE) {
            Some(aggregate) => builder.aggregate(aggregate).build(),
            None => builder.build(),
        }
    }

    async fn publish_and_confirm(
        &self,
        subject: String,
        header_map: HeaderMap,
        payload: Bytes,
    ) -> Result<(), PublishError> {
        let ack = self
            .context
            .publish_with_headers(subject, header_map, payload)
            .await
            .map_err(|e| classify_publish_error(e.kind(), &e.to_string()))?;
        ack.await
            .map_err(|e| classify_publish_error(e.kind(), &e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl IntegrationEventPublisher for NatsIntegrationPublisher {
    async fn publish(
        &self,
        event_type: &str,
        payload: &str,
        headers: &EventHeaders,
        cancel: &CancellationToken,
    ) -> Result<(), PublishError> {
        let subject = self.subject_for(event_type, headers)?;
        let header_map = to_header_map(headers);

        debug!(subject = %subject, event_type = %event_type, "Publishing integration event");

        let publish = tokio::time::timeout(
            self.ack_timeout,
            self.publish_and_confirm(
                subject.clone(),
                header_map,
                Bytes::copy_from_slice(payload.as_bytes()),
            ),
        );

        tokio::select! {
            _ = cancel.cancelled() => Err(PublishError::Cancelled),
            result = publish => match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => {
                    warn!(subject = %subject, error = %e, "Integration publish failed");
                    Err(e)
                }
                Err(_) => Err(PublishError::Transient(format!(
                    "no publish acknowledgment within {:?}",
                    self.ack_timeout
                ))),
            },
        }
    }
}

fn to_header_map(headers: &EventHeaders) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (key, value) in headers.iter() {
        map.insert(key, value);
    }
    if let Some(message_id) = headers.get(headers::MESSAGE_ID) {
        map.insert(NATS_MESSAGE_ID, message_id);
    }
    map
}

fn classify_publish_error(kind: PublishErrorKind, message: &str) -> PublishError {
    match kind {
        PublishErrorKind::StreamNotFound => {
            PublishError::Permanent(format!("no stream for subject: {}", message))
        }
        PublishErrorKind::WrongLastMessageId | PublishErrorKind::WrongLastSequence => {
            PublishError::Permanent(message.to_string())
        }
        _ => PublishError::Transient(message.to_string()),
    }
}
