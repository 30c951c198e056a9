// Copyright (c) 2025 - Cowboy AI, Inc.
//! JetStream change-log source
//!
//! Reads CDC envelopes from a JetStream stream through a durable pull
//! consumer. The consumer's durable name is the relay group, so every relay
//! instance of one group shares the acknowledgment floor and a restarted
//! instance resumes from it.
//!
//! # Position semantics
//!
//! - `acknowledge` acks the message; the server moves the ack floor.
//! - `fail` optionally copies the item to a dead-letter subject, then NAKs
//!   it with a delay. The floor stays where it is and the server redelivers.
//!   If the copy cannot be published the error is returned and no NAK is
//!   sent; the server redelivers after `ack_wait`.
//! - `max_deliver` is unlimited by default. A bounded limit is only
//!   accepted together with a dead-letter subject, since the server drops
//!   the item once the limit is hit.
//! - `in_progress` sends `+WPI` so retries and backoff do not run into
//!   `ack_wait`.
//! - With `max_ack_pending = 1` the consumer hands out one message at a
//!   time, which keeps commit order for the whole stream.

use async_nats::jetstream::{self, consumer::PullConsumer, AckKind};
use async_nats::HeaderMap;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::changelog::{
    envelope, Acknowledger, CapturedEvent, ChangeLogSource, DeadLetter, StreamPosition,
};
use crate::config::{ChangeLogConfig, RelayGroup};
use crate::errors::{OutboxError, OutboxResult};

/// Header carrying the decode error on copied unreadable change messages
pub const UNREADABLE_REASON_HEADER: &str = "Outbox-Unreadable-Reason";
/// Header carrying the CDC stream sequence of a copied unreadable message
pub const UNREADABLE_SEQUENCE_HEADER: &str = "Outbox-Stream-Sequence";

/// Durable pull consumer over the CDC stream
pub struct JetStreamChangeLogSource {
    context: jetstream::Context,
    consumer: PullConsumer,
    config: ChangeLogConfig,
    group: RelayGroup,
}

impl JetStreamChangeLogSource {
    /// Connect to NATS and bind the group's durable consumer
    pub async fn connect(config: ChangeLogConfig, group: RelayGroup) -> OutboxResult<Self> {
        info!(url = %config.nats_url, "Connecting to NATS for change log");
        let client = async_nats::connect(&config.nats_url)
            .await
            .map_err(|e| classify_transport_error(&e.to_string()))?;
        Self::new(jetstream::new(client), config, group).await
    }

    /// Bind the group's durable consumer on an existing context
    pub async fn new(
        context: jetstream::Context,
        config: ChangeLogConfig,
        group: RelayGroup,
    ) -> OutboxResult<Self> {
        config.validate()?;
        let stream = context
            .get_or_create_stream(jetstream::stream::Config {
                name: config.stream_name.clone(),
                subjects: vec![config.subject.clone()],
                storage: jetstream::stream::StorageType::File,
                ..Default::default()
            })
            .await
            .map_err(|e| classify_transport_error(&e.to_string()))?;

        let consumer: PullConsumer = stream
            .get_or_create_consumer(
                group.as_str(),
                jetstream::consumer::pull::Config {
                    durable_name: Some(group.to_string()),
                    description: Some("Transactional outbox relay".to_string()),
                    ack_policy: jetstream::consumer::AckPolicy::Explicit,
                    deliver_policy: jetstream::consumer::DeliverPolicy::All,
                    ack_wait: config.ack_wait,
                    max_deliver: config.max_deliver,
                    max_ack_pending: config.max_ack_pending,
                    filter_subject: config.subject.clone(),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| classify_transport_error(&e.to_string()))?;

        info!(
            stream = %config.stream_name,
            subject = %config.subject,
            group = %group,
            "Change log consumer ready"
        );

        Ok(Self {
            context,
            consumer,
            config,
            group,
        })
    }

    /// Copy an undecodable change message verbatim to the dead-letter subject
    async fn copy_unreadable(
        &self,
        subject: &str,
        message: &jetstream::Message,
        stream_sequence: u64,
        reason: &OutboxError,
    ) -> OutboxResult<()> {
        let mut headers = HeaderMap::new();
        headers.insert(UNREADABLE_REASON_HEADER, reason.to_string().as_str());
        headers.insert(
            UNREADABLE_SEQUENCE_HEADER,
            stream_sequence.to_string().as_str(),
        );
        self.context
            .publish_with_headers(subject.to_string(), headers, message.payload.clone())
            .await
            .map_err(|e| OutboxError::Acknowledge(format!("dead letter publish failed: {}", e)))?
            .await
            .map_err(|e| OutboxError::Acknowledge(format!("dead letter publish failed: {}", e)))?;
        Ok(())
    }

    async fn next_message(&self, timeout: Duration) -> OutboxResult<Option<jetstream::Message>> {
        let mut batch = match self
            .consumer
            .fetch()
            .max_messages(1)
            .expires(timeout)
            .messages()
            .await
        {
            Ok(batch) => batch,
            Err(e) => {
                let message = e.to_string().to_lowercase();
                if message.contains("timeout")
                    || message.contains("timed out")
                    || message.contains("no messages")
                {
                    return Ok(None);
                }
                return Err(classify_transport_error(&e.to_string()));
            }
        };

        match batch.next().await {
            Some(Ok(message)) => Ok(Some(message)),
            Some(Err(e)) => Err(classify_transport_error(&e.to_string())),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl ChangeLogSource for JetStreamChangeLogSource {
    async fn consume_next(&self, timeout: Duration) -> OutboxResult<Option<CapturedEvent>> {
        // Skipped change events do not count against the caller's timeout
        loop {
            let Some(message) = self.next_message(timeout).await? else {
                return Ok(None);
            };

            let (stream_sequence, delivered) = match message.info() {
                Ok(info) => (info.stream_sequence, info.delivered.max(1) as u64),
                Err(e) => {
                    warn!(error = %e, "Change message without JetStream metadata");
                    (0, 1)
                }
            };

            let entry = match envelope::decode(&message.payload) {
                Ok(Some(entry)) => entry,
                Ok(None) => {
                    debug!(stream_sequence, "Skipping non-insert change event");
                    message
                        .ack()
                        .await
                        .map_err(|e| OutboxError::Acknowledge(e.to_string()))?;
                    continue;
                }
                Err(e) => {
                    error!(
                        stream_sequence,
                        error = %e,
                        "Malformed change event, leaving it for redelivery"
                    );
                    if let Some(subject) = &self.config.dead_letter_subject {
                        self.copy_unreadable(subject, &message, stream_sequence, &e)
                            .await?;
                    }
                    if let Err(nak) = message
                        .ack_with(AckKind::Nak(Some(self.config.nak_delay)))
                        .await
                    {
                        return Err(OutboxError::Acknowledge(nak.to_string()));
                    }
                    return Err(e);
                }
            };

            let position = StreamPosition {
                partition: 0,
                offset: stream_sequence,
                delivery_attempt: delivered,
            };
            let acknowledger = JetStreamAcknowledger {
                message,
                context: self.context.clone(),
                dead_letter_subject: self.config.dead_letter_subject.clone(),
                nak_delay: self.config.nak_delay,
            };
            return Ok(Some(CapturedEvent::new(
                entry,
                position,
                Box::new(acknowledger),
            )));
        }
    }

    fn group(&self) -> &RelayGroup {
        &self.group
    }
}

struct JetStreamAcknowledger {
    message: jetstream::Message,
    context: jetstream::Context,
    dead_letter_subject: Option<String>,
    nak_delay: Duration,
}

impl JetStreamAcknowledger {
    async fn publish_dead_letter(&self, subject: &str, dead_letter: &DeadLetter) -> OutboxResult<()> {
        let body = serde_json::to_vec(dead_letter)?;
        self.context
            .publish(subject.to_string(), Bytes::from(body))
            .await
            .map_err(|e| classify_transport_error(&e.to_string()))?
            .await
            .map_err(|e| classify_transport_error(&e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl Acknowledger for JetStreamAcknowledger {
    async fn acknowledge(&self) -> OutboxResult<()> {
        self.message
            .ack()
            .await
            .map_err(|e| OutboxError::Acknowledge(e.to_string()))
    }

    async fn in_progress(&self) -> OutboxResult<()> {
        self.message
            .ack_with(AckKind::Progress)
            .await
            .map_err(|e| classify_transport_error(&e.to_string()))
    }

    async fn fail(&self, dead_letter: DeadLetter) -> OutboxResult<()> {
        if let Some(subject) = &self.dead_letter_subject {
            if let Err(e) = self.publish_dead_letter(subject, &dead_letter).await {
                error!(
                    subject = %subject,
                    record_id = %dead_letter.record_id,
                    error = %e,
                    "Dead letter publish failed, item left for redelivery"
                );
                return Err(OutboxError::Acknowledge(format!(
                    "dead letter publish to {} failed: {}",
                    subject, e
                )));
            }
            info!(
                subject = %subject,
                record_id = %dead_letter.record_id,
                "Dead letter published"
            );
        }

        self.message
            .ack_with(AckKind::Nak(Some(self.nak_delay)))
            .await
            .map_err(|e| OutboxError::Acknowledge(e.to_string()))
    }
}

/// Map a NATS client error to a transport error
///
/// Authentication and permission problems cannot heal by retrying; anything
/// else is treated as a transient connectivity issue.
pub fn classify_transport_error(message: &str) -> OutboxError {
    let lowered = message.to_lowercase();
    let fatal = ["authorization", "authentication", "permission", "invalid url"]
        .iter()
        .any(|needle| lowered.contains(needle));
    if fatal {
        OutboxError::fatal(message)
    } else {
        OutboxError::transient(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("Authorization Violation", true ; "authorization")]
    #[test_case("permissions violation for subscription", true ; "permission")]
    #[test_case("connection refused", false ; "refused")]
    #[test_case("timed out", false ; "timeout")]
    fn test_classify_transport_error(message: &str, fatal: bool) {
        let error = classify_transport_error(message);
        assert_eq!(error.is_fatal(), fatal);
        assert!(matches!(error, OutboxError::Transport { .. }));
    }
}
