// Copyright (c) 2025 - Cowboy AI, Inc.
//! Relay configuration
//!
//! All settings are supplied by the host process. Each struct has a
//! `Default` with the documented values and a `from_env()` constructor
//! reading `OUTBOX_*` / `NATS_*` variables.
//!
//! | Variable | Default |
//! |---|---|
//! | `OUTBOX_RELAY_ENABLED` | `true` |
//! | `OUTBOX_RELAY_POLL_TIMEOUT_MS` | `1000` |
//! | `OUTBOX_RELAY_MAX_RETRY_ATTEMPTS` | `3` |
//! | `OUTBOX_RELAY_RETRY_BASE_DELAY_MS` | `2000` |
//! | `OUTBOX_RELAY_RETRY_MAX_DELAY_MS` | `60000` |
//! | `OUTBOX_RELAY_GROUP` | `outbox-relay` |
//! | `NATS_URL` | `nats://localhost:4222` |
//! | `OUTBOX_CDC_STREAM` | `OUTBOX_CDC` |
//! | `OUTBOX_CDC_SUBJECT` | `cdc.outbox.>` |
//! | `OUTBOX_DEAD_LETTER_SUBJECT` | unset |
//! | `OUTBOX_PUBLISH_PREFIX` | `integration` |

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::errors::{OutboxError, OutboxResult};

/// Name of the consumer group shared by every process of one relay deployment
///
/// All relay processes of a deployment must use the same group so the
/// transport splits partitions between them. Two different groups each
/// receive the full change log and would publish every event twice.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RelayGroup(String);

impl RelayGroup {
    /// Validate and wrap a group name
    ///
    /// The name doubles as a JetStream durable consumer name, so it must be
    /// non-empty and free of whitespace, `.`, `*` and `>`.
    pub fn new(name: impl Into<String>) -> OutboxResult<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(OutboxError::Configuration(
                "relay group name must not be empty".to_string(),
            ));
        }
        if let Some(bad) = name
            .chars()
            .find(|c| c.is_whitespace() || matches!(c, '.' | '*' | '>'))
        {
            return Err(OutboxError::Configuration(format!(
                "relay group name '{}' contains invalid character '{}'",
                name, bad
            )));
        }
        Ok(Self(name))
    }

    /// Read the group from `OUTBOX_RELAY_GROUP`
    pub fn from_env() -> OutboxResult<Self> {
        Self::from_lookup(env_lookup)
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> OutboxResult<Self> {
        Self::new(lookup("OUTBOX_RELAY_GROUP").unwrap_or_else(|| "outbox-relay".to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RelayGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Relay loop settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// Run the relay at all
    pub enabled: bool,
    /// Upper bound for one `consume_next` call
    pub poll_timeout: Duration,
    /// Total publish attempts per item, first attempt included
    pub max_retry_attempts: u32,
    /// Delay before the second attempt; doubles on each further attempt
    pub retry_base_delay: Duration,
    /// Cap on a single backoff delay
    pub retry_max_delay: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_timeout: Duration::from_millis(1000),
            max_retry_attempts: 3,
            retry_base_delay: Duration::from_millis(2000),
            retry_max_delay: Duration::from_secs(60),
        }
    }
}

impl RelayConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> OutboxResult<Self> {
        Self::from_lookup(env_lookup)
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> OutboxResult<Self> {
        let defaults = Self::default();
        let config = Self {
            enabled: parse_or(&lookup, "OUTBOX_RELAY_ENABLED", defaults.enabled)?,
            poll_timeout: millis_or(&lookup, "OUTBOX_RELAY_POLL_TIMEOUT_MS", defaults.poll_timeout)?,
            max_retry_attempts: parse_or(
                &lookup,
                "OUTBOX_RELAY_MAX_RETRY_ATTEMPTS",
                defaults.max_retry_attempts,
            )?,
            retry_base_delay: millis_or(
                &lookup,
                "OUTBOX_RELAY_RETRY_BASE_DELAY_MS",
                defaults.retry_base_delay,
            )?,
            retry_max_delay: millis_or(
                &lookup,
                "OUTBOX_RELAY_RETRY_MAX_DELAY_MS",
                defaults.retry_max_delay,
            )?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the relay loop cannot run with
    pub fn validate(&self) -> OutboxResult<()> {
        if self.poll_timeout.is_zero() {
            return Err(OutboxError::Configuration(
                "poll timeout must be greater than zero".to_string(),
            ));
        }
        if self.max_retry_attempts == 0 {
            return Err(OutboxError::Configuration(
                "max retry attempts must be at least 1".to_string(),
            ));
        }
        if self.retry_max_delay < self.retry_base_delay {
            return Err(OutboxError::Configuration(format!(
                "retry max delay {:?} is below base delay {:?}",
                self.retry_max_delay, self.retry_base_delay
            )));
        }
        Ok(())
    }
}

/// JetStream change-log transport settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeLogConfig {
    /// NATS server URL
    pub nats_url: String,
    /// Stream the CDC connector writes row changes into
    pub stream_name: String,
    /// Subject filter for outbox row changes
    pub subject: String,
    /// How long an unacknowledged delivery stays invisible to the group
    pub ack_wait: Duration,
    /// Redelivery limit enforced by the server; `-1` is unlimited
    ///
    /// Once reached the server drops the item, so a bounded limit requires
    /// a dead-letter subject.
    pub max_deliver: i64,
    /// Deliveries in flight per consumer; 1 keeps the stream strictly ordered
    pub max_ack_pending: i64,
    /// Delay requested when a failed item is handed back
    pub nak_delay: Duration,
    /// Where failed items are copied for inspection
    pub dead_letter_subject: Option<String>,
}

impl Default for ChangeLogConfig {
    fn default() -> Self {
        Self {
            nats_url: "nats://localhost:4222".to_string(),
            stream_name: "OUTBOX_CDC".to_string(),
            subject: "cdc.outbox.>".to_string(),
            ack_wait: Duration::from_secs(30),
            max_deliver: -1,
            max_ack_pending: 1,
            nak_delay: Duration::from_secs(5),
            dead_letter_subject: None,
        }
    }
}

impl ChangeLogConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> OutboxResult<Self> {
        Self::from_lookup(env_lookup)
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> OutboxResult<Self> {
        let defaults = Self::default();
        let config = Self {
            nats_url: lookup("NATS_URL").unwrap_or(defaults.nats_url),
            stream_name: lookup("OUTBOX_CDC_STREAM").unwrap_or(defaults.stream_name),
            subject: lookup("OUTBOX_CDC_SUBJECT").unwrap_or(defaults.subject),
            ack_wait: millis_or(&lookup, "OUTBOX_CDC_ACK_WAIT_MS", defaults.ack_wait)?,
            max_deliver: parse_or(&lookup, "OUTBOX_CDC_MAX_DELIVER", defaults.max_deliver)?,
            max_ack_pending: parse_or(
                &lookup,
                "OUTBOX_CDC_MAX_ACK_PENDING",
                defaults.max_ack_pending,
            )?,
            nak_delay: millis_or(&lookup, "OUTBOX_CDC_NAK_DELAY_MS", defaults.nak_delay)?,
            dead_letter_subject: lookup("OUTBOX_DEAD_LETTER_SUBJECT").filter(|s| !s.is_empty()),
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject settings under which a failed item could be dropped unseen
    pub fn validate(&self) -> OutboxResult<()> {
        if self.max_deliver == 0 || self.max_deliver < -1 {
            return Err(OutboxError::Configuration(format!(
                "max deliver must be -1 or positive, got {}",
                self.max_deliver
            )));
        }
        if self.max_deliver > 0 && self.dead_letter_subject.is_none() {
            return Err(OutboxError::Configuration(format!(
                "max deliver {} needs a dead-letter subject",
                self.max_deliver
            )));
        }
        if self.max_ack_pending < 1 {
            return Err(OutboxError::Configuration(
                "max ack pending must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Outbound bus settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublisherConfig {
    /// Root token of every integration event subject
    pub subject_prefix: String,
    /// How long to wait for the publish acknowledgment
    pub ack_timeout: Duration,
    /// Stream to create over `{subject_prefix}.>` at startup, if any
    pub stream_name: Option<String>,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            subject_prefix: "integration".to_string(),
            ack_timeout: Duration::from_secs(5),
            stream_name: None,
        }
    }
}

impl PublisherConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> OutboxResult<Self> {
        Self::from_lookup(env_lookup)
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> OutboxResult<Self> {
        let defaults = Self::default();
        Ok(Self {
            subject_prefix: lookup("OUTBOX_PUBLISH_PREFIX").unwrap_or(defaults.subject_prefix),
            ack_timeout: millis_or(&lookup, "OUTBOX_PUBLISH_ACK_TIMEOUT_MS", defaults.ack_timeout)?,
            stream_name: lookup("OUTBOX_PUBLISH_STREAM").filter(|s| !s.is_empty()),
        })
    }
}

fn env_lookup(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> OutboxResult<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| {
            OutboxError::Configuration(format!("{}='{}' is invalid: {}", key, raw, e))
        }),
    }
}

fn millis_or(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> OutboxResult<Duration> {
    let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
    parse_or(lookup, key, default_ms).map(Duration::from_millis)
}
