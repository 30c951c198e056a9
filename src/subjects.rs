// Copyright (c) 2025 - Cowboy AI, Inc.

//! NATS subject hierarchy for integration events
//!
//! Integration events are routed by aggregate and event name:
//!
//! ```text
//! {prefix}.{aggregate}.{event}
//! ```
//!
//! This allows for:
//! - Precise subscriptions (`integration.order.order_created`)
//! - Aggregate-level wildcards (`integration.order.>`)
//! - Global subscriptions (`integration.>`)
//!
//! # Examples
//!
//! ```rust
//! use cim_outbox_relay::subjects::SubjectBuilder;
//!
//! let subject = SubjectBuilder::new("integration")
//!     .aggregate("Order")
//!     .event_type("OrderCreated")
//!     .build()
//!     .unwrap();
//! assert_eq!(subject, "integration.order.order_created");
//!
//! let wildcard = SubjectBuilder::new("integration").aggregate("Order").build_wildcard();
//! assert_eq!(wildcard, "integration.order.>");
//! ```

use crate::publisher::PublishError;

/// Builder for integration event subjects
#[derive(Debug, Clone)]
pub struct SubjectBuilder {
    prefix: String,
    aggregate: Option<String>,
    event_type: Option<String>,
}

impl SubjectBuilder {
    /// Create a builder under `prefix`
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            aggregate: None,
            event_type: None,
        }
    }

    /// Set the aggregate segment
    pub fn aggregate(mut self, aggregate: impl AsRef<str>) -> Self {
        let token = token(aggregate.as_ref());
        self.aggregate = (!token.is_empty()).then_some(token);
        self
    }

    /// Set the event segment
    pub fn event_type(mut self, event_type: impl AsRef<str>) -> Self {
        self.event_type = Some(token(event_type.as_ref()));
        self
    }

    /// Build the complete subject
    ///
    /// Fails with a permanent error when no usable event name is set; such a
    /// message can never be routed.
    pub fn build(self) -> Result<String, PublishError> {
        let event = match self.event_type {
            Some(event) if !event.is_empty() => event,
            _ => {
                return Err(PublishError::Permanent(
                    "event type is empty, no subject can be derived".to_string(),
                ))
            }
        };

        Ok(match self.aggregate {
            Some(aggregate) => format!("{}.{}.{}", self.prefix, aggregate, event),
            None => format!("{}.{}", self.prefix, event),
        })
    }

    /// Wildcard for all events under the builder's aggregate (or prefix)
    pub fn build_wildcard(self) -> String {
        match self.aggregate {
            Some(aggregate) => format!("{}.{}.>", self.prefix, aggregate),
            None => format!("{}.>", self.prefix),
        }
    }
}

/// Turn a logical name into one lowercase subject token
///
/// `OrderCreated` becomes `order_created`; characters NATS reserves
/// (`.`, `*`, `>`, whitespace) become `_`.
fn token(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    let mut previous_lower = false;
    for c in name.trim().chars() {
        if c.is_uppercase() {
            if previous_lower {
                out.push('_');
            }
            out.extend(c.to_lowercase());
            previous_lower = false;
        } else if c.is_alphanumeric() || c == '-' || c == '_' {
            out.push(c);
            previous_lower = c.is_lowercase() || c.is_ascii_digit();
        } else {
            out.push('_');
            previous_lower = false;
        }
    }
    out
}
