//! Broker abstraction used by the relay (publisher side) and the dispatcher
//! (consumer side).
//!
//! Delivery is at-least-once: a delivery that is neither acked nor rejected
//! before its ack deadline, or that is nacked, is delivered again. Inside a
//! consumer group, messages sharing a key are delivered one at a time in
//! publish order.

mod memory;
mod postgres;

pub use memory::InMemoryBroker;
pub use postgres::{PostgresBroker, PostgresBrokerConfig};

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Header carrying the event identity.
pub const HEADER_EVENT_ID: &str = "event-id";
/// Header carrying the event type tag.
pub const HEADER_EVENT_TYPE: &str = "event-type";
/// Header naming the consumer a dead-lettered copy was parked for.
pub const HEADER_CONSUMER: &str = "consumer";

/// Topic an aggregate type's events are published to.
pub fn topic_for(aggregate_type: &str) -> String {
    format!("{}.events", aggregate_type.to_lowercase())
}

/// Dead-letter topic paired with `topic`.
pub fn dead_letter_topic(topic: &str) -> String {
    format!("{topic}.dlq")
}

/// A message as published to the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    /// Ordering key; the aggregate id for domain events.
    pub key: String,
    pub payload: Vec<u8>,
    pub headers: HashMap<String, String>,
}

impl Message {
    pub fn new(topic: impl Into<String>, key: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            topic: topic.into(),
            key: key.into(),
            payload,
            headers: HashMap::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

/// A message parked on a dead-letter topic.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    /// The message as it was published; `message.topic` is the source topic.
    pub message: Message,
    pub reason: String,
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetter {
    /// The dead-letter topic the message is parked on.
    pub fn topic(&self) -> String {
        dead_letter_topic(&self.message.topic)
    }
}

/// Identifies one delivery of a message to a consumer group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeliveryTag(u64);

impl DeliveryTag {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A message handed to a subscriber.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub tag: DeliveryTag,
    pub message: Message,
    /// 1 on first delivery, incremented on every redelivery.
    pub attempt: u32,
}

#[derive(Debug, Error)]
pub enum BrokerError {
    /// The broker could not take the request right now; retrying may succeed.
    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    /// The broker refused the message; retrying will not help.
    #[error("Message rejected: {0}")]
    Rejected(String),

    #[error("Broker did not acknowledge in time")]
    Timeout,

    #[error("Unknown or already settled delivery: {0}")]
    UnknownDelivery(DeliveryTag),

    #[error("Broker closed")]
    Closed,
}

impl BrokerError {
    /// True for failures worth retrying with the same message.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BrokerError::Unavailable(_) | BrokerError::Timeout | BrokerError::Closed
        )
    }
}

pub type Result<T> = std::result::Result<T, BrokerError>;

/// Publishing side of the broker.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Publishes `message` and returns once the broker acknowledged it.
    async fn publish(&self, message: Message) -> Result<()>;

    /// Parks `message` on the dead-letter topic of its topic.
    async fn dead_letter(&self, message: Message, reason: &str) -> Result<()>;

    /// Parked messages across all dead-letter topics, oldest first.
    async fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>>;

    /// Joins consumer group `group` on `topic`. Subscriptions of the same
    /// group compete for messages; each group sees every message.
    async fn subscribe(&self, topic: &str, group: &str) -> Result<Box<dyn Subscription>>;
}

/// Consuming side of the broker.
#[async_trait]
pub trait Subscription: Send {
    /// Waits for the next delivery. Returns `None` once the broker is closed.
    async fn next(&mut self) -> Option<Delivery>;

    /// Settles a delivery as processed.
    async fn ack(&mut self, tag: DeliveryTag) -> Result<()>;

    /// Returns a delivery for redelivery.
    async fn nack(&mut self, tag: DeliveryTag) -> Result<()>;

    /// Settles a delivery by moving it to the dead-letter topic.
    async fn reject(&mut self, tag: DeliveryTag, reason: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topics_derive_from_aggregate_type() {
        assert_eq!(topic_for("Order"), "order.events");
        assert_eq!(dead_letter_topic("order.events"), "order.events.dlq");
    }

    #[test]
    fn only_delivery_failures_are_transient() {
        assert!(BrokerError::Unavailable("down".into()).is_transient());
        assert!(BrokerError::Timeout.is_transient());
        assert!(!BrokerError::Rejected("too large".into()).is_transient());
    }

    #[test]
    fn headers_are_readable() {
        let message = Message::new("t", "k", vec![]).with_header(HEADER_EVENT_TYPE, "OrderPaid");
        assert_eq!(message.header(HEADER_EVENT_TYPE), Some("OrderPaid"));
        assert_eq!(message.header(HEADER_EVENT_ID), None);
    }
}
