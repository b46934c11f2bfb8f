//! Core aggregate and domain event traits.

use chrono::{DateTime, Utc};
use common::AggregateId;
use outbox::{EventEnvelope, EventId, Sequence, Version};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

/// Trait for domain events.
///
/// Domain events represent facts that have happened in the domain.
/// They are immutable and should be named in past tense.
pub trait DomainEvent: Serialize + DeserializeOwned + Send + Sync + Clone {
    /// Returns the event type name carried in the envelope.
    fn event_type(&self) -> &'static str;
}

/// An event raised by an aggregate and not yet persisted.
///
/// Identity, sequence and timestamp are fixed when the event is raised and
/// never change afterwards, including across publish retries.
#[derive(Debug, Clone)]
pub struct RaisedEvent<E> {
    pub event_id: EventId,
    pub sequence: Sequence,
    pub occurred_at: DateTime<Utc>,
    pub event: E,
}

impl<E: DomainEvent> RaisedEvent<E> {
    pub fn to_envelope(
        &self,
        aggregate_id: AggregateId,
        aggregate_type: &str,
    ) -> Result<EventEnvelope, serde_json::Error> {
        Ok(EventEnvelope::builder()
            .event_id(self.event_id)
            .event_type(self.event.event_type())
            .aggregate_id(aggregate_id)
            .aggregate_type(aggregate_type)
            .sequence(self.sequence)
            .occurred_at(self.occurred_at)
            .payload(&self.event)?
            .build())
    }
}

/// Events an aggregate raised since it was loaded, plus the sequence the next
/// event will get.
///
/// Only `next_sequence` is part of the persisted state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct EventBuffer<E> {
    next_sequence: Sequence,
    #[serde(skip)]
    pending: Vec<RaisedEvent<E>>,
}

impl<E> Default for EventBuffer<E> {
    fn default() -> Self {
        Self {
            next_sequence: Sequence::first(),
            pending: Vec::new(),
        }
    }
}

impl<E> EventBuffer<E> {
    pub fn push(&mut self, event: E) -> &RaisedEvent<E> {
        let sequence = self.next_sequence;
        self.next_sequence = sequence.next();
        self.pending.push(RaisedEvent {
            event_id: EventId::new(),
            sequence,
            occurred_at: Utc::now(),
            event,
        });
        &self.pending[self.pending.len() - 1]
    }

    pub fn pending(&self) -> &[RaisedEvent<E>] {
        &self.pending
    }

    pub fn next_sequence(&self) -> Sequence {
        self.next_sequence
    }

    pub fn drain(&mut self) -> Vec<RaisedEvent<E>> {
        std::mem::take(&mut self.pending)
    }
}

/// Trait for aggregates whose current state is stored as one row.
///
/// Business methods validate, then [`raise`](Aggregate::raise) events: the
/// event is applied to the in-memory state and buffered for the outbox.
/// Nothing is written until a [`CommandHandler`](crate::CommandHandler)
/// persists the aggregate.
pub trait Aggregate: Default + Serialize + DeserializeOwned + Send + Sync + Sized {
    /// The type of events this aggregate produces.
    type Event: DomainEvent;

    /// The type of errors business methods can produce.
    type Error: std::error::Error + Send + Sync;

    /// Returns the aggregate type name.
    ///
    /// Used as the state row key and to derive the broker topic.
    fn aggregate_type() -> &'static str;

    /// Returns None for an aggregate that was never created.
    fn id(&self) -> Option<AggregateId>;

    /// Version of the state row this aggregate was loaded from.
    fn version(&self) -> Version;

    fn set_version(&mut self, version: Version);

    /// Applies an event to the in-memory state. Must not fail.
    fn apply(&mut self, event: Self::Event);

    fn buffer(&self) -> &EventBuffer<Self::Event>;

    fn buffer_mut(&mut self) -> &mut EventBuffer<Self::Event>;

    /// Applies `event` and buffers it for the outbox.
    fn raise(&mut self, event: Self::Event) {
        self.apply(event.clone());
        self.buffer_mut().push(event);
    }

    /// Removes and returns the buffered events.
    fn take_pending(&mut self) -> Vec<RaisedEvent<Self::Event>> {
        self.buffer_mut().drain()
    }
}
