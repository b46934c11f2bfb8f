//! Outbox records and their delivery state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{EventEnvelope, EventId};

/// Store-assigned identity of an outbox record, increasing in append order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(i64);

impl RecordId {
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Delivery state of an outbox record.
///
/// ```text
/// Pending ──ack──► Sent ──retention──► purged
///    ▲  │
///    │  └─publish error─► Failed ──max attempts──► Exhausted
///    └──────reclaimed after backoff──┘                 │
///    └──────────────operator requeue───────────────────┘
/// ```
///
/// A claim by a relay is tracked separately (`claimed_by`/`claimed_until`);
/// a claimed record stays Pending until the relay reports the outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    Pending,
    Sent,
    Failed,
    Exhausted,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Sent => "sent",
            OutboxStatus::Failed => "failed",
            OutboxStatus::Exhausted => "exhausted",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(OutboxStatus::Pending),
            "sent" => Some(OutboxStatus::Sent),
            "failed" => Some(OutboxStatus::Failed),
            "exhausted" => Some(OutboxStatus::Exhausted),
            _ => None,
        }
    }

    /// Records in these states can still be handed to a relay.
    pub fn is_deliverable(&self) -> bool {
        matches!(self, OutboxStatus::Pending | OutboxStatus::Failed)
    }
}

impl std::fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A domain event together with its delivery bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxRecord {
    pub id: RecordId,
    pub event: EventEnvelope,
    pub status: OutboxStatus,
    /// Number of failed publish attempts so far.
    pub attempts: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// Backoff gate: the record is not claimable before this instant.
    pub next_eligible_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub claimed_by: Option<String>,
    pub claimed_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
}

impl OutboxRecord {
    /// Builds the record an aggregate write appends for `event`.
    pub fn pending(id: RecordId, event: EventEnvelope, now: DateTime<Utc>) -> Self {
        Self {
            id,
            event,
            status: OutboxStatus::Pending,
            attempts: 0,
            last_attempt_at: None,
            next_eligible_at: now,
            last_error: None,
            claimed_by: None,
            claimed_until: None,
            created_at: now,
            sent_at: None,
        }
    }

    pub fn event_id(&self) -> EventId {
        self.event.event_id
    }

    /// True while a relay holds an unexpired claim on the record.
    pub fn is_claimed(&self, now: DateTime<Utc>) -> bool {
        self.claimed_until.is_some_and(|until| until > now)
    }

    /// True if a relay may claim the record at `now`, ignoring ordering
    /// against earlier records of the same aggregate.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.status.is_deliverable() && self.next_eligible_at <= now && !self.is_claimed(now)
    }
}

/// What `mark_failed` decided for a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// The record will be offered again once `next_eligible_at` passes.
    Retrying {
        attempts: u32,
        next_eligible_at: DateTime<Utc>,
    },
    /// The record reached the attempt ceiling and waits for an operator.
    Exhausted { attempts: u32 },
}

/// Delivery-status counters for operators.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OutboxStats {
    pub pending: u64,
    pub failed: u64,
    pub sent: u64,
    pub exhausted: u64,
    /// Pending or failed records currently held by a relay.
    pub in_flight: u64,
}
