//! Idempotency ledger: which consumer has applied which event.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{EventId, Result};

/// Marks that `consumer` has applied the effect of `event_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub consumer: String,
    pub event_id: EventId,
    pub applied_at: DateTime<Utc>,
}

/// Ledger operations. Implemented by units of work so that the entry commits
/// atomically with the handler's durable side effect.
#[async_trait]
pub trait IdempotencyLedger: Send {
    async fn has_applied(&mut self, consumer: &str, event_id: EventId) -> Result<bool>;

    /// Records the pair. Fails with `StoreError::AlreadyApplied` if the pair
    /// is already present (possibly committed concurrently by another
    /// dispatcher in the same consumer group).
    async fn record_applied(&mut self, consumer: &str, event_id: EventId) -> Result<()>;
}
