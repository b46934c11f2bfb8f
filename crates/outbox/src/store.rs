use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    AggregateId, AggregateRow, EventEnvelope, FailureOutcome, IdempotencyLedger, OutboxRecord,
    OutboxStats, RecordId, Result, Version,
};

/// Entry point of the persistence boundary.
///
/// Aggregate state rows, outbox records and ledger entries live in the same
/// store so that one [`UnitOfWork`] can commit them together.
#[async_trait]
pub trait Store: Clone + Send + Sync + 'static {
    type UnitOfWork: UnitOfWork;

    /// Opens a unit of work. Dropping it without `commit` discards every
    /// write made through it.
    async fn begin(&self) -> Result<Self::UnitOfWork>;
}

/// One atomic unit of writes against the store.
///
/// Reads see the unit's own uncommitted writes.
#[async_trait]
pub trait UnitOfWork: IdempotencyLedger + Send {
    async fn load_aggregate(
        &mut self,
        aggregate_type: &str,
        aggregate_id: AggregateId,
    ) -> Result<Option<AggregateRow>>;

    /// Writes an aggregate row. `expected` is the version the caller loaded
    /// (`Version::initial()` for a new aggregate); the row must carry
    /// `expected.next()`.
    async fn save_aggregate(&mut self, row: AggregateRow, expected: Version) -> Result<()>;

    /// Appends events to the outbox as Pending records. Only reachable
    /// through a unit of work, so the records commit or roll back with
    /// whatever state change produced them.
    async fn append(&mut self, events: Vec<EventEnvelope>) -> Result<()>;

    async fn commit(self) -> Result<()>;

    async fn rollback(self) -> Result<()>;
}

/// Relay-facing operations on committed outbox records.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Claims up to `limit` deliverable records for `claimant`.
    ///
    /// Only the lowest unsent sequence of each aggregate is returned, and
    /// only if it is eligible (backoff elapsed) and not held by a live
    /// claim. Claimed records are hidden from other callers for
    /// `visibility_timeout`. Concurrent callers never receive the same record
    /// while its claim is live.
    async fn fetch_pending(
        &self,
        limit: usize,
        visibility_timeout: Duration,
        claimant: &str,
    ) -> Result<Vec<OutboxRecord>>;

    /// Marks a record delivered after the broker acknowledged it.
    async fn mark_sent(&self, record_id: RecordId) -> Result<()>;

    /// Records a failed publish attempt and schedules the retry, or exhausts
    /// the record once the retry budget is used up.
    async fn mark_failed(
        &self,
        record_id: RecordId,
        claimant: &str,
        reason: &str,
    ) -> Result<FailureOutcome>;

    /// Returns a claim without counting an attempt.
    async fn release(&self, record_id: RecordId, claimant: &str) -> Result<()>;

    /// Moves an exhausted record back to Pending with a fresh retry budget.
    async fn requeue(&self, record_id: RecordId) -> Result<()>;

    async fn get(&self, record_id: RecordId) -> Result<Option<OutboxRecord>>;

    /// Exhausted records, oldest first.
    async fn list_exhausted(&self, limit: usize) -> Result<Vec<OutboxRecord>>;

    async fn stats(&self) -> Result<OutboxStats>;
}

/// Retention housekeeping.
#[async_trait]
pub trait Maintenance: Send + Sync {
    /// Deletes Sent records delivered before `cutoff`. Returns the count.
    async fn purge_sent(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    /// Deletes ledger entries applied before `cutoff`. Returns the count.
    async fn purge_ledger(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}
