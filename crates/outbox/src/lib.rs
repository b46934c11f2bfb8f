//! Persistence boundary for the order service: aggregate state rows, the
//! transactional outbox and the consumers' idempotency ledger.

pub mod aggregate_row;
pub mod backoff;
pub mod error;
pub mod event;
pub mod ledger;
pub mod memory;
pub mod postgres;
pub mod record;
pub mod store;

pub use aggregate_row::{AggregateRow, Version};
pub use backoff::RetryPolicy;
pub use common::AggregateId;
pub use error::{Result, StoreError};
pub use event::{EventEnvelope, EventEnvelopeBuilder, EventId, Sequence};
pub use ledger::{IdempotencyLedger, LedgerEntry};
pub use memory::{InMemoryStore, InMemoryUnitOfWork};
pub use postgres::{PgUnitOfWork, PostgresStore};
pub use record::{FailureOutcome, OutboxRecord, OutboxStats, OutboxStatus, RecordId};
pub use store::{Maintenance, OutboxStore, Store, UnitOfWork};

/// Converts a std duration for timestamp arithmetic, saturating at a
/// century for values chrono cannot represent.
pub fn chrono_duration(duration: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(36_500))
}
