use thiserror::Error;

use crate::{AggregateId, EventId, RecordId, Version};

/// Errors raised by the persistence boundary.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Another unit of work saved the aggregate first.
    #[error(
        "Concurrency conflict for aggregate {aggregate_id}: expected version {expected}, found {actual}"
    )]
    ConcurrencyConflict {
        aggregate_id: AggregateId,
        expected: Version,
        actual: Version,
    },

    /// An event with this ID is already in the outbox.
    #[error("Duplicate event in outbox: {0}")]
    DuplicateEvent(EventId),

    /// The consumer already recorded this event in the idempotency ledger.
    #[error("Event {event_id} already applied by consumer {consumer}")]
    AlreadyApplied { consumer: String, event_id: EventId },

    /// The caller no longer holds the claim on the record (it expired and
    /// may have been reclaimed). Informational: the record is back in the pool.
    #[error("Claim on outbox record {record_id} expired or is held by another relay")]
    ClaimExpired { record_id: RecordId },

    #[error("Outbox record not found: {0}")]
    RecordNotFound(RecordId),

    /// Only exhausted records can be requeued by an operator.
    #[error("Outbox record {0} is not exhausted")]
    NotExhausted(RecordId),

    /// The backing store refused the operation (used by test doubles).
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A row held a value the model cannot represent.
    #[error("Corrupt row: {0}")]
    CorruptRow(String),
}

impl StoreError {
    /// True for failures that may succeed when the same work is retried.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::ConcurrencyConflict { .. }
                | StoreError::Unavailable(_)
                | StoreError::Database(_)
        )
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
