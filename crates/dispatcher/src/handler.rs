//! Handler trait for consumed events.

use async_trait::async_trait;
use outbox::{EventEnvelope, UnitOfWork};

use crate::error::HandlerError;

/// A consumer of domain events.
///
/// `handle` runs inside a unit of work opened for this handler alone and must
/// make its durable effect through `uow`; the dispatcher records the ledger
/// entry for `(name, event_id)` in the same unit and commits both together.
#[async_trait]
pub trait EventHandler<U: UnitOfWork>: Send + Sync {
    /// Consumer name used as the idempotency ledger key.
    fn name(&self) -> &'static str;

    /// Event types this handler applies.
    fn event_types(&self) -> &[&'static str];

    async fn handle(&self, uow: &mut U, event: &EventEnvelope) -> Result<(), HandlerError>;
}
