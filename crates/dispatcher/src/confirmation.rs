//! Payment confirmation consumer.

use async_trait::async_trait;
use domain::{DomainEvent, OrderEvent, OrderService, RecordConfirmation};
use outbox::{EventEnvelope, Store};

use crate::error::HandlerError;
use crate::handler::EventHandler;

/// Sends the payment confirmation for each `OrderPaid` event.
///
/// The confirmation is recorded on the order in the dispatcher's unit of
/// work, which raises `OrderConfirmationSent` through the outbox. A replayed
/// `OrderPaid` therefore never confirms twice, even without the ledger.
pub struct SendConfirmationHandler<S: Store> {
    orders: OrderService<S>,
}

impl<S: Store> SendConfirmationHandler<S> {
    pub const NAME: &'static str = "send-confirmation";

    pub fn new(orders: OrderService<S>) -> Self {
        Self { orders }
    }
}

#[async_trait]
impl<S: Store> EventHandler<S::UnitOfWork> for SendConfirmationHandler<S> {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn event_types(&self) -> &[&'static str] {
        &[OrderEvent::PAID]
    }

    async fn handle(
        &self,
        uow: &mut S::UnitOfWork,
        event: &EventEnvelope,
    ) -> Result<(), HandlerError> {
        let paid = match serde_json::from_value::<OrderEvent>(event.payload.clone()) {
            Ok(OrderEvent::OrderPaid(paid)) => paid,
            Ok(other) => {
                return Err(HandlerError::Business(format!(
                    "expected OrderPaid, got {}",
                    other.event_type()
                )));
            }
            Err(e) => {
                return Err(HandlerError::Business(format!(
                    "undecodable OrderPaid payload: {e}"
                )));
            }
        };

        let result = self
            .orders
            .record_confirmation_in(uow, RecordConfirmation::new(paid.order_id, event.event_id))
            .await?;

        if result.events.is_empty() {
            tracing::debug!(order_id = %paid.order_id, "confirmation already recorded");
        } else {
            tracing::info!(
                order_id = %paid.order_id,
                customer_id = %paid.customer_id,
                amount = %paid.amount,
                payment_id = %paid.payment_id,
                "payment confirmation sent"
            );
        }
        Ok(())
    }
}
