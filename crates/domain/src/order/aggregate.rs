//! Order aggregate implementation.

use chrono::{DateTime, Utc};
use common::AggregateId;
use outbox::{EventId, Version};
use serde::{Deserialize, Serialize};

use crate::aggregate::{Aggregate, EventBuffer};

use super::{
    CustomerId, Money, OrderError, OrderEvent, OrderItem, OrderState,
    events::{
        ConfirmationSentData, OrderCancelledData, OrderCreatedData, OrderPaidData,
        OrderShippedData,
    },
};

/// Order aggregate root.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Order {
    id: Option<AggregateId>,

    /// Taken from the state row on load.
    #[serde(skip)]
    version: Version,

    customer_id: Option<CustomerId>,
    state: OrderState,
    items: Vec<OrderItem>,
    total_amount: Money,
    payment_id: Option<String>,
    paid_at: Option<DateTime<Utc>>,
    tracking_number: Option<String>,
    cancellation_reason: Option<String>,

    /// Set once the payment confirmation went out.
    confirmation_for: Option<EventId>,

    events: EventBuffer<OrderEvent>,
}

impl Aggregate for Order {
    type Event = OrderEvent;
    type Error = OrderError;

    fn aggregate_type() -> &'static str {
        "Order"
    }

    fn id(&self) -> Option<AggregateId> {
        self.id
    }

    fn version(&self) -> Version {
        self.version
    }

    fn set_version(&mut self, version: Version) {
        self.version = version;
    }

    fn apply(&mut self, event: Self::Event) {
        match event {
            OrderEvent::OrderCreated(data) => {
                self.id = Some(data.order_id);
                self.customer_id = Some(data.customer_id);
                self.items = data.items;
                self.total_amount = data.total_amount;
                self.state = OrderState::Created;
            }
            OrderEvent::OrderPaid(data) => {
                self.payment_id = Some(data.payment_id);
                self.paid_at = Some(data.paid_at);
                self.state = OrderState::Paid;
            }
            OrderEvent::OrderShipped(data) => {
                self.tracking_number = data.tracking_number;
                self.state = OrderState::Shipped;
            }
            OrderEvent::OrderCancelled(data) => {
                self.cancellation_reason = Some(data.reason);
                self.state = OrderState::Cancelled;
            }
            OrderEvent::OrderConfirmationSent(data) => {
                self.confirmation_for = Some(data.paid_event_id);
            }
        }
    }

    fn buffer(&self) -> &EventBuffer<OrderEvent> {
        &self.events
    }

    fn buffer_mut(&mut self) -> &mut EventBuffer<OrderEvent> {
        &mut self.events
    }
}

// Query methods
impl Order {
    pub fn customer_id(&self) -> Option<CustomerId> {
        self.customer_id
    }

    pub fn state(&self) -> OrderState {
        self.state
    }

    pub fn items(&self) -> &[OrderItem] {
        &self.items
    }

    pub fn total_amount(&self) -> Money {
        self.total_amount
    }

    pub fn payment_id(&self) -> Option<&str> {
        self.payment_id.as_deref()
    }

    pub fn paid_at(&self) -> Option<DateTime<Utc>> {
        self.paid_at
    }

    pub fn tracking_number(&self) -> Option<&str> {
        self.tracking_number.as_deref()
    }

    pub fn cancellation_reason(&self) -> Option<&str> {
        self.cancellation_reason.as_deref()
    }

    pub fn confirmation_sent(&self) -> bool {
        self.confirmation_for.is_some()
    }
}

// Business methods: validate, then raise.
impl Order {
    /// Places a new order.
    pub fn create(
        &mut self,
        order_id: AggregateId,
        customer_id: CustomerId,
        items: Vec<OrderItem>,
    ) -> Result<(), OrderError> {
        if self.id.is_some() {
            return Err(OrderError::AlreadyCreated);
        }
        if items.is_empty() {
            return Err(OrderError::NoItems);
        }
        for item in &items {
            if item.quantity == 0 {
                return Err(OrderError::InvalidQuantity {
                    quantity: item.quantity,
                });
            }
            if !item.unit_price.is_positive() {
                return Err(OrderError::InvalidPrice {
                    price: item.unit_price.cents(),
                });
            }
        }

        let total_amount = items
            .iter()
            .try_fold(Money::zero(), |acc, item| acc.checked_add(item.line_total()?))
            .ok_or(OrderError::AmountOverflow)?;
        self.raise(OrderEvent::OrderCreated(OrderCreatedData {
            order_id,
            customer_id,
            items,
            total_amount,
            created_at: Utc::now(),
        }));
        Ok(())
    }

    /// Records the captured payment.
    pub fn pay(&mut self, payment_id: String, amount: Money) -> Result<(), OrderError> {
        let (order_id, customer_id) = self.identity("pay")?;
        if !self.state.can_pay() {
            return Err(self.invalid_transition("pay"));
        }
        if amount != self.total_amount {
            return Err(OrderError::PaymentMismatch {
                paid: amount,
                total: self.total_amount,
            });
        }

        self.raise(OrderEvent::OrderPaid(OrderPaidData {
            order_id,
            customer_id,
            amount,
            payment_id,
            paid_at: Utc::now(),
        }));
        Ok(())
    }

    pub fn ship(&mut self, tracking_number: Option<String>) -> Result<(), OrderError> {
        let (order_id, _) = self.identity("ship")?;
        if !self.state.can_ship() {
            return Err(self.invalid_transition("ship"));
        }

        self.raise(OrderEvent::OrderShipped(OrderShippedData {
            order_id,
            tracking_number,
            shipped_at: Utc::now(),
        }));
        Ok(())
    }

    pub fn cancel(
        &mut self,
        reason: String,
        cancelled_by: Option<String>,
    ) -> Result<(), OrderError> {
        let (order_id, _) = self.identity("cancel")?;
        if !self.state.can_cancel() {
            return Err(self.invalid_transition("cancel"));
        }

        self.raise(OrderEvent::OrderCancelled(OrderCancelledData {
            order_id,
            reason,
            cancelled_by,
            cancelled_at: Utc::now(),
        }));
        Ok(())
    }

    /// Notes that the payment confirmation for `paid_event_id` was sent.
    ///
    /// Raises nothing if a confirmation was already recorded.
    pub fn record_confirmation(&mut self, paid_event_id: EventId) -> Result<(), OrderError> {
        let (order_id, customer_id) = self.identity("confirm")?;
        if self.paid_at.is_none() {
            return Err(OrderError::NotPaid);
        }
        if self.confirmation_for.is_some() {
            return Ok(());
        }

        self.raise(OrderEvent::OrderConfirmationSent(ConfirmationSentData {
            order_id,
            customer_id,
            paid_event_id,
            sent_at: Utc::now(),
        }));
        Ok(())
    }

    fn identity(&self, action: &'static str) -> Result<(AggregateId, CustomerId), OrderError> {
        match (self.id, self.customer_id) {
            (Some(id), Some(customer_id)) => Ok((id, customer_id)),
            _ => Err(self.invalid_transition(action)),
        }
    }

    fn invalid_transition(&self, action: &'static str) -> OrderError {
        OrderError::InvalidStateTransition {
            current_state: self.state,
            action,
        }
    }
}
