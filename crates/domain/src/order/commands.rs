//! Order commands.

use common::AggregateId;
use outbox::EventId;

use crate::command::Command;

use super::{CustomerId, Money, Order, OrderItem};

/// Command to place a new order.
#[derive(Debug, Clone)]
pub struct CreateOrder {
    pub order_id: AggregateId,
    pub customer_id: CustomerId,
    pub items: Vec<OrderItem>,
}

impl CreateOrder {
    pub fn new(order_id: AggregateId, customer_id: CustomerId, items: Vec<OrderItem>) -> Self {
        Self {
            order_id,
            customer_id,
            items,
        }
    }

    /// Creates a CreateOrder command with a generated order ID.
    pub fn for_customer(customer_id: CustomerId, items: Vec<OrderItem>) -> Self {
        Self::new(AggregateId::new(), customer_id, items)
    }
}

impl Command for CreateOrder {
    type Aggregate = Order;

    fn aggregate_id(&self) -> AggregateId {
        self.order_id
    }
}

/// Command to record a captured payment.
#[derive(Debug, Clone)]
pub struct PayOrder {
    pub order_id: AggregateId,

    /// Payment provider reference.
    pub payment_id: String,

    pub amount: Money,
}

impl PayOrder {
    pub fn new(order_id: AggregateId, payment_id: impl Into<String>, amount: Money) -> Self {
        Self {
            order_id,
            payment_id: payment_id.into(),
            amount,
        }
    }
}

impl Command for PayOrder {
    type Aggregate = Order;

    fn aggregate_id(&self) -> AggregateId {
        self.order_id
    }
}

#[derive(Debug, Clone)]
pub struct ShipOrder {
    pub order_id: AggregateId,
    pub tracking_number: Option<String>,
}

impl ShipOrder {
    pub fn new(order_id: AggregateId, tracking_number: Option<String>) -> Self {
        Self {
            order_id,
            tracking_number,
        }
    }
}

impl Command for ShipOrder {
    type Aggregate = Order;

    fn aggregate_id(&self) -> AggregateId {
        self.order_id
    }
}

#[derive(Debug, Clone)]
pub struct CancelOrder {
    pub order_id: AggregateId,
    pub reason: String,
    pub cancelled_by: Option<String>,
}

impl CancelOrder {
    pub fn new(
        order_id: AggregateId,
        reason: impl Into<String>,
        cancelled_by: Option<String>,
    ) -> Self {
        Self {
            order_id,
            reason: reason.into(),
            cancelled_by,
        }
    }
}

impl Command for CancelOrder {
    type Aggregate = Order;

    fn aggregate_id(&self) -> AggregateId {
        self.order_id
    }
}

/// Records that the confirmation for a payment event reached the customer.
#[derive(Debug, Clone)]
pub struct RecordConfirmation {
    pub order_id: AggregateId,

    /// The OrderPaid event the confirmation answers.
    pub paid_event_id: EventId,
}

impl RecordConfirmation {
    pub fn new(order_id: AggregateId, paid_event_id: EventId) -> Self {
        Self {
            order_id,
            paid_event_id,
        }
    }
}

impl Command for RecordConfirmation {
    type Aggregate = Order;

    fn aggregate_id(&self) -> AggregateId {
        self.order_id
    }
}
