//! Order domain events.

use chrono::{DateTime, Utc};
use common::AggregateId;
use outbox::EventId;
use serde::{Deserialize, Serialize};

use crate::aggregate::DomainEvent;

use super::{CustomerId, Money, OrderItem};

/// Events raised by the order aggregate.
///
/// Serialized as `{"type": ..., "data": ...}`; the tag matches the envelope's
/// `event_type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum OrderEvent {
    OrderCreated(OrderCreatedData),
    OrderPaid(OrderPaidData),
    OrderShipped(OrderShippedData),
    OrderCancelled(OrderCancelledData),
    /// The payment confirmation went out to the customer.
    OrderConfirmationSent(ConfirmationSentData),
}

impl OrderEvent {
    pub const CREATED: &'static str = "OrderCreated";
    pub const PAID: &'static str = "OrderPaid";
    pub const SHIPPED: &'static str = "OrderShipped";
    pub const CANCELLED: &'static str = "OrderCancelled";
    pub const CONFIRMATION_SENT: &'static str = "OrderConfirmationSent";
}

impl DomainEvent for OrderEvent {
    fn event_type(&self) -> &'static str {
        match self {
            OrderEvent::OrderCreated(_) => Self::CREATED,
            OrderEvent::OrderPaid(_) => Self::PAID,
            OrderEvent::OrderShipped(_) => Self::SHIPPED,
            OrderEvent::OrderCancelled(_) => Self::CANCELLED,
            OrderEvent::OrderConfirmationSent(_) => Self::CONFIRMATION_SENT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderCreatedData {
    pub order_id: AggregateId,
    pub customer_id: CustomerId,
    pub items: Vec<OrderItem>,
    pub total_amount: Money,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderPaidData {
    pub order_id: AggregateId,
    pub customer_id: CustomerId,
    pub amount: Money,
    /// Reference from the payment provider.
    pub payment_id: String,
    pub paid_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderShippedData {
    pub order_id: AggregateId,
    pub tracking_number: Option<String>,
    pub shipped_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderCancelledData {
    pub order_id: AggregateId,
    pub reason: String,
    pub cancelled_by: Option<String>,
    pub cancelled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfirmationSentData {
    pub order_id: AggregateId,
    pub customer_id: CustomerId,
    /// The `OrderPaid` event the confirmation answers.
    pub paid_event_id: EventId,
    pub sent_at: DateTime<Utc>,
}
