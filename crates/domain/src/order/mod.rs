//! Order aggregate and related types.

mod aggregate;
mod commands;
mod events;
mod service;
mod state;
mod value_objects;

pub use aggregate::Order;
pub use commands::*;
pub use events::{
    ConfirmationSentData, OrderCancelledData, OrderCreatedData, OrderEvent, OrderPaidData,
    OrderShippedData,
};
pub use service::OrderService;
pub use state::OrderState;
pub use value_objects::{CustomerId, Money, OrderItem, ProductId};

use thiserror::Error;

/// Errors raised by order business rules.
#[derive(Debug, Error)]
pub enum OrderError {
    #[error("Order already created")]
    AlreadyCreated,

    #[error("Invalid state transition: cannot {action} from {current_state} state")]
    InvalidStateTransition {
        current_state: OrderState,
        action: &'static str,
    },

    #[error("Order has no items")]
    NoItems,

    #[error("Invalid quantity: {quantity} (must be greater than 0)")]
    InvalidQuantity { quantity: u32 },

    #[error("Invalid price: {price} (must be greater than 0)")]
    InvalidPrice { price: i64 },

    #[error("Order total exceeds the representable amount")]
    AmountOverflow,

    /// The payment does not cover the order total.
    #[error("Payment of {paid} does not match order total {total}")]
    PaymentMismatch { paid: Money, total: Money },

    #[error("Order has not been paid")]
    NotPaid,
}
