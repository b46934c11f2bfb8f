//! Domain layer of the order service.
//!
//! Aggregates mutate their state and buffer the events they raise. The
//! [`CommandHandler`] persists the new state row and the buffered events as
//! outbox records in one unit of work, so neither survives without the other.

pub mod aggregate;
pub mod command;
pub mod error;
pub mod order;

pub use aggregate::{Aggregate, DomainEvent, EventBuffer, RaisedEvent};
pub use command::{Command, CommandHandler, CommandResult};
pub use error::DomainError;
pub use order::{
    CancelOrder, CreateOrder, CustomerId, Money, Order, OrderError, OrderEvent, OrderItem,
    OrderService, OrderState, PayOrder, ProductId, RecordConfirmation, ShipOrder,
};
