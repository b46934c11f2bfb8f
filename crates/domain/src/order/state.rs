//! Order state machine.

use serde::{Deserialize, Serialize};

/// The state of an order in its lifecycle.
///
/// ```text
/// Created ──► Paid ──► Shipped
///    │          │
///    └──────────┴──► Cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum OrderState {
    /// Order placed, awaiting payment.
    #[default]
    Created,

    /// Payment captured, awaiting shipment.
    Paid,

    /// Handed to the carrier (terminal state).
    Shipped,

    /// Order was cancelled (terminal state).
    Cancelled,
}

impl OrderState {
    pub fn can_pay(&self) -> bool {
        matches!(self, OrderState::Created)
    }

    pub fn can_ship(&self) -> bool {
        matches!(self, OrderState::Paid)
    }

    pub fn can_cancel(&self) -> bool {
        matches!(self, OrderState::Created | OrderState::Paid)
    }

    /// Returns true if no further transitions are possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderState::Shipped | OrderState::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderState::Created => "Created",
            OrderState::Paid => "Paid",
            OrderState::Shipped => "Shipped",
            OrderState::Cancelled => "Cancelled",
        }
    }
}

impl std::fmt::Display for OrderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
