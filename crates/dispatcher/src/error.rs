//! Dispatcher error types.

use broker::BrokerError;
use domain::DomainError;
use outbox::StoreError;
use thiserror::Error;

/// Why a handler could not apply an event.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The event can never be applied; it is dead-lettered.
    #[error("Business failure: {0}")]
    Business(String),

    /// Applying may succeed on redelivery.
    #[error("Transient failure: {0}")]
    Transient(String),
}

impl HandlerError {
    pub fn is_transient(&self) -> bool {
        matches!(self, HandlerError::Transient(_))
    }
}

impl From<StoreError> for HandlerError {
    fn from(e: StoreError) -> Self {
        if e.is_transient() {
            HandlerError::Transient(e.to_string())
        } else {
            HandlerError::Business(e.to_string())
        }
    }
}

impl From<DomainError> for HandlerError {
    fn from(e: DomainError) -> Self {
        match e {
            DomainError::Store(store) => store.into(),
            other => HandlerError::Business(other.to_string()),
        }
    }
}

/// Failures of the dispatcher itself, outside any handler.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::OrderError;

    #[test]
    fn domain_failures_are_classified() {
        let outage: HandlerError =
            DomainError::Store(StoreError::Unavailable("pool exhausted".into())).into();
        assert!(outage.is_transient());

        let rule: HandlerError = DomainError::Order(OrderError::NotPaid).into();
        assert!(!rule.is_transient());
        assert!(rule.to_string().contains("not been paid"));
    }
}
