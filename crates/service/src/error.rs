//! API error types with HTTP response mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use broker::BrokerError;
use chrono::Utc;
use domain::{DomainError, OrderError};
use outbox::StoreError;
use serde::Serialize;
use thiserror::Error;

/// API-level error type that maps to HTTP responses.
#[derive(Debug)]
pub enum ApiError {
    /// Resource not found.
    NotFound(String),
    /// Bad request from the client.
    BadRequest(String),
    /// Domain logic error.
    Domain(DomainError),
    /// Outbox operation error.
    Store(StoreError),
    /// Broker operation error.
    Broker(BrokerError),
    /// Internal server error.
    Internal(String),
}

/// Body of every error response.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
    pub status: u16,
    pub timestamp: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            ApiError::Domain(err) => domain_error_to_response(err),
            ApiError::Store(err) => store_error_to_response(err),
            ApiError::Broker(err) => {
                let message = err.to_string();
                if err.is_transient() {
                    tracing::warn!(error = %message, "broker unavailable");
                    (StatusCode::SERVICE_UNAVAILABLE, "unavailable", message)
                } else {
                    tracing::error!(error = %message, "broker failure");
                    (StatusCode::INTERNAL_SERVER_ERROR, "internal", message)
                }
            }
            ApiError::Internal(msg) => {
                tracing::error!(error = %msg, "internal server error");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal", msg)
            }
        };

        let body = ErrorBody {
            code,
            message,
            status: status.as_u16(),
            timestamp: Utc::now().to_rfc3339(),
        };
        (status, axum::Json(body)).into_response()
    }
}

fn domain_error_to_response(err: DomainError) -> (StatusCode, &'static str, String) {
    let message = err.to_string();
    match err {
        DomainError::Order(order_err) => match order_err {
            OrderError::InvalidStateTransition { .. }
            | OrderError::NotPaid
            | OrderError::AlreadyCreated => (StatusCode::CONFLICT, "invalid_state", message),
            OrderError::PaymentMismatch { .. } => {
                (StatusCode::BAD_REQUEST, "payment_mismatch", message)
            }
            OrderError::NoItems
            | OrderError::InvalidQuantity { .. }
            | OrderError::InvalidPrice { .. }
            | OrderError::AmountOverflow => (StatusCode::BAD_REQUEST, "validation", message),
        },
        DomainError::AggregateNotFound { .. } => (StatusCode::NOT_FOUND, "not_found", message),
        DomainError::AggregateExists { .. } => (StatusCode::CONFLICT, "already_exists", message),
        DomainError::Store(store_err) => store_error_to_response(store_err),
        DomainError::Serialization(_) => {
            tracing::error!(error = %message, "domain serialization failure");
            (StatusCode::INTERNAL_SERVER_ERROR, "internal", message)
        }
    }
}

fn store_error_to_response(err: StoreError) -> (StatusCode, &'static str, String) {
    let message = err.to_string();
    match err {
        StoreError::ConcurrencyConflict { .. } => (StatusCode::CONFLICT, "conflict", message),
        StoreError::NotExhausted(_) => (StatusCode::CONFLICT, "not_exhausted", message),
        StoreError::RecordNotFound(_) => (StatusCode::NOT_FOUND, "not_found", message),
        StoreError::Unavailable(_) | StoreError::Database(_) => {
            tracing::warn!(error = %message, "store unavailable");
            (StatusCode::SERVICE_UNAVAILABLE, "unavailable", message)
        }
        _ => {
            tracing::error!(error = %message, "store failure");
            (StatusCode::INTERNAL_SERVER_ERROR, "internal", message)
        }
    }
}

impl From<DomainError> for ApiError {
    fn from(err: DomainError) -> Self {
        ApiError::Domain(err)
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        ApiError::Store(err)
    }
}

impl From<BrokerError> for ApiError {
    fn from(err: BrokerError) -> Self {
        ApiError::Broker(err)
    }
}

/// Failures that stop the binary before it starts serving.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("Failed to connect to database: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Failed to install Prometheus recorder: {0}")]
    Metrics(#[from] metrics_exporter_prometheus::BuildError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::{Money, OrderState};
    use outbox::RecordId;

    fn status_of(err: ApiError) -> StatusCode {
        err.into_response().status()
    }

    #[test]
    fn business_rule_violations_are_conflicts_or_bad_requests() {
        let transition = DomainError::Order(OrderError::InvalidStateTransition {
            current_state: OrderState::Shipped,
            action: "cancel",
        });
        assert_eq!(status_of(transition.into()), StatusCode::CONFLICT);

        let mismatch = DomainError::Order(OrderError::PaymentMismatch {
            paid: Money::from_cents(1),
            total: Money::from_cents(2),
        });
        assert_eq!(status_of(mismatch.into()), StatusCode::BAD_REQUEST);
        assert_eq!(
            status_of(DomainError::Order(OrderError::NoItems).into()),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(DomainError::Order(OrderError::AmountOverflow).into()),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn store_errors_map_by_kind() {
        assert_eq!(
            status_of(StoreError::RecordNotFound(RecordId::new(7)).into()),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_of(StoreError::NotExhausted(RecordId::new(7)).into()),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(StoreError::Unavailable("down".into()).into()),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_of(DomainError::Store(StoreError::Unavailable("down".into())).into()),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn broker_errors_map_by_transience() {
        assert_eq!(
            status_of(BrokerError::Unavailable("down".into()).into()),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_of(BrokerError::Rejected("corrupt".into()).into()),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
