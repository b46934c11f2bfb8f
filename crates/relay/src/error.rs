//! Relay error types.

use broker::BrokerError;
use outbox::{RecordId, StoreError};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RelayError>;

#[derive(Debug, Error)]
pub enum RelayError {
    /// The broker may accept the record on a later attempt.
    #[error("Transient publish failure for record {record_id}: {source}")]
    TransientPublishFailure {
        record_id: RecordId,
        #[source]
        source: BrokerError,
    },

    /// The broker refused the record, or it could not be encoded.
    #[error("Permanent publish failure for record {record_id}: {reason}")]
    PermanentPublishFailure { record_id: RecordId, reason: String },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl RelayError {
    /// Classifies a broker failure for `record_id`.
    pub fn from_broker(record_id: RecordId, error: BrokerError) -> Self {
        if error.is_transient() {
            RelayError::TransientPublishFailure {
                record_id,
                source: error,
            }
        } else {
            RelayError::PermanentPublishFailure {
                record_id,
                reason: error.to_string(),
            }
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, RelayError::TransientPublishFailure { .. })
    }

    /// Label used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            RelayError::TransientPublishFailure { .. } => "transient",
            RelayError::PermanentPublishFailure { .. } => "permanent",
            RelayError::Store(_) => "store",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broker_failures_are_classified() {
        let id = RecordId::new(7);
        assert!(RelayError::from_broker(id, BrokerError::Timeout).is_transient());
        assert!(
            RelayError::from_broker(id, BrokerError::Unavailable("down".into())).is_transient()
        );

        let permanent = RelayError::from_broker(id, BrokerError::Rejected("too big".into()));
        assert!(!permanent.is_transient());
        assert_eq!(permanent.kind(), "permanent");
        assert!(permanent.to_string().contains("too big"));
    }
}
