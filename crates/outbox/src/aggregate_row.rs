use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::AggregateId;

/// Optimistic-concurrency version of an aggregate's state row.
///
/// 0 means "never saved"; every successful save increments it by one.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Version(i64);

impl Version {
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    /// Version of an aggregate that has not been persisted yet.
    pub fn initial() -> Self {
        Self(0)
    }

    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The persisted state of one aggregate, stored next to the outbox table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateRow {
    pub aggregate_id: AggregateId,
    pub aggregate_type: String,
    /// Version this row is written at.
    pub version: Version,
    pub state: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

impl AggregateRow {
    pub fn from_state<T: Serialize>(
        aggregate_id: AggregateId,
        aggregate_type: impl Into<String>,
        version: Version,
        state: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            aggregate_id,
            aggregate_type: aggregate_type.into(),
            version,
            state: serde_json::to_value(state)?,
            updated_at: Utc::now(),
        })
    }

    pub fn into_state<T: DeserializeOwned>(self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Counter {
        value: i32,
    }

    #[test]
    fn versions_are_ordered_from_initial() {
        assert_eq!(Version::initial().next(), Version::new(1));
        assert!(Version::new(1) < Version::new(2));
    }

    #[test]
    fn state_round_trip() {
        let row = AggregateRow::from_state(
            AggregateId::new(),
            "Counter",
            Version::new(3),
            &Counter { value: 7 },
        )
        .unwrap();
        assert_eq!(row.version, Version::new(3));
        let state: Counter = row.into_state().unwrap();
        assert_eq!(state, Counter { value: 7 });
    }
}
