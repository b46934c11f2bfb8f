//! Shared identifier types used across the outbox workspace.

mod types;

pub use types::{AggregateId, ParseIdError};
