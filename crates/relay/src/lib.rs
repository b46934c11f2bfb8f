//! Outbox relay.
//!
//! A [`Relay`] claims committed outbox records, publishes each one to the
//! broker and marks it sent once the broker acknowledged it. Failed publishes
//! go back to the store with a backoff; records that run out of attempts are
//! dead-lettered. The [`Reaper`] purges delivered records and old ledger
//! entries.
//!
//! Several relays may run against the same store. They coordinate only through
//! the store's claims, so a relay that dies mid-batch loses nothing: its
//! claims expire and another relay picks the records up. A relay that dies
//! after the broker ack but before `mark_sent` causes a duplicate publish,
//! which consumers absorb through their idempotency ledger.

mod config;
mod error;
mod reaper;
mod relay;

pub use config::{ReaperConfig, RelayConfig};
pub use error::{RelayError, Result};
pub use reaper::{PurgeReport, Reaper};
pub use relay::{BatchReport, Relay, to_message};
