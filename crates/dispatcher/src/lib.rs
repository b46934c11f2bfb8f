//! Consumer runtime.
//!
//! The [`Dispatcher`] takes deliveries from a broker subscription, decodes
//! the event envelope and runs every registered [`EventHandler`] for its
//! event type, each inside a unit of work of its own. A handler's idempotency
//! ledger entry commits with its effects, so a redelivered event is detected
//! per consumer and never applied twice by the same handler.

mod config;
mod confirmation;
mod dispatcher;
mod error;
mod handler;

pub use config::DispatcherConfig;
pub use confirmation::SendConfirmationHandler;
pub use dispatcher::{ConsumerFailure, DispatchOutcome, Dispatcher};
pub use error::{DispatchError, HandlerError};
pub use handler::EventHandler;
