//! The dispatcher loop.

use std::sync::Arc;

use broker::{Broker, Delivery, HEADER_CONSUMER, HEADER_EVENT_ID, Subscription};
use outbox::{EventEnvelope, IdempotencyLedger, Store, StoreError, UnitOfWork};
use tokio_util::sync::CancellationToken;

use crate::config::DispatcherConfig;
use crate::error::{DispatchError, HandlerError};
use crate::handler::EventHandler;

/// A consumer that can never apply the event of a delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerFailure {
    pub consumer: &'static str,
    pub reason: String,
}

/// How a delivery was settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// At least one handler applied the event and none failed. Acked.
    Applied,
    /// Every handler had already applied the event. Acked.
    Duplicate,
    /// No handler is registered for the event type. Acked.
    Skipped,
    /// A handler failed transiently; nacked for redelivery. Handlers that
    /// applied the event keep their effects and are skipped next time.
    Retry { reason: String },
    /// The event can never be applied here; parked on the dead-letter topic.
    DeadLettered { reason: String },
    /// Some handlers applied the event, the listed ones never can. Acked,
    /// with one copy per failed consumer parked on the dead-letter topic.
    PartiallyApplied { failed: Vec<ConsumerFailure> },
}

impl DispatchOutcome {
    fn label(&self) -> &'static str {
        match self {
            DispatchOutcome::Applied => "applied",
            DispatchOutcome::Duplicate => "duplicate",
            DispatchOutcome::Skipped => "skipped",
            DispatchOutcome::Retry { .. } => "retry",
            DispatchOutcome::DeadLettered { .. } => "dead_lettered",
            DispatchOutcome::PartiallyApplied { .. } => "partially_applied",
        }
    }
}

enum Failure {
    /// A concurrent delivery of the same event committed first.
    Duplicate,
    Handler(HandlerError),
}

impl From<StoreError> for Failure {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::AlreadyApplied { .. } => Failure::Duplicate,
            other => Failure::Handler(other.into()),
        }
    }
}

/// What one consumer did with the event.
enum Applied {
    Now,
    Before,
}

type SharedHandler<U> = Arc<dyn EventHandler<U>>;

/// Applies broker deliveries to registered handlers.
///
/// Each handler runs in its own unit of work together with its ledger entry,
/// so one consumer's failure never rolls back another's effects.
pub struct Dispatcher<S: Store> {
    store: S,
    broker: Arc<dyn Broker>,
    handlers: Vec<SharedHandler<S::UnitOfWork>>,
    config: DispatcherConfig,
}

impl<S: Store> Dispatcher<S> {
    /// `broker` receives the dead-letter copies of consumers that fail while
    /// their peers succeed.
    pub fn new(store: S, broker: Arc<dyn Broker>, config: DispatcherConfig) -> Self {
        Self {
            store,
            broker,
            handlers: Vec::new(),
            config,
        }
    }

    pub fn register(&mut self, handler: SharedHandler<S::UnitOfWork>) {
        self.handlers.push(handler);
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Consumes `subscription` until `cancel` fires or the broker closes.
    /// A delivery being processed when `cancel` fires is finished and settled.
    #[tracing::instrument(skip(self, subscription, cancel), fields(group = %self.config.group))]
    pub async fn run(&self, mut subscription: Box<dyn Subscription>, cancel: CancellationToken) {
        tracing::info!(handlers = self.handlers.len(), "dispatcher started");

        loop {
            let delivery = tokio::select! {
                _ = cancel.cancelled() => break,
                next = subscription.next() => match next {
                    Some(delivery) => delivery,
                    None => break,
                },
            };

            if let Err(e) = self.dispatch(subscription.as_mut(), delivery).await {
                tracing::warn!(error = %e, "could not settle delivery");
            }
        }

        tracing::info!("dispatcher stopped");
    }

    /// Processes one delivery and settles it on `subscription`.
    pub async fn dispatch(
        &self,
        subscription: &mut dyn Subscription,
        delivery: Delivery,
    ) -> Result<DispatchOutcome, DispatchError> {
        let outcome = self.process(&delivery).await;
        self.settle(subscription, &delivery, &outcome).await?;
        Ok(outcome)
    }

    /// Decides the outcome of a delivery and commits the handlers' effects.
    /// Does not settle the delivery.
    #[tracing::instrument(
        skip(self, delivery),
        fields(
            tag = %delivery.tag,
            attempt = delivery.attempt,
            event_id = delivery.message.header(HEADER_EVENT_ID).unwrap_or("-"),
        )
    )]
    pub async fn process(&self, delivery: &Delivery) -> DispatchOutcome {
        let event = match EventEnvelope::from_bytes(&delivery.message.payload) {
            Ok(event) => event,
            Err(e) => {
                return DispatchOutcome::DeadLettered {
                    reason: format!("undecodable envelope: {e}"),
                };
            }
        };

        let handlers: Vec<_> = self
            .handlers
            .iter()
            .filter(|h| h.event_types().iter().any(|t| *t == event.event_type))
            .collect();
        if handlers.is_empty() {
            tracing::debug!(event_type = %event.event_type, "no handler registered");
            return DispatchOutcome::Skipped;
        }

        let mut applied = 0;
        let mut settled = 0;
        let mut retry = None;
        let mut failed = Vec::new();
        for handler in handlers {
            let consumer = handler.name();
            match self.apply(handler.as_ref(), &event).await {
                Ok(Applied::Now) => {
                    applied += 1;
                    settled += 1;
                }
                Ok(Applied::Before) | Err(Failure::Duplicate) => {
                    tracing::debug!(consumer, "already applied");
                    settled += 1;
                }
                Err(Failure::Handler(e))
                    if e.is_transient() && delivery.attempt < self.config.max_deliveries =>
                {
                    tracing::debug!(consumer, error = %e, "handler failed transiently");
                    if retry.is_none() {
                        retry = Some(format!("{consumer}: {e}"));
                    }
                }
                Err(Failure::Handler(e)) => {
                    let reason = if e.is_transient() {
                        format!("gave up after {} deliveries: {e}", delivery.attempt)
                    } else {
                        e.to_string()
                    };
                    failed.push(ConsumerFailure { consumer, reason });
                }
            }
        }

        if let Some(reason) = retry {
            return DispatchOutcome::Retry { reason };
        }
        if !failed.is_empty() {
            if settled == 0 {
                let reason = failed
                    .iter()
                    .map(|f| format!("{}: {}", f.consumer, f.reason))
                    .collect::<Vec<_>>()
                    .join("; ");
                return DispatchOutcome::DeadLettered { reason };
            }
            return DispatchOutcome::PartiallyApplied { failed };
        }
        if applied == 0 {
            metrics::counter!("dispatcher_duplicates").increment(1);
            tracing::debug!("duplicate delivery detected");
            return DispatchOutcome::Duplicate;
        }
        DispatchOutcome::Applied
    }

    /// Runs one handler and records its ledger entry in a unit of work of
    /// its own. Nothing is committed unless the handler applied the event.
    async fn apply(
        &self,
        handler: &dyn EventHandler<S::UnitOfWork>,
        event: &EventEnvelope,
    ) -> Result<Applied, Failure> {
        let consumer = handler.name();
        let mut uow = self.store.begin().await?;

        if uow.has_applied(consumer, event.event_id).await? {
            uow.rollback().await?;
            return Ok(Applied::Before);
        }

        let handled = handler.handle(&mut uow, event).await;
        let handled = match handled {
            Ok(()) => uow
                .record_applied(consumer, event.event_id)
                .await
                .map_err(Failure::from),
            Err(e) => Err(Failure::Handler(e)),
        };
        if let Err(failure) = handled {
            if let Err(e) = uow.rollback().await {
                tracing::warn!(consumer, error = %e, "rollback failed");
            }
            return Err(failure);
        }

        uow.commit().await?;
        Ok(Applied::Now)
    }

    async fn settle(
        &self,
        subscription: &mut dyn Subscription,
        delivery: &Delivery,
        outcome: &DispatchOutcome,
    ) -> Result<(), DispatchError> {
        metrics::counter!("dispatcher_deliveries", "outcome" => outcome.label()).increment(1);
        let event_id = delivery.message.header(HEADER_EVENT_ID).unwrap_or("-");

        match outcome {
            DispatchOutcome::Applied | DispatchOutcome::Duplicate | DispatchOutcome::Skipped => {
                subscription.ack(delivery.tag).await?;
            }
            DispatchOutcome::Retry { reason } => {
                tracing::warn!(
                    event_id,
                    attempt = delivery.attempt,
                    error = %reason,
                    "handler failed, delivery will be retried"
                );
                subscription.nack(delivery.tag).await?;
            }
            DispatchOutcome::DeadLettered { reason } => {
                tracing::error!(event_id, error = %reason, "delivery dead-lettered");
                subscription.reject(delivery.tag, reason).await?;
            }
            DispatchOutcome::PartiallyApplied { failed } => {
                // An unparked copy leaves the delivery unsettled for redelivery.
                for failure in failed {
                    tracing::error!(
                        event_id,
                        consumer = failure.consumer,
                        error = %failure.reason,
                        "consumer dead-lettered"
                    );
                    let copy = delivery
                        .message
                        .clone()
                        .with_header(HEADER_CONSUMER, failure.consumer);
                    self.broker.dead_letter(copy, &failure.reason).await?;
                }
                subscription.ack(delivery.tag).await?;
            }
        }
        Ok(())
    }
}
