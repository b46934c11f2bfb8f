//! The relay loop.

use std::sync::Arc;
use std::time::Instant;

use broker::{Broker, BrokerError, HEADER_EVENT_ID, HEADER_EVENT_TYPE, Message, topic_for};
use outbox::{FailureOutcome, OutboxRecord, OutboxStore, StoreError};
use tokio_util::sync::CancellationToken;

use crate::config::RelayConfig;
use crate::error::{RelayError, Result};

/// Builds the broker message for a record: topic from the aggregate type,
/// key from the aggregate id, the encoded envelope as payload.
pub fn to_message(record: &OutboxRecord) -> std::result::Result<Message, serde_json::Error> {
    let event = &record.event;
    Ok(Message::new(
        topic_for(&event.aggregate_type),
        event.aggregate_id.to_string(),
        event.to_bytes()?,
    )
    .with_header(HEADER_EVENT_ID, event.event_id.to_string())
    .with_header(HEADER_EVENT_TYPE, event.event_type.clone()))
}

/// What one call to [`Relay::run_once`] did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub claimed: usize,
    pub sent: usize,
    pub retrying: usize,
    pub exhausted: usize,
    /// Claims handed back unattempted (shutdown or batch timeout).
    pub released: usize,
    /// Records whose outcome could not be recorded; their claims expire.
    pub abandoned: usize,
}

impl BatchReport {
    fn count(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Sent => self.sent += 1,
            Outcome::Retrying => self.retrying += 1,
            Outcome::Exhausted => self.exhausted += 1,
            Outcome::Abandoned => self.abandoned += 1,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Outcome {
    Sent,
    Retrying,
    Exhausted,
    Abandoned,
}

/// Moves committed outbox records onto the broker.
pub struct Relay<S: OutboxStore> {
    store: S,
    broker: Arc<dyn Broker>,
    config: RelayConfig,
}

impl<S: OutboxStore> Relay<S> {
    pub fn new(store: S, broker: Arc<dyn Broker>, config: RelayConfig) -> Self {
        Self {
            store,
            broker,
            config,
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Runs batches until `cancel` fires. Sleeps for the poll interval after
    /// a batch that was not full.
    #[tracing::instrument(skip(self, cancel), fields(relay_id = %self.config.relay_id))]
    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!("relay started");

        while !cancel.is_cancelled() {
            let idle = match self.run_once(&cancel).await {
                Ok(report) => report.claimed < self.config.batch_size,
                Err(e) => {
                    tracing::warn!(error = %e, "relay batch failed");
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
            }
        }

        tracing::info!("relay stopped");
    }

    /// Claims one batch and publishes it record by record.
    ///
    /// When `cancel` fires mid-batch the current record finishes and the
    /// rest are released. When the batch timeout passes, the record being
    /// published counts as a transient failure and the rest are released.
    pub async fn run_once(&self, cancel: &CancellationToken) -> Result<BatchReport> {
        let records = self
            .store
            .fetch_pending(
                self.config.batch_size,
                self.config.visibility_timeout,
                &self.config.relay_id,
            )
            .await?;

        let mut report = BatchReport {
            claimed: records.len(),
            ..BatchReport::default()
        };
        if records.is_empty() {
            return Ok(report);
        }
        metrics::histogram!("relay_batch_size").record(records.len() as f64);

        let deadline = tokio::time::Instant::now() + self.config.batch_timeout;
        let mut remaining = records.into_iter();

        while let Some(record) = remaining.next() {
            if cancel.is_cancelled() {
                report.released += self
                    .release_all(std::iter::once(record).chain(remaining.by_ref()))
                    .await;
                break;
            }

            match tokio::time::timeout_at(deadline, self.deliver(&record)).await {
                Ok(outcome) => report.count(outcome),
                Err(_) => {
                    let error = RelayError::from_broker(record.id, BrokerError::Timeout);
                    let outcome = self.fail(&record, &error, to_message(&record).ok()).await;
                    report.count(outcome);
                    report.released += self.release_all(remaining.by_ref()).await;
                    break;
                }
            }
        }

        tracing::debug!(?report, "batch finished");
        Ok(report)
    }

    async fn deliver(&self, record: &OutboxRecord) -> Outcome {
        let message = match to_message(record) {
            Ok(message) => message,
            Err(e) => {
                let error = RelayError::PermanentPublishFailure {
                    record_id: record.id,
                    reason: format!("cannot encode envelope: {e}"),
                };
                return self.fail(record, &error, None).await;
            }
        };

        let started = Instant::now();
        match self.broker.publish(message.clone()).await {
            Ok(()) => {
                metrics::histogram!("relay_publish_seconds")
                    .record(started.elapsed().as_secs_f64());
                self.confirm(record).await
            }
            Err(e) => {
                let error = RelayError::from_broker(record.id, e);
                self.fail(record, &error, Some(message)).await
            }
        }
    }

    async fn confirm(&self, record: &OutboxRecord) -> Outcome {
        match self.store.mark_sent(record.id).await {
            Ok(()) => {
                metrics::counter!("relay_records_sent").increment(1);
                tracing::debug!(
                    record_id = %record.id,
                    event_id = %record.event.event_id,
                    aggregate_id = %record.event.aggregate_id,
                    sequence = %record.event.sequence,
                    "record published"
                );
                Outcome::Sent
            }
            Err(e) => {
                // The broker has the message; the record will go out again.
                tracing::warn!(
                    record_id = %record.id,
                    event_id = %record.event.event_id,
                    error = %e,
                    "published but could not mark sent"
                );
                Outcome::Abandoned
            }
        }
    }

    async fn fail(
        &self,
        record: &OutboxRecord,
        error: &RelayError,
        message: Option<Message>,
    ) -> Outcome {
        metrics::counter!("relay_publish_failures", "kind" => error.kind()).increment(1);
        let reason = error.to_string();

        match self
            .store
            .mark_failed(record.id, &self.config.relay_id, &reason)
            .await
        {
            Ok(FailureOutcome::Retrying {
                attempts,
                next_eligible_at,
            }) => {
                tracing::warn!(
                    record_id = %record.id,
                    event_id = %record.event.event_id,
                    attempts,
                    %next_eligible_at,
                    error = %reason,
                    "publish failed, retry scheduled"
                );
                Outcome::Retrying
            }
            Ok(FailureOutcome::Exhausted { attempts }) => {
                metrics::counter!("relay_records_exhausted").increment(1);
                tracing::error!(
                    record_id = %record.id,
                    event_id = %record.event.event_id,
                    aggregate_id = %record.event.aggregate_id,
                    attempts,
                    error = %reason,
                    "record exhausted its publish attempts and needs an operator requeue"
                );
                if let Some(message) = message {
                    if let Err(e) = self.broker.dead_letter(message, &reason).await {
                        tracing::warn!(record_id = %record.id, error = %e, "dead-letter failed");
                    }
                }
                Outcome::Exhausted
            }
            Err(StoreError::ClaimExpired { .. }) => {
                tracing::debug!(record_id = %record.id, "claim expired before the failure was recorded");
                Outcome::Abandoned
            }
            Err(e) => {
                tracing::warn!(record_id = %record.id, error = %e, "could not record publish failure");
                Outcome::Abandoned
            }
        }
    }

    async fn release_all(&self, records: impl IntoIterator<Item = OutboxRecord>) -> usize {
        let mut released = 0;
        for record in records {
            match self.store.release(record.id, &self.config.relay_id).await {
                Ok(()) => released += 1,
                Err(e) => {
                    tracing::debug!(record_id = %record.id, error = %e, "could not release claim")
                }
            }
        }
        if released > 0 {
            metrics::counter!("relay_claims_released").increment(released as u64);
        }
        released
    }
}
