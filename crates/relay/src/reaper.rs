//! Retention housekeeping for delivered records and ledger entries.

use chrono::Utc;
use outbox::{Maintenance, chrono_duration};
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::ReaperConfig;
use crate::error::Result;

/// Rows deleted by one reaper pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub sent_purged: u64,
    pub ledger_purged: u64,
}

/// Periodically deletes Sent records and ledger entries past their
/// retention. Pending, Failed and Exhausted records are never touched.
pub struct Reaper<S: Maintenance> {
    store: S,
    config: ReaperConfig,
}

impl<S: Maintenance> Reaper<S> {
    pub fn new(store: S, config: ReaperConfig) -> Self {
        Self { store, config }
    }

    #[tracing::instrument(skip(self, cancel))]
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once().await {
                        tracing::warn!(error = %e, "reaper pass failed");
                    }
                }
            }
        }
    }

    pub async fn run_once(&self) -> Result<PurgeReport> {
        let now = Utc::now();
        let sent_purged = self
            .store
            .purge_sent(now - chrono_duration(self.config.outbox_retention))
            .await?;
        let ledger_purged = self
            .store
            .purge_ledger(now - chrono_duration(self.config.ledger_retention))
            .await?;

        metrics::counter!("reaper_sent_purged").increment(sent_purged);
        metrics::counter!("reaper_ledger_purged").increment(ledger_purged);
        if sent_purged > 0 || ledger_purged > 0 {
            tracing::info!(sent_purged, ledger_purged, "purged expired rows");
        }

        Ok(PurgeReport {
            sent_purged,
            ledger_purged,
        })
    }
}
