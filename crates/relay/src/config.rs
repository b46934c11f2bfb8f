//! Relay and reaper configuration loaded from environment variables.

use std::time::Duration;

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

/// Relay loop settings.
///
/// Reads from environment variables:
/// - `RELAY_ID` — claimant name (default: `"relay-<host>-<pid>"`)
/// - `RELAY_BATCH_SIZE` — records claimed per batch (default: `100`)
/// - `RELAY_POLL_INTERVAL_MS` — idle wait between empty batches (default: `500`)
/// - `RELAY_VISIBILITY_TIMEOUT_MS` — claim lifetime (default: `30000`)
/// - `RELAY_BATCH_TIMEOUT_MS` — publish budget per batch (default: `10000`)
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub relay_id: String,
    pub batch_size: usize,
    pub poll_interval: Duration,
    /// Must exceed `batch_timeout`, or claims can lapse while the batch is
    /// still publishing.
    pub visibility_timeout: Duration,
    pub batch_timeout: Duration,
}

impl RelayConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            relay_id: std::env::var("RELAY_ID").unwrap_or(defaults.relay_id),
            batch_size: env_parse("RELAY_BATCH_SIZE").unwrap_or(defaults.batch_size),
            poll_interval: env_parse("RELAY_POLL_INTERVAL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_interval),
            visibility_timeout: env_parse("RELAY_VISIBILITY_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.visibility_timeout),
            batch_timeout: env_parse("RELAY_BATCH_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.batch_timeout),
        }
        .validated()
    }

    /// Raises `visibility_timeout` to twice `batch_timeout` when it does not
    /// exceed it.
    pub fn validated(mut self) -> Self {
        if self.visibility_timeout <= self.batch_timeout {
            let raised = self.batch_timeout.saturating_mul(2);
            tracing::warn!(
                visibility_timeout_ms = self.visibility_timeout.as_millis() as u64,
                batch_timeout_ms = self.batch_timeout.as_millis() as u64,
                raised_to_ms = raised.as_millis() as u64,
                "visibility timeout must exceed batch timeout, raising it"
            );
            self.visibility_timeout = raised;
        }
        self
    }

    pub fn with_relay_id(mut self, relay_id: impl Into<String>) -> Self {
        self.relay_id = relay_id.into();
        self
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "local".to_string());
        Self {
            relay_id: format!("relay-{host}-{}", std::process::id()),
            batch_size: 100,
            poll_interval: Duration::from_millis(500),
            visibility_timeout: Duration::from_secs(30),
            batch_timeout: Duration::from_secs(10),
        }
    }
}

/// Retention settings for the [`Reaper`](crate::Reaper).
///
/// Reads `OUTBOX_RETENTION_HOURS` (default `168`), `LEDGER_RETENTION_HOURS`
/// (default `336`) and `REAPER_INTERVAL_SECS` (default `3600`).
#[derive(Debug, Clone)]
pub struct ReaperConfig {
    /// Sent records older than this are deleted.
    pub outbox_retention: Duration,
    /// Must outlast the broker's redelivery window.
    pub ledger_retention: Duration,
    pub interval: Duration,
}

impl ReaperConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            outbox_retention: env_parse::<u64>("OUTBOX_RETENTION_HOURS")
                .map(hours)
                .unwrap_or(defaults.outbox_retention),
            ledger_retention: env_parse::<u64>("LEDGER_RETENTION_HOURS")
                .map(hours)
                .unwrap_or(defaults.ledger_retention),
            interval: env_parse("REAPER_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.interval),
        }
    }
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            outbox_retention: hours(168),
            ledger_retention: hours(336),
            interval: Duration::from_secs(3600),
        }
    }
}

fn hours(h: u64) -> Duration {
    Duration::from_secs(h * 3600)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relay_defaults() {
        let config = RelayConfig::default();
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.poll_interval, Duration::from_millis(500));
        assert!(config.visibility_timeout > config.batch_timeout);
        assert!(config.relay_id.starts_with("relay-"));
    }

    #[test]
    fn relay_id_override() {
        let config = RelayConfig::default().with_relay_id("relay-a");
        assert_eq!(config.relay_id, "relay-a");
    }

    #[test]
    fn short_visibility_timeout_is_raised_above_batch_timeout() {
        let config = RelayConfig {
            visibility_timeout: Duration::from_secs(5),
            batch_timeout: Duration::from_secs(10),
            ..RelayConfig::default()
        }
        .validated();
        assert_eq!(config.visibility_timeout, Duration::from_secs(20));

        let equal = RelayConfig {
            visibility_timeout: Duration::from_secs(10),
            batch_timeout: Duration::from_secs(10),
            ..RelayConfig::default()
        }
        .validated();
        assert!(equal.visibility_timeout > equal.batch_timeout);

        let valid = RelayConfig::default().validated();
        assert_eq!(valid.visibility_timeout, Duration::from_secs(30));
    }

    #[test]
    fn ledger_outlives_outbox_by_default() {
        let config = ReaperConfig::default();
        assert_eq!(config.outbox_retention, Duration::from_secs(7 * 24 * 3600));
        assert!(config.ledger_retention > config.outbox_retention);
    }
}
