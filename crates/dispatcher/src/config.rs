//! Dispatcher configuration.

/// Reads from environment variables:
/// - `DISPATCHER_GROUP` — broker consumer group (default: `"order-service"`)
/// - `DISPATCHER_MAX_DELIVERIES` — deliveries of a transiently failing event
///   before it is dead-lettered (default: `5`)
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub group: String,
    pub max_deliveries: u32,
}

impl DispatcherConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            group: std::env::var("DISPATCHER_GROUP").unwrap_or(defaults.group),
            max_deliveries: std::env::var("DISPATCHER_MAX_DELIVERIES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_deliveries),
        }
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            group: "order-service".to_string(),
            max_deliveries: 5,
        }
    }
}
