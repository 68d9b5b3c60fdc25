use std::time::Duration;

// ============================================================================
// Event Store Configuration
// ============================================================================

pub const ENV_BROKER_URL: &str = "BOARD_EVENTS_BROKER_URL";
pub const ENV_CHANNEL_CAPACITY: &str = "BOARD_EVENTS_CHANNEL_CAPACITY";
pub const ENV_SHUTDOWN_TIMEOUT_MS: &str = "BOARD_EVENTS_SHUTDOWN_TIMEOUT_MS";

#[derive(Clone, Debug, PartialEq)]
pub struct EventStoreConfig {
    /// Broker endpoint, `redis://...` or `memory://...`
    pub broker_url: String,
    /// Capacity of both the intake and output queues of a subscription
    pub channel_capacity: usize,
    /// How long close waits for a delivery task before aborting it
    pub shutdown_timeout: Duration,
}

impl Default for EventStoreConfig {
    fn default() -> Self {
        Self {
            broker_url: "redis://127.0.0.1:6379".to_string(),
            channel_capacity: 64,
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

impl EventStoreConfig {
    /// In-process broker, for local runs and tests
    pub fn in_memory() -> Self {
        Self {
            broker_url: "memory://local".to_string(),
            ..Self::default()
        }
    }

    pub fn with_broker_url(mut self, url: impl Into<String>) -> Self {
        self.broker_url = url.into();
        self
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Read overrides from the process environment
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from a key lookup. Unset keys keep their defaults; unparsable
    /// values are logged and ignored.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(url) = lookup(ENV_BROKER_URL) {
            config.broker_url = url;
        }

        if let Some(raw) = lookup(ENV_CHANNEL_CAPACITY) {
            match raw.parse::<usize>() {
                Ok(capacity) if capacity > 0 => config.channel_capacity = capacity,
                _ => tracing::warn!(
                    key = ENV_CHANNEL_CAPACITY,
                    value = %raw,
                    "Invalid channel capacity, using default"
                ),
            }
        }

        if let Some(raw) = lookup(ENV_SHUTDOWN_TIMEOUT_MS) {
            match raw.parse::<u64>() {
                Ok(ms) => config.shutdown_timeout = Duration::from_millis(ms),
                Err(e) => tracing::warn!(
                    key = ENV_SHUTDOWN_TIMEOUT_MS,
                    value = %raw,
                    error = %e,
                    "Invalid shutdown timeout, using default"
                ),
            }
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = EventStoreConfig::default();
        assert_eq!(config.broker_url, "redis://127.0.0.1:6379");
        assert_eq!(config.channel_capacity, 64);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_empty_lookup_keeps_defaults() {
        let config = EventStoreConfig::from_lookup(|_| None);
        assert_eq!(config, EventStoreConfig::default());
    }

    #[test]
    fn test_lookup_overrides() {
        let config = EventStoreConfig::from_lookup(lookup_from(&[
            (ENV_BROKER_URL, "memory://board"),
            (ENV_CHANNEL_CAPACITY, "8"),
            (ENV_SHUTDOWN_TIMEOUT_MS, "250"),
        ]));

        assert_eq!(config.broker_url, "memory://board");
        assert_eq!(config.channel_capacity, 8);
        assert_eq!(config.shutdown_timeout, Duration::from_millis(250));
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let config = EventStoreConfig::from_lookup(lookup_from(&[
            (ENV_CHANNEL_CAPACITY, "0"),
            (ENV_SHUTDOWN_TIMEOUT_MS, "soon"),
        ]));

        assert_eq!(config.channel_capacity, 64);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(5));
    }
}
