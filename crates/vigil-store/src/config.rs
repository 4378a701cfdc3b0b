use std::time::Duration;

/// Timing configuration for a [`Coordinator`](crate::Coordinator).
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// How long a session may go without a keepalive before the store
    /// expires it and removes its ephemeral nodes.
    pub session_timeout: Duration,
    /// How often a healthy connection renews its session lease.
    pub keepalive_interval: Duration,
    /// How often the store scans for expired sessions.
    pub reap_interval: Duration,
    /// Artificial delay applied to every operation, simulating a store
    /// round-trip. `None` in production.
    pub op_latency: Option<Duration>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            session_timeout: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(3),
            reap_interval: Duration::from_secs(1),
            op_latency: None,
        }
    }
}

impl StoreConfig {
    /// Defaults overridden by `VIGIL_SESSION_TIMEOUT_MS`, `VIGIL_KEEPALIVE_MS`
    /// and `VIGIL_REAP_MS`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(d) = env_millis("VIGIL_SESSION_TIMEOUT_MS") {
            config.session_timeout = d;
        }
        if let Some(d) = env_millis("VIGIL_KEEPALIVE_MS") {
            config.keepalive_interval = d;
        }
        if let Some(d) = env_millis("VIGIL_REAP_MS") {
            config.reap_interval = d;
        }
        config
    }

    /// Config scaled around a session timeout: keepalives at a third of it,
    /// reaping at a quarter. Neither interval drops below one millisecond.
    pub fn with_session_timeout(session_timeout: Duration) -> Self {
        Self {
            session_timeout,
            keepalive_interval: (session_timeout / 3).max(MIN_INTERVAL),
            reap_interval: (session_timeout / 4).max(MIN_INTERVAL),
            op_latency: None,
        }
    }
}

/// Smallest tick the background tasks accept.
const MIN_INTERVAL: Duration = Duration::from_millis(1);

fn env_millis(key: &str) -> Option<Duration> {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keepalive_well_inside_timeout() {
        let config = StoreConfig::default();
        assert!(config.keepalive_interval * 2 < config.session_timeout);
    }

    #[test]
    fn scaled_config() {
        let config = StoreConfig::with_session_timeout(Duration::from_millis(120));
        assert_eq!(config.keepalive_interval, Duration::from_millis(40));
        assert_eq!(config.reap_interval, Duration::from_millis(30));
        assert!(config.op_latency.is_none());
    }

    #[test]
    fn env_millis_ignores_garbage() {
        assert_eq!(env_millis("VIGIL_TEST_UNSET_VARIABLE"), None);
    }

    #[test]
    fn zero_timeout_keeps_intervals_positive() {
        let config = StoreConfig::with_session_timeout(Duration::ZERO);
        assert_eq!(config.keepalive_interval, Duration::from_millis(1));
        assert_eq!(config.reap_interval, Duration::from_millis(1));
    }
}
