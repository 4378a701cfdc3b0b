use std::time::Duration;

/// Presence settings shared by agents that run pingers.
#[derive(Clone, Debug)]
pub struct PresenceConfig {
    /// How often a pinger refreshes its record.
    pub ping_period: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            ping_period: Duration::from_secs(1),
        }
    }
}

impl PresenceConfig {
    /// Defaults overridden by `VIGIL_PING_PERIOD_MS`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(ms) = std::env::var("VIGIL_PING_PERIOD_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|ms| *ms > 0)
        {
            config.ping_period = Duration::from_millis(ms);
        }
        config
    }
}
