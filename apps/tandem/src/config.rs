use std::env;
use std::time::Duration;

#[cfg(test)]
use std::sync::Mutex;

pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";
pub const DEFAULT_DATA_CHANNEL_LABEL: &str = "tandem-chat";

/// Negotiation settings shared by every session of one registry.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// The single STUN server each peer connection is configured with.
    pub stun_server: String,
    /// Bound on each asynchronous handshake phase before the session fails.
    pub phase_timeout: Duration,
    /// Failed attempts tolerated before a terminal failure is reported.
    pub max_retries: u32,
    /// Delay before the first retry; doubled for every further attempt.
    pub retry_backoff: Duration,
    pub max_backoff: Duration,
    pub data_channel_label: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            stun_server: DEFAULT_STUN_SERVER.to_string(),
            phase_timeout: Duration::from_secs(30),
            max_retries: 3,
            retry_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(10),
            data_channel_label: DEFAULT_DATA_CHANNEL_LABEL.to_string(),
        }
    }
}

impl SessionConfig {
    /// Load configuration from environment variables, keeping defaults for
    /// anything unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            stun_server: env::var("TANDEM_STUN_SERVER")
                .ok()
                .filter(|value| !value.trim().is_empty())
                .unwrap_or(defaults.stun_server),
            phase_timeout: env_parse("TANDEM_PHASE_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.phase_timeout),
            max_retries: env_parse("TANDEM_MAX_RETRIES").unwrap_or(defaults.max_retries),
            retry_backoff: env_parse("TANDEM_RETRY_BACKOFF_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry_backoff),
            max_backoff: env_parse("TANDEM_MAX_BACKOFF_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.max_backoff),
            data_channel_label: env::var("TANDEM_DATA_CHANNEL_LABEL")
                .ok()
                .filter(|value| !value.trim().is_empty())
                .unwrap_or(defaults.data_channel_label),
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.retry_backoff
            .saturating_mul(1u32 << shift)
            .min(self.max_backoff)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|value| value.trim().parse().ok())
}
