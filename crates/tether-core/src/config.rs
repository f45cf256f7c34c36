//! Centralized configuration for the Tether transport.
//!
//! Compile-time defaults live on unit structs; values that callers tune at
//! runtime (reconnect behaviour) live on [`ReconnectPolicy`].

use std::time::Duration;

/// Client connection defaults.
pub struct TransportConfig;

impl TransportConfig {
    pub const WEBSOCKET_PATH: &'static str = "/api/websocket";
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
    pub const RECONNECT_DELAY_INITIAL: Duration = Duration::from_secs(2);
    pub const RECONNECT_DELAY_MAX: Duration = Duration::from_secs(30);
    pub const RECONNECT_BACKOFF_FACTOR: f64 = 1.5;
    pub const RECONNECT_JITTER: Duration = Duration::from_millis(250);
    pub const MAX_RECONNECT_ATTEMPTS: u32 = 10;
    /// How long a unary call waits for `methodDone` after its output.
    pub const UNARY_DONE_GRACE: Duration = Duration::from_millis(500);
}

/// Stream server defaults.
pub struct ServerConfig;

impl ServerConfig {
    pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024; // 16MB
    pub const MAX_CONNECTIONS: usize = 256;
}

/// Pub/sub naming.
pub struct TopicConfig;

impl TopicConfig {
    /// Categories under this prefix belong to the registry itself.
    pub const RESERVED_CATEGORY_PREFIX: &'static str = "/topics";
    pub const META_CATEGORY: &'static str = "/topics";
    pub const META_KEY: &'static str = "meta";
    pub const SUBSCRIBE_METHOD: &'static str = "SubscribeTopic";
    pub const SNAPSHOT_RETRY_DELAY_INITIAL: Duration = Duration::from_millis(250);
    pub const SNAPSHOT_RETRY_DELAY_MAX: Duration = Duration::from_secs(10);
}

/// Reconnect behaviour of the connection manager.
///
/// Delays grow exponentially from `delay_initial` by `factor`, capped at
/// `delay_max`, with up to `jitter` of random delay added. After
/// `max_attempts` consecutive failures the manager gives up; `None` retries
/// forever.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub delay_initial: Duration,
    pub delay_max: Duration,
    pub factor: f64,
    pub jitter: Duration,
    pub max_attempts: Option<u32>,
    pub connect_timeout: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            delay_initial: TransportConfig::RECONNECT_DELAY_INITIAL,
            delay_max: TransportConfig::RECONNECT_DELAY_MAX,
            factor: TransportConfig::RECONNECT_BACKOFF_FACTOR,
            jitter: TransportConfig::RECONNECT_JITTER,
            max_attempts: Some(TransportConfig::MAX_RECONNECT_ATTEMPTS),
            connect_timeout: TransportConfig::CONNECT_TIMEOUT,
        }
    }
}

impl ReconnectPolicy {
    /// Create a policy with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the initial delay.
    pub fn with_delay_initial(mut self, delay: Duration) -> Self {
        self.delay_initial = delay;
        self
    }

    /// Set the maximum delay cap.
    pub fn with_delay_max(mut self, delay: Duration) -> Self {
        self.delay_max = delay;
        self
    }

    /// Set the maximum random jitter.
    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Set the number of consecutive failed attempts before giving up.
    pub fn with_max_attempts(mut self, attempts: Option<u32>) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Set the per-attempt connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Whether `failures` consecutive failed attempts exhaust the policy.
    pub fn is_exhausted(&self, failures: u32) -> bool {
        self.max_attempts.map(|max| failures >= max).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy_is_bounded() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.max_attempts, Some(10));
        assert!(policy.delay_initial <= policy.delay_max);
        assert!(!policy.is_exhausted(9));
        assert!(policy.is_exhausted(10));
    }

    #[test]
    fn test_unbounded_policy_never_exhausts() {
        let policy = ReconnectPolicy::new().with_max_attempts(None);
        assert!(!policy.is_exhausted(u32::MAX));
    }
}
