//! Daemon configuration and the per-process context.
//!
//! The environment contract between the supervisor and a daemon:
//!
//! | variable | meaning |
//! |---|---|
//! | `TETHER_PROCESS_TYPE` | must be `daemon` |
//! | `TETHER_APP_ID` | application identity |
//! | `TETHER_DAEMON_TARGET` | entry point the daemon serves (opaque) |
//! | `PORT` | port to bind, `0` for any |
//! | `TETHER_DAEMON_IDLE_SECS` | idle timeout override |

use crate::{DaemonError, Result};
use std::time::Duration;

/// Daemon constants.
pub struct DaemonConfig;

impl DaemonConfig {
    pub const PROCESS_TYPE_ENV: &'static str = "TETHER_PROCESS_TYPE";
    pub const PROCESS_TYPE_DAEMON: &'static str = "daemon";
    pub const APP_ID_ENV: &'static str = "TETHER_APP_ID";
    pub const TARGET_ENV: &'static str = "TETHER_DAEMON_TARGET";
    pub const PORT_ENV: &'static str = "PORT";
    pub const IDLE_SECS_ENV: &'static str = "TETHER_DAEMON_IDLE_SECS";

    /// Printed on stdout once the listener is bound.
    pub const PORT_LINE_PREFIX: &'static str = "TETHER_DAEMON_PORT=";

    pub const HEALTH_PATH: &'static str = "/api/health";
    pub const RUN_METHOD_PATH: &'static str = "/api/RunAppMethod";

    pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);
    pub const MAX_IDLE_CHECK_INTERVAL: Duration = Duration::from_secs(60);
    pub const MIN_IDLE_CHECK_INTERVAL: Duration = Duration::from_millis(10);

    pub const PORT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(15);
    pub const HEALTH_WAIT_TIMEOUT: Duration = Duration::from_secs(15);
    pub const HEALTH_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    pub const STOP_GRACE_PERIOD: Duration = Duration::from_secs(5);
}

/// Everything a daemon needs to know about itself.
///
/// Built from the environment in a spawned daemon, or programmatically in
/// tests and embedded use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonContext {
    app_id: String,
    target: String,
    port: u16,
    idle_timeout: Duration,
}

impl DaemonContext {
    pub fn new(app_id: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            target: String::new(),
            port: 0,
            idle_timeout: DaemonConfig::DEFAULT_IDLE_TIMEOUT,
        }
    }

    /// Read the context from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read the context through `lookup`, which maps a variable name to its
    /// value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let process_type = lookup(DaemonConfig::PROCESS_TYPE_ENV).unwrap_or_default();
        if process_type != DaemonConfig::PROCESS_TYPE_DAEMON {
            return Err(DaemonError::Config {
                message: format!(
                    "{} must be '{}', got '{}'",
                    DaemonConfig::PROCESS_TYPE_ENV,
                    DaemonConfig::PROCESS_TYPE_DAEMON,
                    process_type
                ),
            });
        }

        let app_id = lookup(DaemonConfig::APP_ID_ENV)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| DaemonError::Config {
                message: format!("{} is not set", DaemonConfig::APP_ID_ENV),
            })?;

        let mut ctx = Self::new(app_id);
        if let Some(target) = lookup(DaemonConfig::TARGET_ENV) {
            ctx.target = target;
        }
        if let Some(port) = lookup(DaemonConfig::PORT_ENV).filter(|p| !p.is_empty()) {
            ctx.port = port.trim().parse().map_err(|_| DaemonError::Config {
                message: format!("invalid {}: '{}'", DaemonConfig::PORT_ENV, port),
            })?;
        }
        if let Some(secs) = lookup(DaemonConfig::IDLE_SECS_ENV).filter(|s| !s.is_empty()) {
            let secs: u64 = secs.trim().parse().map_err(|_| DaemonError::Config {
                message: format!("invalid {}: '{}'", DaemonConfig::IDLE_SECS_ENV, secs),
            })?;
            if secs == 0 {
                return Err(DaemonError::Config {
                    message: format!("{} must be positive", DaemonConfig::IDLE_SECS_ENV),
                });
            }
            ctx.idle_timeout = Duration::from_secs(secs);
        }
        Ok(ctx)
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = target.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// How often the idle watchdog looks at the last activity:
    /// a quarter of the timeout, capped at one minute.
    pub fn idle_check_interval(&self) -> Duration {
        (self.idle_timeout / 4)
            .min(DaemonConfig::MAX_IDLE_CHECK_INTERVAL)
            .max(DaemonConfig::MIN_IDLE_CHECK_INTERVAL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_from_env_contract() {
        let ctx = DaemonContext::from_lookup(env(&[
            ("TETHER_PROCESS_TYPE", "daemon"),
            ("TETHER_APP_ID", "notes"),
            ("TETHER_DAEMON_TARGET", "server/main"),
            ("PORT", "4100"),
            ("TETHER_DAEMON_IDLE_SECS", "30"),
        ]))
        .unwrap();

        assert_eq!(ctx.app_id(), "notes");
        assert_eq!(ctx.target(), "server/main");
        assert_eq!(ctx.port(), 4100);
        assert_eq!(ctx.idle_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_defaults() {
        let ctx = DaemonContext::from_lookup(env(&[
            ("TETHER_PROCESS_TYPE", "daemon"),
            ("TETHER_APP_ID", "notes"),
        ]))
        .unwrap();

        assert_eq!(ctx.port(), 0);
        assert_eq!(ctx.idle_timeout(), DaemonConfig::DEFAULT_IDLE_TIMEOUT);
        assert_eq!(ctx.idle_check_interval(), Duration::from_secs(60));
    }

    #[test]
    fn test_rejects_non_daemon_process() {
        let result = DaemonContext::from_lookup(env(&[("TETHER_APP_ID", "notes")]));
        assert!(matches!(result, Err(DaemonError::Config { .. })));
    }

    #[test]
    fn test_rejects_bad_values() {
        let base = [("TETHER_PROCESS_TYPE", "daemon"), ("TETHER_APP_ID", "notes")];

        let mut bad_port = base.to_vec();
        bad_port.push(("PORT", "http"));
        assert!(DaemonContext::from_lookup(env(&bad_port)).is_err());

        let mut zero_idle = base.to_vec();
        zero_idle.push(("TETHER_DAEMON_IDLE_SECS", "0"));
        assert!(DaemonContext::from_lookup(env(&zero_idle)).is_err());

        assert!(DaemonContext::from_lookup(env(&[("TETHER_PROCESS_TYPE", "daemon")])).is_err());
    }

    #[test]
    fn test_idle_check_interval() {
        let ctx = DaemonContext::new("a").with_idle_timeout(Duration::from_secs(20));
        assert_eq!(ctx.idle_check_interval(), Duration::from_secs(5));

        let ctx = DaemonContext::new("a").with_idle_timeout(Duration::ZERO);
        assert_eq!(ctx.idle_check_interval(), DaemonConfig::MIN_IDLE_CHECK_INTERVAL);
    }
}
