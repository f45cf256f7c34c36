//! Reconnect delay schedule.
//!
//! Delays start at the policy's initial value and grow by `factor` per failed
//! attempt up to `delay_max`. Up to `jitter` of random delay is added so that
//! many clients dropped by the same runtime restart do not reconnect in lockstep.

use crate::config::ReconnectPolicy;
use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    delay_initial: Duration,
    delay_max: Duration,
    delay_current: Duration,
    factor: f64,
    jitter_ms: u64,
}

impl ReconnectBackoff {
    pub fn new(policy: &ReconnectPolicy) -> Self {
        Self {
            delay_initial: policy.delay_initial,
            delay_max: policy.delay_max,
            delay_current: policy.delay_initial,
            factor: policy.factor,
            jitter_ms: u64::try_from(policy.jitter.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Return the next delay (with jitter) and advance the schedule.
    pub fn next_duration(&mut self) -> Duration {
        let jitter = if self.jitter_ms > 0 {
            rand::rng().random_range(0..=self.jitter_ms)
        } else {
            0
        };
        let delay = self
            .delay_current
            .saturating_add(Duration::from_millis(jitter));

        // Float to int casts saturate.
        let next_nanos = (self.delay_current.as_nanos() as f64 * self.factor) as u64;
        let max_nanos = u64::try_from(self.delay_max.as_nanos()).unwrap_or(u64::MAX);
        self.delay_current = Duration::from_nanos(next_nanos.min(max_nanos));

        delay
    }

    /// Restart the schedule after a successful connection.
    pub fn reset(&mut self) {
        self.delay_current = self.delay_initial;
    }

    /// Base delay of the next attempt, without jitter.
    pub fn current_delay(&self) -> Duration {
        self.delay_current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy_without_jitter() -> ReconnectPolicy {
        ReconnectPolicy::new()
            .with_delay_initial(Duration::from_millis(100))
            .with_delay_max(Duration::from_millis(300))
            .with_jitter(Duration::ZERO)
    }

    #[test]
    fn test_growth_is_capped() {
        let mut backoff = ReconnectBackoff::new(&policy_without_jitter());

        assert_eq!(backoff.next_duration(), Duration::from_millis(100));
        assert_eq!(backoff.next_duration(), Duration::from_millis(150));
        assert_eq!(backoff.next_duration(), Duration::from_millis(225));
        assert_eq!(backoff.next_duration(), Duration::from_millis(300));
        assert_eq!(backoff.next_duration(), Duration::from_millis(300));
    }

    #[test]
    fn test_reset_returns_to_initial() {
        let mut backoff = ReconnectBackoff::new(&policy_without_jitter());
        backoff.next_duration();
        backoff.next_duration();
        backoff.reset();
        assert_eq!(backoff.current_delay(), Duration::from_millis(100));
    }

    #[test]
    fn test_jitter_stays_within_bound() {
        let policy = ReconnectPolicy::new()
            .with_delay_initial(Duration::from_millis(100))
            .with_jitter(Duration::from_millis(50));
        let mut backoff = ReconnectBackoff::new(&policy);

        let delay = backoff.next_duration();
        assert!(delay >= Duration::from_millis(100));
        assert!(delay <= Duration::from_millis(150));
    }

    #[test]
    fn test_huge_delays_saturate() {
        let policy = ReconnectPolicy::new()
            .with_delay_initial(Duration::from_secs(u64::MAX))
            .with_delay_max(Duration::MAX)
            .with_jitter(Duration::from_secs(1));
        let mut backoff = ReconnectBackoff::new(&policy);

        assert!(backoff.next_duration() >= Duration::from_secs(u64::MAX));
        assert_eq!(backoff.current_delay(), Duration::from_nanos(u64::MAX));
        assert!(backoff.next_duration() >= Duration::from_nanos(u64::MAX));
    }
}
