use std::time::Duration;

use crate::config::ReconnectConfig;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryBackoffPolicy {
    pub initial_ms: u64,
    pub max_ms: u64,
    pub factor: f64,
    pub jitter: f64,
}

impl RetryBackoffPolicy {
    pub const fn bus_default() -> Self {
        Self {
            initial_ms: 500,
            max_ms: 30_000,
            factor: 2.0,
            jitter: 0.1,
        }
    }

    fn sanitized(self) -> Self {
        let initial_ms = self.initial_ms.max(50);
        let max_ms = self.max_ms.max(initial_ms);
        let factor = self.factor.clamp(1.1, 10.0);
        let jitter = self.jitter.clamp(0.0, 1.0);
        Self {
            initial_ms,
            max_ms,
            factor,
            jitter,
        }
    }
}

impl From<&ReconnectConfig> for RetryBackoffPolicy {
    fn from(cfg: &ReconnectConfig) -> Self {
        Self {
            initial_ms: cfg.initial_ms,
            max_ms: cfg.max_ms,
            factor: cfg.factor,
            jitter: cfg.jitter,
        }
    }
}

/// Delay before reconnect attempt `attempt` (1-based), clamped to `[initial, max]`.
pub fn compute_retry_backoff_delay_ms(policy: RetryBackoffPolicy, attempt: u32) -> u64 {
    let policy = policy.sanitized();
    let effective_attempt = attempt.max(1);
    let mut base = policy.initial_ms as f64;
    for _ in 1..effective_attempt {
        base = (base * policy.factor).min(policy.max_ms as f64);
    }
    let jitter = base * policy.jitter * deterministic_unit_interval(effective_attempt);
    let delay = (base + jitter).round();
    let bounded = delay.clamp(policy.initial_ms as f64, policy.max_ms as f64);
    bounded as u64
}

pub fn compute_retry_backoff_delay(policy: RetryBackoffPolicy, attempt: u32) -> Duration {
    Duration::from_millis(compute_retry_backoff_delay_ms(policy, attempt))
}

fn deterministic_unit_interval(attempt: u32) -> f64 {
    let mut x = u64::from(attempt).wrapping_mul(0x9E37_79B9_7F4A_7C15);
    x ^= x >> 33;
    x = x.wrapping_mul(0xFF51_AFD7_ED55_8CCD);
    x ^= x >> 33;
    (x & 0xFFFF) as f64 / 65_535.0
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{compute_retry_backoff_delay, compute_retry_backoff_delay_ms, RetryBackoffPolicy};

    #[test]
    fn backoff_grows_and_caps_at_max() {
        let policy = RetryBackoffPolicy {
            initial_ms: 500,
            max_ms: 4_000,
            factor: 2.0,
            jitter: 0.0,
        };
        assert_eq!(compute_retry_backoff_delay_ms(policy, 0), 500);
        assert_eq!(compute_retry_backoff_delay_ms(policy, 1), 500);
        assert_eq!(compute_retry_backoff_delay_ms(policy, 2), 1_000);
        assert_eq!(compute_retry_backoff_delay_ms(policy, 4), 4_000);
        assert_eq!(compute_retry_backoff_delay_ms(policy, 12), 4_000);
        assert_eq!(
            compute_retry_backoff_delay(policy, 3),
            Duration::from_millis(2_000)
        );
    }

    #[test]
    fn jitter_stays_within_bounds_and_is_deterministic() {
        let policy = RetryBackoffPolicy::bus_default();
        for attempt in 1..20 {
            let first = compute_retry_backoff_delay_ms(policy, attempt);
            assert_eq!(first, compute_retry_backoff_delay_ms(policy, attempt));
            assert!((policy.initial_ms..=policy.max_ms).contains(&first));
        }
    }

    #[test]
    fn degenerate_policies_are_sanitized() {
        let policy = RetryBackoffPolicy {
            initial_ms: 0,
            max_ms: 0,
            factor: 0.0,
            jitter: 5.0,
        };
        let delay = compute_retry_backoff_delay_ms(policy, 3);
        assert_eq!(delay, 50);
    }
}
