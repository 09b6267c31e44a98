//! Per-endpoint health statistics.
//!
//! Only [`super::ProxyPool`] mutates these, always under its lock. Every
//! method takes `now` explicitly so the pool evaluates a whole selection
//! against a single instant.

use std::time::{Duration, Instant};

use crate::capture::ErrorKind;

/// Consecutive failures that trigger a blocking window.
pub const BLOCK_THRESHOLD: u32 = 3;
/// Consecutive failures after which an endpoint is unhealthy even unblocked.
pub const UNHEALTHY_STREAK: u32 = 5;
/// Attempts required before the success rate is trusted.
pub const MIN_RATED_ATTEMPTS: u64 = 10;
pub const MIN_SUCCESS_RATE: f64 = 0.3;
/// Weight given to the newest latency sample.
pub const LATENCY_EWMA_WEIGHT: f64 = 0.2;

const BLOCK_STEP_MINUTES: u64 = 5;
const BLOCK_CAP_MINUTES: u64 = 60;

const ACCEPTABLE_LATENCY_SECS: f64 = 5.0;
const USAGE_HORIZON: f64 = 100.0;
const IDLE_HORIZON_HOURS: f64 = 24.0;

/// Blocking window for a given failure streak, capped at 60 minutes.
pub fn block_duration(consecutive_failures: u32) -> Duration {
    let minutes = (u64::from(consecutive_failures) * BLOCK_STEP_MINUTES).min(BLOCK_CAP_MINUTES);
    Duration::from_secs(minutes * 60)
}

#[derive(Debug, Clone, Default)]
pub struct ProxyHealth {
    total_attempts: u64,
    success_count: u64,
    failure_count: u64,
    consecutive_failures: u32,
    average_latency: Option<Duration>,
    last_used_at: Option<Instant>,
    last_success_at: Option<Instant>,
    blocked_until: Option<Instant>,
    last_error: Option<ErrorKind>,
}

impl ProxyHealth {
    pub fn total_attempts(&self) -> u64 {
        self.total_attempts
    }

    pub fn success_count(&self) -> u64 {
        self.success_count
    }

    pub fn failure_count(&self) -> u64 {
        self.failure_count
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn average_latency(&self) -> Option<Duration> {
        self.average_latency
    }

    pub fn last_used_at(&self) -> Option<Instant> {
        self.last_used_at
    }

    pub fn last_success_at(&self) -> Option<Instant> {
        self.last_success_at
    }

    pub fn blocked_until(&self) -> Option<Instant> {
        self.blocked_until
    }

    /// Error kind of the most recent failed attempt.
    pub fn last_error(&self) -> Option<ErrorKind> {
        self.last_error
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_attempts == 0 {
            0.0
        } else {
            self.success_count as f64 / self.total_attempts as f64
        }
    }

    pub fn is_blocked(&self, now: Instant) -> bool {
        self.blocked_until.is_some_and(|until| until > now)
    }

    /// Health check with lazy recovery: an expired block is cleared and the
    /// failure streak forgiven before the remaining rules are applied.
    pub fn is_healthy(&mut self, now: Instant) -> bool {
        if let Some(until) = self.blocked_until {
            if until > now {
                return false;
            }
            self.blocked_until = None;
            self.consecutive_failures = 0;
        }

        if self.consecutive_failures >= UNHEALTHY_STREAK {
            return false;
        }

        if self.total_attempts > MIN_RATED_ATTEMPTS && self.success_rate() < MIN_SUCCESS_RATE {
            return false;
        }

        true
    }

    pub fn record_success(&mut self, now: Instant, latency: Duration) {
        self.total_attempts += 1;
        self.success_count += 1;
        self.consecutive_failures = 0;
        self.last_used_at = Some(now);
        self.last_success_at = Some(now);
        self.average_latency = Some(match self.average_latency {
            None => latency,
            Some(current) => Duration::from_secs_f64(
                current.as_secs_f64() * (1.0 - LATENCY_EWMA_WEIGHT)
                    + latency.as_secs_f64() * LATENCY_EWMA_WEIGHT,
            ),
        });
    }

    /// Returns the blocking window applied, if the streak crossed the
    /// threshold.
    pub fn record_failure(&mut self, now: Instant) -> Option<Duration> {
        self.record_failure_kind(now, None)
    }

    pub fn record_failure_kind(
        &mut self,
        now: Instant,
        kind: Option<ErrorKind>,
    ) -> Option<Duration> {
        self.total_attempts += 1;
        self.last_error = kind.or(self.last_error);
        self.failure_count += 1;
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_used_at = Some(now);

        if self.consecutive_failures >= BLOCK_THRESHOLD {
            let window = block_duration(self.consecutive_failures);
            self.blocked_until = Some(now + window);
            Some(window)
        } else {
            None
        }
    }

    pub fn reset_failures(&mut self) {
        self.consecutive_failures = 0;
        self.blocked_until = None;
    }

    /// Weighted ranking score in `[0, 1]`: success rate 0.4, latency 0.3,
    /// inverse usage 0.2, idle time 0.1.
    pub fn score(&self, now: Instant) -> f64 {
        let mut score = self.success_rate() * 0.4;

        score += match self.average_latency {
            Some(latency) if latency > Duration::ZERO => {
                (1.0 - latency.as_secs_f64() / ACCEPTABLE_LATENCY_SECS).max(0.0) * 0.3
            }
            _ => 0.3,
        };

        score += if self.total_attempts > 0 {
            (1.0 - self.total_attempts as f64 / USAGE_HORIZON).max(0.0) * 0.2
        } else {
            0.2
        };

        score += match self.last_used_at {
            Some(used) => {
                let hours = now.saturating_duration_since(used).as_secs_f64() / 3600.0;
                (hours / IDLE_HORIZON_HOURS).min(1.0) * 0.1
            }
            None => 0.1,
        };

        score
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE: Duration = Duration::from_secs(60);

    #[test]
    fn backoff_grows_and_caps() {
        let minutes: Vec<u64> = (3..=14)
            .map(|n| block_duration(n).as_secs() / 60)
            .collect();
        assert_eq!(minutes, vec![15, 20, 25, 30, 35, 40, 45, 50, 55, 60, 60, 60]);
    }

    #[test]
    fn three_failures_block_until_window_elapses() {
        let now = Instant::now();
        let mut health = ProxyHealth::default();
        assert_eq!(health.record_failure(now), None);
        assert_eq!(health.record_failure(now), None);
        assert_eq!(health.record_failure(now), Some(15 * MINUTE));

        assert!(!health.is_healthy(now));
        assert!(!health.is_healthy(now + 14 * MINUTE));
        assert!(health.is_healthy(now + 16 * MINUTE));
        assert_eq!(health.consecutive_failures(), 0);
        assert_eq!(health.blocked_until(), None);
    }

    #[test]
    fn low_success_rate_is_unhealthy() {
        let now = Instant::now();
        let mut health = ProxyHealth::default();
        for _ in 0..3 {
            health.record_success(now, Duration::from_secs(1));
        }
        for _ in 0..8 {
            health.record_failure(now);
            health.reset_failures();
        }
        assert_eq!(health.total_attempts(), 11);
        assert!(!health.is_healthy(now));
    }

    #[test]
    fn latency_is_ewma_seeded_by_first_sample() {
        let now = Instant::now();
        let mut health = ProxyHealth::default();
        health.record_success(now, Duration::from_secs(2));
        assert_eq!(health.average_latency(), Some(Duration::from_secs(2)));
        health.record_success(now, Duration::from_secs(7));
        let avg = health.average_latency().unwrap().as_secs_f64();
        assert!((avg - 3.0).abs() < 1e-9);
    }

    #[test]
    fn success_clears_streak() {
        let now = Instant::now();
        let mut health = ProxyHealth::default();
        health.record_failure(now);
        health.record_failure(now);
        health.record_success(now, Duration::from_millis(300));
        assert_eq!(health.consecutive_failures(), 0);
        assert_eq!(health.total_attempts(), 3);
        assert_eq!(
            health.total_attempts(),
            health.success_count() + health.failure_count()
        );
    }

    #[test]
    fn unused_endpoint_scores_full_except_success_rate() {
        let health = ProxyHealth::default();
        let score = health.score(Instant::now());
        assert!((score - 0.6).abs() < 1e-9);
    }
}
