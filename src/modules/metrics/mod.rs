//! Metrics collection utilities.
//!
//! Aggregates run-level counters and per-capture-key statistics with latency
//! percentiles for observability.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::capture::ErrorKind;

/// Aggregated run metrics.
#[derive(Debug, Clone)]
pub struct GlobalStats {
    pub started_at: DateTime<Utc>,
    pub total_runs: u64,
    pub successes: u64,
    pub failures: u64,
    pub average_latency: Option<Duration>,
}

impl Default for GlobalStats {
    fn default() -> Self {
        Self {
            started_at: Utc::now(),
            total_runs: 0,
            successes: 0,
            failures: 0,
            average_latency: None,
        }
    }
}

/// Capture-key scoped metrics snapshot.
#[derive(Debug, Clone)]
pub struct KeyStats {
    pub key: String,
    pub total: u64,
    pub successes: u64,
    pub failures: u64,
    pub average_latency: Option<Duration>,
    pub p95_latency: Option<Duration>,
    pub consecutive_failures: u32,
    pub last_error: Option<ErrorKind>,
    pub errors_by_kind: HashMap<ErrorKind, u64>,
}

impl KeyStats {
    fn from_accumulator(key: &str, acc: &KeyAccumulator) -> Self {
        let (avg, p95) = acc.latency_stats();
        Self {
            key: key.to_string(),
            total: acc.total,
            successes: acc.successes,
            failures: acc.failures,
            average_latency: avg,
            p95_latency: p95,
            consecutive_failures: acc.consecutive_failures,
            last_error: acc.last_error,
            errors_by_kind: acc.errors_by_kind.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub global: GlobalStats,
    pub keys: Vec<KeyStats>,
}

#[derive(Debug)]
struct KeyAccumulator {
    total: u64,
    successes: u64,
    failures: u64,
    latencies: VecDeque<Duration>,
    max_window: usize,
    consecutive_failures: u32,
    last_error: Option<ErrorKind>,
    errors_by_kind: HashMap<ErrorKind, u64>,
}

impl KeyAccumulator {
    fn new(max_window: usize) -> Self {
        Self {
            total: 0,
            successes: 0,
            failures: 0,
            latencies: VecDeque::with_capacity(max_window),
            max_window,
            consecutive_failures: 0,
            last_error: None,
            errors_by_kind: HashMap::new(),
        }
    }

    fn record(&mut self, success: bool, kind: Option<ErrorKind>, latency: Duration) {
        self.total += 1;

        if success {
            self.successes += 1;
            self.consecutive_failures = 0;
            if self.latencies.len() == self.max_window {
                self.latencies.pop_front();
            }
            self.latencies.push_back(latency);
        } else {
            self.failures += 1;
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
            if let Some(kind) = kind {
                self.last_error = Some(kind);
                *self.errors_by_kind.entry(kind).or_default() += 1;
            }
        }
    }

    fn latency_stats(&self) -> (Option<Duration>, Option<Duration>) {
        if self.latencies.is_empty() {
            return (None, None);
        }
        let mut samples: Vec<_> = self.latencies.iter().cloned().collect();
        samples.sort_unstable();
        let avg = samples.iter().map(|d| d.as_secs_f64()).sum::<f64>() / samples.len() as f64;
        let p95_index = ((samples.len() as f64 * 0.95).ceil() as usize).saturating_sub(1);
        let p95 = samples[p95_index];
        (Some(Duration::from_secs_f64(avg)), Some(p95))
    }
}

#[derive(Debug)]
struct MetricsState {
    global: GlobalStats,
    max_window: usize,
    keys: HashMap<String, KeyAccumulator>,
}

impl MetricsState {
    fn new(max_window: usize) -> Self {
        Self {
            global: GlobalStats::default(),
            max_window,
            keys: HashMap::new(),
        }
    }

    fn accumulator_mut(&mut self, key: &str) -> &mut KeyAccumulator {
        let window = self.max_window;
        self.keys
            .entry(key.to_string())
            .or_insert_with(|| KeyAccumulator::new(window))
    }
}

/// Thread-safe metrics collector shared by the orchestrator's handlers.
#[derive(Clone, Debug)]
pub struct MetricsCollector {
    inner: Arc<Mutex<MetricsState>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MetricsState::new(128))),
        }
    }

    pub fn with_window(window: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MetricsState::new(window.max(16)))),
        }
    }

    pub fn record_capture(
        &self,
        key: &str,
        success: bool,
        kind: Option<ErrorKind>,
        latency: Duration,
    ) {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        guard.accumulator_mut(key).record(success, kind, latency);
    }

    pub fn record_attempt(&self, success: bool, latency: Duration) {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        guard.global.total_runs += 1;
        if success {
            guard.global.successes += 1;
        } else {
            guard.global.failures += 1;
        }

        guard.global.average_latency = Some(match guard.global.average_latency {
            Some(avg) => {
                Duration::from_secs_f64(avg.as_secs_f64() * 0.9 + latency.as_secs_f64() * 0.1)
            }
            None => latency,
        });
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let mut keys: Vec<_> = guard
            .keys
            .iter()
            .map(|(key, acc)| KeyStats::from_accumulator(key, acc))
            .collect();
        keys.sort_by(|a, b| a.key.cmp(&b.key));
        MetricsSnapshot {
            global: guard.global.clone(),
            keys,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_success_and_failure() {
        let metrics = MetricsCollector::new();
        metrics.record_capture("menu", true, None, Duration::from_millis(150));
        metrics.record_capture("menu", false, Some(ErrorKind::ApiError), Duration::ZERO);
        metrics.record_capture("menu", false, Some(ErrorKind::ResponseMissing), Duration::ZERO);
        metrics.record_attempt(true, Duration::from_secs(3));

        let snapshot = metrics.snapshot();
        let menu = snapshot.keys.iter().find(|k| k.key == "menu").unwrap();
        assert_eq!(menu.total, 3);
        assert_eq!(menu.successes, 1);
        assert_eq!(menu.failures, 2);
        assert_eq!(menu.consecutive_failures, 2);
        assert_eq!(menu.last_error, Some(ErrorKind::ResponseMissing));
        assert_eq!(menu.average_latency, Some(Duration::from_millis(150)));
        assert_eq!(snapshot.global.total_runs, 1);
        assert_eq!(snapshot.global.successes, 1);
    }
}
