//! Proxy rotation and health tracking.
//!
//! Tracks per-endpoint performance, blocks endpoints that keep failing, and
//! selects the next egress path according to the configured rotation
//! strategy. All reads and writes of health data go through one pool-wide
//! lock, so lazy recovery inside the health check stays atomic.

mod endpoint;
mod health;
mod probe;

pub use endpoint::{ProxyEndpoint, ProxyParseError, ProxyScheme, load_proxy_file, parse_proxy_list};
pub use health::{ProxyHealth, block_duration};
pub use probe::{ProbeError, ProbeReport, ProxyProbe};

use rand::seq::SliceRandom;
use serde::Deserialize;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::io;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::capture::ErrorKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationStrategy {
    /// Weighted score, random pick within the top third.
    #[default]
    Smart,
    Random,
    RoundRobin,
    /// Smart pick pinned until it turns unhealthy.
    Session,
}

impl FromStr for RotationStrategy {
    type Err = ProxyPoolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "smart" => Ok(RotationStrategy::Smart),
            "random" => Ok(RotationStrategy::Random),
            "round_robin" | "round-robin" | "sequential" => Ok(RotationStrategy::RoundRobin),
            "session" => Ok(RotationStrategy::Session),
            other => Err(ProxyPoolError::UnknownStrategy(other.to_string())),
        }
    }
}

#[derive(Debug, Error)]
pub enum ProxyPoolError {
    #[error("endpoint {0} is not part of this pool")]
    UnknownEndpoint(String),
    #[error("lease #{0} was already reported")]
    AlreadyReported(u64),
    #[error("unknown rotation strategy '{0}'")]
    UnknownStrategy(String),
    #[error("failed to read proxy list: {0}")]
    Io(#[from] io::Error),
}

/// One selection handed out by [`ProxyPool::select`]. Reporting through the
/// lease is accepted exactly once.
#[derive(Debug, Clone)]
pub struct ProxyLease {
    id: u64,
    endpoint: ProxyEndpoint,
}

impl ProxyLease {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn endpoint(&self) -> &ProxyEndpoint {
        &self.endpoint
    }
}

/// Read-only observability snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolStats {
    pub total: usize,
    pub healthy: usize,
    pub blocked: usize,
    pub mean_success_rate: f64,
}

#[derive(Debug)]
struct PoolEntry {
    endpoint: ProxyEndpoint,
    health: ProxyHealth,
}

#[derive(Debug, Default)]
struct PoolState {
    entries: Vec<PoolEntry>,
    strategy: RotationStrategy,
    session: Option<usize>,
    cursor: usize,
    next_lease: u64,
    /// Unreported leases by id, oldest first.
    outstanding: BTreeMap<u64, ProxyEndpoint>,
}

impl PoolState {
    fn index_of(&self, endpoint: &ProxyEndpoint) -> Option<usize> {
        self.entries.iter().position(|entry| entry.endpoint == *endpoint)
    }

    fn healthy_indices(&mut self, now: Instant) -> Vec<usize> {
        self.entries
            .iter_mut()
            .enumerate()
            .filter_map(|(idx, entry)| entry.health.is_healthy(now).then_some(idx))
            .collect()
    }

    fn reset_all(&mut self) {
        for entry in &mut self.entries {
            entry.health.reset_failures();
        }
    }

    fn smart_pick(&self, candidates: &[usize], now: Instant) -> Option<usize> {
        let mut scored: Vec<(f64, usize)> = candidates
            .iter()
            .map(|&idx| (self.entries[idx].health.score(now), idx))
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(Ordering::Equal));

        let top = (scored.len() / 3).max(1);
        scored[..top.min(scored.len())]
            .choose(&mut rand::thread_rng())
            .map(|(_, idx)| *idx)
    }

    fn pick(&mut self, strategy: RotationStrategy, candidates: &[usize], now: Instant) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        match strategy {
            RotationStrategy::Smart => self.smart_pick(candidates, now),
            RotationStrategy::Random => candidates.choose(&mut rand::thread_rng()).copied(),
            RotationStrategy::RoundRobin => {
                let idx = candidates[self.cursor % candidates.len()];
                self.cursor = (self.cursor + 1) % candidates.len();
                Some(idx)
            }
            RotationStrategy::Session => {
                let picked = self.smart_pick(candidates, now);
                self.session = picked;
                picked
            }
        }
    }

    fn lease(&mut self, idx: usize) -> ProxyLease {
        self.next_lease += 1;
        let id = self.next_lease;
        let endpoint = self.entries[idx].endpoint.clone();
        self.outstanding.insert(id, endpoint.clone());
        ProxyLease { id, endpoint }
    }

    /// Retires the oldest unreported lease on `endpoint`, if any.
    fn retire_lease_for(&mut self, endpoint: &ProxyEndpoint) {
        let oldest = self
            .outstanding
            .iter()
            .find(|(_, leased)| *leased == endpoint)
            .map(|(id, _)| *id);
        if let Some(id) = oldest {
            self.outstanding.remove(&id);
        }
    }
}

/// Shared pool of egress paths and their health.
#[derive(Debug, Default)]
pub struct ProxyPool {
    state: Mutex<PoolState>,
}

impl ProxyPool {
    pub fn new(strategy: RotationStrategy) -> Self {
        Self {
            state: Mutex::new(PoolState {
                strategy,
                ..PoolState::default()
            }),
        }
    }

    pub fn with_endpoints<I>(endpoints: I, strategy: RotationStrategy) -> Self
    where
        I: IntoIterator<Item = ProxyEndpoint>,
    {
        let pool = Self::new(strategy);
        for endpoint in endpoints {
            pool.add_endpoint(endpoint);
        }
        log::info!("proxy pool loaded with {} endpoint(s)", pool.len());
        pool
    }

    /// Loads a proxy list file. A missing file yields an empty pool, which
    /// means direct egress.
    pub fn from_file(path: impl AsRef<Path>, strategy: RotationStrategy) -> Result<Self, ProxyPoolError> {
        let path = path.as_ref();
        match load_proxy_file(path) {
            Ok(endpoints) => Ok(Self::with_endpoints(endpoints, strategy)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                log::warn!("proxy file {} not found, using direct egress", path.display());
                Ok(Self::new(strategy))
            }
            Err(err) => Err(err.into()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds an endpoint unless one with the same identity is present.
    pub fn add_endpoint(&self, endpoint: ProxyEndpoint) -> bool {
        let mut state = self.lock();
        if state.index_of(&endpoint).is_some() {
            return false;
        }
        state.entries.push(PoolEntry {
            endpoint,
            health: ProxyHealth::default(),
        });
        true
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn endpoints(&self) -> Vec<ProxyEndpoint> {
        self.lock()
            .entries
            .iter()
            .map(|entry| entry.endpoint.clone())
            .collect()
    }

    pub fn strategy(&self) -> RotationStrategy {
        self.lock().strategy
    }

    pub fn set_strategy(&self, strategy: RotationStrategy) {
        let mut state = self.lock();
        state.strategy = strategy;
        state.session = None;
        log::info!("proxy rotation strategy set to {strategy:?}");
    }

    /// Selects with the configured strategy.
    pub fn select(&self) -> Option<ProxyLease> {
        let strategy = self.strategy();
        self.select_at(strategy, Instant::now())
    }

    pub fn select_with(&self, strategy: RotationStrategy) -> Option<ProxyLease> {
        self.select_at(strategy, Instant::now())
    }

    pub(crate) fn select_at(&self, strategy: RotationStrategy, now: Instant) -> Option<ProxyLease> {
        let mut state = self.lock();
        if state.entries.is_empty() {
            return None;
        }

        if strategy == RotationStrategy::Session {
            if let Some(idx) = state.session {
                if state.entries[idx].health.is_healthy(now) {
                    return Some(state.lease(idx));
                }
                log::info!(
                    "session proxy {} turned unhealthy, reselecting",
                    state.entries[idx].endpoint
                );
                state.session = None;
            }
        }

        let mut candidates = state.healthy_indices(now);
        if candidates.is_empty() {
            log::warn!("no healthy proxy available, resetting pool-wide failure state");
            state.reset_all();
            candidates = (0..state.entries.len()).collect();
        }

        let idx = state.pick(strategy, &candidates, now)?;
        log::debug!("selected proxy {}", state.entries[idx].endpoint);
        Some(state.lease(idx))
    }

    /// Records one attempt against `endpoint`. Every call counts, so callers
    /// must report exactly once per attempt; prefer [`ProxyPool::report_lease`].
    /// The oldest unreported lease on the endpoint counts as settled.
    pub fn report(
        &self,
        endpoint: &ProxyEndpoint,
        success: bool,
        latency: Duration,
        error_kind: Option<ErrorKind>,
    ) -> Result<(), ProxyPoolError> {
        self.report_at(endpoint, success, latency, error_kind, Instant::now())?;
        self.lock().retire_lease_for(endpoint);
        Ok(())
    }

    /// Records the attempt a lease was issued for. A second report for the
    /// same lease is rejected and leaves the statistics untouched.
    pub fn report_lease(
        &self,
        lease: &ProxyLease,
        success: bool,
        latency: Duration,
        error_kind: Option<ErrorKind>,
    ) -> Result<(), ProxyPoolError> {
        {
            let mut state = self.lock();
            if state.outstanding.remove(&lease.id).is_none() {
                log::error!("lease #{} for {} reported twice", lease.id, lease.endpoint);
                return Err(ProxyPoolError::AlreadyReported(lease.id));
            }
        }
        self.report_at(&lease.endpoint, success, latency, error_kind, Instant::now())
    }

    /// Leases handed out and not reported yet.
    pub fn outstanding_leases(&self) -> usize {
        self.lock().outstanding.len()
    }

    pub(crate) fn report_at(
        &self,
        endpoint: &ProxyEndpoint,
        success: bool,
        latency: Duration,
        error_kind: Option<ErrorKind>,
        now: Instant,
    ) -> Result<(), ProxyPoolError> {
        let mut state = self.lock();
        let idx = state
            .index_of(endpoint)
            .ok_or_else(|| ProxyPoolError::UnknownEndpoint(endpoint.server_url()))?;
        let entry = &mut state.entries[idx];

        if success {
            entry.health.record_success(now, latency);
            log::debug!(
                "proxy {} succeeded in {:.2}s",
                entry.endpoint,
                latency.as_secs_f64()
            );
        } else {
            let kind = error_kind.map(|k| k.as_str()).unwrap_or("unknown");
            log::debug!("proxy {} failed: {kind}", entry.endpoint);
            if let Some(window) = entry.health.record_failure_kind(now, error_kind) {
                log::warn!(
                    "proxy {} failed {} times in a row, blocked for {} minutes",
                    entry.endpoint,
                    entry.health.consecutive_failures(),
                    window.as_secs() / 60
                );
            }
        }
        Ok(())
    }

    /// Clears every failure streak and blocking window.
    pub fn reset_all(&self) {
        self.lock().reset_all();
        log::info!("proxy pool failure state reset");
    }

    pub fn health(&self, endpoint: &ProxyEndpoint) -> Option<ProxyHealth> {
        let state = self.lock();
        state
            .index_of(endpoint)
            .map(|idx| state.entries[idx].health.clone())
    }

    pub fn stats(&self) -> PoolStats {
        self.stats_at(Instant::now())
    }

    pub(crate) fn stats_at(&self, now: Instant) -> PoolStats {
        let mut state = self.lock();
        let total = state.entries.len();
        let healthy = state.healthy_indices(now).len();
        let blocked = state
            .entries
            .iter()
            .filter(|entry| entry.health.is_blocked(now))
            .count();
        let mean_success_rate = if total == 0 {
            0.0
        } else {
            state
                .entries
                .iter()
                .map(|entry| entry.health.success_rate())
                .sum::<f64>()
                / total as f64
        };

        PoolStats {
            total,
            healthy,
            blocked,
            mean_success_rate,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    const MINUTE: Duration = Duration::from_secs(60);

    fn endpoint(host: &str) -> ProxyEndpoint {
        ProxyEndpoint::new(ProxyScheme::Socks5, host, 1080)
    }

    fn pool(hosts: &[&str], strategy: RotationStrategy) -> ProxyPool {
        ProxyPool::with_endpoints(hosts.iter().map(|h| endpoint(h)), strategy)
    }

    #[test]
    fn empty_pool_selects_nothing() {
        let pool = ProxyPool::new(RotationStrategy::Smart);
        assert!(pool.select().is_none());
    }

    #[test]
    fn deduplicates_by_identity() {
        let pool = pool(&["1.1.1.1"], RotationStrategy::Smart);
        assert!(!pool.add_endpoint(endpoint("1.1.1.1").with_credentials("u", "p")));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn counters_stay_consistent() {
        let pool = pool(&["1.1.1.1"], RotationStrategy::Smart);
        let ep = endpoint("1.1.1.1");
        let pattern = [true, false, true, true, false, false, true];
        for success in pattern {
            pool.report(&ep, success, Duration::from_millis(500), None)
                .unwrap();
        }
        let health = pool.health(&ep).unwrap();
        assert_eq!(health.total_attempts(), 7);
        assert_eq!(
            health.total_attempts(),
            health.success_count() + health.failure_count()
        );
        let expected = health.success_count() as f64 / health.total_attempts() as f64;
        assert!((health.success_rate() - expected).abs() < f64::EPSILON);
    }

    #[test]
    fn blocked_endpoint_is_skipped() {
        let pool = pool(&["1.1.1.1", "2.2.2.2"], RotationStrategy::Random);
        let now = Instant::now();
        let bad = endpoint("1.1.1.1");
        for _ in 0..3 {
            pool.report_at(&bad, false, Duration::ZERO, Some(ErrorKind::Forbidden), now)
                .unwrap();
        }
        for _ in 0..20 {
            let lease = pool.select_at(RotationStrategy::Random, now).unwrap();
            assert_eq!(lease.endpoint(), &endpoint("2.2.2.2"));
        }
        let stats = pool.stats_at(now);
        assert_eq!(stats.blocked, 1);
        assert_eq!(stats.healthy, 1);
    }

    #[test]
    fn block_expires_lazily() {
        let pool = pool(&["1.1.1.1"], RotationStrategy::Smart);
        let now = Instant::now();
        let ep = endpoint("1.1.1.1");
        for _ in 0..3 {
            pool.report_at(&ep, false, Duration::ZERO, None, now).unwrap();
        }
        assert_eq!(pool.stats_at(now + 10 * MINUTE).healthy, 0);
        let later = pool.stats_at(now + 16 * MINUTE);
        assert_eq!(later.healthy, 1);
        assert_eq!(later.blocked, 0);
        assert_eq!(pool.health(&ep).unwrap().consecutive_failures(), 0);
    }

    #[test]
    fn all_unhealthy_triggers_reset() {
        let pool = pool(&["1.1.1.1", "2.2.2.2"], RotationStrategy::Smart);
        let now = Instant::now();
        for host in ["1.1.1.1", "2.2.2.2"] {
            for _ in 0..3 {
                pool.report_at(&endpoint(host), false, Duration::ZERO, None, now)
                    .unwrap();
            }
        }
        assert_eq!(pool.stats_at(now).healthy, 0);
        assert!(pool.select_at(RotationStrategy::Smart, now).is_some());
        let stats = pool.stats_at(now);
        assert_eq!(stats.blocked, 0);
        assert_eq!(stats.healthy, 2);
    }

    #[test]
    fn smart_prefers_top_scorer_in_small_pools() {
        let pool = pool(&["1.1.1.1", "2.2.2.2", "3.3.3.3"], RotationStrategy::Smart);
        let now = Instant::now();
        pool.report_at(&endpoint("1.1.1.1"), true, Duration::from_millis(200), None, now)
            .unwrap();
        pool.report_at(&endpoint("2.2.2.2"), false, Duration::ZERO, None, now)
            .unwrap();
        pool.report_at(&endpoint("3.3.3.3"), true, Duration::from_secs(4), None, now)
            .unwrap();
        for _ in 0..10 {
            let lease = pool.select_at(RotationStrategy::Smart, now).unwrap();
            assert_eq!(lease.endpoint(), &endpoint("1.1.1.1"));
        }
    }

    #[test]
    fn smart_spreads_within_top_third() {
        let hosts: Vec<String> = (1..=9).map(|i| format!("10.0.0.{i}")).collect();
        let refs: Vec<&str> = hosts.iter().map(String::as_str).collect();
        let pool = pool(&refs, RotationStrategy::Smart);
        let seen: HashSet<String> = (0..200)
            .filter_map(|_| pool.select())
            .map(|lease| lease.endpoint().host().to_string())
            .collect();
        assert!(seen.len() <= 3);
        assert!(!seen.is_empty());
    }

    #[test]
    fn round_robin_cycles() {
        let pool = pool(&["1.1.1.1", "2.2.2.2"], RotationStrategy::RoundRobin);
        let picks: Vec<String> = (0..4)
            .filter_map(|_| pool.select())
            .map(|lease| lease.endpoint().host().to_string())
            .collect();
        assert_eq!(picks, vec!["1.1.1.1", "2.2.2.2", "1.1.1.1", "2.2.2.2"]);
    }

    #[test]
    fn session_pins_until_unhealthy() {
        let pool = pool(&["1.1.1.1", "2.2.2.2"], RotationStrategy::Session);
        let now = Instant::now();
        let first = pool.select_at(RotationStrategy::Session, now).unwrap();
        for _ in 0..5 {
            let again = pool.select_at(RotationStrategy::Session, now).unwrap();
            assert_eq!(again.endpoint(), first.endpoint());
        }
        for _ in 0..3 {
            pool.report_at(first.endpoint(), false, Duration::ZERO, None, now)
                .unwrap();
        }
        let next = pool.select_at(RotationStrategy::Session, now).unwrap();
        assert_ne!(next.endpoint(), first.endpoint());
    }

    #[test]
    fn raw_report_double_counts() {
        let pool = pool(&["1.1.1.1"], RotationStrategy::Smart);
        let ep = endpoint("1.1.1.1");
        pool.report(&ep, true, Duration::from_secs(1), None).unwrap();
        pool.report(&ep, true, Duration::from_secs(1), None).unwrap();
        assert_eq!(pool.health(&ep).unwrap().total_attempts(), 2);
    }

    #[test]
    fn second_lease_report_is_rejected() {
        let pool = pool(&["1.1.1.1"], RotationStrategy::Smart);
        let lease = pool.select().unwrap();
        pool.report_lease(&lease, true, Duration::from_secs(1), None)
            .unwrap();
        let err = pool
            .report_lease(&lease, true, Duration::from_secs(1), None)
            .unwrap_err();
        assert!(matches!(err, ProxyPoolError::AlreadyReported(id) if id == lease.id()));
        assert_eq!(pool.health(lease.endpoint()).unwrap().total_attempts(), 1);
    }

    #[test]
    fn raw_report_settles_the_oldest_lease() {
        let pool = pool(&["1.1.1.1"], RotationStrategy::Smart);
        let first = pool.select().unwrap();
        let second = pool.select().unwrap();
        assert_eq!(pool.outstanding_leases(), 2);

        pool.report(first.endpoint(), true, Duration::from_secs(1), None)
            .unwrap();
        assert_eq!(pool.outstanding_leases(), 1);
        assert!(matches!(
            pool.report_lease(&first, true, Duration::from_secs(1), None),
            Err(ProxyPoolError::AlreadyReported(_))
        ));
        pool.report_lease(&second, false, Duration::ZERO, None)
            .unwrap();
        assert_eq!(pool.outstanding_leases(), 0);
        assert_eq!(pool.health(first.endpoint()).unwrap().total_attempts(), 2);
    }

    #[test]
    fn unknown_endpoint_is_an_error() {
        let pool = pool(&["1.1.1.1"], RotationStrategy::Smart);
        let err = pool
            .report(&endpoint("9.9.9.9"), true, Duration::ZERO, None)
            .unwrap_err();
        assert!(matches!(err, ProxyPoolError::UnknownEndpoint(_)));
    }

    #[test]
    fn parses_strategy_names() {
        assert_eq!("round_robin".parse::<RotationStrategy>().unwrap(), RotationStrategy::RoundRobin);
        assert_eq!("SESSION".parse::<RotationStrategy>().unwrap(), RotationStrategy::Session);
        assert!("fastest".parse::<RotationStrategy>().is_err());
    }

    #[test]
    fn missing_file_means_empty_pool() {
        let pool = ProxyPool::from_file("/nonexistent/proxies.txt", RotationStrategy::Smart).unwrap();
        assert!(pool.is_empty());
    }
}
