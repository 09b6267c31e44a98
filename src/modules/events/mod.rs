//! Event system for scrape runs.
//!
//! Provides hooks for metrics, logging, and custom reactions around each
//! stage of a run: proxy choice, session start, watcher resolution,
//! navigation, and the final attempt verdict.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use super::metrics::MetricsCollector;
use crate::capture::{ErrorKind, ScrapeOutcome};

#[derive(Debug, Clone)]
pub struct ProxySelectedEvent {
    /// `None` when the run egresses directly.
    pub proxy: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct SessionStartedEvent {
    pub strategy: String,
    pub profile: String,
    pub elapsed: Duration,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct WatcherResolvedEvent {
    pub key: String,
    pub success: bool,
    pub error_kind: Option<ErrorKind>,
    pub status: Option<u16>,
    pub elapsed: Duration,
    pub timestamp: DateTime<Utc>,
}

impl WatcherResolvedEvent {
    pub fn from_outcome(key: &str, outcome: &ScrapeOutcome, elapsed: Duration) -> Self {
        let failure = outcome.as_failure();
        Self {
            key: key.to_string(),
            success: outcome.is_success(),
            error_kind: failure.map(|f| f.kind),
            status: failure.and_then(|f| f.status),
            elapsed,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NavigationEvent {
    pub url: Url,
    pub error: Option<String>,
    pub elapsed: Duration,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct AttemptEvent {
    pub url: Url,
    pub proxy: Option<String>,
    pub success: bool,
    pub error_kind: Option<ErrorKind>,
    pub elapsed: Duration,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct DomFallbackEvent {
    pub filled: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ErrorEvent {
    pub stage: &'static str,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

impl ErrorEvent {
    pub fn new(stage: &'static str, error: impl ToString) -> Self {
        Self {
            stage,
            error: error.to_string(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum ScrapeEvent {
    ProxySelected(ProxySelectedEvent),
    SessionStarted(SessionStartedEvent),
    WatcherResolved(WatcherResolvedEvent),
    NavigationFinished(NavigationEvent),
    AttemptFinished(AttemptEvent),
    DomFallback(DomFallbackEvent),
    Error(ErrorEvent),
}

/// Trait implemented by event handlers.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &ScrapeEvent);
}

/// Dispatcher that broadcasts events to registered handlers.
#[derive(Default, Clone)]
pub struct EventDispatcher {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    pub fn register_handler(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn dispatch(&self, event: ScrapeEvent) {
        for handler in &self.handlers {
            handler.handle(&event);
        }
    }
}

/// Logs events using the `log` crate.
#[derive(Debug)]
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn handle(&self, event: &ScrapeEvent) {
        match event {
            ScrapeEvent::ProxySelected(selected) => match &selected.proxy {
                Some(proxy) => log::info!("using proxy {proxy}"),
                None => log::info!("no proxy available, connecting directly"),
            },
            ScrapeEvent::SessionStarted(started) => {
                log::debug!(
                    "browser session up via '{}' with profile {} ({:.2}s)",
                    started.strategy,
                    started.profile,
                    started.elapsed.as_secs_f64()
                );
            }
            ScrapeEvent::WatcherResolved(watcher) => {
                if watcher.success {
                    log::debug!(
                        "captured '{}' after {:.2}s",
                        watcher.key,
                        watcher.elapsed.as_secs_f64()
                    );
                } else {
                    log::debug!(
                        "'{}' failed with {} (status {:?})",
                        watcher.key,
                        watcher
                            .error_kind
                            .map(|kind| kind.as_str())
                            .unwrap_or("unknown"),
                        watcher.status
                    );
                }
            }
            ScrapeEvent::NavigationFinished(nav) => match &nav.error {
                None => log::debug!("-> {} ({:.2}s)", nav.url, nav.elapsed.as_secs_f64()),
                Some(err) => log::warn!("navigation to {} failed: {err}", nav.url),
            },
            ScrapeEvent::AttemptFinished(attempt) => {
                log::info!(
                    "scrape {} via {} success={} ({:.2}s)",
                    attempt.url,
                    attempt.proxy.as_deref().unwrap_or("direct"),
                    attempt.success,
                    attempt.elapsed.as_secs_f64()
                );
            }
            ScrapeEvent::DomFallback(fallback) => {
                log::info!("dom fallback filled {:?}", fallback.filled);
            }
            ScrapeEvent::Error(error) => {
                log::warn!("warning {} -> {}", error.stage, error.error);
            }
        }
    }
}

/// Metrics handler that feeds the metrics collector.
#[derive(Clone, Debug)]
pub struct MetricsHandler {
    metrics: MetricsCollector,
}

impl MetricsHandler {
    pub fn new(metrics: MetricsCollector) -> Self {
        Self { metrics }
    }
}

impl EventHandler for MetricsHandler {
    fn handle(&self, event: &ScrapeEvent) {
        match event {
            ScrapeEvent::WatcherResolved(watcher) => {
                self.metrics.record_capture(
                    &watcher.key,
                    watcher.success,
                    watcher.error_kind,
                    watcher.elapsed,
                );
            }
            ScrapeEvent::AttemptFinished(attempt) => {
                self.metrics
                    .record_attempt(attempt.success, attempt.elapsed);
            }
            _ => {}
        }
    }
}
