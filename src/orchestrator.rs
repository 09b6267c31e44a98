//! High level scrape orchestration.
//!
//! Wires together proxy selection, stealth profiles, the browser session,
//! response interception and classification (plus metrics, events and the
//! DOM fallback) to turn one target URL into a map of named outcomes.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use thiserror::Error;
use tokio::time::{Instant, timeout_at};
use url::Url;

use crate::capture::{
	ErrorKind, ResponseClassifier, ScrapeOutcome, ScrapeReport, ScrapeTarget, WatchResult,
};
use crate::config::{ConfigError, ScrapeSettings};
use crate::external_deps::browser::{
	BrowserError, BrowserLauncher, BrowserSession, LaunchOptions, LaunchStrategy,
};
use crate::external_deps::dom_fallback::{DomFallbackExtractor, HtmlMetadataExtractor};
use crate::modules::events::{
	AttemptEvent, DomFallbackEvent, ErrorEvent, EventDispatcher, EventHandler, LoggingHandler,
	MetricsHandler, NavigationEvent, ProxySelectedEvent, ScrapeEvent, SessionStartedEvent,
	WatcherResolvedEvent,
};
use crate::modules::metrics::MetricsCollector;
use crate::modules::proxy::{ProxyEndpoint, ProxyLease, ProxyPool, RotationStrategy};
use crate::modules::stealth::{StealthProfile, StealthProvider};

/// Upper bound on closing a session.
const SESSION_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);
/// Time a close always gets, even when the run deadline has passed.
const SESSION_CLOSE_FLOOR: Duration = Duration::from_secs(1);
/// Stand-in for "no deadline", the same horizon tokio uses for its timers.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Result alias used across the orchestration layer.
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

/// Errors surfaced before any browser work starts. Everything after that is
/// reported per key inside [`ScrapeReport`].
#[derive(Debug, Error)]
pub enum OrchestratorError {
	#[error("url parse error: {0}")]
	Url(#[from] url::ParseError),
	#[error("settings error: {0}")]
	Config(#[from] ConfigError),
	#[error("no browser launcher configured")]
	MissingLauncher,
}

/// Stages one run moves through, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStage {
	Idle,
	ProxySelected,
	SessionStarting,
	Racing,
	Classifying,
	Reporting,
	DomFallback,
	Done,
}

impl RunStage {
	pub fn as_str(&self) -> &'static str {
		match self {
			RunStage::Idle => "idle",
			RunStage::ProxySelected => "proxy_selected",
			RunStage::SessionStarting => "session_starting",
			RunStage::Racing => "racing",
			RunStage::Classifying => "classifying",
			RunStage::Reporting => "reporting",
			RunStage::DomFallback => "dom_fallback",
			RunStage::Done => "done",
		}
	}
}

impl fmt::Display for RunStage {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Orchestrator configuration used by the builder.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
	pub watcher_timeout: Duration,
	pub navigation_timeout: Duration,
	pub launch_timeout: Duration,
	pub overall_timeout: Duration,
	pub headless: bool,
	pub strip_query: bool,
	pub enable_metrics: bool,
	pub launch_strategies: Vec<LaunchStrategy>,
}

impl Default for OrchestratorConfig {
	fn default() -> Self {
		let settings = ScrapeSettings::default();
		Self::from(&settings)
	}
}

impl From<&ScrapeSettings> for OrchestratorConfig {
	fn from(settings: &ScrapeSettings) -> Self {
		Self {
			watcher_timeout: settings.watcher_timeout,
			navigation_timeout: settings.navigation_timeout,
			launch_timeout: settings.launch_timeout,
			overall_timeout: settings.overall_timeout,
			headless: settings.headless,
			strip_query: settings.strip_query,
			enable_metrics: settings.enable_metrics,
			launch_strategies: settings.launch_strategies.clone(),
		}
	}
}

/// Fluent builder for [`ScrapeOrchestrator`].
pub struct ScrapeOrchestratorBuilder {
	config: OrchestratorConfig,
	pool: Option<Arc<ProxyPool>>,
	launcher: Option<Arc<dyn BrowserLauncher>>,
	dom_fallback: Option<Arc<dyn DomFallbackExtractor>>,
	handlers: Vec<Arc<dyn EventHandler>>,
}

impl ScrapeOrchestratorBuilder {
	pub fn new() -> Self {
		Self {
			config: OrchestratorConfig::default(),
			pool: None,
			launcher: None,
			dom_fallback: None,
			handlers: Vec::new(),
		}
	}

	/// Builder seeded from deployment settings: timeouts, launch strategies,
	/// the proxy pool and the generic DOM fallback when enabled.
	pub fn from_settings(settings: &ScrapeSettings) -> OrchestratorResult<Self> {
		settings.validate()?;
		let mut builder = Self::new();
		builder.config = OrchestratorConfig::from(settings);
		builder.pool = Some(Arc::new(settings.build_pool()?));
		if settings.enable_dom_fallback {
			builder.dom_fallback = Some(Arc::new(HtmlMetadataExtractor::new()));
		}
		Ok(builder)
	}

	pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
		self.config = config;
		self
	}

	pub fn with_pool(mut self, pool: Arc<ProxyPool>) -> Self {
		self.pool = Some(pool);
		self
	}

	pub fn with_launcher(mut self, launcher: Arc<dyn BrowserLauncher>) -> Self {
		self.launcher = Some(launcher);
		self
	}

	pub fn with_dom_fallback(mut self, extractor: Arc<dyn DomFallbackExtractor>) -> Self {
		self.dom_fallback = Some(extractor);
		self
	}

	pub fn without_dom_fallback(mut self) -> Self {
		self.dom_fallback = None;
		self
	}

	pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
		self.handlers.push(handler);
		self
	}

	pub fn with_watcher_timeout(mut self, timeout: Duration) -> Self {
		self.config.watcher_timeout = timeout;
		self
	}

	pub fn with_navigation_timeout(mut self, timeout: Duration) -> Self {
		self.config.navigation_timeout = timeout;
		self
	}

	pub fn with_launch_timeout(mut self, timeout: Duration) -> Self {
		self.config.launch_timeout = timeout;
		self
	}

	pub fn with_overall_timeout(mut self, timeout: Duration) -> Self {
		self.config.overall_timeout = timeout;
		self
	}

	pub fn with_launch_strategies<I>(mut self, strategies: I) -> Self
	where
		I: IntoIterator<Item = LaunchStrategy>,
	{
		self.config.launch_strategies = strategies.into_iter().collect();
		self
	}

	pub fn headless(mut self, headless: bool) -> Self {
		self.config.headless = headless;
		self
	}

	pub fn strip_query(mut self, strip: bool) -> Self {
		self.config.strip_query = strip;
		self
	}

	pub fn disable_metrics(mut self) -> Self {
		self.config.enable_metrics = false;
		self
	}

	pub fn build(self) -> OrchestratorResult<ScrapeOrchestrator> {
		let launcher = match self.launcher {
			Some(launcher) => launcher,
			None => default_launcher()?,
		};
		let pool = self
			.pool
			.unwrap_or_else(|| Arc::new(ProxyPool::new(RotationStrategy::default())));

		let metrics = self.config.enable_metrics.then(MetricsCollector::new);
		let mut events = EventDispatcher::new();
		events.register_handler(Arc::new(LoggingHandler));
		if let Some(ref collector) = metrics {
			events.register_handler(Arc::new(MetricsHandler::new(collector.clone())));
		}
		for handler in self.handlers {
			events.register_handler(handler);
		}

		Ok(ScrapeOrchestrator {
			config: self.config,
			pool,
			launcher,
			dom_fallback: self.dom_fallback,
			stealth: StealthProvider::new(),
			classifier: ResponseClassifier,
			metrics,
			events: Arc::new(events),
		})
	}
}

impl Default for ScrapeOrchestratorBuilder {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(feature = "chromium")]
fn default_launcher() -> OrchestratorResult<Arc<dyn BrowserLauncher>> {
	Ok(Arc::new(crate::external_deps::browser::ChromiumLauncher::new()))
}

#[cfg(not(feature = "chromium"))]
fn default_launcher() -> OrchestratorResult<Arc<dyn BrowserLauncher>> {
	Err(OrchestratorError::MissingLauncher)
}

/// Strips query string and fragment.
pub fn clean_url(url: &Url) -> Url {
	let mut cleaned = url.clone();
	cleaned.set_query(None);
	cleaned.set_fragment(None);
	cleaned
}

/// Executes scrape runs. Runs share nothing but the proxy pool, so one
/// orchestrator can serve concurrent callers.
pub struct ScrapeOrchestrator {
	config: OrchestratorConfig,
	pool: Arc<ProxyPool>,
	launcher: Arc<dyn BrowserLauncher>,
	dom_fallback: Option<Arc<dyn DomFallbackExtractor>>,
	stealth: StealthProvider,
	classifier: ResponseClassifier,
	metrics: Option<MetricsCollector>,
	events: Arc<EventDispatcher>,
}

impl ScrapeOrchestrator {
	/// Obtain a builder to customise the orchestrator instance.
	pub fn builder() -> ScrapeOrchestratorBuilder {
		ScrapeOrchestratorBuilder::new()
	}

	pub fn config(&self) -> &OrchestratorConfig {
		&self.config
	}

	pub fn pool(&self) -> &Arc<ProxyPool> {
		&self.pool
	}

	pub fn metrics(&self) -> Option<&MetricsCollector> {
		self.metrics.as_ref()
	}

	/// Runs one scrape bounded by the configured overall timeout.
	pub async fn run(&self, url: &str, target: &ScrapeTarget) -> OrchestratorResult<ScrapeReport> {
		self.run_with_timeout(url, target, self.config.overall_timeout).await
	}

	/// Runs one scrape: select a proxy, start a stealth session, race the
	/// navigation against one watcher per target key, classify, report the
	/// attempt to the pool once and fall back to the DOM when nothing was
	/// captured.
	///
	/// `overall_timeout` bounds launch, watchers, navigation and the fallback.
	/// Closing the session afterwards may overrun it by at most one second.
	/// `Duration::MAX` means no ceiling. Dropping the returned future before
	/// it reports still records the attempt as a failure.
	pub async fn run_with_timeout(
		&self,
		url: &str,
		target: &ScrapeTarget,
		overall_timeout: Duration,
	) -> OrchestratorResult<ScrapeReport> {
		let started = Instant::now();
		let deadline = deadline_after(started, overall_timeout);
		let mut url = Url::parse(url)?;
		if self.config.strip_query {
			url = clean_url(&url);
		}
		let mut stage = RunStage::Idle;

		let mut lease = LeaseGuard::new(&self.pool, self.pool.select(), started);
		let proxy = lease.endpoint().cloned();
		advance(&mut stage, RunStage::ProxySelected);
		self.events.dispatch(ScrapeEvent::ProxySelected(ProxySelectedEvent {
			proxy: proxy.as_ref().map(ProxyEndpoint::server_url),
			timestamp: Utc::now(),
		}));

		advance(&mut stage, RunStage::SessionStarting);
		let profile = self.stealth.random_profile();
		let session = match self.start_session(proxy.as_ref(), &profile, deadline).await {
			Ok(session) => session,
			Err(err) => {
				let kind = err.kind();
				self.events.dispatch(ScrapeEvent::Error(ErrorEvent::new(
					RunStage::SessionStarting.as_str(),
					&err,
				)));
				let outcomes = target
					.keys()
					.map(|key| {
						(
							key.to_string(),
							ScrapeOutcome::failure(
								kind,
								format!("browser session failed to start: {err}"),
							),
						)
					})
					.collect();
				advance(&mut stage, RunStage::Reporting);
				self.report(lease.take(), false, started.elapsed(), Some(kind));
				advance(&mut stage, RunStage::Done);
				return Ok(self.finish(&url, proxy, outcomes, started, false));
			}
		};

		advance(&mut stage, RunStage::Racing);
		let results = self.race(session.as_ref(), &url, target, started, deadline).await;

		advance(&mut stage, RunStage::Classifying);
		let mut outcomes = BTreeMap::new();
		for (key, result, elapsed) in results {
			let outcome = self.classifier.classify(&key, &result);
			self.events.dispatch(ScrapeEvent::WatcherResolved(
				WatcherResolvedEvent::from_outcome(&key, &outcome, elapsed),
			));
			outcomes.insert(key, outcome);
		}

		advance(&mut stage, RunStage::Reporting);
		let success = outcomes.values().any(ScrapeOutcome::is_success);
		let first_error = target
			.keys()
			.find_map(|key| outcomes.get(key).and_then(ScrapeOutcome::error_kind));
		self.report(lease.take(), success, started.elapsed(), first_error);

		let mut dom_fallback_used = false;
		if !success {
			if let Some(extractor) = &self.dom_fallback {
				advance(&mut stage, RunStage::DomFallback);
				self.apply_dom_fallback(extractor.as_ref(), session.as_ref(), target, deadline, &mut outcomes)
					.await;
				dom_fallback_used = true;
			}
		}

		release(session.as_ref(), deadline).await;
		advance(&mut stage, RunStage::Done);
		Ok(self.finish(&url, proxy, outcomes, started, dom_fallback_used))
	}

	/// Tries each launch strategy in order. Each attempt is bounded by the
	/// launch timeout and the overall deadline.
	async fn start_session(
		&self,
		proxy: Option<&ProxyEndpoint>,
		profile: &StealthProfile,
		deadline: Instant,
	) -> Result<Box<dyn BrowserSession>, BrowserError> {
		let launch_started = Instant::now();
		let mut last_error = BrowserError::Launch("no launch strategy configured".into());

		for strategy in &self.config.launch_strategies {
			let mut args = self.stealth.launch_args(profile);
			args.extend(strategy.extra_args.iter().cloned());
			let options = LaunchOptions {
				headless: self.config.headless,
				args,
				proxy: proxy.cloned(),
				executable: strategy.executable.clone(),
			};

			let bound = bounded(self.config.launch_timeout, deadline);
			let session = match timeout_at(bound, self.launcher.launch(&options)).await {
				Ok(Ok(session)) => session,
				Ok(Err(err)) => {
					log::warn!("launch strategy '{}' failed: {err}", strategy.name);
					last_error = err;
					continue;
				}
				Err(_) => {
					log::warn!("launch strategy '{}' timed out", strategy.name);
					last_error = BrowserError::Timeout(self.config.launch_timeout);
					continue;
				}
			};

			let applied = timeout_at(bound, session.apply_profile(profile))
				.await
				.unwrap_or(Err(BrowserError::Timeout(self.config.launch_timeout)));
			if let Err(err) = applied {
				release(session.as_ref(), deadline).await;
				return Err(err);
			}

			self.events.dispatch(ScrapeEvent::SessionStarted(SessionStartedEvent {
				strategy: strategy.name.clone(),
				profile: profile.name.to_string(),
				elapsed: launch_started.elapsed(),
				timestamp: Utc::now(),
			}));
			return Ok(session);
		}

		Err(last_error)
	}

	/// Registers every watcher, then navigates, then awaits all of them.
	/// Nothing is cancelled early; the overall deadline caps each wait.
	async fn race(
		&self,
		session: &dyn BrowserSession,
		url: &Url,
		target: &ScrapeTarget,
		started: Instant,
		deadline: Instant,
	) -> Vec<(String, WatchResult, Duration)> {
		let watchers: Vec<_> = target
			.iter()
			.map(|(key, pattern)| (key.to_string(), session.watch_response(pattern)))
			.collect();

		let watcher_deadline = bounded(self.config.watcher_timeout, deadline);
		let navigation_deadline = bounded(self.config.navigation_timeout, deadline);

		let watches = join_all(watchers.into_iter().map(|(key, watcher)| async move {
			let result = match timeout_at(watcher_deadline, watcher.wait()).await {
				Ok(Ok(response)) => WatchResult::Captured(response),
				Ok(Err(err)) => WatchResult::Failed(err.to_string()),
				Err(_) => WatchResult::TimedOut,
			};
			(key, result, started.elapsed())
		}));

		let navigation = async {
			let nav_started = Instant::now();
			let error = match timeout_at(navigation_deadline, session.navigate(url)).await {
				Ok(Ok(())) => None,
				Ok(Err(err)) => Some(err.to_string()),
				Err(_) => Some(format!(
					"timed out after {:.1}s",
					nav_started.elapsed().as_secs_f64()
				)),
			};
			self.events.dispatch(ScrapeEvent::NavigationFinished(NavigationEvent {
				url: url.clone(),
				error,
				elapsed: nav_started.elapsed(),
				timestamp: Utc::now(),
			}));
		};

		let (results, ()) = tokio::join!(watches, navigation);
		results
	}

	async fn apply_dom_fallback(
		&self,
		extractor: &dyn DomFallbackExtractor,
		session: &dyn BrowserSession,
		target: &ScrapeTarget,
		deadline: Instant,
		outcomes: &mut BTreeMap<String, ScrapeOutcome>,
	) {
		let keys: Vec<String> = target.keys().map(str::to_string).collect();
		let extracted = match timeout_at(deadline, extractor.extract(session, &keys)).await {
			Ok(extracted) => extracted,
			Err(_) => {
				self.events.dispatch(ScrapeEvent::Error(ErrorEvent::new(
					RunStage::DomFallback.as_str(),
					"dom fallback hit the overall deadline",
				)));
				keys.iter()
					.map(|key| {
						(
							key.clone(),
							ScrapeOutcome::failure(
								ErrorKind::DomFallbackError,
								"dom fallback hit the overall deadline",
							),
						)
					})
					.collect()
			}
		};

		let mut filled = Vec::new();
		for (key, candidate) in extracted {
			if !target.contains_key(&key) {
				continue;
			}
			let Some(current) = outcomes.get(&key) else {
				continue;
			};
			if !should_replace(current, &candidate) {
				continue;
			}
			if candidate.is_success() {
				filled.push(key.clone());
			}
			outcomes.insert(key, candidate);
		}

		filled.sort();
		self.events.dispatch(ScrapeEvent::DomFallback(DomFallbackEvent {
			filled,
			timestamp: Utc::now(),
		}));
	}

	fn report(
		&self,
		lease: Option<ProxyLease>,
		success: bool,
		elapsed: Duration,
		error_kind: Option<ErrorKind>,
	) {
		match lease {
			Some(lease) => {
				if let Err(err) = self.pool.report_lease(&lease, success, elapsed, error_kind) {
					self.events.dispatch(ScrapeEvent::Error(ErrorEvent::new(
						RunStage::Reporting.as_str(),
						err,
					)));
				}
			}
			None => log::debug!("direct egress attempt, no proxy health to update"),
		}
	}

	fn finish(
		&self,
		url: &Url,
		proxy: Option<ProxyEndpoint>,
		outcomes: BTreeMap<String, ScrapeOutcome>,
		started: Instant,
		dom_fallback_used: bool,
	) -> ScrapeReport {
		let proxy = proxy.as_ref().map(ProxyEndpoint::server_url);
		let elapsed = started.elapsed();
		let success = outcomes.values().any(ScrapeOutcome::is_success);
		let error_kind = outcomes.values().find_map(ScrapeOutcome::error_kind);

		self.events.dispatch(ScrapeEvent::AttemptFinished(AttemptEvent {
			url: url.clone(),
			proxy: proxy.clone(),
			success,
			error_kind: if success { None } else { error_kind },
			elapsed,
			timestamp: Utc::now(),
		}));

		ScrapeReport {
			outcomes,
			proxy,
			elapsed,
			dom_fallback_used,
		}
	}
}

/// A fallback result replaces an intercepted failure when it succeeded, or
/// when interception simply saw nothing.
fn should_replace(current: &ScrapeOutcome, candidate: &ScrapeOutcome) -> bool {
	if current.is_success() {
		return false;
	}
	candidate.is_success() || current.error_kind() == Some(ErrorKind::ResponseMissing)
}

/// Reports the lease as a failed attempt when a run is dropped before it
/// reached the reporting stage.
struct LeaseGuard<'a> {
	pool: &'a ProxyPool,
	lease: Option<ProxyLease>,
	started: Instant,
}

impl<'a> LeaseGuard<'a> {
	fn new(pool: &'a ProxyPool, lease: Option<ProxyLease>, started: Instant) -> Self {
		Self {
			pool,
			lease,
			started,
		}
	}

	fn endpoint(&self) -> Option<&ProxyEndpoint> {
		self.lease.as_ref().map(ProxyLease::endpoint)
	}

	fn take(&mut self) -> Option<ProxyLease> {
		self.lease.take()
	}
}

impl Drop for LeaseGuard<'_> {
	fn drop(&mut self) {
		let Some(lease) = self.lease.take() else {
			return;
		};
		log::warn!("run via {} dropped before reporting, recording a failure", lease.endpoint());
		if let Err(err) = self
			.pool
			.report_lease(&lease, false, self.started.elapsed(), None)
		{
			log::error!("could not record cancelled run: {err}");
		}
	}
}

fn deadline_after(start: Instant, timeout: Duration) -> Instant {
	start
		.checked_add(timeout)
		.or_else(|| start.checked_add(FAR_FUTURE))
		.unwrap_or(start)
}

fn bounded(timeout: Duration, deadline: Instant) -> Instant {
	deadline_after(Instant::now(), timeout).min(deadline)
}

fn advance(stage: &mut RunStage, next: RunStage) {
	log::trace!("run stage {stage} -> {next}");
	*stage = next;
}

/// Best-effort close, bounded by what is left of the run deadline but never
/// shorter than the floor nor longer than the cap. A failure is logged and
/// never retried.
async fn release(session: &dyn BrowserSession, deadline: Instant) {
	let now = Instant::now();
	let close_by = deadline
		.max(deadline_after(now, SESSION_CLOSE_FLOOR))
		.min(deadline_after(now, SESSION_CLOSE_TIMEOUT));
	match timeout_at(close_by, session.close()).await {
		Ok(Ok(())) => {}
		Ok(Err(err)) => log::warn!("browser session close failed: {err}"),
		Err(_) => log::warn!("browser session close timed out"),
	}
}
