//! # catalog-scraper
//!
//! Headless-browser scraping of storefront catalogs by intercepting the API
//! responses the page itself fetches, rather than parsing markup.
//!
//! ## Features
//!
//! - Proxy pool with health scoring, blocking windows and rotation strategies
//! - Randomised, self-consistent stealth browser profiles
//! - Concurrent response watchers raced against navigation, with per-operation
//!   and overall timeouts
//! - Typed per-key outcomes with a stable caller-facing JSON shape
//! - DOM fallback when interception captures nothing
//! - Chromium backend behind the `chromium` feature
//!
//! ## Example
//!
//! ```no_run
//! # #[cfg(feature = "chromium")]
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! use catalog_scraper::{ScrapeOrchestrator, ScrapeSettings, ScrapeOrchestratorBuilder, ScrapeTarget};
//!
//! let settings = ScrapeSettings::from_env()?;
//! let orchestrator = ScrapeOrchestratorBuilder::from_settings(&settings)?.build()?;
//! let report = orchestrator
//!     .run("https://shop.example/store/pizzaria-bella", &ScrapeTarget::shop_all())
//!     .await?;
//! println!("{}", report.to_json());
//! # Ok(())
//! # }
//! ```

mod orchestrator;

pub mod capture;
pub mod config;
pub mod external_deps;
pub mod modules;

pub use crate::orchestrator::{
    OrchestratorConfig,
    OrchestratorError,
    OrchestratorResult,
    RunStage,
    ScrapeOrchestrator,
    ScrapeOrchestratorBuilder,
    clean_url,
};

pub use crate::capture::{
    CapturedResponse,
    ErrorKind,
    MENU_KEY,
    RESPONSE_MISSING_MESSAGE,
    ResponseClassifier,
    SHOP_INFO_KEY,
    ScrapeFailure,
    ScrapeOutcome,
    ScrapeReport,
    ScrapeTarget,
    TargetError,
    WatchResult,
};

pub use crate::config::{ConfigError, ScrapeSettings};

pub use crate::external_deps::browser::{
    BrowserError,
    BrowserLauncher,
    BrowserSession,
    LaunchOptions,
    LaunchStrategy,
    ResponseWatcher,
    WatchSender,
};

#[cfg(feature = "chromium")]
pub use crate::external_deps::browser::ChromiumLauncher;

pub use crate::external_deps::dom_fallback::{DomFallbackExtractor, HtmlMetadataExtractor};

pub use crate::modules::{
    EventDispatcher,
    EventHandler,
    KeyStats,
    LoggingHandler,
    MetricsCollector,
    MetricsHandler,
    MetricsSnapshot,
    PoolStats,
    ProxyEndpoint,
    ProxyHealth,
    ProxyLease,
    ProxyPool,
    ProxyPoolError,
    ProxyProbe,
    ProxyScheme,
    RotationStrategy,
    ScrapeEvent,
    StealthProfile,
    StealthProvider,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
