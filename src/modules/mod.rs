//! Cross-cutting services module
//!
//! Proxy rotation with health scoring, stealth fingerprints, run events and
//! metrics shared by the orchestrator.

pub mod events;
pub mod metrics;
pub mod proxy;
pub mod stealth;

// Re-export commonly used types
pub use events::{
    AttemptEvent, DomFallbackEvent, ErrorEvent, EventDispatcher, EventHandler, LoggingHandler,
    MetricsHandler, NavigationEvent, ProxySelectedEvent, ScrapeEvent, SessionStartedEvent,
    WatcherResolvedEvent,
};
pub use metrics::{GlobalStats, KeyStats, MetricsCollector, MetricsSnapshot};
pub use proxy::{
    PoolStats, ProbeError, ProbeReport, ProxyEndpoint, ProxyHealth, ProxyLease, ProxyParseError,
    ProxyPool, ProxyPoolError, ProxyProbe, ProxyScheme, RotationStrategy,
};
pub use stealth::{StealthProfile, StealthProvider, Viewport};
