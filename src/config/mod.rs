//! Settings and configuration module
//!
//! Provides deployment settings with:
//! - Defaults matching production values
//! - JSON loading
//! - Environment overrides
//! - Proxy pool construction (cloud proxy or proxy list file)

pub mod settings;

pub use settings::{ConfigError, ScrapeSettings};
