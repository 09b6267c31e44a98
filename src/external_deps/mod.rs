//! Integrations that rely on outside tooling.
//!
//! This module groups the browser automation contract (and its Chromium
//! backend) and the DOM fallback extractors that read rendered pages.

pub mod browser;
pub mod dom_fallback;

pub use browser::{
    BrowserError, BrowserLauncher, BrowserSession, LaunchOptions, LaunchStrategy, ResponseWatcher,
};
pub use dom_fallback::{DomFallbackExtractor, HtmlMetadataExtractor};
