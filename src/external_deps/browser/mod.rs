//! Browser automation contract.
//!
//! The orchestrator only talks to a browser through [`BrowserLauncher`] and
//! [`BrowserSession`]: launch with a proxy and argument list, apply a
//! stealth profile, register response watchers, navigate, read the rendered
//! DOM and close. Any automation backend can sit behind these traits.

#[cfg(feature = "chromium")]
pub mod chromium;

use std::path::PathBuf;

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::oneshot;
use url::Url;

use crate::capture::{CapturedResponse, ErrorKind};
use crate::modules::proxy::ProxyEndpoint;
use crate::modules::stealth::StealthProfile;

#[cfg(feature = "chromium")]
pub use chromium::ChromiumLauncher;

#[derive(Debug, Error, Clone)]
pub enum BrowserError {
    #[error("browser launch failed: {0}")]
    Launch(String),
    #[error("browser executable not found: {0}")]
    ExecutableNotFound(String),
    #[error("navigation failed: {0}")]
    Navigation(String),
    #[error("browser disconnected")]
    Disconnected,
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("browser ran out of resources: {0}")]
    ResourceExhausted(String),
    #[error("browser operation timed out after {0:?}")]
    Timeout(std::time::Duration),
}

impl BrowserError {
    /// Taxonomy entry used when this error sinks a whole run.
    pub fn kind(&self) -> ErrorKind {
        match self {
            BrowserError::ResourceExhausted(_) => ErrorKind::MemoryError,
            _ => ErrorKind::BrowserError,
        }
    }
}

/// One way of starting a browser. Strategies are tried in order until one
/// launches.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LaunchStrategy {
    pub name: String,
    /// `None` lets the backend locate its own executable.
    #[serde(default)]
    pub executable: Option<PathBuf>,
    #[serde(default)]
    pub extra_args: Vec<String>,
}

impl LaunchStrategy {
    pub fn bundled() -> Self {
        Self {
            name: "bundled".into(),
            executable: None,
            extra_args: Vec::new(),
        }
    }

    pub fn executable(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            name: path.display().to_string(),
            executable: Some(path),
            extra_args: Vec::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra_args.extend(args.into_iter().map(Into::into));
        self
    }
}

impl Default for LaunchStrategy {
    fn default() -> Self {
        Self::bundled()
    }
}

#[derive(Debug, Clone, Default)]
pub struct LaunchOptions {
    pub headless: bool,
    pub args: Vec<String>,
    pub proxy: Option<ProxyEndpoint>,
    pub executable: Option<PathBuf>,
}

/// Pending "first response matching a pattern". Dropping the sending half
/// resolves the watcher with [`BrowserError::Disconnected`].
#[derive(Debug)]
pub struct ResponseWatcher {
    rx: oneshot::Receiver<Result<CapturedResponse, BrowserError>>,
}

/// Sending half held by the backend until a matching response arrives.
pub type WatchSender = oneshot::Sender<Result<CapturedResponse, BrowserError>>;

impl ResponseWatcher {
    pub fn channel() -> (WatchSender, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx })
    }

    /// Watcher that is already resolved.
    pub fn ready(result: Result<CapturedResponse, BrowserError>) -> Self {
        let (tx, watcher) = Self::channel();
        let _ = tx.send(result);
        watcher
    }

    pub async fn wait(self) -> Result<CapturedResponse, BrowserError> {
        self.rx.await.unwrap_or(Err(BrowserError::Disconnected))
    }
}

#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    async fn launch(&self, options: &LaunchOptions) -> Result<Box<dyn BrowserSession>, BrowserError>;
}

/// An isolated page owned by one run.
#[async_trait]
pub trait BrowserSession: Send + Sync {
    async fn apply_profile(&self, profile: &StealthProfile) -> Result<(), BrowserError>;

    /// Registers interception synchronously; the returned watcher resolves
    /// with the first response whose URL matches `pattern`.
    fn watch_response(&self, pattern: &Regex) -> ResponseWatcher;

    async fn navigate(&self, url: &Url) -> Result<(), BrowserError>;

    /// Rendered document HTML.
    async fn content(&self) -> Result<String, BrowserError>;

    async fn close(&self) -> Result<(), BrowserError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dropped_sender_disconnects() {
        let (tx, watcher) = ResponseWatcher::channel();
        drop(tx);
        assert!(matches!(watcher.wait().await, Err(BrowserError::Disconnected)));
    }

    #[tokio::test]
    async fn ready_watcher_resolves() {
        let watcher = ResponseWatcher::ready(Ok(CapturedResponse::new("https://a/b", 200, "{}")));
        assert_eq!(watcher.wait().await.unwrap().status, 200);
    }

    #[test]
    fn resource_exhaustion_maps_to_memory_error() {
        assert_eq!(
            BrowserError::ResourceExhausted("oom".into()).kind(),
            ErrorKind::MemoryError
        );
        assert_eq!(
            BrowserError::ExecutableNotFound("chrome".into()).kind(),
            ErrorKind::BrowserError
        );
    }

    #[test]
    fn executable_strategy_is_named_after_path() {
        let strategy = LaunchStrategy::executable("/usr/bin/chromium").with_args(["--foo"]);
        assert_eq!(strategy.name, "/usr/bin/chromium");
        assert_eq!(strategy.extra_args, vec!["--foo".to_string()]);
    }
}
