use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::external_deps::browser::LaunchStrategy;
use crate::modules::proxy::{
    ProxyEndpoint, ProxyPool, ProxyPoolError, ProxyScheme, RotationStrategy,
};

const DEFAULT_CLOUD_PROXY_PORT: u16 = 1080;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read settings file: {0}")]
    Io(#[from] io::Error),
    #[error("invalid settings json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid value for {name}: {reason}")]
    InvalidValue { name: &'static str, reason: String },
    #[error("{0} must be greater than zero")]
    ZeroTimeout(&'static str),
    #[error("at least one launch strategy is required")]
    NoLaunchStrategy,
    #[error("failed to build proxy pool: {0}")]
    Pool(#[from] ProxyPoolError),
}

/// Runtime settings for a scraper deployment.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScrapeSettings {
    pub proxy_file: PathBuf,
    pub rotation_strategy: RotationStrategy,
    #[serde(rename = "watcher_timeout_ms", with = "duration_ms")]
    pub watcher_timeout: Duration,
    #[serde(rename = "navigation_timeout_ms", with = "duration_ms")]
    pub navigation_timeout: Duration,
    #[serde(rename = "launch_timeout_ms", with = "duration_ms")]
    pub launch_timeout: Duration,
    /// Hard ceiling across every awaited operation of one run.
    #[serde(rename = "overall_timeout_ms", with = "duration_ms")]
    pub overall_timeout: Duration,
    pub headless: bool,
    pub strip_query: bool,
    pub enable_metrics: bool,
    pub enable_dom_fallback: bool,
    pub launch_strategies: Vec<LaunchStrategy>,
    /// When set, the pool holds this endpoint only.
    pub cloud_proxy: Option<ProxyEndpoint>,
}

impl Default for ScrapeSettings {
    fn default() -> Self {
        Self {
            proxy_file: PathBuf::from("proxies.txt"),
            rotation_strategy: RotationStrategy::Smart,
            watcher_timeout: Duration::from_secs(25),
            navigation_timeout: Duration::from_secs(15),
            launch_timeout: Duration::from_secs(30),
            overall_timeout: Duration::from_secs(60),
            headless: true,
            strip_query: true,
            enable_metrics: true,
            enable_dom_fallback: true,
            launch_strategies: vec![LaunchStrategy::bundled()],
            cloud_proxy: None,
        }
    }
}

impl ScrapeSettings {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let settings: Self = serde_json::from_str(json)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    /// Defaults overridden by process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`ScrapeSettings::from_env`] with an explicit variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let mut settings = Self::default();

        if let Some(path) = var("PROXY_FILE") {
            settings.proxy_file = PathBuf::from(path);
        }
        if let Some(strategy) = var("PROXY_ROTATION_STRATEGY") {
            settings.rotation_strategy =
                strategy.parse().map_err(|err: ProxyPoolError| ConfigError::InvalidValue {
                    name: "PROXY_ROTATION_STRATEGY",
                    reason: err.to_string(),
                })?;
        }
        if let Some(ms) = var("SCRAPER_WATCHER_TIMEOUT_MS") {
            settings.watcher_timeout = parse_millis("SCRAPER_WATCHER_TIMEOUT_MS", &ms)?;
        }
        if let Some(ms) = var("SCRAPER_NAVIGATION_TIMEOUT_MS") {
            settings.navigation_timeout = parse_millis("SCRAPER_NAVIGATION_TIMEOUT_MS", &ms)?;
        }
        if let Some(ms) = var("SCRAPER_LAUNCH_TIMEOUT_MS") {
            settings.launch_timeout = parse_millis("SCRAPER_LAUNCH_TIMEOUT_MS", &ms)?;
        }
        if let Some(ms) = var("SCRAPER_OVERALL_TIMEOUT_MS") {
            settings.overall_timeout = parse_millis("SCRAPER_OVERALL_TIMEOUT_MS", &ms)?;
        }
        if let Some(flag) = var("SCRAPER_HEADLESS") {
            settings.headless = parse_bool("SCRAPER_HEADLESS", &flag)?;
        }
        if let Some(paths) = var("SCRAPER_BROWSER_PATHS") {
            settings.launch_strategies = paths
                .split(':')
                .map(str::trim)
                .filter(|path| !path.is_empty())
                .map(LaunchStrategy::executable)
                .collect();
        }

        settings.cloud_proxy = cloud_proxy_from(&var)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let timeouts = [
            ("watcher_timeout", self.watcher_timeout),
            ("navigation_timeout", self.navigation_timeout),
            ("launch_timeout", self.launch_timeout),
            ("overall_timeout", self.overall_timeout),
        ];
        if let Some((name, _)) = timeouts.iter().find(|(_, value)| value.is_zero()) {
            return Err(ConfigError::ZeroTimeout(*name));
        }
        if self.launch_strategies.is_empty() {
            return Err(ConfigError::NoLaunchStrategy);
        }
        Ok(())
    }

    /// Builds the pool: the cloud proxy alone when configured, otherwise the
    /// proxy file (missing file means an empty pool).
    pub fn build_pool(&self) -> Result<ProxyPool, ConfigError> {
        if let Some(endpoint) = &self.cloud_proxy {
            log::info!("using cloud proxy {endpoint}");
            return Ok(ProxyPool::with_endpoints(
                [endpoint.clone()],
                self.rotation_strategy,
            ));
        }
        Ok(ProxyPool::from_file(&self.proxy_file, self.rotation_strategy)?)
    }
}

fn cloud_proxy_from<F>(var: &F) -> Result<Option<ProxyEndpoint>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let host = var("CLOUD_PROXY_HOST");
    let username = var("CLOUD_PROXY_USERNAME");
    let password = var("CLOUD_PROXY_PASSWORD");

    let (Some(host), Some(username), Some(password)) = (host, username, password) else {
        return Ok(None);
    };

    let port = match var("CLOUD_PROXY_PORT") {
        Some(port) => port
            .parse::<u16>()
            .ok()
            .filter(|port| *port != 0)
            .ok_or_else(|| ConfigError::InvalidValue {
                name: "CLOUD_PROXY_PORT",
                reason: format!("'{port}' is not a valid port"),
            })?,
        None => DEFAULT_CLOUD_PROXY_PORT,
    };

    Ok(Some(
        ProxyEndpoint::new(ProxyScheme::Http, host, port).with_credentials(username, password),
    ))
}

fn parse_millis(name: &'static str, value: &str) -> Result<Duration, ConfigError> {
    value
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|err| ConfigError::InvalidValue {
            name,
            reason: err.to_string(),
        })
}

fn parse_bool(name: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ConfigError::InvalidValue {
            name,
            reason: format!("'{other}' is not a boolean"),
        }),
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
