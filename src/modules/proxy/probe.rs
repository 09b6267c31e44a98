//! Reqwest-based proxy verification.
//!
//! Fetches an IP-echo endpoint through a proxy to confirm the egress path
//! works before a browser is pointed at it.

use std::time::{Duration, Instant};

use serde_json::Value;
use thiserror::Error;
use url::Url;

use super::{ProxyEndpoint, ProxyPool};
use crate::capture::ErrorKind;

const DEFAULT_CHECK_URL: &str = "https://httpbin.org/ip";
const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("probe transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("probe endpoint answered with status {0}")]
    Status(u16),
    #[error("invalid check url: {0}")]
    Url(#[from] url::ParseError),
}

impl ProbeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProbeError::Transport(err) if err.is_timeout() => ErrorKind::TimeoutError,
            ProbeError::Status(403) => ErrorKind::Forbidden,
            ProbeError::Status(_) => ErrorKind::ApiError,
            _ => ErrorKind::NetworkError,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProbeReport {
    /// Egress address as seen by the echo service, when it reports one.
    pub origin: Option<String>,
    pub latency: Duration,
}

#[derive(Debug, Clone)]
pub struct ProxyProbe {
    check_url: String,
    timeout: Duration,
}

impl ProxyProbe {
    pub fn new() -> Self {
        Self {
            check_url: DEFAULT_CHECK_URL.to_string(),
            timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }

    pub fn with_check_url(mut self, url: &str) -> Result<Self, ProbeError> {
        self.check_url = Url::parse(url)?.to_string();
        Ok(self)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn probe(&self, endpoint: &ProxyEndpoint) -> Result<ProbeReport, ProbeError> {
        let client = reqwest::Client::builder()
            .proxy(reqwest::Proxy::all(endpoint.proxy_url())?)
            .timeout(self.timeout)
            .build()?;

        let started = Instant::now();
        let response = client.get(&self.check_url).send().await?;
        let status = response.status().as_u16();
        if !response.status().is_success() {
            return Err(ProbeError::Status(status));
        }
        let body: Value = response.json().await.unwrap_or(Value::Null);
        let latency = started.elapsed();

        Ok(ProbeReport {
            origin: parse_origin(&body),
            latency,
        })
    }

    /// Probes every endpoint in turn and records each result as one attempt.
    pub async fn verify_pool(
        &self,
        pool: &ProxyPool,
    ) -> Vec<(ProxyEndpoint, Result<ProbeReport, ProbeError>)> {
        let mut results = Vec::new();
        for endpoint in pool.endpoints() {
            let result = self.probe(&endpoint).await;
            let recorded = match &result {
                Ok(report) => {
                    log::info!(
                        "proxy {endpoint} verified, egress ip {}",
                        report.origin.as_deref().unwrap_or("unknown")
                    );
                    pool.report(&endpoint, true, report.latency, None)
                }
                Err(err) => {
                    log::warn!("proxy {endpoint} failed verification: {err}");
                    pool.report(&endpoint, false, self.timeout, Some(err.kind()))
                }
            };
            if let Err(err) = recorded {
                log::error!("could not record probe result for {endpoint}: {err}");
            }
            results.push((endpoint, result));
        }
        results
    }
}

impl Default for ProxyProbe {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_origin(body: &Value) -> Option<String> {
    body.get("origin")
        .and_then(Value::as_str)
        .map(|origin| origin.split(',').next().unwrap_or(origin).trim().to_string())
        .filter(|origin| !origin.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::proxy::{ProxyScheme, RotationStrategy};
    use serde_json::json;

    #[test]
    fn extracts_first_origin() {
        assert_eq!(
            parse_origin(&json!({"origin": "1.2.3.4, 10.0.0.1"})),
            Some("1.2.3.4".to_string())
        );
        assert_eq!(parse_origin(&json!({"ip": "1.2.3.4"})), None);
    }

    #[tokio::test]
    async fn unreachable_proxy_is_recorded_as_failure() {
        let endpoint = ProxyEndpoint::new(ProxyScheme::Http, "127.0.0.1", 9);
        let pool = ProxyPool::with_endpoints([endpoint.clone()], RotationStrategy::Smart);
        let probe = ProxyProbe::new()
            .with_check_url("http://127.0.0.1:9/ip")
            .unwrap()
            .with_timeout(Duration::from_secs(2));

        let results = probe.verify_pool(&pool).await;
        assert_eq!(results.len(), 1);
        assert!(results[0].1.is_err());

        let health = pool.health(&endpoint).unwrap();
        assert_eq!(health.total_attempts(), 1);
        assert_eq!(health.failure_count(), 1);
    }
}
