//! Core data structures shared by the watchers, the classifier, and the
//! orchestrator.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

static MENU_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"merchants/.*/catalog").expect("valid menu pattern"));
static SHOP_INFO_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"merchant-info/graphql").expect("valid shop info pattern"));

pub const MENU_KEY: &str = "menu";
pub const SHOP_INFO_KEY: &str = "shop_info";

/// Fixed failure taxonomy surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
    ResponseMissing,
    Forbidden,
    #[serde(rename = "APIError")]
    ApiError,
    ParseError,
    BrowserError,
    NetworkError,
    TimeoutError,
    MemoryError,
    DomFallbackError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ResponseMissing => "ResponseMissing",
            ErrorKind::Forbidden => "Forbidden",
            ErrorKind::ApiError => "APIError",
            ErrorKind::ParseError => "ParseError",
            ErrorKind::BrowserError => "BrowserError",
            ErrorKind::NetworkError => "NetworkError",
            ErrorKind::TimeoutError => "TimeoutError",
            ErrorKind::MemoryError => "MemoryError",
            ErrorKind::DomFallbackError => "DomFallbackError",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure half of [`ScrapeOutcome`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScrapeFailure {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

impl ScrapeFailure {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }
}

/// Per-key result of one orchestration run.
#[derive(Debug, Clone, PartialEq)]
pub enum ScrapeOutcome {
    Success(Value),
    Failure(ScrapeFailure),
}

impl ScrapeOutcome {
    pub fn failure(kind: ErrorKind, message: impl Into<String>) -> Self {
        ScrapeOutcome::Failure(ScrapeFailure::new(kind, message))
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ScrapeOutcome::Success(_))
    }

    pub fn payload(&self) -> Option<&Value> {
        match self {
            ScrapeOutcome::Success(payload) => Some(payload),
            ScrapeOutcome::Failure(_) => None,
        }
    }

    pub fn as_failure(&self) -> Option<&ScrapeFailure> {
        match self {
            ScrapeOutcome::Success(_) => None,
            ScrapeOutcome::Failure(failure) => Some(failure),
        }
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.as_failure().map(|failure| failure.kind)
    }
}

#[derive(Serialize)]
struct OutcomeRepr<'a> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a ScrapeFailure>,
}

impl Serialize for ScrapeOutcome {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        OutcomeRepr {
            success: self.is_success(),
            payload: self.payload(),
            error: self.as_failure(),
        }
        .serialize(serializer)
    }
}

#[derive(Debug, Error)]
pub enum TargetError {
    #[error("duplicate target key '{0}'")]
    DuplicateKey(String),
    #[error("invalid pattern for '{key}': {source}")]
    InvalidPattern {
        key: String,
        #[source]
        source: regex::Error,
    },
}

/// Mapping from logical key to the URL pattern of the API response that
/// carries its data. Insertion order is kept for logging only.
#[derive(Debug, Clone, Default)]
pub struct ScrapeTarget {
    entries: Vec<(String, Regex)>,
}

impl ScrapeTarget {
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog API only.
    pub fn menu() -> Self {
        Self {
            entries: vec![(MENU_KEY.to_string(), MENU_PATTERN.clone())],
        }
    }

    /// Merchant info API only.
    pub fn shop_info() -> Self {
        Self {
            entries: vec![(SHOP_INFO_KEY.to_string(), SHOP_INFO_PATTERN.clone())],
        }
    }

    /// Catalog and merchant info in a single page load.
    pub fn shop_all() -> Self {
        Self {
            entries: vec![
                (MENU_KEY.to_string(), MENU_PATTERN.clone()),
                (SHOP_INFO_KEY.to_string(), SHOP_INFO_PATTERN.clone()),
            ],
        }
    }

    pub fn with_pattern(
        mut self,
        key: impl Into<String>,
        pattern: &str,
    ) -> Result<Self, TargetError> {
        let key = key.into();
        let regex = Regex::new(pattern).map_err(|source| TargetError::InvalidPattern {
            key: key.clone(),
            source,
        })?;
        self.insert(key, regex)?;
        Ok(self)
    }

    pub fn insert(&mut self, key: impl Into<String>, pattern: Regex) -> Result<(), TargetError> {
        let key = key.into();
        if self.entries.iter().any(|(existing, _)| *existing == key) {
            return Err(TargetError::DuplicateKey(key));
        }
        self.entries.push((key, pattern));
        Ok(())
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(key, _)| key.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Regex)> {
        self.entries.iter().map(|(key, pattern)| (key.as_str(), pattern))
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.iter().any(|(existing, _)| existing == key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A network response captured by a watcher, body already buffered.
#[derive(Debug, Clone)]
pub struct CapturedResponse {
    pub url: String,
    pub status: u16,
    pub body: Bytes,
}

impl CapturedResponse {
    pub fn new(url: impl Into<String>, status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            url: url.into(),
            status,
            body: body.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// What a single watcher produced once awaited.
#[derive(Debug, Clone)]
pub enum WatchResult {
    Captured(CapturedResponse),
    TimedOut,
    Failed(String),
}

/// Full result of one orchestration run.
#[derive(Debug, Clone)]
pub struct ScrapeReport {
    pub outcomes: BTreeMap<String, ScrapeOutcome>,
    pub proxy: Option<String>,
    pub elapsed: Duration,
    pub dom_fallback_used: bool,
}

impl ScrapeReport {
    pub fn get(&self, key: &str) -> Option<&ScrapeOutcome> {
        self.outcomes.get(key)
    }

    pub fn any_success(&self) -> bool {
        self.outcomes.values().any(ScrapeOutcome::is_success)
    }

    pub fn all_failed(&self) -> bool {
        !self.outcomes.is_empty() && !self.any_success()
    }

    /// Status for the caller when every key failed: a ban wins over other
    /// upstream statuses, which win over a generic 500.
    pub fn caller_error_status(&self) -> Option<u16> {
        if !self.all_failed() {
            return None;
        }

        let failures: Vec<&ScrapeFailure> = self
            .outcomes
            .values()
            .filter_map(ScrapeOutcome::as_failure)
            .collect();

        if failures.iter().any(|f| f.kind == ErrorKind::Forbidden) {
            return Some(403);
        }

        let upstream = failures
            .iter()
            .find(|f| f.kind == ErrorKind::ApiError)
            .and_then(|f| f.status);

        Some(upstream.unwrap_or(500))
    }

    /// Caller-facing shape: `{key: {success, payload?, error?}}`.
    pub fn to_json(&self) -> Value {
        serde_json::to_value(&self.outcomes).unwrap_or(Value::Null)
    }

    pub fn into_outcomes(self) -> BTreeMap<String, ScrapeOutcome> {
        self.outcomes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn report(outcomes: Vec<(&str, ScrapeOutcome)>) -> ScrapeReport {
        ScrapeReport {
            outcomes: outcomes
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
            proxy: None,
            elapsed: Duration::from_secs(1),
            dom_fallback_used: false,
        }
    }

    #[test]
    fn timeouts_alone_map_to_a_server_error() {
        let report = report(vec![
            ("menu", ScrapeOutcome::failure(ErrorKind::TimeoutError, "navigation timed out")),
            ("shop_info", ScrapeOutcome::failure(ErrorKind::TimeoutError, "navigation timed out")),
        ]);
        assert_eq!(report.caller_error_status(), Some(500));
    }

    #[test]
    fn rejects_duplicate_keys() {
        let err = ScrapeTarget::menu()
            .with_pattern("menu", "catalog")
            .unwrap_err();
        assert!(matches!(err, TargetError::DuplicateKey(key) if key == "menu"));
    }

    #[test]
    fn shop_all_preset_matches_known_endpoints() {
        let target = ScrapeTarget::shop_all();
        let patterns: Vec<_> = target.iter().collect();
        assert_eq!(patterns.len(), 2);
        assert!(patterns[0].1.is_match("https://x/api/v1/merchants/abc/catalog?lat=1"));
        assert!(patterns[1].1.is_match("https://x/merchant-info/graphql"));
    }

    #[test]
    fn serializes_caller_shape() {
        let ok = ScrapeOutcome::Success(json!({"items": []}));
        let failed = ScrapeOutcome::Failure(
            ScrapeFailure::new(ErrorKind::ApiError, "boom").with_status(502),
        );
        assert_eq!(
            serde_json::to_value(&ok).unwrap(),
            json!({"success": true, "payload": {"items": []}})
        );
        assert_eq!(
            serde_json::to_value(&failed).unwrap(),
            json!({"success": false, "error": {"kind": "APIError", "message": "boom", "status": 502}})
        );
    }

    #[test]
    fn caller_status_prefers_forbidden() {
        let r = report(vec![
            (
                "a",
                ScrapeOutcome::Failure(
                    ScrapeFailure::new(ErrorKind::ApiError, "x").with_status(502),
                ),
            ),
            (
                "b",
                ScrapeOutcome::Failure(
                    ScrapeFailure::new(ErrorKind::Forbidden, "y").with_status(403),
                ),
            ),
        ]);
        assert_eq!(r.caller_error_status(), Some(403));
    }

    #[test]
    fn caller_status_falls_back_to_500() {
        let r = report(vec![(
            "a",
            ScrapeOutcome::failure(ErrorKind::ResponseMissing, "none"),
        )]);
        assert_eq!(r.caller_error_status(), Some(500));
    }

    #[test]
    fn partial_success_has_no_caller_status() {
        let r = report(vec![
            ("a", ScrapeOutcome::Success(json!({}))),
            ("b", ScrapeOutcome::failure(ErrorKind::ResponseMissing, "none")),
        ]);
        assert!(r.any_success());
        assert_eq!(r.caller_error_status(), None);
    }
}
