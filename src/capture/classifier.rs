//! Response classification.
//!
//! Turns whatever a watcher produced into exactly one [`ScrapeOutcome`].
//! Classification is pure: it only reads the already-buffered body.

use serde_json::Value;

use super::types::{CapturedResponse, ErrorKind, ScrapeFailure, ScrapeOutcome, WatchResult};

pub const RESPONSE_MISSING_MESSAGE: &str = "no matching response captured";

/// Stateless classifier applied once per target key.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResponseClassifier;

impl ResponseClassifier {
    pub fn new() -> Self {
        Self
    }

    pub fn classify(&self, key: &str, result: &WatchResult) -> ScrapeOutcome {
        match result {
            WatchResult::TimedOut => {
                ScrapeOutcome::failure(ErrorKind::ResponseMissing, RESPONSE_MISSING_MESSAGE)
            }
            WatchResult::Failed(reason) => {
                log::debug!("watcher for '{key}' failed: {reason}");
                ScrapeOutcome::failure(
                    ErrorKind::ResponseMissing,
                    format!("{RESPONSE_MISSING_MESSAGE} ({reason})"),
                )
            }
            WatchResult::Captured(response) => self.classify_response(key, response),
        }
    }

    fn classify_response(&self, key: &str, response: &CapturedResponse) -> ScrapeOutcome {
        log::info!(
            "captured '{key}' response: {} [status {}]",
            response.url,
            response.status
        );

        if response.status == 403 {
            return ScrapeOutcome::Failure(
                ScrapeFailure::new(
                    ErrorKind::Forbidden,
                    format!("egress blocked or refused while fetching '{key}'"),
                )
                .with_status(403),
            );
        }

        if !response.is_ok() {
            return ScrapeOutcome::Failure(
                ScrapeFailure::new(
                    ErrorKind::ApiError,
                    format!("'{key}' API returned status {}", response.status),
                )
                .with_status(response.status),
            );
        }

        match serde_json::from_slice::<Value>(&response.body) {
            Ok(payload) => ScrapeOutcome::Success(payload),
            Err(err) => ScrapeOutcome::failure(ErrorKind::ParseError, err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn captured(status: u16, body: &'static str) -> WatchResult {
        WatchResult::Captured(CapturedResponse::new(
            "https://api.example.com/merchants/1/catalog",
            status,
            body,
        ))
    }

    #[test]
    fn timeout_is_response_missing() {
        let outcome = ResponseClassifier::new().classify("menu", &WatchResult::TimedOut);
        let failure = outcome.as_failure().unwrap();
        assert_eq!(failure.kind, ErrorKind::ResponseMissing);
        assert_eq!(failure.message, RESPONSE_MISSING_MESSAGE);
        assert_eq!(failure.status, None);
    }

    #[test]
    fn watcher_error_is_response_missing() {
        let outcome = ResponseClassifier::new()
            .classify("menu", &WatchResult::Failed("page closed".into()));
        assert_eq!(outcome.error_kind(), Some(ErrorKind::ResponseMissing));
    }

    #[test]
    fn forbidden_beats_body_parsing() {
        let outcome = ResponseClassifier::new().classify("menu", &captured(403, "{}"));
        let failure = outcome.as_failure().unwrap();
        assert_eq!(failure.kind, ErrorKind::Forbidden);
        assert_eq!(failure.status, Some(403));
    }

    #[test]
    fn non_2xx_is_api_error() {
        let outcome = ResponseClassifier::new().classify("menu", &captured(503, "{}"));
        let failure = outcome.as_failure().unwrap();
        assert_eq!(failure.kind, ErrorKind::ApiError);
        assert_eq!(failure.status, Some(503));
    }

    #[test]
    fn malformed_body_is_parse_error() {
        let outcome = ResponseClassifier::new().classify("menu", &captured(200, "<html>"));
        assert_eq!(outcome.error_kind(), Some(ErrorKind::ParseError));
    }

    #[test]
    fn valid_body_is_success() {
        let outcome =
            ResponseClassifier::new().classify("menu", &captured(200, r#"{"data":{"menu":[]}}"#));
        assert_eq!(outcome.payload(), Some(&json!({"data": {"menu": []}})));
    }
}
