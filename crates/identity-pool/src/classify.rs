//! Retry classification for creation failures
//!
//! Distinguishes transient failures (timeouts, rate limits, upstream 5xx)
//! from permanent ones (bad request, rejected credentials). Only transient
//! failures keep the creation retry loop going; anything else aborts the
//! acquisition.

use std::future::Future;
use std::pin::Pin;

use crate::factory::{CreateError, ErrorClassifier};

/// Message fragments that mark a failure as transient.
const TRANSIENT_PATTERNS: &[&str] = &[
    "timeout",
    "timed out",
    "connection reset",
    "connection refused",
    "temporarily unavailable",
    "rate limit",
    "try again",
];

/// Retry explanation for an upstream status code, if the status is transient.
///
/// 408 and 429 are retryable, as are 500/502/503/504. Everything else,
/// including 401/403, is permanent.
pub fn classify_status(status: u16) -> Option<&'static str> {
    match status {
        408 => Some("upstream request timeout"),
        429 => Some("upstream rate limited"),
        500 | 502 | 503 | 504 => Some("upstream unavailable"),
        _ => None,
    }
}

/// Retry explanation for a message, matched case-insensitively.
pub fn classify_message(message: &str) -> Option<String> {
    let lower = message.to_lowercase();
    TRANSIENT_PATTERNS
        .iter()
        .find(|pattern| lower.contains(*pattern))
        .map(|pattern| format!("transient failure ({pattern})"))
}

/// Classifier driven by status codes and message patterns.
///
/// A status, when present, decides on its own; otherwise the message is
/// matched against known transient phrases.
#[derive(Debug, Clone, Default)]
pub struct StatusClassifier {
    extra_retryable: Vec<u16>,
}

impl StatusClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Treat these statuses as retryable in addition to the defaults.
    pub fn with_retryable_statuses(mut self, statuses: impl IntoIterator<Item = u16>) -> Self {
        self.extra_retryable.extend(statuses);
        self
    }

    pub fn explain(&self, error: &CreateError) -> Option<String> {
        match error.status {
            Some(status) if self.extra_retryable.contains(&status) => {
                Some(format!("status {status} configured as retryable"))
            }
            Some(status) => classify_status(status).map(|reason| format!("{reason} ({status})")),
            None => classify_message(&error.message),
        }
    }
}

impl ErrorClassifier for StatusClassifier {
    fn classify<'a>(
        &'a self,
        error: &'a CreateError,
    ) -> Pin<Box<dyn Future<Output = Option<String>> + Send + 'a>> {
        Box::pin(std::future::ready(self.explain(error)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_status_429_retryable() {
        assert!(classify_status(429).is_some());
    }

    #[test]
    fn classify_status_5xx_retryable() {
        for status in [500, 502, 503, 504] {
            assert!(classify_status(status).is_some(), "status {status}");
        }
    }

    #[test]
    fn classify_status_408_retryable() {
        assert!(classify_status(408).is_some());
    }

    #[test]
    fn classify_status_auth_failures_permanent() {
        assert_eq!(classify_status(401), None);
        assert_eq!(classify_status(403), None);
    }

    #[test]
    fn classify_status_unknown_is_permanent() {
        assert_eq!(classify_status(418), None);
    }

    #[test]
    fn classify_message_matches_case_insensitively() {
        let reason = classify_message("Connection Reset by peer").unwrap();
        assert!(reason.contains("connection reset"));
    }

    #[test]
    fn classify_message_non_matching_is_permanent() {
        assert_eq!(classify_message("invalid signup form"), None);
        assert_eq!(classify_message(""), None);
    }

    #[test]
    fn status_takes_precedence_over_message() {
        let classifier = StatusClassifier::new();
        let err = CreateError::with_status(400, "request timed out");
        assert_eq!(classifier.explain(&err), None);
    }

    #[test]
    fn extra_statuses_become_retryable() {
        let classifier = StatusClassifier::new().with_retryable_statuses([409]);
        let err = CreateError::with_status(409, "conflict");
        assert!(classifier.explain(&err).is_some());
        assert!(StatusClassifier::new().explain(&err).is_none());
    }

    #[tokio::test]
    async fn classifier_trait_returns_explanation() {
        let classifier = StatusClassifier::new();
        let err = CreateError::with_status(503, "maintenance");
        let reason = classifier.classify(&err).await.unwrap();
        assert!(reason.contains("503"), "reason: {reason}");
    }
}
