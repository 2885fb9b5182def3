//! Classification of upstream failures into transient vs. fatal.
//!
//! Transient means the upstream is overloaded or briefly unavailable: HTTP 429
//! or 529, a message in the overload vocabulary, or a timeout. Everything else
//! (validation, auth, other 4xx) fails immediately.

use std::time::Duration;

/// Phrases upstream SDKs use when they are shedding load.
const OVERLOAD_VOCABULARY: &[&str] = &[
    "overloaded",
    "rate limit",
    "rate_limit",
    "too many requests",
    "service unavailable",
    "temporarily unavailable",
    "busy",
];

const TIMEOUT_VOCABULARY: &[&str] = &["timed out", "timeout", "etimedout", "deadline exceeded"];

/// Whether an error type is eligible for retry.
pub trait Retryable {
    /// `true` when retrying might succeed.
    fn is_transient(&self) -> bool;

    /// Server-provided minimum wait before the next attempt.
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

impl Retryable for crate::Error {
    fn is_transient(&self) -> bool {
        crate::Error::is_transient(self)
    }

    fn retry_after(&self) -> Option<Duration> {
        crate::Error::retry_after(self)
    }
}

impl Retryable for std::io::Error {
    fn is_transient(&self) -> bool {
        use std::io::ErrorKind;
        match self.kind() {
            ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted => true,
            _ => is_overload_message(&self.to_string()),
        }
    }
}

/// 429 (too many requests) and 529 (overloaded).
pub fn is_overload_status(status: u16) -> bool {
    status == 429 || status == 529
}

/// Case-insensitive match against the overload vocabulary.
pub fn is_overload_message(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    OVERLOAD_VOCABULARY.iter().any(|needle| lower.contains(needle))
}

/// Case-insensitive match against timeout wording.
pub fn is_timeout_message(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    TIMEOUT_VOCABULARY.iter().any(|needle| lower.contains(needle))
}

/// Parse a `Retry-After` header given in whole or fractional seconds.
///
/// HTTP-date values, negatives, and values too large for a `Duration`
/// yield `None`.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let trimmed = value.trim();
    if let Ok(secs) = trimmed.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let secs = trimmed.parse::<f64>().ok()?;
    Duration::try_from_secs_f64(secs).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overload_vocabulary_is_case_insensitive() {
        assert!(is_overload_message("Overloaded"));
        assert!(is_overload_message("429 Too Many Requests"));
        assert!(is_overload_message("The server is BUSY, try later"));
        assert!(is_overload_message("rate_limit_error"));
        assert!(!is_overload_message("invalid_request_error"));
    }

    #[test]
    fn overload_statuses() {
        assert!(is_overload_status(429));
        assert!(is_overload_status(529));
        assert!(!is_overload_status(500));
        assert!(!is_overload_status(400));
    }

    #[test]
    fn timeout_wording() {
        assert!(is_timeout_message("operation timed out"));
        assert!(is_timeout_message("connect ETIMEDOUT 10.0.0.1:443"));
        assert!(!is_timeout_message("connection refused"));
    }

    #[test]
    fn retry_after_parsing() {
        assert_eq!(parse_retry_after("7"), Some(Duration::from_secs(7)));
        assert_eq!(parse_retry_after(" 1.5 "), Some(Duration::from_millis(1500)));
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"), None);
        assert_eq!(parse_retry_after("-2"), None);
        assert_eq!(parse_retry_after("NaN"), None);
        assert_eq!(parse_retry_after("1e30"), None);
        assert_eq!(parse_retry_after("18446744073709551616"), None);
    }

    #[test]
    fn io_errors_classify_by_kind() {
        let timed_out = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow");
        assert!(timed_out.is_transient());
        let denied = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope");
        assert!(!denied.is_transient());
    }
}
