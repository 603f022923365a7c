use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HspError {
    #[error("Authentication failed: HTTP {0}")]
    Authentication(u16),
    #[error("Invalid request: {0}")]
    Validation(String),
    #[error("Rate limit exceeded")]
    RateLimit { retry_after: Option<Duration> },
    #[error("Upstream error: {0}")]
    Transient(String),
    #[error("Unparseable response: {0}")]
    Protocol(String),
    #[error("Not authenticated")]
    NotAuthenticated,
}

impl HspError {
    /// Only rate limits and transient upstream faults are worth retrying;
    /// everything else will fail identically on the next attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, HspError::RateLimit { .. } | HspError::Transient(_))
    }

    /// Map an HTTP status to the error taxonomy.
    pub fn from_status(status: u16, body: &str, retry_after: Option<Duration>) -> Self {
        match status {
            401 | 403 => HspError::Authentication(status),
            400 => HspError::Validation(truncate(body, 200)),
            429 => HspError::RateLimit { retry_after },
            408 | 504 => HspError::Transient(format!("timeout: HTTP {status}")),
            s if s >= 500 => HspError::Transient(format!("server error: HTTP {s}")),
            s => HspError::Transient(format!("unexpected HTTP {s}")),
        }
    }
}

impl From<reqwest::Error> for HspError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            HspError::Protocol(err.to_string())
        } else {
            // Connect failures and timeouts are transient by definition.
            HspError::Transient(err.to_string())
        }
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_errors_are_not_retryable() {
        assert!(!HspError::from_status(401, "", None).is_retryable());
        assert!(!HspError::from_status(403, "", None).is_retryable());
        assert!(!HspError::from_status(400, "bad", None).is_retryable());
    }

    #[test]
    fn rate_limit_and_server_errors_are_retryable() {
        assert!(HspError::from_status(429, "", None).is_retryable());
        assert!(HspError::from_status(500, "", None).is_retryable());
        assert!(HspError::from_status(503, "", None).is_retryable());
        assert!(HspError::from_status(504, "", None).is_retryable());
    }

    #[test]
    fn rate_limit_carries_server_hint() {
        let err = HspError::from_status(429, "", Some(Duration::from_secs(10)));
        match err {
            HspError::RateLimit { retry_after } => {
                assert_eq!(retry_after, Some(Duration::from_secs(10)))
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn validation_body_is_truncated() {
        let long_body = "x".repeat(500);
        match HspError::from_status(400, &long_body, None) {
            HspError::Validation(msg) => assert!(msg.len() <= 203),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
