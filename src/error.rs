/// CTA error types and handling utilities
use std::time::Duration;

pub type Result<T, E = CtaError> = std::result::Result<T, E>;

/// Main error type for CTA operations
#[derive(Debug, thiserror::Error)]
pub enum CtaError {
    /// Registry rejected the request (401/403)
    #[error("401 Unauthorized: registry {host} rejected the credentials (or none were supplied)")]
    Unauthorized { host: String },

    /// Digest or reference absent (404)
    #[error("404 Not Found: {what}")]
    NotFound { what: String },

    /// Content read back does not hash to the requested digest
    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    /// Archive or artifact does not have the expected shape or media types
    #[error("malformed archive: {0}")]
    MalformedArchive(String),

    /// Network or protocol failure
    #[error("transport error (retryable: {retryable}): {message}")]
    Transport { message: String, retryable: bool },

    /// Target already holds the artifact and force was not requested
    #[error("{what} already exists at target (use force to overwrite)")]
    AlreadyExists { what: String },

    /// Operation called out of order on a stateful builder
    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("invalid reference '{reference}': {reason}")]
    InvalidReference { reference: String, reason: String },

    #[error("configuration error: {0}")]
    Config(String),

    /// External descriptor tool exited unsuccessfully
    #[error("command '{command}' failed with exit code {code:?}: {stderr}")]
    Tool {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

impl CtaError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    pub fn transport(message: impl Into<String>, retryable: bool) -> Self {
        Self::Transport {
            message: message.into(),
            retryable,
        }
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedArchive(message.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl From<reqwest::Error> for CtaError {
    fn from(err: reqwest::Error) -> Self {
        let retryable = err.is_timeout() || err.is_connect();
        CtaError::Transport {
            message: err.to_string(),
            retryable,
        }
    }
}

impl From<walkdir::Error> for CtaError {
    fn from(err: walkdir::Error) -> Self {
        CtaError::Io(err.into())
    }
}

/// Helper to determine if an error is retryable.
///
/// Integrity failures (digest mismatch, malformed archives) are never retried.
pub fn is_retryable(err: &CtaError) -> bool {
    match err {
        CtaError::Transport { retryable, .. } => *retryable,
        CtaError::DigestMismatch { .. } => false,
        CtaError::MalformedArchive(_) => false,
        CtaError::Unauthorized { .. } => false,
        CtaError::NotFound { .. } => false,
        CtaError::AlreadyExists { .. } => false,
        CtaError::InvalidState(_) => false,
        CtaError::InvalidReference { .. } => false,
        CtaError::Config(_) => false,
        CtaError::Tool { .. } => false,
        CtaError::Io(_) => false,
        CtaError::Json(_) => false,
        CtaError::Yaml(_) => false,
    }
}

/// Retry configuration for callers that want to retry transport failures
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: crate::constants::DEFAULT_MAX_RETRY_ATTEMPTS,
            initial_backoff_ms: crate::constants::DEFAULT_INITIAL_BACKOFF_MS,
            max_backoff_ms: crate::constants::DEFAULT_MAX_BACKOFF_MS,
            backoff_multiplier: 2.0,
        }
    }
}

/// Calculates exponential backoff with jitter
pub fn calculate_backoff(attempt: u32, config: &RetryConfig) -> u64 {
    let backoff = (config.initial_backoff_ms as f64
        * config.backoff_multiplier.powi(attempt as i32))
    .min(config.max_backoff_ms as f64) as u64;

    // Add jitter: ±20% of backoff, then clamp to max
    let jitter = (backoff as f64) * (rand::random::<f64>() * 0.4 - 0.2);
    ((backoff as f64) + jitter)
        .max(0.0)
        .min(config.max_backoff_ms as f64) as u64
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the attempts run out.
pub fn retry<T>(config: &RetryConfig, mut op: impl FnMut() -> Result<T>) -> Result<T> {
    let mut attempt = 0;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if is_retryable(&err) && attempt + 1 < config.max_attempts => {
                let backoff = calculate_backoff(attempt, config);
                tracing::warn!(
                    attempt = attempt + 1,
                    backoff_ms = backoff,
                    error = %err,
                    "Retrying after transport failure"
                );
                std::thread::sleep(Duration::from_millis(backoff));
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_digest_mismatch_display() {
        let err = CtaError::DigestMismatch {
            expected: "sha256:abc123".to_string(),
            actual: "sha256:def456".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("sha256:abc123"));
        assert!(msg.contains("sha256:def456"));
        assert!(!is_retryable(&err));
    }

    #[test]
    fn test_unauthorized_names_host() {
        let err = CtaError::Unauthorized {
            host: "ghcr.io".to_string(),
        };
        assert!(err.to_string().contains("401 Unauthorized"));
        assert!(err.to_string().contains("ghcr.io"));
    }

    #[test]
    fn test_retryable_detection() {
        assert!(is_retryable(&CtaError::transport("timeout", true)));
        assert!(!is_retryable(&CtaError::transport("bad request", false)));
        assert!(!is_retryable(&CtaError::malformed("no layers")));
    }

    #[test]
    fn test_malformed_request_not_retried() {
        let err = reqwest::blocking::Client::new()
            .get("http://")
            .build()
            .unwrap_err();
        assert!(!is_retryable(&CtaError::from(err)));
    }

    #[test]
    fn test_exponential_backoff_bounded() {
        let config = RetryConfig::default();
        for attempt in 0..6 {
            assert!(calculate_backoff(attempt, &config) <= config.max_backoff_ms);
        }
    }

    #[test]
    fn test_retry_stops_on_integrity_error() {
        let calls = Cell::new(0);
        let config = RetryConfig {
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
            ..RetryConfig::default()
        };
        let result: Result<()> = retry(&config, || {
            calls.set(calls.get() + 1);
            Err(CtaError::DigestMismatch {
                expected: "a".into(),
                actual: "b".into(),
            })
        });
        assert!(result.is_err());
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_retry_recovers_from_transient_failure() {
        let calls = Cell::new(0);
        let config = RetryConfig {
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
            ..RetryConfig::default()
        };
        let value = retry(&config, || {
            calls.set(calls.get() + 1);
            if calls.get() < 2 {
                Err(CtaError::transport("connection reset", true))
            } else {
                Ok(7)
            }
        })
        .unwrap();
        assert_eq!(value, 7);
        assert_eq!(calls.get(), 2);
    }
}
