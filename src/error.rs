//! Error taxonomy for providers and the runner.
//!
//! Every provider outcome is either a `ProviderResponse` or one of the
//! `ProviderError` variants below. The taxonomy is the sole input to retry
//! and backoff decisions; strategies never inspect driver-native errors.

use serde::{Deserialize, Serialize};

/// Classified provider failure.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    /// The provider did not respond within the expected window.
    #[error("timeout: {0}")]
    Timeout(String),

    /// The provider rejected the request due to rate limiting.
    #[error("rate limited: {0}")]
    RateLimit(String),

    /// Transient failure where retrying may help.
    #[error("retryable: {0}")]
    Retryable(String),

    /// The provider should be skipped without counting as a failure.
    #[error("{message}")]
    Skip {
        message: String,
        reason: Option<String>,
    },

    /// Credentials are missing or invalid for the provider.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The provider is misconfigured.
    #[error("misconfigured provider: {0}")]
    Config(String),

    /// Unrecoverable failure that halts the run.
    #[error("fatal: {0}")]
    Fatal(String),

    /// The attempt was cancelled before the provider produced a result.
    #[error("cancelled")]
    Cancelled,
}

impl ProviderError {
    pub fn skip(message: impl Into<String>) -> Self {
        Self::Skip {
            message: message.into(),
            reason: None,
        }
    }

    pub fn skip_with_reason(message: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Skip {
            message: message.into(),
            reason: Some(reason.into()),
        }
    }

    /// Stable wire name used in `error_type` event fields.
    pub fn wire_name(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "TimeoutError",
            Self::RateLimit(_) => "RateLimitError",
            Self::Retryable(_) => "RetryableError",
            Self::Skip { .. } => "ProviderSkip",
            Self::Auth(_) => "AuthError",
            Self::Config(_) => "ConfigError",
            Self::Fatal(_) => "FatalError",
            Self::Cancelled => "CancelledError",
        }
    }

    /// Error family used for metrics aggregation.
    pub fn family(&self) -> &'static str {
        match self {
            Self::RateLimit(_) => "rate_limit",
            Self::Skip { .. } => "skip",
            Self::Auth(_) | Self::Config(_) | Self::Fatal(_) => "fatal",
            Self::Retryable(_) | Self::Timeout(_) => "retryable",
            Self::Cancelled => "unknown",
        }
    }

    /// Fatal errors halt the run; Auth/Config are the per-provider subclass
    /// that still lets a sequential chain advance.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Auth(_) | Self::Config(_) | Self::Fatal(_))
    }

    /// True for Auth/Config: configuration errors specific to one provider.
    pub fn is_provider_config_error(&self) -> bool {
        matches!(self, Self::Auth(_) | Self::Config(_))
    }

    pub fn is_skip(&self) -> bool {
        matches!(self, Self::Skip { .. })
    }

    /// Classify an HTTP status code from a driver into the taxonomy.
    ///
    /// Drivers live outside the core; this is the shared mapping they use so
    /// the strategies only ever see classified errors.
    pub fn from_http_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            401 | 403 => Self::Auth(message),
            408 => Self::Timeout(message),
            429 => Self::RateLimit(message),
            400 | 404 | 422 => Self::Config(message),
            500..=599 => Self::Retryable(message),
            _ => Self::Fatal(message),
        }
    }

    /// One-line `Type: message` summary used in failure details.
    pub fn summary(&self) -> String {
        format!("{}: {}", self.wire_name(), self)
    }
}

/// Per-provider failure summary carried by terminal errors and events.
///
/// Consensus constraint failures additionally record the observation index
/// and the offending latency/cost.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureDetail {
    pub provider: String,
    pub attempt: usize,
    pub summary: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
}

impl FailureDetail {
    pub fn new(provider: impl Into<String>, attempt: usize, summary: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            attempt,
            summary: summary.into(),
            index: None,
            latency_ms: None,
            cost_usd: None,
        }
    }
}

/// Join failure details into the `;`-separated summary embedded in messages.
pub fn join_failure_details(failures: &[FailureDetail]) -> String {
    failures
        .iter()
        .map(|f| format!("{} (attempt {}): {}", f.provider, f.attempt, f.summary))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Terminal runner failure returned to the caller.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    /// A single-provider sequential run re-raises the provider's original
    /// error instead of wrapping it.
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// Every provider in the chain failed (sequential / parallel-any).
    #[error("{message}")]
    AllFailed {
        message: String,
        failures: Vec<FailureDetail>,
        stop_reason: Option<String>,
    },

    /// A parallel execution failed as a whole (parallel-all / consensus).
    #[error("{message}")]
    ParallelExecution {
        message: String,
        failures: Vec<FailureDetail>,
    },

    /// The request or runner configuration was rejected before any attempt.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl RunnerError {
    pub fn all_failed(message: impl Into<String>, failures: Vec<FailureDetail>) -> Self {
        Self::AllFailed {
            message: message.into(),
            failures,
            stop_reason: None,
        }
    }

    pub fn parallel(message: impl Into<String>, failures: Vec<FailureDetail>) -> Self {
        Self::ParallelExecution {
            message: message.into(),
            failures,
        }
    }

    /// Stable wire name used in `last_error_type` event fields.
    pub fn wire_name(&self) -> &'static str {
        match self {
            Self::Provider(err) => err.wire_name(),
            Self::AllFailed { .. } => "AllFailedError",
            Self::ParallelExecution { .. } => "ParallelExecutionError",
            Self::InvalidInput(_) => "InvalidInputError",
        }
    }

    pub fn family(&self) -> &'static str {
        match self {
            Self::Provider(err) => err.family(),
            _ => "fatal",
        }
    }

    pub fn failures(&self) -> &[FailureDetail] {
        match self {
            Self::AllFailed { failures, .. } | Self::ParallelExecution { failures, .. } => failures,
            _ => &[],
        }
    }

    pub fn stop_reason(&self) -> Option<&str> {
        match self {
            Self::AllFailed { stop_reason, .. } => stop_reason.as_deref(),
            _ => None,
        }
    }
}

/// Result alias for provider calls.
pub type ProviderResult<T> = Result<T, ProviderError>;

/// Result alias for runner operations.
pub type RunnerResult<T> = Result<T, RunnerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_families() {
        assert_eq!(ProviderError::RateLimit("x".into()).family(), "rate_limit");
        assert_eq!(ProviderError::skip("x").family(), "skip");
        assert_eq!(ProviderError::Auth("x".into()).family(), "fatal");
        assert_eq!(ProviderError::Config("x".into()).family(), "fatal");
        assert_eq!(ProviderError::Fatal("x".into()).family(), "fatal");
        assert_eq!(ProviderError::Timeout("x".into()).family(), "retryable");
        assert_eq!(ProviderError::Retryable("x".into()).family(), "retryable");
        assert_eq!(ProviderError::Cancelled.family(), "unknown");
    }

    #[test]
    fn test_http_status_classification() {
        assert!(matches!(
            ProviderError::from_http_status(401, "no key"),
            ProviderError::Auth(_)
        ));
        assert!(matches!(
            ProviderError::from_http_status(429, "slow down"),
            ProviderError::RateLimit(_)
        ));
        assert!(matches!(
            ProviderError::from_http_status(503, "busy"),
            ProviderError::Retryable(_)
        ));
        assert!(matches!(
            ProviderError::from_http_status(400, "bad request"),
            ProviderError::Config(_)
        ));
    }

    #[test]
    fn test_failure_summary_joining() {
        let failures = vec![
            FailureDetail::new("alpha", 1, "TimeoutError: timeout: too slow"),
            FailureDetail::new("beta", 2, "RateLimitError: rate limited: busy"),
        ];
        let joined = join_failure_details(&failures);
        assert_eq!(
            joined,
            "alpha (attempt 1): TimeoutError: timeout: too slow; \
             beta (attempt 2): RateLimitError: rate limited: busy"
        );
    }

    #[test]
    fn test_single_provider_error_passthrough() {
        let err: RunnerError = ProviderError::Timeout("too slow".into()).into();
        assert_eq!(err.wire_name(), "TimeoutError");
        assert_eq!(err.to_string(), "timeout: too slow");
    }
}
