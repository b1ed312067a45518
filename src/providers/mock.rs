//! Deterministic mock provider.
//!
//! Echoes the prompt back with a configurable base latency and injects
//! classified failures when the prompt carries a marker. Used by the CLI
//! for dry runs and by the test suite as the reference driver.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;

use crate::error::{ProviderError, ProviderResult};
use crate::provider::ProviderClient;
use crate::request::{ProviderRequest, ProviderResponse, TokenUsage};

pub const DEFAULT_BASE_LATENCY_MS: u64 = 50;

/// Prompt markers that trigger classified failures.
const MARKER_TIMEOUT: &str = "[TIMEOUT]";
const MARKER_RATE_LIMIT: &str = "[RATELIMIT]";
const MARKER_RETRYABLE: &str = "[RETRYABLE]";
const MARKER_AUTH: &str = "[AUTH]";
const MARKER_SKIP: &str = "[SKIP]";

const COST_PER_TOKEN_USD: f64 = 0.000002;

pub struct MockProvider {
    name: String,
    base_latency_ms: u64,
    jitter_ms: u64,
    fixed_text: Option<String>,
    failure: Option<ProviderError>,
}

impl MockProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base_latency_ms: DEFAULT_BASE_LATENCY_MS,
            jitter_ms: 20,
            fixed_text: None,
            failure: None,
        }
    }

    pub fn with_base_latency_ms(mut self, base_latency_ms: u64) -> Self {
        self.base_latency_ms = base_latency_ms;
        self
    }

    /// Disable latency jitter for fully deterministic runs.
    pub fn without_jitter(mut self) -> Self {
        self.jitter_ms = 0;
        self
    }

    /// Always answer with this text instead of echoing the prompt.
    pub fn with_fixed_text(mut self, text: impl Into<String>) -> Self {
        self.fixed_text = Some(text.into());
        self
    }

    /// Fail every call with this error, regardless of the prompt.
    pub fn with_failure(mut self, failure: ProviderError) -> Self {
        self.failure = Some(failure);
        self
    }
}

#[async_trait]
impl ProviderClient for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> HashSet<String> {
        HashSet::from(["chat".to_string()])
    }

    fn model(&self) -> Option<&str> {
        Some("mock-echo")
    }

    async fn invoke(&self, request: &ProviderRequest) -> ProviderResult<ProviderResponse> {
        if let Some(failure) = &self.failure {
            return Err(failure.clone());
        }
        let prompt = request.prompt();
        if prompt.contains(MARKER_TIMEOUT) {
            tokio::time::sleep(Duration::from_millis(self.base_latency_ms)).await;
            return Err(ProviderError::Timeout("simulated timeout".into()));
        }
        if prompt.contains(MARKER_RATE_LIMIT) {
            return Err(ProviderError::RateLimit("simulated rate limit".into()));
        }
        if prompt.contains(MARKER_RETRYABLE) {
            return Err(ProviderError::Retryable("simulated transient failure".into()));
        }
        if prompt.contains(MARKER_AUTH) {
            return Err(ProviderError::Auth("simulated missing credentials".into()));
        }
        if prompt.contains(MARKER_SKIP) {
            return Err(ProviderError::skip_with_reason(
                "simulated skip",
                "mock_marker",
            ));
        }

        let jitter = if self.jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..self.jitter_ms)
        };
        let latency_ms = self.base_latency_ms + jitter;
        tokio::time::sleep(Duration::from_millis(latency_ms)).await;

        let text = match &self.fixed_text {
            Some(text) => text.clone(),
            None => format!("{}: {}", self.name, prompt),
        };
        let prompt_tokens = (prompt.len() as u64 / 4).max(1);
        Ok(ProviderResponse::new(
            text,
            latency_ms,
            TokenUsage::new(prompt_tokens, 16),
            request.model(),
        )
        .with_finish_reason("stop"))
    }

    fn estimate_cost(&self, tokens_in: u64, tokens_out: u64) -> f64 {
        (tokens_in + tokens_out) as f64 * COST_PER_TOKEN_USD
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_echo_response() {
        let provider = MockProvider::new("echo").with_base_latency_ms(1).without_jitter();
        let request = ProviderRequest::new("demo-model", "hello").unwrap();
        let response = provider.invoke(&request).await.unwrap();
        assert_eq!(response.text, "echo: hello");
        assert_eq!(response.latency_ms, 1);
        assert_eq!(response.token_usage.completion, 16);
        assert_eq!(response.finish_reason.as_deref(), Some("stop"));
    }

    #[tokio::test]
    async fn test_failure_markers() {
        let provider = MockProvider::new("echo").with_base_latency_ms(1);
        let request = ProviderRequest::new("demo-model", "x [TIMEOUT]").unwrap();
        assert!(matches!(
            provider.invoke(&request).await,
            Err(ProviderError::Timeout(_))
        ));
        let request = ProviderRequest::new("demo-model", "x [RATELIMIT]").unwrap();
        assert!(matches!(
            provider.invoke(&request).await,
            Err(ProviderError::RateLimit(_))
        ));
        let request = ProviderRequest::new("demo-model", "x [SKIP]").unwrap();
        assert!(matches!(
            provider.invoke(&request).await,
            Err(ProviderError::Skip { .. })
        ));
    }

    #[tokio::test]
    async fn test_fixed_text_override() {
        let provider = MockProvider::new("fixed")
            .with_base_latency_ms(1)
            .without_jitter()
            .with_fixed_text("agree");
        let request = ProviderRequest::new("demo-model", "anything").unwrap();
        let response = provider.invoke(&request).await.unwrap();
        assert_eq!(response.text, "agree");
    }

    #[tokio::test]
    async fn test_scripted_failure_override() {
        let provider = MockProvider::new("down")
            .with_failure(ProviderError::Retryable("offline".into()));
        let request = ProviderRequest::new("demo-model", "hello").unwrap();
        assert!(matches!(
            provider.invoke(&request).await,
            Err(ProviderError::Retryable(_))
        ));
    }

    #[test]
    fn test_cost_estimate() {
        let provider = MockProvider::new("echo");
        let cost = provider.estimate_cost(1000, 1000);
        assert!((cost - 0.004).abs() < 1e-9);
    }
}
