//! Per-provider retry control.
//!
//! Wraps the invoker with the provider retry budget (`retries.max + 1`
//! attempts), backoff sleeps, and the advance-to-next-provider decision.
//! A run-wide attempt cap short-circuits the loop across providers.

use std::time::Duration;

use tokio::time::sleep;
use tracing::debug;

use crate::config::{BackoffPolicy, RetryPolicy};
use crate::error::ProviderError;
use crate::events::log_provider_fallback;
use crate::invoker::{InvocationResult, InvokeContext, ProviderInvoker};
use crate::provider::SharedProvider;
use crate::request::ProviderRequest;

/// Hands out monotonically increasing attempt labels under the run-wide cap.
pub(crate) struct AttemptSequencer {
    next: usize,
    cap: Option<usize>,
}

impl AttemptSequencer {
    pub fn new(cap: Option<usize>) -> Self {
        Self { next: 1, cap }
    }

    /// Reserve the next attempt label, or `None` once the cap is spent.
    pub fn reserve(&mut self) -> Option<usize> {
        if let Some(cap) = self.cap {
            if self.next > cap {
                return None;
            }
        }
        let label = self.next;
        self.next += 1;
        Some(label)
    }

    pub fn used(&self) -> usize {
        self.next - 1
    }
}

/// What the chain should do after a provider's retry loop finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Advance {
    /// The provider produced a response.
    Success,
    /// Move on to the next provider in the chain.
    NextProvider,
    /// Abort the run and surface the error.
    Propagate,
    /// The run-wide attempt cap is spent; stop starting attempts.
    BudgetExhausted,
}

pub(crate) struct RetryController<'a> {
    invoker: &'a ProviderInvoker,
    retries: &'a RetryPolicy,
    backoff: &'a BackoffPolicy,
}

impl<'a> RetryController<'a> {
    pub fn new(
        invoker: &'a ProviderInvoker,
        retries: &'a RetryPolicy,
        backoff: &'a BackoffPolicy,
    ) -> Self {
        Self {
            invoker,
            retries,
            backoff,
        }
    }

    /// Attempt one provider until success, budget exhaustion, or a
    /// non-retryable error.
    pub async fn run_provider(
        &self,
        provider: &SharedProvider,
        request: &ProviderRequest,
        total_providers: usize,
        ctx: &InvokeContext<'_>,
        sequencer: &mut AttemptSequencer,
    ) -> (Option<InvocationResult>, Advance) {
        let max_attempts = self.retries.max as usize + 1;
        let mut attempts_here = 0;
        let mut last: Option<InvocationResult> = None;

        loop {
            let Some(attempt) = sequencer.reserve() else {
                return (last, Advance::BudgetExhausted);
            };
            attempts_here += 1;
            let result = self
                .invoker
                .invoke(provider, request, attempt, total_providers, ctx)
                .await;
            if result.succeeded() {
                return (Some(result), Advance::Success);
            }

            let error = result
                .error
                .clone()
                .unwrap_or_else(|| ProviderError::Fatal("provider returned no response".into()));
            let advance = match &error {
                ProviderError::Skip { .. } => Advance::NextProvider,
                ProviderError::RateLimit(_) => {
                    if attempts_here < max_attempts {
                        debug!(
                            provider = provider.name(),
                            attempt, "rate limited; backing off before retry"
                        );
                        if !self.backoff.rate_limit_sleep.is_zero() {
                            sleep(self.backoff.rate_limit_sleep).await;
                        }
                        last = Some(result);
                        continue;
                    }
                    Advance::NextProvider
                }
                ProviderError::Timeout(_) => {
                    if self.backoff.timeout_next_provider {
                        Advance::NextProvider
                    } else {
                        Advance::Propagate
                    }
                }
                ProviderError::Retryable(_) => {
                    if attempts_here < max_attempts {
                        if !self.retries.backoff.is_zero() {
                            sleep(self.retries.backoff).await;
                        }
                        last = Some(result);
                        continue;
                    }
                    if self.backoff.retryable_next_provider {
                        Advance::NextProvider
                    } else {
                        Advance::Propagate
                    }
                }
                ProviderError::Auth(_) | ProviderError::Config(_) => {
                    // Configuration errors are specific to one provider; the
                    // chain records the fallback and moves on.
                    log_provider_fallback(
                        ctx.logger,
                        ctx.request_fingerprint,
                        provider.as_ref(),
                        attempt,
                        &error,
                    );
                    Advance::NextProvider
                }
                ProviderError::Fatal(_) | ProviderError::Cancelled => Advance::Propagate,
            };
            return (Some(result), advance);
        }
    }
}

/// Re-attempt decision for parallel workers.
///
/// Returns the new attempt label (`total_providers + retry_attempts + 1`)
/// and the delay to apply, or `None` when the worker should fail instead.
/// The run-wide cap bounds re-labeled attempts.
pub(crate) fn parallel_retry_decision(
    error: &ProviderError,
    total_providers: usize,
    retry_attempts: usize,
    max_attempts: Option<usize>,
    backoff: &BackoffPolicy,
) -> Option<(usize, Duration)> {
    let delay = match error {
        ProviderError::RateLimit(_) => Some(backoff.rate_limit_sleep),
        ProviderError::Timeout(_) if !backoff.timeout_next_provider => Some(Duration::ZERO),
        ProviderError::Retryable(_) if !backoff.retryable_next_provider => Some(Duration::ZERO),
        _ => None,
    }?;
    let next_attempt = total_providers + retry_attempts + 1;
    if let Some(cap) = max_attempts {
        if next_attempt > cap {
            return None;
        }
    }
    Some((next_attempt, delay))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;

    use crate::error::ProviderResult;
    use crate::provider::ProviderClient;
    use crate::request::{ProviderResponse, TokenUsage};
    use crate::util::JsonMap;

    /// Fails with the scripted errors, then succeeds.
    struct ScriptedProvider {
        name: String,
        failures: Vec<ProviderError>,
        calls: AtomicUsize,
    }

    impl ScriptedProvider {
        fn new(name: &str, failures: Vec<ProviderError>) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                failures,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ProviderClient for ScriptedProvider {
        fn name(&self) -> &str {
            &self.name
        }

        async fn invoke(&self, request: &ProviderRequest) -> ProviderResult<ProviderResponse> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(error) = self.failures.get(call) {
                return Err(error.clone());
            }
            Ok(ProviderResponse::new(
                format!("{}: {}", self.name, request.prompt()),
                7,
                TokenUsage::new(2, 2),
                request.model(),
            ))
        }
    }

    fn context<'a>(fingerprint: &'a str, metadata: &'a JsonMap) -> InvokeContext<'a> {
        InvokeContext {
            logger: None,
            request_fingerprint: fingerprint,
            metadata,
            shadow: None,
            capture_shadow_metrics: false,
        }
    }

    #[tokio::test]
    async fn test_retryable_error_is_retried_within_budget() {
        let provider = ScriptedProvider::new(
            "flaky",
            vec![ProviderError::Retryable("blip".into())],
        );
        let shared: SharedProvider = provider.clone();
        let invoker = ProviderInvoker::new(None);
        let retries = RetryPolicy {
            max: 1,
            backoff: Duration::ZERO,
        };
        let backoff = BackoffPolicy::default();
        let controller = RetryController::new(&invoker, &retries, &backoff);
        let request = ProviderRequest::new("demo-model", "hi").unwrap();
        let metadata = JsonMap::new();
        let mut sequencer = AttemptSequencer::new(None);

        let (result, advance) = controller
            .run_provider(&shared, &request, 1, &context("fp", &metadata), &mut sequencer)
            .await;

        assert_eq!(advance, Advance::Success);
        assert!(result.unwrap().succeeded());
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
        assert_eq!(sequencer.used(), 2);
    }

    #[tokio::test]
    async fn test_timeout_is_never_silently_retried() {
        let provider = ScriptedProvider::new(
            "slow",
            vec![
                ProviderError::Timeout("too slow".into()),
                ProviderError::Timeout("too slow".into()),
            ],
        );
        let shared: SharedProvider = provider.clone();
        let invoker = ProviderInvoker::new(None);
        let retries = RetryPolicy {
            max: 3,
            backoff: Duration::ZERO,
        };
        let backoff = BackoffPolicy::default();
        let controller = RetryController::new(&invoker, &retries, &backoff);
        let request = ProviderRequest::new("demo-model", "hi").unwrap();
        let metadata = JsonMap::new();
        let mut sequencer = AttemptSequencer::new(None);

        let (result, advance) = controller
            .run_provider(&shared, &request, 1, &context("fp", &metadata), &mut sequencer)
            .await;

        assert_eq!(advance, Advance::NextProvider);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
        assert!(matches!(
            result.unwrap().error,
            Some(ProviderError::Timeout(_))
        ));
    }

    #[tokio::test]
    async fn test_timeout_propagates_when_policy_disables_advance() {
        let provider =
            ScriptedProvider::new("slow", vec![ProviderError::Timeout("too slow".into())]);
        let shared: SharedProvider = provider.clone();
        let invoker = ProviderInvoker::new(None);
        let retries = RetryPolicy::default();
        let backoff = BackoffPolicy {
            timeout_next_provider: false,
            ..BackoffPolicy::default()
        };
        let controller = RetryController::new(&invoker, &retries, &backoff);
        let request = ProviderRequest::new("demo-model", "hi").unwrap();
        let metadata = JsonMap::new();
        let mut sequencer = AttemptSequencer::new(None);

        let (_, advance) = controller
            .run_provider(&shared, &request, 1, &context("fp", &metadata), &mut sequencer)
            .await;
        assert_eq!(advance, Advance::Propagate);
    }

    #[tokio::test]
    async fn test_auth_error_advances_without_retry() {
        let provider = ScriptedProvider::new("unauth", vec![ProviderError::Auth("no key".into())]);
        let shared: SharedProvider = provider.clone();
        let invoker = ProviderInvoker::new(None);
        let retries = RetryPolicy {
            max: 5,
            backoff: Duration::ZERO,
        };
        let backoff = BackoffPolicy::default();
        let controller = RetryController::new(&invoker, &retries, &backoff);
        let request = ProviderRequest::new("demo-model", "hi").unwrap();
        let metadata = JsonMap::new();
        let mut sequencer = AttemptSequencer::new(None);

        let (_, advance) = controller
            .run_provider(&shared, &request, 1, &context("fp", &metadata), &mut sequencer)
            .await;
        assert_eq!(advance, Advance::NextProvider);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_global_cap_short_circuits_retries() {
        let provider = ScriptedProvider::new(
            "flaky",
            vec![
                ProviderError::Retryable("blip".into()),
                ProviderError::Retryable("blip".into()),
                ProviderError::Retryable("blip".into()),
            ],
        );
        let shared: SharedProvider = provider.clone();
        let invoker = ProviderInvoker::new(None);
        let retries = RetryPolicy {
            max: 5,
            backoff: Duration::ZERO,
        };
        let backoff = BackoffPolicy::default();
        let controller = RetryController::new(&invoker, &retries, &backoff);
        let request = ProviderRequest::new("demo-model", "hi").unwrap();
        let metadata = JsonMap::new();
        let mut sequencer = AttemptSequencer::new(Some(2));

        let (_, advance) = controller
            .run_provider(&shared, &request, 1, &context("fp", &metadata), &mut sequencer)
            .await;
        assert_eq!(advance, Advance::BudgetExhausted);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_parallel_retry_decision_rate_limit() {
        let backoff = BackoffPolicy::default();
        let decision = parallel_retry_decision(
            &ProviderError::RateLimit("busy".into()),
            3,
            0,
            None,
            &backoff,
        );
        assert_eq!(decision, Some((4, backoff.rate_limit_sleep)));

        // The cap bounds re-labeled attempts.
        let capped = parallel_retry_decision(
            &ProviderError::RateLimit("busy".into()),
            3,
            1,
            Some(4),
            &backoff,
        );
        assert_eq!(capped, None);
    }

    #[test]
    fn test_parallel_retry_decision_other_errors() {
        let backoff = BackoffPolicy::default();
        assert_eq!(
            parallel_retry_decision(&ProviderError::Fatal("x".into()), 2, 0, None, &backoff),
            None
        );
        assert_eq!(
            parallel_retry_decision(&ProviderError::Timeout("x".into()), 2, 0, None, &backoff),
            None
        );
        let no_advance = BackoffPolicy {
            timeout_next_provider: false,
            ..BackoffPolicy::default()
        };
        assert_eq!(
            parallel_retry_decision(&ProviderError::Timeout("x".into()), 2, 0, None, &no_advance),
            Some((3, Duration::ZERO))
        );
    }
}
