//! Single provider attempt execution.
//!
//! The invoker owns exactly one attempt: acquire a rate-limit token, call
//! the provider (racing the shadow when one is configured), classify the
//! outcome, emit `provider_skipped`/`provider_call`, and hand back a
//! normalized `InvocationResult`. Retrying is the retry controller's job;
//! the invoker never loops.

use std::sync::Arc;
use std::time::Instant;

use tracing::debug;

use crate::error::ProviderError;
use crate::events::{
    log_provider_call, log_provider_skipped, log_run_metric, CallStatus, ProviderCallRecord,
    RunMetricRecord, SharedLogger,
};
use crate::provider::SharedProvider;
use crate::rate_limit::RateLimiter;
use crate::request::ProviderRequest;
use crate::shadow::{run_with_shadow, ShadowMetrics};
use crate::util::{elapsed_ms, JsonMap};

impl std::fmt::Debug for InvocationResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvocationResult")
            .field("provider", &self.provider.name())
            .field("attempt", &self.attempt)
            .field("total_providers", &self.total_providers)
            .field("response", &self.response)
            .field("error", &self.error)
            .field("latency_ms", &self.latency_ms)
            .field("tokens_in", &self.tokens_in)
            .field("tokens_out", &self.tokens_out)
            .field("shadow_metrics", &self.shadow_metrics)
            .field("shadow_extra", &self.shadow_extra)
            .field("provider_call_logged", &self.provider_call_logged)
            .finish()
    }
}

/// Normalized outcome of one provider attempt.
pub struct InvocationResult {
    pub provider: SharedProvider,
    pub attempt: usize,
    pub total_providers: usize,
    pub response: Option<crate::request::ProviderResponse>,
    pub error: Option<ProviderError>,
    pub latency_ms: Option<u64>,
    pub tokens_in: Option<u64>,
    pub tokens_out: Option<u64>,
    pub shadow_metrics: Option<ShadowMetrics>,
    /// Extra fields merged into the shadow record at emit time (consensus
    /// attaches `shadow_consensus_delta` here).
    pub shadow_extra: Option<JsonMap>,
    /// Deferred loggers must not re-emit `provider_call` when this is set.
    pub provider_call_logged: bool,
}

impl InvocationResult {
    pub fn succeeded(&self) -> bool {
        self.response.is_some()
    }
}

/// Shared per-run context for invocations.
pub(crate) struct InvokeContext<'a> {
    pub logger: Option<&'a SharedLogger>,
    pub request_fingerprint: &'a str,
    pub metadata: &'a JsonMap,
    pub shadow: Option<&'a SharedProvider>,
    /// Keep shadow metrics on the result instead of emitting inline.
    pub capture_shadow_metrics: bool,
}

pub(crate) struct ProviderInvoker {
    rate_limiter: Option<Arc<RateLimiter>>,
}

impl ProviderInvoker {
    pub fn new(rate_limiter: Option<Arc<RateLimiter>>) -> Self {
        Self { rate_limiter }
    }

    pub async fn invoke(
        &self,
        provider: &SharedProvider,
        request: &ProviderRequest,
        attempt: usize,
        total_providers: usize,
        ctx: &InvokeContext<'_>,
    ) -> InvocationResult {
        if let Some(rate_limiter) = &self.rate_limiter {
            rate_limiter.acquire_async().await;
        }
        let attempt_started = Instant::now();
        debug!(
            provider = provider.name(),
            attempt, total_providers, "invoking provider"
        );

        // Shadowed invocations always capture internally so the call record
        // can carry shadow metadata; emission is deferred only on request.
        let capture_internal = ctx.shadow.is_some();
        let invoke_result = run_with_shadow(
            provider,
            ctx.shadow,
            request,
            ctx.logger,
            capture_internal,
        )
        .await;

        match invoke_result {
            Ok((response, mut shadow_metrics)) => {
                let usage = response.token_usage;
                let mut metadata = ctx.metadata.clone();
                if let Some(metrics) = &shadow_metrics {
                    for (key, value) in metrics.log_metadata() {
                        metadata.insert(key, value);
                    }
                }
                if !ctx.capture_shadow_metrics {
                    if let Some(metrics) = shadow_metrics.take() {
                        metrics.emit();
                    }
                }
                log_provider_call(
                    ctx.logger,
                    ctx.request_fingerprint,
                    ProviderCallRecord {
                        provider: provider.as_ref(),
                        request,
                        attempt,
                        total_providers,
                        status: CallStatus::Ok,
                        latency_ms: Some(response.latency_ms),
                        tokens_in: Some(usage.prompt),
                        tokens_out: Some(usage.completion),
                        error: None,
                        metadata: &metadata,
                        shadow_used: ctx.shadow.is_some(),
                    },
                );
                InvocationResult {
                    provider: Arc::clone(provider),
                    attempt,
                    total_providers,
                    latency_ms: Some(response.latency_ms),
                    tokens_in: Some(usage.prompt),
                    tokens_out: Some(usage.completion),
                    response: Some(response),
                    error: None,
                    shadow_metrics,
                    shadow_extra: None,
                    provider_call_logged: true,
                }
            }
            Err(error) => {
                let latency_ms = elapsed_ms(attempt_started);
                if error.is_skip() {
                    log_provider_skipped(
                        ctx.logger,
                        ctx.request_fingerprint,
                        provider.as_ref(),
                        request,
                        attempt,
                        total_providers,
                        &error,
                    );
                }
                log_provider_call(
                    ctx.logger,
                    ctx.request_fingerprint,
                    ProviderCallRecord {
                        provider: provider.as_ref(),
                        request,
                        attempt,
                        total_providers,
                        status: CallStatus::Error,
                        latency_ms: Some(latency_ms),
                        tokens_in: None,
                        tokens_out: None,
                        error: Some(&error),
                        metadata: ctx.metadata,
                        shadow_used: ctx.shadow.is_some(),
                    },
                );
                InvocationResult {
                    provider: Arc::clone(provider),
                    attempt,
                    total_providers,
                    response: None,
                    error: Some(error),
                    latency_ms: Some(latency_ms),
                    tokens_in: None,
                    tokens_out: None,
                    shadow_metrics: None,
                    shadow_extra: None,
                    provider_call_logged: true,
                }
            }
        }
    }
}

/// Synthetic result for a provider whose attempt was cancelled before it
/// produced anything; its events are emitted by the deferred logger.
pub(crate) fn cancelled_result(
    provider: &SharedProvider,
    attempt: usize,
    total_providers: usize,
    run_started: Instant,
) -> InvocationResult {
    InvocationResult {
        provider: Arc::clone(provider),
        attempt,
        total_providers,
        response: None,
        error: Some(ProviderError::Cancelled),
        latency_ms: Some(elapsed_ms(run_started)),
        tokens_in: None,
        tokens_out: None,
        shadow_metrics: None,
        shadow_extra: None,
        provider_call_logged: false,
    }
}

/// Emit deferred `provider_call` and per-provider `run_metric` events for a
/// batch of parallel results. Pending shadow records are flushed here too.
#[allow(clippy::too_many_arguments)]
pub(crate) fn log_parallel_results(
    results: &mut [InvocationResult],
    logger: Option<&SharedLogger>,
    request: &ProviderRequest,
    request_fingerprint: &str,
    metadata: &JsonMap,
    run_started: Instant,
    shadow_used: bool,
    attempts_override: Option<(usize, usize)>,
) {
    for result in results.iter_mut() {
        if let Some(metrics) = result.shadow_metrics.take() {
            metrics.emit_with(result.shadow_extra.take());
        }
        let status = if result.succeeded() {
            CallStatus::Ok
        } else {
            CallStatus::Error
        };
        let (tokens_in, tokens_out, cost_usd) = if result.succeeded() {
            let tokens_in = result.tokens_in.unwrap_or(0);
            let tokens_out = result.tokens_out.unwrap_or(0);
            let cost = result.provider.estimate_cost(tokens_in, tokens_out);
            (Some(tokens_in), Some(tokens_out), cost)
        } else {
            (None, None, 0.0)
        };
        let latency_ms = result.latency_ms.unwrap_or_else(|| elapsed_ms(run_started));

        if !result.provider_call_logged {
            log_provider_call(
                logger,
                request_fingerprint,
                ProviderCallRecord {
                    provider: result.provider.as_ref(),
                    request,
                    attempt: result.attempt,
                    total_providers: result.total_providers,
                    status,
                    latency_ms: Some(latency_ms),
                    tokens_in,
                    tokens_out,
                    error: result.error.as_ref(),
                    metadata,
                    shadow_used,
                },
            );
            result.provider_call_logged = true;
        }

        let attempts = match attempts_override {
            Some((label, attempts)) if label == result.attempt => attempts,
            _ => result.attempt,
        };
        let error = if result.succeeded() {
            None
        } else {
            result.error.as_ref()
        };
        log_run_metric(
            logger,
            request_fingerprint,
            RunMetricRecord {
                provider: Some(result.provider.as_ref()),
                request,
                status,
                attempts,
                latency_ms,
                tokens_in,
                tokens_out,
                cost_usd,
                error_type: error.map(ProviderError::wire_name),
                error_message: error.map(|err| err.to_string()),
                error_family: error.map(ProviderError::family),
                skip: error.map(ProviderError::is_skip).unwrap_or(false),
                metadata,
                shadow_used,
                failure_kind: None,
            },
        );
    }
}
