//! Execution strategies.
//!
//! One strategy per runner mode over a single shared invoker. The parallel
//! strategies share the worker machinery here: bounded concurrency, global
//! attempt labeling, the rate-limit re-attempt hook, and cancellation
//! bookkeeping for the racing path.

mod consensus;
mod parallel_all;
mod parallel_any;
mod sequential;

pub(crate) use consensus::run_consensus;
pub(crate) use parallel_all::run_parallel_all;
pub(crate) use parallel_any::run_parallel_any;
pub(crate) use sequential::run_sequential;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use serde_json::json;
use tokio::sync::Semaphore;
use tracing::debug;

use crate::config::RunnerConfig;
use crate::error::{FailureDetail, ProviderError};
use crate::events::{log_retry, SharedLogger};
use crate::invoker::{cancelled_result, InvocationResult, InvokeContext, ProviderInvoker};
use crate::provider::SharedProvider;
use crate::request::{ProviderRequest, ProviderResponse};
use crate::retry::parallel_retry_decision;
use crate::util::JsonMap;

/// Everything a strategy needs for one run.
pub(crate) struct RunContext {
    pub request: ProviderRequest,
    /// Provider list already clipped to the run-wide attempt cap.
    pub providers: Vec<SharedProvider>,
    /// Names of every configured provider, for chain-failure events.
    pub all_provider_names: Vec<String>,
    pub logger: Option<SharedLogger>,
    pub metadata: JsonMap,
    pub fingerprint: String,
    pub run_started: Instant,
    pub shadow: Option<SharedProvider>,
    pub config: RunnerConfig,
    pub invoker: ProviderInvoker,
}

impl RunContext {
    pub fn total_providers(&self) -> usize {
        self.providers.len()
    }

    pub fn invoke_ctx(&self, capture_shadow_metrics: bool) -> InvokeContext<'_> {
        InvokeContext {
            logger: self.logger.as_ref(),
            request_fingerprint: &self.fingerprint,
            metadata: &self.metadata,
            shadow: self.shadow.as_ref(),
            capture_shadow_metrics,
        }
    }
}

/// Successful strategy outcome plus what the budget manager needs.
pub(crate) struct StrategySuccess {
    pub response: ProviderResponse,
    /// Full ordered invocation list for the fan-out mode.
    pub invocations: Option<Vec<InvocationResult>>,
    pub winner_provider: String,
    pub winner_cost_usd: f64,
}

/// How the runner should surface a failed strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FinalErrorKind {
    /// Re-raise the last provider error verbatim (single-provider sequential
    /// runs and immediately-propagated fatal errors).
    ReRaise,
    AllFailed,
    Parallel,
}

/// Failed strategy outcome.
pub(crate) enum StrategyFailure {
    /// The original error propagates unchanged, with no chain events.
    Propagate(ProviderError),
    /// The chain failed: the runner emits `provider_chain_failed` and the
    /// terminal `run_metric`, then wraps per `kind`.
    ChainFailed {
        attempt_count: usize,
        last_error: Option<ProviderError>,
        last_error_type: Option<String>,
        last_error_message: Option<String>,
        last_error_family: Option<String>,
        failures: Vec<FailureDetail>,
        message: String,
        kind: FinalErrorKind,
    },
}

pub(crate) fn normalize_concurrency(total: usize, limit: Option<usize>) -> usize {
    match limit {
        None | Some(0) => total.max(1),
        Some(limit) => limit.min(total).max(1),
    }
}

/// Per-run shared state for the parallel worker pool.
pub(crate) struct ParallelState {
    pub results: Vec<Option<InvocationResult>>,
    pub attempt_labels: Vec<usize>,
    pub retry_attempts: usize,
    pending_retry: HashMap<usize, JsonMap>,
}

impl ParallelState {
    fn new(total: usize) -> Self {
        Self {
            results: (0..total).map(|_| None).collect(),
            attempt_labels: (1..=total).collect(),
            retry_attempts: 0,
            pending_retry: HashMap::new(),
        }
    }

    /// Total attempt labels handed out so far.
    pub fn attempt_count(&self, total: usize) -> usize {
        total + self.retry_attempts
    }
}

#[derive(Debug, Clone, Copy)]
enum WorkerExit {
    Success(usize),
    Failure(usize),
}

pub(crate) struct ParallelOptions {
    pub capture_shadow_metrics: bool,
    /// Stop on the first success and cancel the rest.
    pub race_to_first: bool,
    /// Cancel the pool as soon as any worker fails permanently.
    pub abort_on_failure: bool,
}

pub(crate) struct ParallelRun {
    pub results: Vec<Option<InvocationResult>>,
    pub winner_index: Option<usize>,
    /// Whether the pool was cancelled before every worker finished.
    pub aborted: bool,
    pub attempt_count: usize,
    /// Attempts actually started at the moment the race was decided.
    pub attempts_started: usize,
}

/// Run one worker per provider under the shared semaphore.
///
/// The retry hook re-labels rate-limited attempts as
/// `total_providers + retry_attempts + 1`; the matching `retry` event is
/// emitted only when the re-attempt actually starts.
async fn run_worker(
    index: usize,
    provider: SharedProvider,
    ctx: &RunContext,
    invoke_ctx: &InvokeContext<'_>,
    state: &Mutex<ParallelState>,
    semaphore: &Semaphore,
) -> WorkerExit {
    let total = ctx.total_providers();
    let mut label = index + 1;
    loop {
        {
            let mut st = state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(payload) = st.pending_retry.remove(&index) {
                if payload.get("next_attempt") == Some(&json!(label)) {
                    log_retry(ctx.logger.as_ref(), payload);
                } else {
                    st.pending_retry.insert(index, payload);
                }
            }
        }

        let _permit = semaphore.acquire().await.ok();
        let result = ctx
            .invoker
            .invoke(&provider, &ctx.request, label, total, invoke_ctx)
            .await;
        drop(_permit);

        let succeeded = result.succeeded();
        let error = result.error.clone();
        {
            let mut st = state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            st.results[index] = Some(result);
        }
        if succeeded {
            return WorkerExit::Success(index);
        }

        let error =
            error.unwrap_or_else(|| ProviderError::Fatal("provider returned no response".into()));
        let decision = {
            let mut st = state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            match parallel_retry_decision(
                &error,
                total,
                st.retry_attempts,
                ctx.config.max_attempts,
                &ctx.config.backoff,
            ) {
                Some((next_attempt, delay)) => {
                    st.retry_attempts += 1;
                    let retry_attempt = st.retry_attempts;
                    st.attempt_labels[index] = next_attempt;
                    let mut payload = JsonMap::new();
                    payload.insert(
                        "request_fingerprint".into(),
                        json!(ctx.fingerprint.clone()),
                    );
                    payload.insert("provider".into(), json!(provider.name()));
                    payload.insert("attempt".into(), json!(label));
                    payload.insert("retry_attempt".into(), json!(retry_attempt));
                    payload.insert("next_attempt".into(), json!(next_attempt));
                    payload.insert("error_type".into(), json!(error.wire_name()));
                    payload.insert("delay_seconds".into(), json!(delay.as_secs_f64()));
                    st.pending_retry.insert(index, payload);
                    Some((next_attempt, delay))
                }
                None => None,
            }
        };
        match decision {
            Some((next_attempt, delay)) => {
                debug!(
                    provider = provider.name(),
                    attempt = label,
                    next_attempt,
                    "scheduling parallel re-attempt"
                );
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                label = next_attempt;
            }
            None => return WorkerExit::Failure(index),
        }
    }
}

/// Drive all workers to a decision for the parallel strategies.
pub(crate) async fn run_parallel_workers(
    ctx: &RunContext,
    options: ParallelOptions,
) -> ParallelRun {
    let total = ctx.total_providers();
    let concurrency = normalize_concurrency(total, ctx.config.max_concurrency);
    let semaphore = Semaphore::new(concurrency);
    let state = Mutex::new(ParallelState::new(total));
    let invoke_ctx = ctx.invoke_ctx(options.capture_shadow_metrics);

    let mut workers: FuturesUnordered<_> = ctx
        .providers
        .iter()
        .enumerate()
        .map(|(index, provider)| {
            run_worker(
                index,
                Arc::clone(provider),
                ctx,
                &invoke_ctx,
                &state,
                &semaphore,
            )
        })
        .collect();

    let mut winner_index = None;
    let mut aborted = false;
    while let Some(exit) = workers.next().await {
        match exit {
            WorkerExit::Success(index) => {
                if options.race_to_first {
                    winner_index = Some(index);
                    aborted = true;
                    break;
                }
            }
            WorkerExit::Failure(_) => {
                if options.abort_on_failure {
                    aborted = true;
                    break;
                }
            }
        }
    }
    // Dropping the pool cancels every in-flight worker at its await point.
    drop(workers);

    let mut state = state.into_inner().unwrap_or_else(|poisoned| poisoned.into_inner());
    let attempts_started = state.results.iter().filter(|slot| slot.is_some()).count();
    let attempt_count = state.attempt_count(total);

    if options.race_to_first {
        // Cancelled workers still surface in the event stream via synthetic
        // results; the deferred logger emits their provider_call/run_metric.
        for index in 0..total {
            if state.results[index].is_none() {
                let label = state.attempt_labels[index];
                state.results[index] = Some(cancelled_result(
                    &ctx.providers[index],
                    label,
                    total,
                    ctx.run_started,
                ));
            }
        }
    }

    ParallelRun {
        results: state.results,
        winner_index,
        aborted,
        attempt_count,
        attempts_started,
    }
}

/// Collect per-provider failure details from finished workers, ordered by
/// attempt index.
pub(crate) fn collect_failures(results: &[Option<InvocationResult>]) -> Vec<FailureDetail> {
    let mut failures: Vec<FailureDetail> = results
        .iter()
        .flatten()
        .filter_map(|result| {
            result.error.as_ref().map(|error| {
                FailureDetail::new(
                    result.provider.name().to_string(),
                    result.attempt,
                    error.summary(),
                )
            })
        })
        .collect();
    failures.sort_by_key(|failure| failure.attempt);
    failures
}

/// A fatal worker error overrides any other outcome of a parallel pool.
pub(crate) fn extract_fatal(results: &[Option<InvocationResult>]) -> Option<ProviderError> {
    results.iter().flatten().find_map(|result| match &result.error {
        Some(error @ ProviderError::Fatal(_)) => Some(error.clone()),
        _ => None,
    })
}

pub(crate) fn chain_failed_from_provider_error(
    attempt_count: usize,
    last_error: Option<ProviderError>,
    failures: Vec<FailureDetail>,
    message: String,
    kind: FinalErrorKind,
) -> StrategyFailure {
    StrategyFailure::ChainFailed {
        attempt_count,
        last_error_type: last_error.as_ref().map(|e| e.wire_name().to_string()),
        last_error_message: last_error.as_ref().map(|e| e.to_string()),
        last_error_family: last_error.as_ref().map(|e| e.family().to_string()),
        last_error,
        failures,
        message,
        kind,
    }
}
