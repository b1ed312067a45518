//! Runner facade.
//!
//! Normalizes the request, seeds run metadata and the fingerprint, selects
//! the strategy, consults the budget manager, and finalizes the event
//! stream on failure paths. The async entry point is the engine; the
//! blocking entry point drives it on a private runtime with identical
//! semantics.

use std::sync::Arc;
use std::time::Instant;

use serde_json::json;
use tracing::{debug, info};

use crate::budget::BudgetManager;
use crate::config::{RunnerConfig, RunnerMode};
use crate::error::{ProviderError, RunnerError, RunnerResult};
use crate::events::{
    log_chain_failed, log_run_metric, resolve_event_logger, CallStatus, RunMetricRecord,
    SharedLogger,
};
use crate::invoker::{InvocationResult, ProviderInvoker};
use crate::provider::SharedProvider;
use crate::rate_limit::{resolve_rate_limiter, RateLimiter};
use crate::request::{ProviderRequest, ProviderResponse};
use crate::strategy::{
    run_consensus, run_parallel_all, run_parallel_any, run_sequential, FinalErrorKind,
    RunContext, StrategyFailure, StrategySuccess,
};
use crate::util::{elapsed_ms, JsonMap};

/// Full fan-out result: every invocation in input order, with the first
/// input provider as the primary for single-response consumers.
#[derive(Debug)]
pub struct FanoutResult {
    pub invocations: Vec<InvocationResult>,
}

impl FanoutResult {
    pub fn primary_response(&self) -> Option<&ProviderResponse> {
        self.invocations
            .first()
            .and_then(|invocation| invocation.response.as_ref())
    }

    pub fn responses(&self) -> Vec<&ProviderResponse> {
        self.invocations
            .iter()
            .filter_map(|invocation| invocation.response.as_ref())
            .collect()
    }
}

/// What a run returns: a single response, or the fan-out container for
/// `parallel_all`.
#[derive(Debug)]
pub enum RunOutcome {
    Response(ProviderResponse),
    Fanout(FanoutResult),
}

impl RunOutcome {
    /// The single (or primary) response of the run.
    pub fn response(&self) -> Option<&ProviderResponse> {
        match self {
            Self::Response(response) => Some(response),
            Self::Fanout(fanout) => fanout.primary_response(),
        }
    }

    pub fn into_response(self) -> Option<ProviderResponse> {
        match self {
            Self::Response(response) => Some(response),
            Self::Fanout(fanout) => fanout
                .invocations
                .into_iter()
                .next()
                .and_then(|invocation| invocation.response),
        }
    }
}

/// Strategy-driven provider orchestrator.
pub struct Runner {
    providers: Vec<SharedProvider>,
    logger: Option<SharedLogger>,
    config: RunnerConfig,
    rate_limiter: Option<Arc<RateLimiter>>,
    budget: Option<BudgetManager>,
}

impl Runner {
    pub fn new(providers: Vec<SharedProvider>, config: RunnerConfig) -> RunnerResult<Self> {
        if providers.is_empty() {
            return Err(RunnerError::InvalidInput(
                "runner requires at least one provider".into(),
            ));
        }
        let rate_limiter = resolve_rate_limiter(config.rpm)
            .map_err(|error| RunnerError::InvalidInput(error.to_string()))?;
        let budget = config.budget.clone().map(BudgetManager::new);
        Ok(Self {
            providers,
            logger: None,
            config,
            rate_limiter,
            budget,
        })
    }

    /// Attach an explicit event logger; it wins over `metrics_path`.
    pub fn with_logger(mut self, logger: SharedLogger) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn providers(&self) -> &[SharedProvider] {
        &self.providers
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Execute the request under the configured strategy.
    pub async fn run(&self, request: ProviderRequest) -> RunnerResult<RunOutcome> {
        self.run_with_shadow(request, None).await
    }

    /// Execute with an explicit shadow provider (overrides the configured one).
    pub async fn run_with_shadow(
        &self,
        request: ProviderRequest,
        shadow: Option<SharedProvider>,
    ) -> RunnerResult<RunOutcome> {
        let logger = resolve_event_logger(self.logger.clone(), self.config.metrics_path.as_deref());
        let run_started = Instant::now();
        let fingerprint = request.fingerprint();
        let mode = self.config.mode();
        let shadow = shadow.or_else(|| self.config.shadow_provider.clone());

        // The attempt cap clips the provider list up front; re-labeled
        // parallel retries are bounded separately against the same cap.
        let providers: Vec<SharedProvider> = match self.config.max_attempts {
            Some(cap) => self.providers.iter().take(cap).cloned().collect(),
            None => self.providers.clone(),
        };
        let all_provider_names: Vec<String> = self
            .providers
            .iter()
            .map(|provider| provider.name().to_string())
            .collect();

        let mut metadata: JsonMap = request.metadata().clone();
        let run_id = metadata
            .get("trace_id")
            .and_then(|value| value.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| fingerprint.clone());
        metadata.insert("run_id".into(), json!(run_id));
        metadata.insert("mode".into(), json!(mode.as_str()));
        metadata.insert(
            "providers".into(),
            json!(providers
                .iter()
                .map(|provider| provider.name())
                .collect::<Vec<_>>()),
        );

        if providers.is_empty() {
            let error = RunnerError::all_failed("no providers were attempted", Vec::new());
            log_chain_failed(
                logger.as_ref(),
                &fingerprint,
                0,
                &all_provider_names,
                None,
                None,
                None,
            );
            log_run_metric(
                logger.as_ref(),
                &fingerprint,
                RunMetricRecord {
                    provider: None,
                    request: &request,
                    status: CallStatus::Error,
                    attempts: 0,
                    latency_ms: elapsed_ms(run_started),
                    tokens_in: None,
                    tokens_out: None,
                    cost_usd: 0.0,
                    error_type: Some(error.wire_name()),
                    error_message: Some(error.to_string()),
                    error_family: Some(error.family()),
                    skip: false,
                    metadata: &metadata,
                    shadow_used: shadow.is_some(),
                    failure_kind: None,
                },
            );
            return Err(error);
        }

        debug!(
            mode = mode.as_str(),
            providers = providers.len(),
            fingerprint = %fingerprint,
            "starting run"
        );

        let ctx = RunContext {
            request,
            providers,
            all_provider_names,
            logger,
            metadata,
            fingerprint,
            run_started,
            shadow,
            config: self.config.clone(),
            invoker: ProviderInvoker::new(self.rate_limiter.clone()),
        };

        let outcome = match mode {
            RunnerMode::Sequential => run_sequential(&ctx).await,
            RunnerMode::ParallelAny => run_parallel_any(&ctx).await,
            RunnerMode::ParallelAll => run_parallel_all(&ctx).await,
            RunnerMode::Consensus => run_consensus(&ctx).await,
        };

        match outcome {
            Ok(success) => self.accept(&ctx, success),
            Err(failure) => Err(self.finalize_failure(&ctx, failure)),
        }
    }

    /// Blocking entry point with identical semantics.
    ///
    /// Drives the async engine on a private current-thread runtime; must not
    /// be called from inside an async context.
    pub fn run_blocking(&self, request: ProviderRequest) -> RunnerResult<RunOutcome> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|error| {
                RunnerError::InvalidInput(format!("failed to build blocking runtime: {error}"))
            })?;
        runtime.block_on(self.run(request))
    }

    /// Budget consultation after a strategy success; a breach demotes the
    /// run to a guard violation.
    fn accept(&self, ctx: &RunContext, success: StrategySuccess) -> RunnerResult<RunOutcome> {
        if let Some(budget) = &self.budget {
            let decision = budget.evaluate(&success.winner_provider, success.winner_cost_usd);
            if let Some(stop_reason) = decision.stop_reason {
                info!(
                    provider = %success.winner_provider,
                    stop_reason = %stop_reason,
                    "run demoted by budget guard"
                );
                let message = format!("budget exceeded: {stop_reason}");
                log_run_metric(
                    ctx.logger.as_ref(),
                    &ctx.fingerprint,
                    RunMetricRecord {
                        provider: None,
                        request: &ctx.request,
                        status: CallStatus::Error,
                        attempts: 0,
                        latency_ms: elapsed_ms(ctx.run_started),
                        tokens_in: None,
                        tokens_out: None,
                        cost_usd: success.winner_cost_usd,
                        error_type: Some("AllFailedError"),
                        error_message: Some(message.clone()),
                        error_family: Some("fatal"),
                        skip: false,
                        metadata: &ctx.metadata,
                        shadow_used: ctx.shadow.is_some(),
                        failure_kind: Some("guard_violation"),
                    },
                );
                return Err(RunnerError::AllFailed {
                    message,
                    failures: Vec::new(),
                    stop_reason: Some(stop_reason),
                });
            }
        }
        match success.invocations {
            Some(invocations) => Ok(RunOutcome::Fanout(FanoutResult { invocations })),
            None => Ok(RunOutcome::Response(success.response)),
        }
    }

    /// Emit the chain-failure events and build the terminal error.
    fn finalize_failure(&self, ctx: &RunContext, failure: StrategyFailure) -> RunnerError {
        match failure {
            StrategyFailure::Propagate(error) => RunnerError::Provider(error),
            StrategyFailure::ChainFailed {
                attempt_count,
                last_error,
                last_error_type,
                last_error_message,
                last_error_family,
                failures,
                message,
                kind,
            } => {
                log_chain_failed(
                    ctx.logger.as_ref(),
                    &ctx.fingerprint,
                    attempt_count,
                    &ctx.all_provider_names,
                    last_error_type.as_deref(),
                    last_error_message.clone(),
                    last_error_family.as_deref(),
                );
                let final_error = match kind {
                    FinalErrorKind::ReRaise => RunnerError::Provider(
                        last_error.unwrap_or_else(|| ProviderError::Fatal(message.clone())),
                    ),
                    FinalErrorKind::AllFailed => RunnerError::AllFailed {
                        message: message.clone(),
                        failures,
                        stop_reason: None,
                    },
                    FinalErrorKind::Parallel => RunnerError::ParallelExecution {
                        message: message.clone(),
                        failures,
                    },
                };
                log_run_metric(
                    ctx.logger.as_ref(),
                    &ctx.fingerprint,
                    RunMetricRecord {
                        provider: None,
                        request: &ctx.request,
                        status: CallStatus::Error,
                        attempts: attempt_count,
                        latency_ms: elapsed_ms(ctx.run_started),
                        tokens_in: None,
                        tokens_out: None,
                        cost_usd: 0.0,
                        error_type: Some(final_error.wire_name()),
                        error_message: Some(final_error.to_string()),
                        error_family: Some(final_error.family()),
                        skip: false,
                        metadata: &ctx.metadata,
                        shadow_used: ctx.shadow.is_some(),
                        failure_kind: None,
                    },
                );
                final_error
            }
        }
    }
}
