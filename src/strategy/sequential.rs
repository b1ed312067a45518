//! Sequential failover: try providers in input order until one succeeds.

use crate::error::{join_failure_details, FailureDetail, ProviderError};
use crate::events::{log_run_metric, CallStatus, RunMetricRecord};
use crate::retry::{Advance, AttemptSequencer, RetryController};

use super::{
    chain_failed_from_provider_error, FinalErrorKind, RunContext, StrategyFailure,
    StrategySuccess,
};

pub(crate) async fn run_sequential(
    ctx: &RunContext,
) -> Result<StrategySuccess, StrategyFailure> {
    let total = ctx.total_providers();
    let invoke_ctx = ctx.invoke_ctx(false);
    let controller = RetryController::new(&ctx.invoker, &ctx.config.retries, &ctx.config.backoff);
    let mut sequencer = AttemptSequencer::new(ctx.config.max_attempts);

    let mut last_error: Option<ProviderError> = None;
    let mut failures: Vec<FailureDetail> = Vec::new();

    for provider in &ctx.providers {
        let (result, advance) = controller
            .run_provider(provider, &ctx.request, total, &invoke_ctx, &mut sequencer)
            .await;

        if let Some(result) = &result {
            if let Some(error) = &result.error {
                failures.push(FailureDetail::new(
                    provider.name().to_string(),
                    result.attempt,
                    error.summary(),
                ));
                last_error = Some(error.clone());
            }
        }

        match advance {
            Advance::Success => {
                let Some(result) = result else { continue };
                let Some(response) = result.response else { continue };
                let tokens_in = result.tokens_in.unwrap_or(0);
                let tokens_out = result.tokens_out.unwrap_or(0);
                let cost_usd = provider.estimate_cost(tokens_in, tokens_out);
                log_run_metric(
                    ctx.logger.as_ref(),
                    &ctx.fingerprint,
                    RunMetricRecord {
                        provider: Some(provider.as_ref()),
                        request: &ctx.request,
                        status: CallStatus::Ok,
                        attempts: sequencer.used(),
                        latency_ms: response.latency_ms,
                        tokens_in: Some(tokens_in),
                        tokens_out: Some(tokens_out),
                        cost_usd,
                        error_type: None,
                        error_message: None,
                        error_family: None,
                        skip: false,
                        metadata: &ctx.metadata,
                        shadow_used: ctx.shadow.is_some(),
                        failure_kind: None,
                    },
                );
                return Ok(StrategySuccess {
                    response,
                    invocations: None,
                    winner_provider: provider.name().to_string(),
                    winner_cost_usd: cost_usd,
                });
            }
            Advance::NextProvider => continue,
            Advance::Propagate => {
                let error = last_error
                    .take()
                    .unwrap_or_else(|| ProviderError::Fatal("provider chain aborted".into()));
                return Err(StrategyFailure::Propagate(error));
            }
            Advance::BudgetExhausted => break,
        }
    }

    let attempt_count = sequencer.used();
    let message = if attempt_count == 0 {
        "no providers were attempted".to_string()
    } else {
        let detail = join_failure_details(&failures);
        if detail.is_empty() {
            "all providers failed".to_string()
        } else {
            format!("all providers failed: {detail}")
        }
    };
    // A single-provider chain re-raises the original error verbatim.
    let kind = if ctx.providers.len() <= 1 && last_error.is_some() {
        FinalErrorKind::ReRaise
    } else {
        FinalErrorKind::AllFailed
    };
    Err(chain_failed_from_provider_error(
        attempt_count,
        last_error,
        failures,
        message,
        kind,
    ))
}
