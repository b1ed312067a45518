//! Parallel fan-out: run every provider to completion and return the full
//! ordered invocation list, with the first input provider as the primary.

use crate::error::join_failure_details;
use crate::invoker::{log_parallel_results, InvocationResult};

use super::{
    chain_failed_from_provider_error, collect_failures, extract_fatal, FinalErrorKind,
    ParallelOptions, RunContext, StrategyFailure, StrategySuccess,
};

pub(crate) async fn run_parallel_all(
    ctx: &RunContext,
) -> Result<StrategySuccess, StrategyFailure> {
    let run = super::run_parallel_workers(
        ctx,
        ParallelOptions {
            capture_shadow_metrics: false,
            race_to_first: false,
            abort_on_failure: true,
        },
    )
    .await;
    let slots = run.results;

    if let Some(fatal) = extract_fatal(&slots) {
        flush(ctx, slots);
        return Err(StrategyFailure::Propagate(fatal));
    }

    let any_failed = run.aborted
        || slots
            .iter()
            .any(|slot| slot.as_ref().map(|result| !result.succeeded()).unwrap_or(true));
    if any_failed {
        let failures = collect_failures(&slots);
        let last_error = slots
            .iter()
            .flatten()
            .filter_map(|result| result.error.clone())
            .last();
        let detail = join_failure_details(&failures);
        let message = if detail.is_empty() {
            "all workers failed".to_string()
        } else {
            format!("parallel execution failed: {detail}")
        };
        flush(ctx, slots);
        return Err(chain_failed_from_provider_error(
            run.attempt_count,
            last_error,
            failures,
            message,
            FinalErrorKind::Parallel,
        ));
    }

    let mut invocations: Vec<InvocationResult> = slots.into_iter().flatten().collect();
    log_parallel_results(
        &mut invocations,
        ctx.logger.as_ref(),
        &ctx.request,
        &ctx.fingerprint,
        &ctx.metadata,
        ctx.run_started,
        ctx.shadow.is_some(),
        None,
    );

    // The primary response for single-response consumers is the first input
    // provider's.
    let primary = &invocations[0];
    let Some(response) = primary.response.clone() else {
        return Err(chain_failed_from_provider_error(
            run.attempt_count,
            None,
            Vec::new(),
            "parallel execution produced no primary response".to_string(),
            FinalErrorKind::Parallel,
        ));
    };
    let tokens_in = primary.tokens_in.unwrap_or(0);
    let tokens_out = primary.tokens_out.unwrap_or(0);
    let winner_provider = primary.provider.name().to_string();
    let winner_cost_usd = primary.provider.estimate_cost(tokens_in, tokens_out);

    Ok(StrategySuccess {
        response,
        invocations: Some(invocations),
        winner_provider,
        winner_cost_usd,
    })
}

fn flush(ctx: &RunContext, slots: Vec<Option<InvocationResult>>) {
    let mut results: Vec<InvocationResult> = slots.into_iter().flatten().collect();
    log_parallel_results(
        &mut results,
        ctx.logger.as_ref(),
        &ctx.request,
        &ctx.fingerprint,
        &ctx.metadata,
        ctx.run_started,
        ctx.shadow.is_some(),
        None,
    );
}
