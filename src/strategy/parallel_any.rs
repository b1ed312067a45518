//! Parallel racing: every provider starts concurrently, the first success
//! wins, and the rest are cancelled.

use crate::error::join_failure_details;
use crate::invoker::{log_parallel_results, InvocationResult};

use super::{
    chain_failed_from_provider_error, collect_failures, extract_fatal, FinalErrorKind,
    ParallelOptions, RunContext, StrategyFailure, StrategySuccess,
};

pub(crate) async fn run_parallel_any(
    ctx: &RunContext,
) -> Result<StrategySuccess, StrategyFailure> {
    let run = super::run_parallel_workers(
        ctx,
        ParallelOptions {
            capture_shadow_metrics: false,
            race_to_first: true,
            abort_on_failure: false,
        },
    )
    .await;
    let mut slots = run.results;

    // A fatal worker error overrides the race outcome.
    if let Some(fatal) = extract_fatal(&slots) {
        flush(ctx, slots, None);
        return Err(StrategyFailure::Propagate(fatal));
    }

    let winner = run.winner_index.and_then(|index| {
        slots
            .get(index)
            .and_then(Option::as_ref)
            .filter(|result| result.succeeded())
            .map(|result| {
                let tokens_in = result.tokens_in.unwrap_or(0);
                let tokens_out = result.tokens_out.unwrap_or(0);
                (
                    result.attempt,
                    result.provider.name().to_string(),
                    result.provider.estimate_cost(tokens_in, tokens_out),
                    result.response.clone(),
                )
            })
    });

    match winner {
        Some((winner_label, winner_provider, winner_cost_usd, Some(response))) => {
            // The winner's run_metric reports how many attempts the race
            // actually started, not the winner's own attempt label.
            let attempts_final = run.attempts_started.max(1);
            flush(ctx, slots, Some((winner_label, attempts_final)));
            Ok(StrategySuccess {
                response,
                invocations: None,
                winner_provider,
                winner_cost_usd,
            })
        }
        _ => {
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
                format!("all workers failed: {detail}")
            };
            flush(ctx, slots, None);
            Err(chain_failed_from_provider_error(
                run.attempt_count,
                last_error,
                failures,
                message,
                FinalErrorKind::AllFailed,
            ))
        }
    }
}

fn flush(
    ctx: &RunContext,
    slots: Vec<Option<InvocationResult>>,
    attempts_override: Option<(usize, usize)>,
) {
    let mut results: Vec<InvocationResult> = slots.into_iter().flatten().collect();
    log_parallel_results(
        &mut results,
        ctx.logger.as_ref(),
        &ctx.request,
        &ctx.fingerprint,
        &ctx.metadata,
        ctx.run_started,
        ctx.shadow.is_some(),
        attempts_override,
    );
}
