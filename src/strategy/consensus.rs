//! Consensus orchestration: fan out to every provider, tolerate individual
//! failures, and let the evaluator pick one winning response.

use serde_json::json;

use crate::consensus::{compute_consensus, ConsensusObservation};
use crate::error::{join_failure_details, RunnerError};
use crate::events::emit_event;
use crate::invoker::{log_parallel_results, InvocationResult};
use crate::provider::SharedProvider;
use crate::util::{text_hash, JsonMap};

use super::{
    chain_failed_from_provider_error, collect_failures, extract_fatal, FinalErrorKind,
    ParallelOptions, RunContext, StrategyFailure, StrategySuccess,
};

pub(crate) async fn run_consensus(
    ctx: &RunContext,
) -> Result<StrategySuccess, StrategyFailure> {
    let run = super::run_parallel_workers(
        ctx,
        ParallelOptions {
            capture_shadow_metrics: true,
            race_to_first: false,
            abort_on_failure: false,
        },
    )
    .await;
    let mut slots = run.results;

    if let Some(fatal) = extract_fatal(&slots) {
        flush(ctx, slots);
        return Err(StrategyFailure::Propagate(fatal));
    }

    // Only successful observations enter the evaluator; worker order is
    // preserved so stable tie-breaking follows input order.
    let mut observations: Vec<ConsensusObservation> = Vec::new();
    let mut observation_workers: Vec<usize> = Vec::new();
    for (worker_index, slot) in slots.iter().enumerate() {
        let Some(result) = slot else { continue };
        let Some(response) = &result.response else { continue };
        let tokens_in = result.tokens_in.unwrap_or(response.token_usage.prompt);
        let tokens_out = result.tokens_out.unwrap_or(response.token_usage.completion);
        let cost_estimate = result.provider.estimate_cost(tokens_in, tokens_out);
        observations.push(
            ConsensusObservation::from_response(
                result.provider.name().to_string(),
                response.clone(),
            )
            .with_cost(cost_estimate),
        );
        observation_workers.push(worker_index);
    }

    if observations.is_empty() {
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
        flush(ctx, slots);
        return Err(chain_failed_from_provider_error(
            run.attempt_count,
            last_error,
            failures,
            message,
            FinalErrorKind::Parallel,
        ));
    }

    let config = ctx.config.consensus.clone().unwrap_or_default();
    let judge: Option<SharedProvider> = ctx.config.judge_provider.clone().or_else(|| {
        config.judge.as_ref().and_then(|judge_name| {
            ctx.providers
                .iter()
                .find(|provider| provider.name() == judge_name)
                .cloned()
        })
    });

    let consensus = match compute_consensus(&observations, &config, judge.as_ref()).await {
        Ok(consensus) => consensus,
        Err(error) => {
            let failures = match &error {
                RunnerError::ParallelExecution { failures, .. } if !failures.is_empty() => {
                    failures.clone()
                }
                _ => collect_failures(&slots),
            };
            let message = error.to_string();
            flush(ctx, slots);
            return Err(StrategyFailure::ChainFailed {
                attempt_count: run.attempt_count,
                last_error: None,
                last_error_type: Some(error.wire_name().to_string()),
                last_error_message: Some(message.clone()),
                last_error_family: Some(error.family().to_string()),
                failures,
                message,
                kind: FinalErrorKind::Parallel,
            });
        }
    };

    let votes_against = consensus
        .total_voters
        .saturating_sub(consensus.votes + consensus.abstained);

    if ctx.logger.is_some() {
        let candidate_summaries: Vec<serde_json::Value> = observations
            .iter()
            .map(|observation| {
                let response = observation
                    .response
                    .as_ref()
                    .map(|response| (response.latency_ms, response.text.clone()));
                let (latency_ms, text) = response.unwrap_or((0, String::new()));
                json!({
                    "provider": observation.provider_id,
                    "latency_ms": latency_ms,
                    "votes": consensus.tally.get(text.trim()).copied().unwrap_or(0),
                    "text_hash": text_hash("consensus", &text),
                })
            })
            .collect();
        let schema_failures: JsonMap = consensus
            .schema_failures
            .iter()
            .map(|(index, reason)| (index.to_string(), json!(reason)))
            .collect();

        let mut fields = JsonMap::new();
        fields.insert("reason".into(), json!(consensus.reason));
        fields.insert("strategy".into(), json!(consensus.strategy.as_str()));
        fields.insert(
            "tie_breaker".into(),
            json!(consensus.tie_breaker.map(|b| b.as_str())),
        );
        fields.insert("quorum".into(), json!(consensus.min_votes));
        fields.insert("min_votes".into(), json!(consensus.min_votes));
        fields.insert("voters_total".into(), json!(consensus.total_voters));
        fields.insert("votes_for".into(), json!(consensus.votes));
        fields.insert("votes_against".into(), json!(votes_against));
        fields.insert("abstained".into(), json!(consensus.abstained));
        fields.insert(
            "chosen_provider".into(),
            json!(consensus.winner_provider_id),
        );
        fields.insert(
            "winner_provider".into(),
            json!(consensus.winner_provider_id),
        );
        fields.insert("winner_score".into(), json!(consensus.winner_score));
        fields.insert(
            "winner_latency_ms".into(),
            json!(consensus.response.latency_ms),
        );
        fields.insert(
            "tie_break_applied".into(),
            json!(consensus.tie_break_applied),
        );
        fields.insert(
            "tie_break_reason".into(),
            json!(consensus.tie_break_reason),
        );
        fields.insert(
            "tie_breaker_selected".into(),
            json!(consensus.tie_breaker_selected),
        );
        fields.insert("rounds".into(), json!(consensus.rounds));
        fields.insert("scores".into(), json!(consensus.scores));
        fields.insert("schema_checked".into(), json!(consensus.schema_checked));
        fields.insert("schema_failures".into(), json!(schema_failures));
        fields.insert("judge".into(), json!(consensus.judge_name));
        fields.insert("judge_score".into(), json!(consensus.judge_score));
        fields.insert("votes".into(), json!(consensus.tally));
        fields.insert("candidate_summaries".into(), json!(candidate_summaries));
        emit_event(
            ctx.logger.as_ref(),
            "consensus_vote",
            &ctx.fingerprint,
            fields,
        );
    }

    // The winner's pending shadow record is enriched with the consensus
    // outcome; losers' records are emitted as-is by the deferred logger.
    let winner_worker = observation_workers[consensus.winner_stable_index];
    if let Some(result) = slots.get_mut(winner_worker).and_then(Option::as_mut) {
        if let Some(metrics) = &result.shadow_metrics {
            let mut extra = JsonMap::new();
            extra.insert(
                "shadow_consensus_delta".into(),
                json!({
                    "votes_for": consensus.votes,
                    "votes_total": consensus.total_voters,
                    "tie_break_applied": consensus.tie_break_applied,
                    "winner_score": consensus.winner_score,
                    "rounds": consensus.rounds,
                    "tie_break_reason": consensus.tie_break_reason,
                    "tie_breaker_selected": consensus.tie_breaker_selected,
                    "judge": consensus.judge_name,
                    "judge_score": consensus.judge_score,
                    "reason": consensus.reason,
                }),
            );
            if metrics.payload().get("shadow_ok") == Some(&json!(false)) {
                if let Some(error) = metrics.payload().get("shadow_error") {
                    extra.insert("shadow_consensus_error".into(), error.clone());
                }
            }
            result.shadow_extra = Some(extra);
        }
    }

    let winner_cost_usd = slots
        .get(winner_worker)
        .and_then(Option::as_ref)
        .map(|result| {
            let tokens_in = result.tokens_in.unwrap_or(0);
            let tokens_out = result.tokens_out.unwrap_or(0);
            result.provider.estimate_cost(tokens_in, tokens_out)
        })
        .unwrap_or(0.0);

    flush(ctx, slots);

    Ok(StrategySuccess {
        response: consensus.response.clone(),
        invocations: None,
        winner_provider: consensus.winner_provider_id.clone(),
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
