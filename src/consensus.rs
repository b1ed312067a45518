//! Consensus evaluation over successful provider responses.
//!
//! Observations are grouped into candidates by normalized text (canonical
//! JSON when the text parses, whitespace-collapsed lowercase otherwise),
//! gated by an optional JSON schema and latency/cost constraints, selected
//! by strategy, narrowed by tie-breakers and an optional judge, and finally
//! checked against the quorum.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::config::{ConsensusConfig, ConsensusStrategyKind, TieBreaker};
use crate::error::{FailureDetail, RunnerError, RunnerResult};
use crate::provider::SharedProvider;
use crate::request::{ProviderRequest, ProviderResponse, TokenUsage};
use crate::util::canonical_json;

/// One provider's contribution to a consensus round.
#[derive(Debug, Clone)]
pub struct ConsensusObservation {
    pub provider_id: String,
    pub response: Option<ProviderResponse>,
    pub latency_ms: Option<u64>,
    pub tokens: Option<TokenUsage>,
    pub cost_estimate: Option<f64>,
    pub error: Option<String>,
}

impl ConsensusObservation {
    pub fn from_response(provider_id: impl Into<String>, response: ProviderResponse) -> Self {
        let latency_ms = Some(response.latency_ms);
        let tokens = Some(response.token_usage);
        Self {
            provider_id: provider_id.into(),
            response: Some(response),
            latency_ms,
            tokens,
            cost_estimate: None,
            error: None,
        }
    }

    pub fn with_cost(mut self, cost_estimate: f64) -> Self {
        self.cost_estimate = Some(cost_estimate);
        self
    }
}

/// Outcome of a consensus evaluation.
#[derive(Debug, Clone)]
pub struct ConsensusResult {
    pub response: ProviderResponse,
    pub winner_provider_id: String,
    /// Input index of the winning entry, for locating its invocation.
    pub winner_stable_index: usize,
    pub votes: usize,
    pub tally: BTreeMap<String, usize>,
    pub total_voters: usize,
    pub reason: String,
    pub strategy: ConsensusStrategyKind,
    pub min_votes: Option<usize>,
    pub tie_breaker: Option<TieBreaker>,
    pub tie_break_applied: bool,
    pub tie_break_reason: Option<String>,
    pub tie_breaker_selected: Option<String>,
    pub winner_score: f64,
    pub abstained: usize,
    pub rounds: u32,
    pub schema_checked: bool,
    pub schema_failures: BTreeMap<usize, String>,
    pub judge_name: Option<String>,
    pub judge_score: Option<f64>,
    pub scores: Option<BTreeMap<String, f64>>,
}

#[derive(Debug, Clone)]
struct Candidate {
    normalized: String,
    text: String,
    entry_indexes: Vec<usize>,
    votes: usize,
    score: f64,
    best_score: f64,
    weight: f64,
    latency: u64,
    cost: f64,
    stable_index: usize,
}

impl Candidate {
    fn record(&mut self, index: usize, observation: &ConsensusObservation, weight: f64) {
        let Some(response) = &observation.response else {
            return;
        };
        self.entry_indexes.push(index);
        self.votes += 1;
        let value = response.raw_score().unwrap_or(0.0);
        if self.votes == 1 {
            self.weight = weight;
            self.score = value;
            self.best_score = value;
            self.latency = resolve_latency(observation, response);
            self.cost = resolve_cost(observation, response);
            self.stable_index = index;
        } else {
            self.weight += weight;
            self.score += value;
            self.best_score = self.best_score.max(value);
            self.latency = self.latency.min(resolve_latency(observation, response));
            self.cost = self.cost.min(resolve_cost(observation, response));
            self.stable_index = self.stable_index.min(index);
        }
    }
}

fn resolve_latency(observation: &ConsensusObservation, response: &ProviderResponse) -> u64 {
    observation.latency_ms.unwrap_or(response.latency_ms)
}

fn resolve_cost(observation: &ConsensusObservation, response: &ProviderResponse) -> f64 {
    if let Some(cost) = observation.cost_estimate {
        return cost;
    }
    let tokens = observation.tokens.unwrap_or(response.token_usage);
    tokens.total() as f64
}

/// Normalize a candidate text; JSON answers collapse to a canonical form so
/// formatting differences do not split a candidate.
fn normalize_candidate_text(text: &str) -> (String, String) {
    let stripped = text.trim().to_string();
    if stripped.is_empty() {
        return (String::new(), stripped);
    }
    match serde_json::from_str::<Value>(text) {
        Ok(parsed) => (canonical_json(&parsed), stripped),
        Err(_) => {
            let normalized = stripped
                .split_whitespace()
                .collect::<Vec<_>>()
                .join(" ")
                .to_lowercase();
            (normalized, stripped)
        }
    }
}

fn float_close(a: f64, b: f64) -> bool {
    let tolerance = 1e-9_f64.max(1e-9 * a.abs().max(b.abs()));
    (a - b).abs() <= tolerance
}

fn validate_schema(
    observations: &[ConsensusObservation],
    schema: Option<&str>,
) -> RunnerResult<(Vec<usize>, BTreeMap<usize, String>, bool)> {
    let Some(schema) = schema.filter(|schema| !schema.trim().is_empty()) else {
        return Ok(((0..observations.len()).collect(), BTreeMap::new(), false));
    };

    let spec: Value = serde_json::from_str(schema)
        .map_err(|_| RunnerError::InvalidInput("invalid consensus schema".into()))?;
    let spec = spec
        .as_object()
        .ok_or_else(|| RunnerError::InvalidInput("invalid consensus schema".into()))?;
    let expect_object = spec.get("type").and_then(Value::as_str) == Some("object");
    let required: Vec<String> = spec
        .get("required")
        .and_then(Value::as_array)
        .map(|fields| {
            fields
                .iter()
                .map(|field| match field {
                    Value::String(name) => name.clone(),
                    other => other.to_string(),
                })
                .collect()
        })
        .unwrap_or_default();

    let mut valid = Vec::new();
    let mut failures = BTreeMap::new();
    for (index, observation) in observations.iter().enumerate() {
        let Some(response) = &observation.response else {
            continue;
        };
        let parsed: Value = match serde_json::from_str(&response.text) {
            Ok(parsed) => parsed,
            Err(err) => {
                failures.insert(index, format!("invalid json: {err}"));
                continue;
            }
        };
        if expect_object && !parsed.is_object() {
            failures.insert(index, "expected object".to_string());
            continue;
        }
        let missing: Vec<&str> = required
            .iter()
            .filter(|field| parsed.get(field.as_str()).is_none())
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            failures.insert(index, format!("missing keys: {}", missing.join(", ")));
            continue;
        }
        valid.push(index);
    }
    Ok((valid, failures, true))
}

fn apply_constraints(
    observations: &[ConsensusObservation],
    valid: Vec<usize>,
    config: &ConsensusConfig,
) -> RunnerResult<Vec<usize>> {
    if config.max_latency_ms.is_none() && config.max_cost_usd.is_none() {
        return Ok(valid);
    }
    let mut filtered = Vec::new();
    let mut constraint_failures = Vec::new();
    for index in valid {
        let observation = &observations[index];
        let mut reasons = Vec::new();
        if let (Some(max_latency), Some(latency)) = (config.max_latency_ms, observation.latency_ms)
        {
            if latency > max_latency {
                reasons.push(format!("latency {latency}ms exceeds max {max_latency}ms"));
            }
        }
        if let (Some(max_cost), Some(cost)) = (config.max_cost_usd, observation.cost_estimate) {
            if cost > max_cost {
                reasons.push(format!("cost {cost} exceeds max {max_cost}"));
            }
        }
        if reasons.is_empty() {
            filtered.push(index);
        } else {
            let mut detail = FailureDetail::new(
                observation.provider_id.clone(),
                index + 1,
                reasons.join("; "),
            );
            detail.index = Some(index);
            detail.latency_ms = observation.latency_ms;
            detail.cost_usd = observation.cost_estimate;
            constraint_failures.push(detail);
        }
    }
    if filtered.is_empty() {
        return Err(RunnerError::parallel(
            "no responses satisfied consensus constraints",
            constraint_failures,
        ));
    }
    Ok(filtered)
}

fn build_candidates(
    observations: &[ConsensusObservation],
    valid: &[usize],
    config: &ConsensusConfig,
) -> Vec<Candidate> {
    let mut candidates: Vec<Candidate> = Vec::new();
    for &index in valid {
        let observation = &observations[index];
        let Some(response) = &observation.response else {
            continue;
        };
        let (normalized, display) = normalize_candidate_text(&response.text);
        let weight = config
            .provider_weights
            .get(&observation.provider_id)
            .copied()
            .unwrap_or(1.0);
        let position = candidates
            .iter()
            .position(|candidate| candidate.normalized == normalized);
        match position {
            Some(position) => candidates[position].record(index, observation, weight),
            None => {
                let mut candidate = Candidate {
                    normalized,
                    text: display,
                    entry_indexes: Vec::new(),
                    votes: 0,
                    score: 0.0,
                    best_score: 0.0,
                    weight: 0.0,
                    latency: 0,
                    cost: 0.0,
                    stable_index: 0,
                };
                candidate.record(index, observation, weight);
                candidates.push(candidate);
            }
        }
    }
    candidates
}

/// Select the candidate pool at the strategy's pivot value.
fn select_pool(
    strategy: ConsensusStrategyKind,
    candidates: &[Candidate],
) -> (Vec<usize>, f64, Option<BTreeMap<String, f64>>) {
    match strategy {
        ConsensusStrategyKind::Majority => {
            let pivot = candidates
                .iter()
                .map(|candidate| candidate.votes)
                .max()
                .unwrap_or(0);
            let pool = candidates
                .iter()
                .enumerate()
                .filter(|(_, candidate)| candidate.votes == pivot)
                .map(|(index, _)| index)
                .collect();
            (pool, pivot as f64, None)
        }
        ConsensusStrategyKind::Weighted => {
            pick_by_float(candidates, |candidate| candidate.score)
        }
        ConsensusStrategyKind::MaxScore => {
            pick_by_float(candidates, |candidate| candidate.best_score)
        }
        ConsensusStrategyKind::WeightedVote => {
            pick_by_float(candidates, |candidate| candidate.weight)
        }
    }
}

fn pick_by_float(
    candidates: &[Candidate],
    key: impl Fn(&Candidate) -> f64,
) -> (Vec<usize>, f64, Option<BTreeMap<String, f64>>) {
    let scores: BTreeMap<String, f64> = candidates
        .iter()
        .map(|candidate| (candidate.text.clone(), key(candidate)))
        .collect();
    let pivot = candidates
        .iter()
        .map(&key)
        .fold(f64::NEG_INFINITY, f64::max);
    let pool = candidates
        .iter()
        .enumerate()
        .filter(|(_, candidate)| float_close(key(candidate), pivot))
        .map(|(index, _)| index)
        .collect();
    (pool, pivot, Some(scores))
}

/// Narrow the pool with one tie-breaker; returns the survivors and a
/// human-readable reason fragment.
fn apply_tie_breaker(
    breaker: TieBreaker,
    candidates: &[Candidate],
    pool: &[usize],
) -> (Vec<usize>, String) {
    match breaker {
        TieBreaker::MinLatency => {
            let best = pool
                .iter()
                .map(|&index| candidates[index].latency)
                .min()
                .unwrap_or(0);
            let narrowed = pool
                .iter()
                .copied()
                .filter(|&index| candidates[index].latency == best)
                .collect();
            (narrowed, format!("min_latency(min={best})"))
        }
        TieBreaker::MinCost => {
            let best = pool
                .iter()
                .map(|&index| candidates[index].cost)
                .fold(f64::INFINITY, f64::min);
            let narrowed = pool
                .iter()
                .copied()
                .filter(|&index| candidates[index].cost == best)
                .collect();
            (narrowed, "min_cost(min)".to_string())
        }
        TieBreaker::StableOrder => {
            let chosen = pool
                .iter()
                .copied()
                .min_by(|&a, &b| {
                    let left = (&candidates[a].normalized, candidates[a].stable_index);
                    let right = (&candidates[b].normalized, candidates[b].stable_index);
                    left.cmp(&right)
                })
                .expect("tie-break pool is never empty");
            let reason = format!("stable_order(text={})", candidates[chosen].text);
            (vec![chosen], reason)
        }
    }
}

async fn invoke_judge(
    judge: &SharedProvider,
    candidates: &[Candidate],
    pool: &[usize],
) -> RunnerResult<(usize, Option<f64>)> {
    let mut prompt = String::from(
        "Multiple model responses are tied. Reply with the number of the best \
         candidate, optionally followed by a confidence score.\n",
    );
    for (position, &index) in pool.iter().enumerate() {
        prompt.push_str(&format!("{}. {}\n", position + 1, candidates[index].text));
    }
    let model = judge.model().unwrap_or("judge").to_string();
    let request = ProviderRequest::new(model, prompt).map_err(RunnerError::Provider)?;
    let response = judge.invoke(&request).await.map_err(RunnerError::Provider)?;

    let mut tokens = response.text.split_whitespace();
    let choice: Option<usize> = tokens.next().and_then(|token| {
        token
            .trim_matches(|c: char| !c.is_ascii_digit())
            .parse()
            .ok()
    });
    let score: Option<f64> = tokens
        .next()
        .and_then(|token| token.parse().ok())
        .or_else(|| response.raw_score());

    match choice {
        Some(position) if position >= 1 && position <= pool.len() => {
            Ok((pool[position - 1], score))
        }
        _ => Err(RunnerError::parallel(
            "judge returned unknown choice",
            Vec::new(),
        )),
    }
}

/// Evaluate consensus over the observations.
///
/// `judge` must be supplied when `config.judge` names a provider and a tie
/// can reach the judge round.
pub async fn compute_consensus(
    observations: &[ConsensusObservation],
    config: &ConsensusConfig,
    judge: Option<&SharedProvider>,
) -> RunnerResult<ConsensusResult> {
    if observations.is_empty() {
        return Err(RunnerError::InvalidInput(
            "consensus requires at least one observation".into(),
        ));
    }

    let (valid, schema_failures, schema_checked) =
        validate_schema(observations, config.schema.as_deref())?;
    if valid.is_empty() {
        return Err(RunnerError::parallel(
            "all responses failed schema validation",
            Vec::new(),
        ));
    }
    let valid = apply_constraints(observations, valid, config)?;

    let candidates = build_candidates(observations, &valid, config);
    if candidates.is_empty() {
        return Err(RunnerError::parallel("consensus tally is empty", Vec::new()));
    }

    let tally: BTreeMap<String, usize> = candidates
        .iter()
        .map(|candidate| (candidate.text.clone(), candidate.votes))
        .collect();

    let (mut pool, winner_score, scores) = select_pool(config.strategy, &candidates);

    let tie_break_applied = pool.len() > 1;
    let mut rounds: u32 = 1;
    let mut tie_break_reason = None;
    let mut tie_breaker_selected = None;
    let mut judge_name = None;
    let mut judge_score = None;

    let mut next_round = |rounds: &mut u32| -> RunnerResult<()> {
        if let Some(max_rounds) = config.max_rounds {
            if *rounds >= max_rounds {
                return Err(RunnerError::parallel(
                    "consensus max_rounds exhausted",
                    Vec::new(),
                ));
            }
        }
        *rounds += 1;
        Ok(())
    };

    if tie_break_applied {
        if let Some(breaker) = config.tie_breaker {
            next_round(&mut rounds)?;
            let (narrowed, reason) = apply_tie_breaker(breaker, &candidates, &pool);
            pool = narrowed;
            tie_break_reason = Some(reason);
            tie_breaker_selected = Some(breaker.as_str().to_string());
        } else {
            next_round(&mut rounds)?;
            for fallback in [
                TieBreaker::MinLatency,
                TieBreaker::MinCost,
                TieBreaker::StableOrder,
            ] {
                if pool.len() <= 1 {
                    break;
                }
                let (narrowed, reason) = apply_tie_breaker(fallback, &candidates, &pool);
                if narrowed.len() < pool.len() {
                    pool = narrowed;
                    tie_break_reason = Some(reason);
                    tie_breaker_selected = Some(fallback.as_str().to_string());
                    break;
                }
            }
        }
    }

    if pool.len() > 1 {
        if let Some(judge_provider_name) = &config.judge {
            let judge = judge.ok_or_else(|| {
                RunnerError::InvalidInput(format!(
                    "judge provider {judge_provider_name:?} not available"
                ))
            })?;
            next_round(&mut rounds)?;
            let (winner, score) = invoke_judge(judge, &candidates, &pool).await?;
            pool = vec![winner];
            judge_name = Some(judge_provider_name.clone());
            judge_score = score;
        }
    }

    if pool.len() > 1 {
        return Err(RunnerError::parallel(
            "consensus tie could not be resolved",
            Vec::new(),
        ));
    }

    let winner = &candidates[pool[0]];
    let quorum = config.quorum.unwrap_or(valid.len());
    if winner.votes < quorum {
        return Err(RunnerError::parallel(
            "consensus quorum not reached",
            Vec::new(),
        ));
    }

    let winner_index = winner.stable_index;
    let winner_observation = &observations[winner_index];
    let response = winner_observation
        .response
        .clone()
        .expect("winning candidate always has a response");

    let mut reason_parts = vec![config.strategy.as_str().to_string()];
    reason_parts.push(format!("quorum={quorum}/{}", valid.len()));
    if tie_break_applied {
        let tie_detail = tie_breaker_selected
            .clone()
            .or_else(|| config.tie_breaker.map(|b| b.as_str().to_string()))
            .unwrap_or_else(|| "tie".to_string());
        reason_parts.push(format!("tie_breaker={tie_detail}"));
        if let Some(reason) = &tie_break_reason {
            reason_parts.push(format!("tie_break_reason={reason}"));
        }
    }
    if let Some(name) = &judge_name {
        reason_parts.push(format!("judge={name}"));
        if let Some(score) = judge_score {
            reason_parts.push(format!("judge_score={score}"));
        }
    }

    Ok(ConsensusResult {
        response,
        winner_provider_id: winner_observation.provider_id.clone(),
        winner_stable_index: winner_index,
        votes: winner.votes,
        tally,
        total_voters: observations.len(),
        reason: reason_parts.join(" "),
        strategy: config.strategy,
        min_votes: config.quorum,
        tie_breaker: config.tie_breaker,
        tie_break_applied,
        tie_break_reason,
        tie_breaker_selected,
        winner_score,
        abstained: observations.len() - valid.len(),
        rounds,
        schema_checked,
        schema_failures,
        judge_name,
        judge_score,
        scores,
    })
}
