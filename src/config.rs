//! Runner configuration.
//!
//! `RunnerConfig` is injected by the caller (the CLI builds one from flags);
//! the core never loads configuration itself.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ProviderError, ProviderResult};
use crate::provider::SharedProvider;

/// Execution strategies supported by the runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerMode {
    Sequential,
    ParallelAny,
    ParallelAll,
    Consensus,
}

impl RunnerMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sequential => "sequential",
            Self::ParallelAny => "parallel_any",
            Self::ParallelAll => "parallel_all",
            Self::Consensus => "consensus",
        }
    }

    /// Parse a mode name; dashes are accepted as underscores.
    pub fn parse(value: &str) -> ProviderResult<Self> {
        match value.trim().to_lowercase().replace('-', "_").as_str() {
            "sequential" => Ok(Self::Sequential),
            "parallel_any" => Ok(Self::ParallelAny),
            "parallel_all" => Ok(Self::ParallelAll),
            "consensus" => Ok(Self::Consensus),
            other => Err(ProviderError::Config(format!(
                "unsupported runner mode: {other:?}"
            ))),
        }
    }
}

impl fmt::Display for RunnerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Backoff behavior between provider attempts.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Sleep before retrying after a rate-limit rejection.
    pub rate_limit_sleep: Duration,
    /// Whether a timeout advances the chain to the next provider.
    pub timeout_next_provider: bool,
    /// Whether an exhausted retryable error advances to the next provider.
    pub retryable_next_provider: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            rate_limit_sleep: Duration::from_millis(50),
            timeout_next_provider: true,
            retryable_next_provider: true,
        }
    }
}

/// Per-provider retry budget applied by the retry controller.
#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    /// Extra attempts after the first; total attempts = `max + 1`.
    pub max: u32,
    /// Sleep between retryable attempts.
    pub backoff: Duration,
}

/// Consensus selection strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsensusStrategyKind {
    Majority,
    Weighted,
    MaxScore,
    WeightedVote,
}

impl ConsensusStrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Majority => "majority",
            Self::Weighted => "weighted",
            Self::MaxScore => "max_score",
            Self::WeightedVote => "weighted_vote",
        }
    }

    /// Parse a strategy name, accepting the legacy aliases.
    pub fn parse(value: &str) -> ProviderResult<Self> {
        match value.trim().to_lowercase().replace('-', "_").as_str() {
            "majority" | "majority_vote" => Ok(Self::Majority),
            "weighted" | "weighted_score" => Ok(Self::Weighted),
            "max_score" => Ok(Self::MaxScore),
            "weighted_vote" => Ok(Self::WeightedVote),
            other => Err(ProviderError::Config(format!(
                "unsupported consensus strategy: {other:?}"
            ))),
        }
    }
}

/// Tie-breakers applied when a selection round leaves more than one candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreaker {
    MinLatency,
    MinCost,
    StableOrder,
}

impl TieBreaker {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MinLatency => "min_latency",
            Self::MinCost => "min_cost",
            Self::StableOrder => "stable_order",
        }
    }

    pub fn parse(value: &str) -> ProviderResult<Self> {
        match value.trim().to_lowercase().replace('-', "_").as_str() {
            "min_latency" | "latency" => Ok(Self::MinLatency),
            "min_cost" | "cost" => Ok(Self::MinCost),
            "stable_order" => Ok(Self::StableOrder),
            other => Err(ProviderError::Config(format!(
                "unknown tie_breaker: {other:?}"
            ))),
        }
    }
}

/// Configuration for consensus-style orchestrations.
#[derive(Debug, Clone)]
pub struct ConsensusConfig {
    pub strategy: ConsensusStrategyKind,
    /// Minimum votes the winner must hold; defaults to all valid voters.
    pub quorum: Option<usize>,
    pub tie_breaker: Option<TieBreaker>,
    /// JSON schema text enforcing `type=object` plus `required` keys.
    pub schema: Option<String>,
    /// Name of the provider used as an external judge for unresolved ties.
    pub judge: Option<String>,
    pub provider_weights: HashMap<String, f64>,
    pub max_latency_ms: Option<u64>,
    pub max_cost_usd: Option<f64>,
    pub max_rounds: Option<u32>,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            strategy: ConsensusStrategyKind::Majority,
            quorum: None,
            tie_breaker: None,
            schema: None,
            judge: None,
            provider_weights: HashMap::new(),
            max_latency_ms: None,
            max_cost_usd: None,
            max_rounds: None,
        }
    }
}

/// Per-provider budget ceilings consulted after a successful run.
#[derive(Debug, Clone, Default)]
pub struct BudgetConfig {
    /// Run-level ceiling per provider (USD); zero means unlimited.
    pub default_run_budget_usd: f64,
    /// Daily ceiling per provider (USD); zero means unlimited.
    pub default_daily_budget_usd: f64,
    pub run_budget_usd: HashMap<String, f64>,
    pub daily_budget_usd: HashMap<String, f64>,
    /// Log and continue instead of demoting the run on breach.
    pub allow_overrun: bool,
}

/// Orchestration configuration for one `Runner`.
#[derive(Clone, Default)]
pub struct RunnerConfig {
    pub mode: Option<RunnerMode>,
    /// Cap on total provider attempts in a run, retries included.
    pub max_attempts: Option<usize>,
    pub max_concurrency: Option<usize>,
    pub rpm: Option<u32>,
    pub backoff: BackoffPolicy,
    pub retries: RetryPolicy,
    pub consensus: Option<ConsensusConfig>,
    pub shadow_provider: Option<SharedProvider>,
    /// External judge for consensus ties; `consensus.judge` names it. When
    /// unset, the judge name is resolved against the run's provider list.
    pub judge_provider: Option<SharedProvider>,
    pub metrics_path: Option<PathBuf>,
    pub budget: Option<BudgetConfig>,
}

impl RunnerConfig {
    pub fn mode(&self) -> RunnerMode {
        self.mode.unwrap_or(RunnerMode::Sequential)
    }
}

impl fmt::Debug for RunnerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunnerConfig")
            .field("mode", &self.mode())
            .field("max_attempts", &self.max_attempts)
            .field("max_concurrency", &self.max_concurrency)
            .field("rpm", &self.rpm)
            .field("backoff", &self.backoff)
            .field("retries", &self.retries)
            .field("consensus", &self.consensus)
            .field(
                "shadow_provider",
                &self.shadow_provider.as_ref().map(|p| p.name().to_string()),
            )
            .field(
                "judge_provider",
                &self.judge_provider.as_ref().map(|p| p.name().to_string()),
            )
            .field("metrics_path", &self.metrics_path)
            .field("budget", &self.budget)
            .finish()
    }
}
