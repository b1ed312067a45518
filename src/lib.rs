// LLM Relay - provider orchestration runtime
// Dispatches one generation request across heterogeneous model providers
// under a chosen execution strategy.

//! # LLM Relay
//!
//! A provider-abstraction runtime: one logical generation request goes in,
//! exactly one `ProviderResponse` (or a typed failure) comes out, dispatched
//! across one or more providers under a chosen execution strategy:
//!
//! - **sequential** — failover chain in input order
//! - **parallel_any** — race every provider, first success wins
//! - **parallel_all** — fan out and return every response
//! - **consensus** — fan out and vote on the winning answer
//!
//! Along the way the runner enforces per-call retries, a shared
//! requests-per-minute rate limit, run-wide attempt caps, and budget
//! ceilings, optionally races a shadow provider for comparison, and emits a
//! structured JSONL event stream (`provider_call`, `retry`,
//! `provider_chain_failed`, `shadow_diff`, `consensus_vote`, `run_metric`)
//! for metrics and regression analysis.
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use llm_relay::{
//!     MockProvider, ProviderRequest, Runner, RunnerConfig, RunnerMode, SharedProvider,
//! };
//!
//! # async fn example() -> Result<(), llm_relay::RunnerError> {
//! let providers: Vec<SharedProvider> = vec![
//!     Arc::new(MockProvider::new("primary")),
//!     Arc::new(MockProvider::new("fallback")),
//! ];
//! let config = RunnerConfig {
//!     mode: Some(RunnerMode::Sequential),
//!     ..RunnerConfig::default()
//! };
//! let runner = Runner::new(providers, config)?;
//! let request = ProviderRequest::new("mock-echo", "hello")?;
//! let outcome = runner.run(request).await?;
//! println!("{}", outcome.response().map(|r| r.text.as_str()).unwrap_or(""));
//! # Ok(())
//! # }
//! ```

pub mod budget;
pub mod config;
pub mod consensus;
pub mod error;
pub mod events;
pub mod invoker;
pub mod provider;
pub mod providers;
pub mod rate_limit;
pub mod request;
pub mod runner;
pub mod shadow;
pub mod util;

mod retry;
mod strategy;

pub use budget::{BudgetDecision, BudgetManager};
pub use config::{
    BackoffPolicy, BudgetConfig, ConsensusConfig, ConsensusStrategyKind, RetryPolicy,
    RunnerConfig, RunnerMode, TieBreaker,
};
pub use consensus::{compute_consensus, ConsensusObservation, ConsensusResult};
pub use error::{FailureDetail, ProviderError, ProviderResult, RunnerError, RunnerResult};
pub use events::{
    resolve_event_logger, CompositeLogger, EventLogger, JsonlLogger, SharedLogger, StdoutLogger,
};
pub use invoker::InvocationResult;
pub use provider::{ProviderClient, SharedProvider};
pub use providers::{provider_from_spec, providers_from_specs, MockProvider};
pub use rate_limit::{resolve_rate_limiter, MonotonicClock, RateLimiter, Sleeper};
pub use request::{ChatMessage, MessageRole, ProviderRequest, ProviderResponse, TokenUsage};
pub use runner::{FanoutResult, RunOutcome, Runner};
pub use shadow::{run_with_shadow, ShadowMetrics, ShadowOutcome};
