// LLM Relay CLI
// Run a generation request across providers, or diagnose the environment.
// Run with: cargo run --bin relay -- run --providers mock:a,mock:b --prompt "hi"

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::json;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use llm_relay::{
    providers_from_specs, provider_from_spec, BackoffPolicy, ConsensusConfig,
    ConsensusStrategyKind, ProviderError, ProviderRequest, RetryPolicy, RunOutcome, Runner,
    RunnerConfig, RunnerError, RunnerMode, TieBreaker,
};

const EXIT_OK: u8 = 0;
const EXIT_INPUT_ERROR: u8 = 2;
const EXIT_ENV_ERROR: u8 = 3;
const EXIT_NETWORK_ERROR: u8 = 4;
const EXIT_PROVIDER_ERROR: u8 = 5;
const EXIT_RATE_LIMIT: u8 = 6;
const EXIT_INTERRUPT: u8 = 130;

#[derive(Parser)]
#[command(name = "relay", about = "Strategy-driven LLM provider relay")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute a generation request across the configured providers.
    Run(RunArgs),
    /// Diagnose the local environment.
    Doctor(DoctorArgs),
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
    Jsonl,
}

#[derive(Args)]
struct RunArgs {
    /// Comma-separated provider specs, e.g. mock:fast:10,mock:slow:100
    #[arg(long, alias = "provider", required = true)]
    providers: String,

    /// Model name placed on the request.
    #[arg(long, default_value = "mock-echo")]
    model: String,

    /// Inline prompt text.
    #[arg(long, conflicts_with_all = ["prompt_file", "prompts"])]
    prompt: Option<String>,

    /// Read the prompt from a file.
    #[arg(long, conflicts_with = "prompts")]
    prompt_file: Option<PathBuf>,

    /// Run one request per non-empty line of this file.
    #[arg(long)]
    prompts: Option<PathBuf>,

    /// Execution strategy.
    #[arg(long, default_value = "sequential")]
    mode: String,

    /// Requests-per-minute shared across all provider calls.
    #[arg(long)]
    rpm: Option<u32>,

    #[arg(long)]
    max_concurrency: Option<usize>,

    /// Run-wide cap on provider attempts, retries included.
    #[arg(long)]
    max_attempts: Option<usize>,

    /// Per-provider retry budget.
    #[arg(long, default_value_t = 0)]
    retries: u32,

    /// Consensus aggregate strategy (majority, weighted, max_score, weighted_vote).
    #[arg(long)]
    aggregate: Option<String>,

    #[arg(long)]
    quorum: Option<usize>,

    #[arg(long)]
    tie_breaker: Option<String>,

    /// JSON schema for consensus gating: inline text or a file path.
    #[arg(long)]
    schema: Option<String>,

    /// Judge provider spec for unresolved consensus ties, e.g. mock:arbiter
    #[arg(long)]
    judge: Option<String>,

    /// Per-provider consensus weights, e.g. fast=2.0,slow=0.5
    #[arg(long)]
    weights: Option<String>,

    #[arg(long)]
    max_latency_ms: Option<u64>,

    #[arg(long)]
    max_cost_usd: Option<f64>,

    /// JSONL metrics output path.
    #[arg(long)]
    metrics: Option<PathBuf>,

    /// Shadow provider spec raced next to the primary.
    #[arg(long)]
    shadow: Option<String>,

    /// Drive the run on the async engine (default); disable to exercise the
    /// blocking entry point.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    async_runner: bool,

    /// Request timeout in seconds.
    #[arg(long)]
    timeout_s: Option<f64>,

    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,

    /// Load environment variables from this file before running.
    #[arg(long)]
    env: Option<PathBuf>,
}

#[derive(Args)]
struct DoctorArgs {
    /// Load environment variables from this file first.
    #[arg(long)]
    env: Option<PathBuf>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let code = match cli.command {
        Command::Run(args) => run_command(args),
        Command::Doctor(args) => doctor_command(args),
    };
    ExitCode::from(code)
}

fn run_command(args: RunArgs) -> u8 {
    if let Some(env_path) = &args.env {
        if dotenv::from_path(env_path).is_err() {
            error!("failed to load env file {:?}", env_path);
            return EXIT_ENV_ERROR;
        }
    }

    let prompts = match resolve_prompts(&args) {
        Ok(prompts) => prompts,
        Err(err) => {
            error!("{err:#}");
            return EXIT_INPUT_ERROR;
        }
    };
    let runner = match build_runner(&args) {
        Ok(runner) => runner,
        Err(err) => {
            error!("{err:#}");
            return EXIT_INPUT_ERROR;
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            error!("failed to start runtime: {err}");
            return EXIT_ENV_ERROR;
        }
    };

    let mut worst = EXIT_OK;
    for prompt in prompts {
        let request = match build_request(&args, &prompt) {
            Ok(request) => request,
            Err(err) => {
                error!("{err}");
                return EXIT_INPUT_ERROR;
            }
        };
        let outcome = if args.async_runner {
            match runtime.block_on(run_with_interrupt(&runner, request)) {
                Some(outcome) => outcome,
                None => return EXIT_INTERRUPT,
            }
        } else {
            runner.run_blocking(request)
        };
        match outcome {
            Ok(outcome) => print_outcome(&outcome, args.format),
            Err(err) => {
                error!("run failed: {err}");
                worst = worst.max(exit_code_for(&err));
            }
        }
    }
    worst
}

async fn run_with_interrupt(
    runner: &Runner,
    request: ProviderRequest,
) -> Option<Result<RunOutcome, RunnerError>> {
    tokio::select! {
        outcome = runner.run(request) => Some(outcome),
        _ = tokio::signal::ctrl_c() => {
            error!("interrupted");
            None
        }
    }
}

fn resolve_prompts(args: &RunArgs) -> Result<Vec<String>> {
    if let Some(path) = &args.prompts {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read prompts file {path:?}"))?;
        let prompts: Vec<String> = contents
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();
        if prompts.is_empty() {
            return Err(anyhow!("prompts file {path:?} is empty"));
        }
        return Ok(prompts);
    }
    if let Some(path) = &args.prompt_file {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read prompt file {path:?}"))?;
        return Ok(vec![contents.trim_end().to_string()]);
    }
    match &args.prompt {
        Some(prompt) => Ok(vec![prompt.clone()]),
        None => Err(anyhow!("one of --prompt, --prompt-file, --prompts is required")),
    }
}

fn build_runner(args: &RunArgs) -> Result<Runner> {
    let providers = providers_from_specs(&args.providers)?;
    let mode = RunnerMode::parse(&args.mode)?;

    let consensus = if mode == RunnerMode::Consensus
        || args.aggregate.is_some()
        || args.quorum.is_some()
    {
        let mut config = ConsensusConfig::default();
        if let Some(aggregate) = &args.aggregate {
            config.strategy = ConsensusStrategyKind::parse(aggregate)?;
        }
        config.quorum = args.quorum;
        if let Some(tie_breaker) = &args.tie_breaker {
            config.tie_breaker = Some(TieBreaker::parse(tie_breaker)?);
        }
        if let Some(schema) = &args.schema {
            config.schema = Some(resolve_schema(schema)?);
        }
        if let Some(weights) = &args.weights {
            config.provider_weights = parse_weights(weights)?;
        }
        config.max_latency_ms = args.max_latency_ms;
        config.max_cost_usd = args.max_cost_usd;
        Some(config)
    } else {
        None
    };

    let shadow_provider = match &args.shadow {
        Some(spec) => Some(provider_from_spec(spec)?),
        None => None,
    };
    let judge_provider = match &args.judge {
        Some(spec) => Some(provider_from_spec(spec)?),
        None => None,
    };
    let consensus = match (consensus, &judge_provider) {
        (Some(mut config), Some(judge)) => {
            config.judge = Some(judge.name().to_string());
            Some(config)
        }
        (consensus, _) => consensus,
    };

    let config = RunnerConfig {
        mode: Some(mode),
        max_attempts: args.max_attempts,
        max_concurrency: args.max_concurrency,
        rpm: args.rpm,
        backoff: BackoffPolicy::default(),
        retries: RetryPolicy {
            max: args.retries,
            backoff: Duration::from_millis(100),
        },
        consensus,
        shadow_provider,
        judge_provider,
        metrics_path: args.metrics.clone(),
        budget: None,
    };
    Ok(Runner::new(providers, config)?)
}

fn build_request(args: &RunArgs, prompt: &str) -> Result<ProviderRequest, ProviderError> {
    let mut request = ProviderRequest::new(&args.model, prompt)?;
    if let Some(timeout_s) = args.timeout_s {
        request = request.with_timeout(Duration::from_secs_f64(timeout_s));
    }
    Ok(request)
}

fn resolve_schema(schema: &str) -> Result<String> {
    let path = PathBuf::from(schema);
    if path.exists() {
        return std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read schema file {path:?}"));
    }
    Ok(schema.to_string())
}

fn parse_weights(raw: &str) -> Result<HashMap<String, f64>> {
    let mut weights = HashMap::new();
    for item in raw.split(',').map(str::trim).filter(|item| !item.is_empty()) {
        let (name, value) = item
            .split_once('=')
            .ok_or_else(|| anyhow!("weights must use provider=value: {item:?}"))?;
        let value: f64 = value
            .trim()
            .parse()
            .map_err(|_| anyhow!("weight must be numeric: {item:?}"))?;
        weights.insert(name.trim().to_string(), value);
    }
    if weights.is_empty() {
        return Err(anyhow!("weights must not be empty"));
    }
    Ok(weights)
}

fn print_outcome(outcome: &RunOutcome, format: OutputFormat) {
    match format {
        OutputFormat::Text => {
            if let Some(response) = outcome.response() {
                println!("{}", response.text);
            }
        }
        OutputFormat::Json | OutputFormat::Jsonl => match outcome {
            RunOutcome::Response(response) => print_response_json(response),
            RunOutcome::Fanout(fanout) => {
                for response in fanout.responses() {
                    print_response_json(response);
                }
            }
        },
    }
}

fn print_response_json(response: &llm_relay::ProviderResponse) {
    let record = json!({
        "text": response.text,
        "model": response.model,
        "latency_ms": response.latency_ms,
        "token_usage": {
            "prompt": response.token_usage.prompt,
            "completion": response.token_usage.completion,
            "total": response.token_usage.total(),
        },
        "finish_reason": response.finish_reason,
    });
    println!("{record}");
}

fn exit_code_for(error: &RunnerError) -> u8 {
    match error {
        RunnerError::InvalidInput(_) => EXIT_INPUT_ERROR,
        RunnerError::Provider(provider_error) => match provider_error {
            ProviderError::RateLimit(_) => EXIT_RATE_LIMIT,
            ProviderError::Timeout(_) | ProviderError::Retryable(_) => EXIT_NETWORK_ERROR,
            _ => EXIT_PROVIDER_ERROR,
        },
        RunnerError::AllFailed { .. } | RunnerError::ParallelExecution { .. } => {
            EXIT_PROVIDER_ERROR
        }
    }
}

fn doctor_command(args: DoctorArgs) -> u8 {
    if let Some(env_path) = &args.env {
        if dotenv::from_path(env_path).is_err() {
            error!("failed to load env file {:?}", env_path);
            return EXIT_ENV_ERROR;
        }
    } else {
        let _ = dotenv::dotenv();
    }

    println!("relay doctor");
    for (var, purpose) in [
        ("OPENAI_API_KEY", "OpenAI-compatible drivers"),
        ("GEMINI_API_KEY", "Gemini drivers"),
        ("OPENROUTER_API_KEY", "OpenRouter drivers"),
        ("OLLAMA_BASE_URL", "local Ollama endpoint"),
        ("RELAY_METRICS_PATH", "default metrics sink"),
    ] {
        match std::env::var(var) {
            Ok(value) if !value.trim().is_empty() => {
                println!("  [set]     {var} ({purpose})");
            }
            _ => println!("  [missing] {var} ({purpose})"),
        }
    }

    match tokio::runtime::Runtime::new() {
        Ok(_) => println!("  [ok]      tokio runtime"),
        Err(err) => {
            println!("  [fail]    tokio runtime: {err}");
            return EXIT_ENV_ERROR;
        }
    }
    info!("doctor finished");
    EXIT_OK
}
