// Consensus voting demo
// Run with: cargo run --example consensus_vote

use std::sync::Arc;

use llm_relay::{
    ConsensusConfig, MockProvider, ProviderRequest, Runner, RunnerConfig, RunnerMode,
    SharedProvider, StdoutLogger, TieBreaker,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Three fixed-answer providers vote; two agree, so "blue" wins with a
    // quorum of two. Watch the consensus_vote event on stdout for the tally.
    let providers: Vec<SharedProvider> = vec![
        Arc::new(
            MockProvider::new("voter-a")
                .with_base_latency_ms(10)
                .without_jitter()
                .with_fixed_text("blue"),
        ),
        Arc::new(
            MockProvider::new("voter-b")
                .with_base_latency_ms(30)
                .without_jitter()
                .with_fixed_text("blue"),
        ),
        Arc::new(
            MockProvider::new("voter-c")
                .with_base_latency_ms(20)
                .without_jitter()
                .with_fixed_text("green"),
        ),
    ];

    let config = RunnerConfig {
        mode: Some(RunnerMode::Consensus),
        consensus: Some(ConsensusConfig {
            quorum: Some(2),
            tie_breaker: Some(TieBreaker::MinLatency),
            ..ConsensusConfig::default()
        }),
        ..RunnerConfig::default()
    };
    let runner = Runner::new(providers, config)?.with_logger(Arc::new(StdoutLogger::new()));

    let request = ProviderRequest::new("mock-echo", "what color is the sky?")?;
    let outcome = runner.run(request).await?;
    if let Some(response) = outcome.response() {
        eprintln!("consensus answer: {}", response.text);
    }
    Ok(())
}
