// Sequential failover demo
// Run with: cargo run --example failover

use std::sync::Arc;

use llm_relay::{
    MockProvider, ProviderError, ProviderRequest, Runner, RunnerConfig, RunnerMode,
    SharedProvider, StdoutLogger,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // The first provider is scripted to time out; the chain advances to the
    // second one and the run still succeeds. The event stream goes to stdout.
    let providers: Vec<SharedProvider> = vec![
        Arc::new(
            MockProvider::new("flaky")
                .with_failure(ProviderError::Timeout("upstream too slow".into())),
        ),
        Arc::new(MockProvider::new("steady").with_base_latency_ms(20)),
    ];

    let config = RunnerConfig {
        mode: Some(RunnerMode::Sequential),
        ..RunnerConfig::default()
    };
    let runner = Runner::new(providers, config)?.with_logger(Arc::new(StdoutLogger::new()));

    let request = ProviderRequest::new("mock-echo", "hello from the failover demo")?;
    match runner.run(request).await {
        Ok(outcome) => {
            if let Some(response) = outcome.response() {
                eprintln!("winner: {} ({} ms)", response.text, response.latency_ms);
            }
        }
        Err(error) => eprintln!("run failed: {error}"),
    }
    Ok(())
}
