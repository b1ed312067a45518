//! Shadow comparison end-to-end behavior.

mod common;

use std::sync::Arc;

use serde_json::json;

use common::{RecordingLogger, ScriptedProvider};
use llm_relay::{
    MockProvider, ProviderRequest, Runner, RunnerConfig, RunnerMode, SharedLogger, SharedProvider,
};

#[tokio::test]
async fn test_shadow_diff_emitted_once_with_primary_untouched() {
    let logger = RecordingLogger::new();
    let primary: SharedProvider =
        Arc::new(MockProvider::new("primary").with_base_latency_ms(5).without_jitter());
    let shadow: SharedProvider =
        Arc::new(MockProvider::new("shadow").with_base_latency_ms(8).without_jitter());

    let config = RunnerConfig {
        mode: Some(RunnerMode::Sequential),
        shadow_provider: Some(shadow),
        ..RunnerConfig::default()
    };
    let runner = Runner::new(vec![primary], config)
        .unwrap()
        .with_logger(Arc::clone(&logger) as SharedLogger);
    let request = ProviderRequest::new("mock-echo", "observe me").unwrap();

    let outcome = runner.run(request).await.unwrap();
    let response = outcome.response().unwrap();
    assert_eq!(response.text, "primary: observe me");

    let diffs = logger.named("shadow_diff");
    assert_eq!(diffs.len(), 1, "exactly one shadow_diff per invocation");
    let diff = &diffs[0];
    assert_eq!(diff["primary_provider"], json!("primary"));
    assert_eq!(diff["shadow_provider"], json!("shadow"));
    assert_eq!(diff["shadow_ok"], json!(true));
    assert_eq!(diff["shadow_outcome"], json!("success"));
    assert_eq!(
        diff["primary_token_usage_total"],
        json!(response.token_usage.total())
    );
    assert_eq!(diff["latency_gap_ms"], json!(3));

    // The provider_call carries the shadow metadata.
    let calls = logger.named("provider_call");
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0]["shadow_used"], json!(true));
    assert_eq!(calls[0]["shadow_outcome"], json!("success"));
    assert_eq!(calls[0]["shadow_provider_id"], json!("shadow"));
}

#[tokio::test]
async fn test_shadow_failure_is_recorded_but_harmless() {
    let logger = RecordingLogger::new();
    let primary: SharedProvider = ScriptedProvider::ok("primary", "fine", 4);
    let shadow: SharedProvider = ScriptedProvider::failing(
        "shadow",
        llm_relay::ProviderError::Retryable("shadow broke".into()),
    );

    let config = RunnerConfig {
        mode: Some(RunnerMode::Sequential),
        shadow_provider: Some(shadow),
        ..RunnerConfig::default()
    };
    let runner = Runner::new(vec![primary], config)
        .unwrap()
        .with_logger(Arc::clone(&logger) as SharedLogger);
    let request = ProviderRequest::new("scripted-model", "hello").unwrap();

    let outcome = runner.run(request).await.unwrap();
    assert_eq!(outcome.response().unwrap().text, "fine");

    let diffs = logger.named("shadow_diff");
    assert_eq!(diffs.len(), 1);
    assert_eq!(diffs[0]["shadow_ok"], json!(false));
    assert_eq!(diffs[0]["shadow_outcome"], json!("error"));
    assert_eq!(diffs[0]["shadow_error"], json!("RetryableError"));
}

#[tokio::test]
async fn test_consensus_enriches_only_the_winner_diff() {
    let logger = RecordingLogger::new();
    let providers: Vec<SharedProvider> = vec![
        ScriptedProvider::ok("agree_a", "agree", 10),
        ScriptedProvider::ok("agree_b", "agree", 12),
        ScriptedProvider::ok("dissent", "disagree", 9),
    ];
    let shadow: SharedProvider = ScriptedProvider::ok("shadow", "shadow view", 3);

    let config = RunnerConfig {
        mode: Some(RunnerMode::Consensus),
        consensus: Some(llm_relay::ConsensusConfig {
            quorum: Some(2),
            ..llm_relay::ConsensusConfig::default()
        }),
        shadow_provider: Some(shadow),
        ..RunnerConfig::default()
    };
    let runner = Runner::new(providers, config)
        .unwrap()
        .with_logger(Arc::clone(&logger) as SharedLogger);
    let request = ProviderRequest::new("scripted-model", "vote").unwrap();

    let outcome = runner.run(request).await.unwrap();
    assert_eq!(outcome.response().unwrap().text, "agree");

    let diffs = logger.named("shadow_diff");
    assert_eq!(diffs.len(), 3, "every provider's shadow raced once");
    let enriched: Vec<_> = diffs
        .iter()
        .filter(|diff| diff.contains_key("shadow_consensus_delta"))
        .collect();
    assert_eq!(enriched.len(), 1, "only the winner's diff is enriched");
    let delta = &enriched[0]["shadow_consensus_delta"];
    assert_eq!(delta["votes_for"], json!(2));
    assert_eq!(delta["votes_total"], json!(3));
}
