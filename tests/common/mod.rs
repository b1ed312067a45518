//! Shared fixtures for the integration suites.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use llm_relay::{
    EventLogger, ProviderClient, ProviderError, ProviderRequest, ProviderResponse,
    ProviderResult, TokenUsage,
};

pub type EventRecord = (String, serde_json::Map<String, Value>);

/// Captures every emitted event for ordering and schema assertions.
pub struct RecordingLogger {
    events: Mutex<Vec<EventRecord>>,
}

impl RecordingLogger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
        })
    }

    pub fn all(&self) -> Vec<EventRecord> {
        self.events.lock().unwrap().clone()
    }

    pub fn names(&self) -> Vec<String> {
        self.all().into_iter().map(|(name, _)| name).collect()
    }

    pub fn named(&self, name: &str) -> Vec<serde_json::Map<String, Value>> {
        self.all()
            .into_iter()
            .filter(|(event, _)| event == name)
            .map(|(_, record)| record)
            .collect()
    }
}

impl EventLogger for RecordingLogger {
    fn emit(&self, event: &str, record: serde_json::Map<String, Value>) {
        self.events
            .lock()
            .unwrap()
            .push((event.to_string(), record));
    }
}

/// What a scripted provider does on each call.
#[derive(Clone)]
pub enum Script {
    /// Respond with this text after the given latency.
    Succeed { text: String, latency_ms: u64 },
    /// Always fail with this error.
    Fail(ProviderError),
    /// Fail `failures` times, then succeed.
    FailThenSucceed {
        failures: usize,
        error: ProviderError,
        text: String,
    },
}

/// Deterministic provider driven by a fixed script.
pub struct ScriptedProvider {
    name: String,
    script: Script,
    cost_per_token_usd: f64,
    calls: AtomicUsize,
}

impl ScriptedProvider {
    pub fn ok(name: &str, text: &str, latency_ms: u64) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            script: Script::Succeed {
                text: text.to_string(),
                latency_ms,
            },
            cost_per_token_usd: 0.0,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn failing(name: &str, error: ProviderError) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            script: Script::Fail(error),
            cost_per_token_usd: 0.0,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn flaky(name: &str, failures: usize, error: ProviderError, text: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            script: Script::FailThenSucceed {
                failures,
                error,
                text: text.to_string(),
            },
            cost_per_token_usd: 0.0,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn with_cost(self: Arc<Self>, cost_per_token_usd: f64) -> Arc<Self> {
        Arc::new(Self {
            name: self.name.clone(),
            script: self.script.clone(),
            cost_per_token_usd,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProviderClient for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn model(&self) -> Option<&str> {
        Some("scripted-model")
    }

    async fn invoke(&self, request: &ProviderRequest) -> ProviderResult<ProviderResponse> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.script {
            Script::Succeed { text, latency_ms } => {
                tokio::time::sleep(Duration::from_millis(*latency_ms)).await;
                Ok(response(text, *latency_ms, request))
            }
            Script::Fail(error) => Err(error.clone()),
            Script::FailThenSucceed {
                failures,
                error,
                text,
            } => {
                if call < *failures {
                    Err(error.clone())
                } else {
                    Ok(response(text, 5, request))
                }
            }
        }
    }

    fn estimate_cost(&self, tokens_in: u64, tokens_out: u64) -> f64 {
        (tokens_in + tokens_out) as f64 * self.cost_per_token_usd
    }
}

fn response(text: &str, latency_ms: u64, request: &ProviderRequest) -> ProviderResponse {
    let prompt_tokens = (request.prompt().len() as u64 / 4).max(1);
    ProviderResponse::new(
        text,
        latency_ms,
        TokenUsage::new(prompt_tokens, 8),
        request.model(),
    )
}
