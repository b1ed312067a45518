//! Request and response types shared by providers and the runner.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ProviderError, ProviderResult};
use crate::util::{content_hash, JsonMap};

/// Chat message roles understood by all providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

/// One message in a chat-style request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }
}

/// Token accounting for one provider call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt: u64,
    pub completion: u64,
}

impl TokenUsage {
    pub fn new(prompt: u64, completion: u64) -> Self {
        Self { prompt, completion }
    }

    pub fn total(&self) -> u64 {
        self.prompt + self.completion
    }
}

/// A normalized generation request.
///
/// Immutable once built: `prompt` and `messages` are kept mutually derivable
/// by the constructors (a prompt with no messages becomes a single user
/// message; messages with no prompt populate the prompt from the first
/// message content).
#[derive(Debug, Clone)]
pub struct ProviderRequest {
    model: String,
    prompt: String,
    messages: Vec<ChatMessage>,
    max_tokens: Option<u32>,
    temperature: Option<f32>,
    top_p: Option<f32>,
    stop: Option<Vec<String>>,
    timeout: Option<Duration>,
    metadata: JsonMap,
    options: JsonMap,
}

impl ProviderRequest {
    /// Build a request from a bare prompt.
    pub fn new(model: impl Into<String>, prompt: impl Into<String>) -> ProviderResult<Self> {
        let model = normalize_model(model.into())?;
        let prompt = prompt.into();
        let messages = if prompt.is_empty() {
            Vec::new()
        } else {
            vec![ChatMessage::user(prompt.clone())]
        };
        Ok(Self {
            model,
            prompt,
            messages,
            max_tokens: None,
            temperature: None,
            top_p: None,
            stop: None,
            timeout: None,
            metadata: JsonMap::new(),
            options: JsonMap::new(),
        })
    }

    /// Build a request from an ordered message list.
    pub fn from_messages(
        model: impl Into<String>,
        messages: Vec<ChatMessage>,
    ) -> ProviderResult<Self> {
        let model = normalize_model(model.into())?;
        let prompt = messages
            .first()
            .map(|message| message.content.clone())
            .unwrap_or_default();
        Ok(Self {
            model,
            prompt,
            messages,
            max_tokens: None,
            temperature: None,
            top_p: None,
            stop: None,
            timeout: None,
            metadata: JsonMap::new(),
            options: JsonMap::new(),
        })
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_top_p(mut self, top_p: f32) -> Self {
        self.top_p = Some(top_p);
        self
    }

    /// Stop sequences; empty entries are dropped after trimming.
    pub fn with_stop(mut self, stop: Vec<String>) -> Self {
        let stop: Vec<String> = stop
            .into_iter()
            .map(|entry| entry.trim().to_string())
            .filter(|entry| !entry.is_empty())
            .collect();
        self.stop = if stop.is_empty() { None } else { Some(stop) };
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Driver-specific passthrough options; participates in the fingerprint.
    pub fn with_option(mut self, key: impl Into<String>, value: Value) -> Self {
        self.options.insert(key.into(), value);
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn max_tokens(&self) -> Option<u32> {
        self.max_tokens
    }

    pub fn temperature(&self) -> Option<f32> {
        self.temperature
    }

    pub fn top_p(&self) -> Option<f32> {
        self.top_p
    }

    pub fn stop(&self) -> Option<&[String]> {
        self.stop.as_deref()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn metadata(&self) -> &JsonMap {
        &self.metadata
    }

    pub fn options(&self) -> &JsonMap {
        &self.options
    }

    /// Deterministic run fingerprint over `(prompt, options, max_tokens)`.
    pub fn fingerprint(&self) -> String {
        content_hash("runner", &self.prompt, &self.options, self.max_tokens)
    }

    /// Per-provider request hash used in event records.
    pub fn provider_hash(&self, provider_name: &str) -> String {
        content_hash(provider_name, &self.prompt, &self.options, self.max_tokens)
    }
}

fn normalize_model(model: String) -> ProviderResult<String> {
    let trimmed = model.trim();
    if trimmed.is_empty() {
        return Err(ProviderError::Config("model must not be empty".into()));
    }
    Ok(trimmed.to_string())
}

/// A normalized provider response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderResponse {
    pub text: String,
    pub latency_ms: u64,
    pub token_usage: TokenUsage,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
    /// Opaque driver payload; consensus reads an optional numeric `score`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<Value>,
}

impl ProviderResponse {
    pub fn new(
        text: impl Into<String>,
        latency_ms: u64,
        token_usage: TokenUsage,
        model: impl Into<String>,
    ) -> Self {
        Self {
            text: text.into(),
            latency_ms,
            token_usage,
            model: model.into(),
            finish_reason: None,
            raw: None,
        }
    }

    pub fn with_finish_reason(mut self, finish_reason: impl Into<String>) -> Self {
        self.finish_reason = Some(finish_reason.into());
        self
    }

    pub fn with_raw(mut self, raw: Value) -> Self {
        self.raw = Some(raw);
        self
    }

    /// Numeric `score` from the raw payload, if the driver supplied one.
    pub fn raw_score(&self) -> Option<f64> {
        self.raw
            .as_ref()
            .and_then(|raw| raw.get("score"))
            .and_then(Value::as_f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_prompt_becomes_user_message() {
        let request = ProviderRequest::new("demo-model", "hello").unwrap();
        assert_eq!(request.messages().len(), 1);
        assert_eq!(request.messages()[0].role, MessageRole::User);
        assert_eq!(request.messages()[0].content, "hello");
    }

    #[test]
    fn test_messages_populate_prompt() {
        let request = ProviderRequest::from_messages(
            "demo-model",
            vec![ChatMessage::system("be brief"), ChatMessage::user("hi")],
        )
        .unwrap();
        assert_eq!(request.prompt(), "be brief");
        assert_eq!(request.messages().len(), 2);
    }

    #[test]
    fn test_model_is_trimmed_and_required() {
        let request = ProviderRequest::new("  demo-model  ", "hi").unwrap();
        assert_eq!(request.model(), "demo-model");
        assert!(ProviderRequest::new("   ", "hi").is_err());
    }

    #[test]
    fn test_empty_stop_entries_dropped() {
        let request = ProviderRequest::new("demo-model", "hi")
            .unwrap()
            .with_stop(vec!["".into(), "  ".into(), "END".into()]);
        assert_eq!(request.stop(), Some(&["END".to_string()][..]));

        let request = ProviderRequest::new("demo-model", "hi")
            .unwrap()
            .with_stop(vec!["  ".into()]);
        assert!(request.stop().is_none());
    }

    #[test]
    fn test_fingerprint_ignores_model_and_metadata() {
        let a = ProviderRequest::new("model-a", "hi")
            .unwrap()
            .with_metadata("trace_id", json!("t1"));
        let b = ProviderRequest::new("model-b", "hi").unwrap();
        assert_eq!(a.fingerprint(), b.fingerprint());

        let c = ProviderRequest::new("model-a", "hi")
            .unwrap()
            .with_option("seed", json!(3));
        assert_ne!(a.fingerprint(), c.fingerprint());
    }

    #[test]
    fn test_token_usage_total() {
        let usage = TokenUsage::new(12, 4);
        assert_eq!(usage.total(), 16);
    }

    #[test]
    fn test_raw_score_extraction() {
        let usage = TokenUsage::new(1, 1);
        let response = ProviderResponse::new("ok", 5, usage, "m").with_raw(json!({"score": 0.75}));
        assert_eq!(response.raw_score(), Some(0.75));
        let response = ProviderResponse::new("ok", 5, usage, "m").with_raw(json!({"score": "hi"}));
        assert_eq!(response.raw_score(), None);
    }
}
