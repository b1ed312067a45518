//! Shadow execution.
//!
//! A shadow provider runs concurrently with the primary purely to observe
//! differences. The primary result is never affected: shadow failures are
//! folded into the diff record, and a primary failure cancels the shadow and
//! propagates unchanged.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tracing::debug;

use crate::error::{ProviderError, ProviderResult};
use crate::events::SharedLogger;
use crate::provider::SharedProvider;
use crate::request::{ProviderRequest, ProviderResponse};
use crate::util::{elapsed_ms, ts_ms, JsonMap};

/// Bound on how long the primary waits for the shadow after finishing.
const SHADOW_JOIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Terminal state of one shadow invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShadowOutcome {
    Success,
    Error,
    Timeout,
}

impl ShadowOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
            Self::Timeout => "timeout",
        }
    }
}

/// Raw observation of the shadow call before the diff record is built.
#[derive(Debug, Clone)]
struct ShadowPayload {
    provider: String,
    ok: bool,
    outcome: ShadowOutcome,
    latency_ms: Option<u64>,
    text_len: Option<usize>,
    token_usage_total: Option<u64>,
    error: Option<&'static str>,
    message: Option<String>,
    duration_ms: Option<u64>,
}

impl ShadowPayload {
    fn success(provider: String, response: &ProviderResponse, duration_ms: u64) -> Self {
        Self {
            provider,
            ok: true,
            outcome: ShadowOutcome::Success,
            latency_ms: Some(response.latency_ms),
            text_len: Some(response.text.len()),
            token_usage_total: Some(response.token_usage.total()),
            error: None,
            message: None,
            duration_ms: Some(duration_ms),
        }
    }

    fn error(provider: String, error: &ProviderError, duration_ms: u64) -> Self {
        Self {
            provider,
            ok: false,
            outcome: ShadowOutcome::Error,
            latency_ms: None,
            text_len: None,
            token_usage_total: None,
            error: Some(error.wire_name()),
            message: Some(error.to_string()),
            duration_ms: Some(duration_ms),
        }
    }

    fn timeout(provider: String, duration_ms: u64) -> Self {
        Self {
            provider,
            ok: false,
            outcome: ShadowOutcome::Timeout,
            latency_ms: None,
            text_len: None,
            token_usage_total: None,
            error: Some("ShadowTimeout"),
            message: None,
            duration_ms: Some(duration_ms),
        }
    }
}

/// A pending `shadow_diff` record.
///
/// Emission consumes the value, so each shadow invocation can produce at
/// most one event; strategies that need to enrich the record (consensus)
/// hold it and emit later.
#[derive(Clone)]
pub struct ShadowMetrics {
    payload: JsonMap,
    logger: Option<SharedLogger>,
}

impl std::fmt::Debug for ShadowMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShadowMetrics")
            .field("payload", &self.payload)
            .field("logger", &self.logger.is_some())
            .finish()
    }
}

impl ShadowMetrics {
    pub fn payload(&self) -> &JsonMap {
        &self.payload
    }

    /// Merge extra fields into the pending record.
    pub fn extend(&mut self, extra: JsonMap) {
        for (key, value) in extra {
            self.payload.insert(key, value);
        }
    }

    /// Emit the `shadow_diff` event.
    pub fn emit(self) {
        self.emit_with(None);
    }

    pub fn emit_with(mut self, extra: Option<JsonMap>) {
        if let Some(extra) = extra {
            self.extend(extra);
        }
        let Some(logger) = self.logger else { return };
        self.payload
            .entry("ts_ms".to_string())
            .or_insert_with(|| json!(ts_ms()));
        self.payload
            .insert("event".to_string(), json!("shadow_diff"));
        logger.emit("shadow_diff", self.payload);
    }

    /// Metadata fields merged into `provider_call` records for the attempt.
    pub fn log_metadata(&self) -> JsonMap {
        let mut metadata = JsonMap::new();
        for key in [
            "shadow_provider_id",
            "shadow_latency_ms",
            "shadow_duration_ms",
            "shadow_outcome",
        ] {
            if let Some(value) = self.payload.get(key) {
                if !value.is_null() {
                    metadata.insert(key.to_string(), value.clone());
                }
            }
        }
        metadata
    }
}

fn build_shadow_metrics(
    primary: &dyn crate::provider::ProviderClient,
    primary_response: &ProviderResponse,
    request: &ProviderRequest,
    payload: &ShadowPayload,
    logger: SharedLogger,
) -> ShadowMetrics {
    let mut record = JsonMap::new();
    record.insert(
        "request_hash".into(),
        json!(request.provider_hash(primary.name())),
    );
    record.insert("request_fingerprint".into(), json!(request.fingerprint()));
    record.insert("primary_provider".into(), json!(primary.name()));
    record.insert(
        "primary_latency_ms".into(),
        json!(primary_response.latency_ms),
    );
    record.insert(
        "primary_text_len".into(),
        json!(primary_response.text.len()),
    );
    record.insert(
        "primary_token_usage_total".into(),
        json!(primary_response.token_usage.total()),
    );
    record.insert("shadow_provider".into(), json!(payload.provider));
    record.insert("shadow_provider_id".into(), json!(payload.provider));
    record.insert("shadow_ok".into(), json!(payload.ok));
    record.insert("shadow_outcome".into(), json!(payload.outcome.as_str()));
    record.insert("shadow_latency_ms".into(), json!(payload.latency_ms));
    record.insert("shadow_duration_ms".into(), json!(payload.duration_ms));
    record.insert("shadow_error".into(), json!(payload.error));
    if let Some(latency) = payload.latency_ms {
        record.insert(
            "latency_gap_ms".into(),
            json!(latency as i64 - primary_response.latency_ms as i64),
        );
    }
    if let Some(text_len) = payload.text_len {
        record.insert("shadow_text_len".into(), json!(text_len));
    }
    if let Some(total) = payload.token_usage_total {
        record.insert("shadow_token_usage_total".into(), json!(total));
    }
    if let Some(message) = &payload.message {
        record.insert("shadow_error_message".into(), json!(message));
    }
    ShadowMetrics {
        payload: record,
        logger: Some(logger),
    }
}

/// Invoke `primary`, racing `shadow` next to it.
///
/// Returns the primary response plus the pending shadow record when
/// `capture_metrics` is set (and a logger is available); otherwise the
/// `shadow_diff` event is emitted inline before returning.
pub async fn run_with_shadow(
    primary: &SharedProvider,
    shadow: Option<&SharedProvider>,
    request: &ProviderRequest,
    logger: Option<&SharedLogger>,
    capture_metrics: bool,
) -> ProviderResult<(ProviderResponse, Option<ShadowMetrics>)> {
    let shadow_task = shadow.map(|shadow| {
        let provider = Arc::clone(shadow);
        let shadow_request = request.clone();
        let name = shadow.name().to_string();
        let started = Instant::now();
        let handle = tokio::spawn(async move {
            let call_started = Instant::now();
            let provider_name = provider.name().to_string();
            match provider.invoke(&shadow_request).await {
                Ok(response) => {
                    ShadowPayload::success(provider_name, &response, elapsed_ms(call_started))
                }
                Err(error) => {
                    ShadowPayload::error(provider_name, &error, elapsed_ms(call_started))
                }
            }
        });
        (name, started, handle)
    });

    let primary_response = match primary.invoke(request).await {
        Ok(response) => response,
        Err(error) => {
            if let Some((name, _, handle)) = shadow_task {
                debug!("primary failed; cancelling shadow provider {name}");
                handle.abort();
            }
            return Err(error);
        }
    };

    let Some((shadow_name, shadow_started, handle)) = shadow_task else {
        return Ok((primary_response, None));
    };

    let abort_handle = handle.abort_handle();
    let payload = match tokio::time::timeout(SHADOW_JOIN_TIMEOUT, handle).await {
        Ok(Ok(payload)) => payload,
        Ok(Err(_join_error)) => {
            ShadowPayload::error(
                shadow_name.clone(),
                &ProviderError::Fatal("shadow task failed".into()),
                elapsed_ms(shadow_started),
            )
        }
        Err(_elapsed) => {
            abort_handle.abort();
            ShadowPayload::timeout(shadow_name.clone(), elapsed_ms(shadow_started))
        }
    };

    let Some(logger) = logger else {
        return Ok((primary_response, None));
    };
    let metrics = build_shadow_metrics(
        primary.as_ref(),
        &primary_response,
        request,
        &payload,
        Arc::clone(logger),
    );
    if capture_metrics {
        Ok((primary_response, Some(metrics)))
    } else {
        metrics.emit();
        Ok((primary_response, None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::events::EventLogger;
    use crate::provider::ProviderClient;
    use crate::request::TokenUsage;

    struct EchoProvider {
        name: String,
        latency_ms: u64,
        fail: bool,
    }

    #[async_trait]
    impl ProviderClient for EchoProvider {
        fn name(&self) -> &str {
            &self.name
        }

        async fn invoke(&self, request: &ProviderRequest) -> ProviderResult<ProviderResponse> {
            if self.fail {
                return Err(ProviderError::Retryable("simulated failure".into()));
            }
            Ok(ProviderResponse::new(
                format!("{}: {}", self.name, request.prompt()),
                self.latency_ms,
                TokenUsage::new(4, 2),
                request.model(),
            ))
        }
    }

    #[derive(Default)]
    struct RecordingLogger {
        events: Mutex<Vec<(String, JsonMap)>>,
    }

    impl EventLogger for RecordingLogger {
        fn emit(&self, event: &str, record: JsonMap) {
            self.events.lock().unwrap().push((event.to_string(), record));
        }
    }

    fn provider(name: &str, latency_ms: u64, fail: bool) -> SharedProvider {
        Arc::new(EchoProvider {
            name: name.to_string(),
            latency_ms,
            fail,
        })
    }

    #[tokio::test]
    async fn test_shadow_success_builds_diff_record() {
        let recording = Arc::new(RecordingLogger::default());
        let logger: SharedLogger = Arc::clone(&recording) as SharedLogger;
        let primary = provider("primary", 30, false);
        let shadow = provider("shadow", 50, false);
        let request = ProviderRequest::new("demo-model", "hello").unwrap();

        let (response, metrics) =
            run_with_shadow(&primary, Some(&shadow), &request, Some(&logger), true)
                .await
                .unwrap();

        assert!(response.text.starts_with("primary:"));
        let metrics = metrics.expect("capture_metrics returns the record");
        let payload = metrics.payload();
        assert_eq!(payload["shadow_ok"], json!(true));
        assert_eq!(payload["shadow_outcome"], json!("success"));
        assert_eq!(payload["primary_token_usage_total"], json!(6));
        assert_eq!(payload["latency_gap_ms"], json!(20));
        assert!(recording.events.lock().unwrap().is_empty());

        metrics.emit();
        let events = recording.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, "shadow_diff");
    }

    #[tokio::test]
    async fn test_shadow_failure_never_affects_primary() {
        let recording = Arc::new(RecordingLogger::default());
        let logger: SharedLogger = Arc::clone(&recording) as SharedLogger;
        let primary = provider("primary", 5, false);
        let shadow = provider("shadow", 5, true);
        let request = ProviderRequest::new("demo-model", "hello").unwrap();

        let (response, _) =
            run_with_shadow(&primary, Some(&shadow), &request, Some(&logger), false)
                .await
                .unwrap();

        assert!(response.text.starts_with("primary:"));
        let events = recording.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        let (event, record) = &events[0];
        assert_eq!(event, "shadow_diff");
        assert_eq!(record["shadow_ok"], json!(false));
        assert_eq!(record["shadow_outcome"], json!("error"));
        assert_eq!(record["shadow_error"], json!("RetryableError"));
    }

    #[tokio::test]
    async fn test_primary_failure_propagates_without_diff() {
        let recording = Arc::new(RecordingLogger::default());
        let logger: SharedLogger = Arc::clone(&recording) as SharedLogger;
        let primary = provider("primary", 5, true);
        let shadow = provider("shadow", 5, false);
        let request = ProviderRequest::new("demo-model", "hello").unwrap();

        let result = run_with_shadow(&primary, Some(&shadow), &request, Some(&logger), false).await;
        assert!(matches!(result, Err(ProviderError::Retryable(_))));
        assert!(recording.events.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_no_shadow_returns_primary_only() {
        let primary = provider("primary", 5, false);
        let request = ProviderRequest::new("demo-model", "hello").unwrap();
        let (response, metrics) = run_with_shadow(&primary, None, &request, None, true)
            .await
            .unwrap();
        assert!(response.text.starts_with("primary:"));
        assert!(metrics.is_none());
    }
}
