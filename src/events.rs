//! Structured event emission.
//!
//! The event stream is a data product with a fixed schema, distinct from
//! diagnostic `tracing` output: one JSON object per line, every record
//! carrying at least `ts_ms`, `event` and `request_fingerprint`. Loggers
//! serialize writes to their sink; the composite logger fans out while
//! isolating per-logger failures.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use tracing::warn;

use crate::error::ProviderError;
use crate::provider::ProviderClient;
use crate::request::ProviderRequest;
use crate::util::{ts_ms, JsonMap};

/// Sink for structured events.
pub trait EventLogger: Send + Sync {
    fn emit(&self, event: &str, record: JsonMap);
}

/// Shared logger handle passed through the run.
pub type SharedLogger = Arc<dyn EventLogger>;

/// Append events to a JSONL file, one object per line.
pub struct JsonlLogger {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl JsonlLogger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl EventLogger for JsonlLogger {
    fn emit(&self, event: &str, record: JsonMap) {
        let mut record = record;
        record
            .entry("event".to_string())
            .or_insert_with(|| json!(event));
        let line = Value::Object(record).to_string();

        let mut guard = self.file.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if guard.is_none() {
            if let Some(parent) = self.path.parent() {
                if !parent.as_os_str().is_empty() {
                    if let Err(err) = std::fs::create_dir_all(parent) {
                        warn!("failed to create metrics directory {:?}: {err}", parent);
                        return;
                    }
                }
            }
            match OpenOptions::new().create(true).append(true).open(&self.path) {
                Ok(file) => *guard = Some(file),
                Err(err) => {
                    warn!("failed to open metrics file {:?}: {err}", self.path);
                    return;
                }
            }
        }
        if let Some(file) = guard.as_mut() {
            if writeln!(file, "{line}").and_then(|()| file.flush()).is_err() {
                warn!("failed to append event to {:?}", self.path);
            }
        }
    }
}

/// Emit events to stdout as JSON lines.
pub struct StdoutLogger {
    lock: Mutex<()>,
}

impl StdoutLogger {
    pub fn new() -> Self {
        Self { lock: Mutex::new(()) }
    }
}

impl Default for StdoutLogger {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLogger for StdoutLogger {
    fn emit(&self, event: &str, record: JsonMap) {
        let mut record = record;
        record
            .entry("event".to_string())
            .or_insert_with(|| json!(event));
        let line = Value::Object(record).to_string();
        let _guard = self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        println!("{line}");
    }
}

/// Fan events out to multiple loggers; one failing sink never blocks another.
pub struct CompositeLogger {
    loggers: Vec<SharedLogger>,
}

impl CompositeLogger {
    pub fn new(loggers: Vec<SharedLogger>) -> Self {
        Self { loggers }
    }
}

impl EventLogger for CompositeLogger {
    fn emit(&self, event: &str, record: JsonMap) {
        for logger in &self.loggers {
            logger.emit(event, record.clone());
        }
    }
}

/// Resolve the event logger for a run: an explicit logger wins, otherwise a
/// JSONL logger is built from the metrics path, otherwise events are dropped.
pub fn resolve_event_logger(
    logger: Option<SharedLogger>,
    metrics_path: Option<&Path>,
) -> Option<SharedLogger> {
    if let Some(logger) = logger {
        return Some(logger);
    }
    metrics_path.map(|path| Arc::new(JsonlLogger::new(path)) as SharedLogger)
}

/// Stamp the shared envelope fields and hand the record to the logger.
pub(crate) fn emit_event(
    logger: Option<&SharedLogger>,
    event: &str,
    request_fingerprint: &str,
    mut record: JsonMap,
) {
    let Some(logger) = logger else { return };
    record.insert("ts_ms".to_string(), json!(ts_ms()));
    record.insert("event".to_string(), json!(event));
    record.insert(
        "request_fingerprint".to_string(),
        json!(request_fingerprint),
    );
    logger.emit(event, record);
}

fn token_usage_value(tokens_in: Option<u64>, tokens_out: Option<u64>) -> Value {
    let prompt = tokens_in.unwrap_or(0);
    let completion = tokens_out.unwrap_or(0);
    json!({
        "prompt": prompt,
        "completion": completion,
        "total": prompt + completion,
    })
}

fn metadata_field(metadata: &JsonMap, key: &str) -> Value {
    metadata.get(key).cloned().unwrap_or(Value::Null)
}

/// Status of one provider call in the event stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    Ok,
    Error,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Error => "error",
        }
    }
}

fn outcome_for(status: CallStatus, error: Option<&ProviderError>) -> &'static str {
    if error.map(ProviderError::is_skip).unwrap_or(false) {
        return "skip";
    }
    match status {
        CallStatus::Ok => "success",
        CallStatus::Error => "error",
    }
}

/// Parameters for one `provider_call` record.
pub(crate) struct ProviderCallRecord<'a> {
    pub provider: &'a dyn ProviderClient,
    pub request: &'a ProviderRequest,
    pub attempt: usize,
    pub total_providers: usize,
    pub status: CallStatus,
    pub latency_ms: Option<u64>,
    pub tokens_in: Option<u64>,
    pub tokens_out: Option<u64>,
    pub error: Option<&'a ProviderError>,
    pub metadata: &'a JsonMap,
    pub shadow_used: bool,
}

pub(crate) fn log_provider_call(
    logger: Option<&SharedLogger>,
    request_fingerprint: &str,
    record: ProviderCallRecord<'_>,
) {
    if logger.is_none() {
        return;
    }
    let provider_name = record.provider.name();
    let cost_estimate = match (record.tokens_in, record.tokens_out) {
        (Some(tokens_in), Some(tokens_out)) => {
            record.provider.estimate_cost(tokens_in, tokens_out)
        }
        _ => 0.0,
    };
    let mut fields = JsonMap::new();
    fields.insert("run_id".into(), metadata_field(record.metadata, "run_id"));
    fields.insert(
        "request_hash".into(),
        json!(record.request.provider_hash(provider_name)),
    );
    fields.insert("provider".into(), json!(provider_name));
    fields.insert("provider_id".into(), json!(provider_name));
    fields.insert("model".into(), json!(record.provider.model()));
    fields.insert("attempt".into(), json!(record.attempt));
    fields.insert("retries".into(), json!(record.attempt.saturating_sub(1)));
    fields.insert("total_providers".into(), json!(record.total_providers));
    fields.insert("status".into(), json!(record.status.as_str()));
    fields.insert(
        "outcome".into(),
        json!(outcome_for(record.status, record.error)),
    );
    fields.insert("latency_ms".into(), json!(record.latency_ms));
    fields.insert("tokens_in".into(), json!(record.tokens_in));
    fields.insert("tokens_out".into(), json!(record.tokens_out));
    fields.insert(
        "token_usage".into(),
        token_usage_value(record.tokens_in, record.tokens_out),
    );
    fields.insert("cost_estimate".into(), json!(cost_estimate));
    fields.insert(
        "error_type".into(),
        json!(record.error.map(ProviderError::wire_name)),
    );
    fields.insert(
        "error_message".into(),
        json!(record.error.map(|err| err.to_string())),
    );
    fields.insert(
        "error_family".into(),
        json!(record.error.map(ProviderError::family)),
    );
    fields.insert("shadow_used".into(), json!(record.shadow_used));
    for key in [
        "shadow_provider_id",
        "shadow_latency_ms",
        "shadow_duration_ms",
        "shadow_outcome",
        "mode",
        "providers",
        "trace_id",
        "project_id",
    ] {
        fields.insert(key.into(), metadata_field(record.metadata, key));
    }
    emit_event(logger, "provider_call", request_fingerprint, fields);
}

pub(crate) fn log_provider_skipped(
    logger: Option<&SharedLogger>,
    request_fingerprint: &str,
    provider: &dyn ProviderClient,
    request: &ProviderRequest,
    attempt: usize,
    total_providers: usize,
    error: &ProviderError,
) {
    if logger.is_none() {
        return;
    }
    let reason = match error {
        ProviderError::Skip { reason, .. } => reason.clone(),
        _ => None,
    };
    let mut fields = JsonMap::new();
    fields.insert(
        "request_hash".into(),
        json!(request.provider_hash(provider.name())),
    );
    fields.insert("provider".into(), json!(provider.name()));
    fields.insert("attempt".into(), json!(attempt));
    fields.insert("total_providers".into(), json!(total_providers));
    fields.insert("reason".into(), json!(reason));
    fields.insert("error_message".into(), json!(error.to_string()));
    emit_event(logger, "provider_skipped", request_fingerprint, fields);
}

/// Auth/Config skip: the chain moves on, but the event stream records why.
pub(crate) fn log_provider_fallback(
    logger: Option<&SharedLogger>,
    request_fingerprint: &str,
    provider: &dyn ProviderClient,
    attempt: usize,
    error: &ProviderError,
) {
    if logger.is_none() {
        return;
    }
    let mut fields = JsonMap::new();
    fields.insert("provider".into(), json!(provider.name()));
    fields.insert("attempt".into(), json!(attempt));
    fields.insert("error_type".into(), json!(error.wire_name()));
    fields.insert("error_message".into(), json!(error.to_string()));
    emit_event(logger, "provider_fallback", request_fingerprint, fields);
}

/// Parameters for one `run_metric` record.
pub(crate) struct RunMetricRecord<'a> {
    pub provider: Option<&'a dyn ProviderClient>,
    pub request: &'a ProviderRequest,
    pub status: CallStatus,
    pub attempts: usize,
    pub latency_ms: u64,
    pub tokens_in: Option<u64>,
    pub tokens_out: Option<u64>,
    pub cost_usd: f64,
    pub error_type: Option<&'a str>,
    pub error_message: Option<String>,
    pub error_family: Option<&'a str>,
    pub skip: bool,
    pub metadata: &'a JsonMap,
    pub shadow_used: bool,
    pub failure_kind: Option<&'a str>,
}

pub(crate) fn log_run_metric(
    logger: Option<&SharedLogger>,
    request_fingerprint: &str,
    record: RunMetricRecord<'_>,
) {
    if logger.is_none() {
        return;
    }
    let provider_name = record.provider.map(|provider| provider.name().to_string());
    let outcome = if record.skip {
        "skip"
    } else {
        match record.status {
            CallStatus::Ok => "success",
            CallStatus::Error => "error",
        }
    };
    let mut fields = JsonMap::new();
    fields.insert("run_id".into(), metadata_field(record.metadata, "run_id"));
    fields.insert(
        "request_hash".into(),
        json!(provider_name
            .as_deref()
            .map(|name| record.request.provider_hash(name))),
    );
    fields.insert("provider".into(), json!(provider_name));
    fields.insert("provider_id".into(), json!(provider_name));
    fields.insert("status".into(), json!(record.status.as_str()));
    fields.insert("outcome".into(), json!(outcome));
    fields.insert("attempts".into(), json!(record.attempts));
    fields.insert("retries".into(), json!(record.attempts.saturating_sub(1)));
    fields.insert("latency_ms".into(), json!(record.latency_ms));
    fields.insert("tokens_in".into(), json!(record.tokens_in));
    fields.insert("tokens_out".into(), json!(record.tokens_out));
    fields.insert(
        "token_usage".into(),
        token_usage_value(record.tokens_in, record.tokens_out),
    );
    fields.insert("cost_usd".into(), json!(record.cost_usd));
    fields.insert("cost_estimate".into(), json!(record.cost_usd));
    fields.insert("error_type".into(), json!(record.error_type));
    fields.insert("error_message".into(), json!(record.error_message));
    fields.insert("error_family".into(), json!(record.error_family));
    fields.insert("shadow_used".into(), json!(record.shadow_used));
    if let Some(kind) = record.failure_kind {
        fields.insert("failure_kind".into(), json!(kind));
    }
    for key in [
        "shadow_provider_id",
        "shadow_latency_ms",
        "shadow_duration_ms",
        "shadow_outcome",
        "mode",
        "providers",
        "trace_id",
        "project_id",
    ] {
        fields.insert(key.into(), metadata_field(record.metadata, key));
    }
    emit_event(logger, "run_metric", request_fingerprint, fields);
}

pub(crate) fn log_chain_failed(
    logger: Option<&SharedLogger>,
    request_fingerprint: &str,
    provider_attempts: usize,
    providers: &[String],
    last_error_type: Option<&str>,
    last_error_message: Option<String>,
    last_error_family: Option<&str>,
) {
    if logger.is_none() {
        return;
    }
    let mut fields = JsonMap::new();
    fields.insert("provider_attempts".into(), json!(provider_attempts));
    fields.insert("providers".into(), json!(providers));
    fields.insert("last_error_type".into(), json!(last_error_type));
    fields.insert("last_error_message".into(), json!(last_error_message));
    fields.insert("last_error_family".into(), json!(last_error_family));
    emit_event(logger, "provider_chain_failed", request_fingerprint, fields);
}

pub(crate) fn log_retry(logger: Option<&SharedLogger>, payload: JsonMap) {
    let Some(logger) = logger else { return };
    let mut payload = payload;
    payload.insert("ts_ms".to_string(), json!(ts_ms()));
    payload.insert("event".to_string(), json!("retry"));
    logger.emit("retry", payload);
}
