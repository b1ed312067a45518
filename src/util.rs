//! Fingerprinting and timing helpers shared across the runner modules.

use std::time::Instant;

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// JSON object map used for request metadata, driver options and event records.
pub type JsonMap = Map<String, Value>;

/// Serialize a JSON value with object keys sorted recursively.
///
/// Two requests whose options differ only in key order must produce the same
/// fingerprint, so the hash input always goes through this canonical form.
pub fn canonical_json(value: &Value) -> String {
    fn write_value(value: &Value, out: &mut String) {
        match value {
            Value::Object(map) => {
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                out.push('{');
                for (i, key) in keys.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    out.push_str(&Value::String((*key).clone()).to_string());
                    out.push(':');
                    write_value(&map[*key], out);
                }
                out.push('}');
            }
            Value::Array(items) => {
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    write_value(item, out);
                }
                out.push(']');
            }
            other => out.push_str(&other.to_string()),
        }
    }

    let mut out = String::new();
    write_value(value, &mut out);
    out
}

/// 16-hex-character truncated SHA-256 over a scoped request identity.
///
/// `scope` is `"runner"` for the run fingerprint and the provider name for
/// per-provider request hashes.
pub fn content_hash(scope: &str, prompt: &str, options: &JsonMap, max_tokens: Option<u32>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(scope.as_bytes());
    hasher.update(prompt.as_bytes());
    if !options.is_empty() {
        hasher.update(canonical_json(&Value::Object(options.clone())).as_bytes());
    }
    if let Some(max_tokens) = max_tokens {
        hasher.update(max_tokens.to_string().as_bytes());
    }
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(16);
    for byte in digest.iter().take(8) {
        hex.push_str(&format!("{:02x}", byte));
    }
    hex
}

/// Hash a candidate text for `consensus_vote.candidate_summaries`.
pub fn text_hash(scope: &str, text: &str) -> String {
    content_hash(scope, text, &JsonMap::new(), None)
}

/// Milliseconds elapsed since `started`, saturating at zero.
pub fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

/// Current wall-clock timestamp in milliseconds for event records.
pub fn ts_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fingerprint_is_order_insensitive() {
        let mut a = JsonMap::new();
        a.insert("temperature".to_string(), json!(0.2));
        a.insert("seed".to_string(), json!(7));

        let mut b = JsonMap::new();
        b.insert("seed".to_string(), json!(7));
        b.insert("temperature".to_string(), json!(0.2));

        assert_eq!(
            content_hash("runner", "hello", &a, Some(64)),
            content_hash("runner", "hello", &b, Some(64)),
        );
    }

    #[test]
    fn test_fingerprint_changes_with_content() {
        let options = JsonMap::new();
        let base = content_hash("runner", "hello", &options, Some(64));
        assert_ne!(base, content_hash("runner", "hello!", &options, Some(64)));
        assert_ne!(base, content_hash("runner", "hello", &options, Some(65)));
        assert_ne!(base, content_hash("other", "hello", &options, Some(64)));
        assert_eq!(base.len(), 16);
    }

    #[test]
    fn test_canonical_json_sorts_nested_keys() {
        let value = json!({"b": {"z": 1, "a": 2}, "a": [3, {"y": 4, "x": 5}]});
        assert_eq!(
            canonical_json(&value),
            r#"{"a":[3,{"x":5,"y":4}],"b":{"a":2,"z":1}}"#
        );
    }
}
