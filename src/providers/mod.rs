//! Provider drivers.
//!
//! The core ships a single concrete driver: a deterministic mock used by
//! the CLI and the test suite. Real vendor drivers implement
//! `ProviderClient` in downstream crates and classify their wire errors
//! with `ProviderError::from_http_status`.

pub mod mock;

pub use mock::MockProvider;

use crate::error::{ProviderError, ProviderResult};
use crate::provider::SharedProvider;

/// Instantiate a provider from a CLI spec string.
///
/// Supported specs: `mock:<name>[:latency_ms]`. A bare name is treated as
/// `mock:<name>`.
pub fn provider_from_spec(spec: &str) -> ProviderResult<SharedProvider> {
    let spec = spec.trim();
    if spec.is_empty() {
        return Err(ProviderError::Config("empty provider spec".into()));
    }
    let parts: Vec<&str> = spec.split(':').collect();
    match parts.as_slice() {
        ["mock", name] if !name.is_empty() => Ok(std::sync::Arc::new(MockProvider::new(*name))),
        ["mock", name, latency] if !name.is_empty() => {
            let latency_ms = latency.parse().map_err(|_| {
                ProviderError::Config(format!("provider spec {spec:?} has a non-numeric latency"))
            })?;
            Ok(std::sync::Arc::new(
                MockProvider::new(*name).with_base_latency_ms(latency_ms),
            ))
        }
        ["mock", ..] => Err(ProviderError::Config(format!(
            "provider spec {spec:?} is missing a name"
        ))),
        // A bare name falls back to a mock provider with defaults.
        [name] if !name.is_empty() => Ok(std::sync::Arc::new(MockProvider::new(*name))),
        _ => Err(ProviderError::Config(format!(
            "unknown provider spec: {spec:?}"
        ))),
    }
}

/// Parse a comma-separated provider spec list.
pub fn providers_from_specs(specs: &str) -> ProviderResult<Vec<SharedProvider>> {
    let providers: Vec<SharedProvider> = specs
        .split(',')
        .map(str::trim)
        .filter(|spec| !spec.is_empty())
        .map(provider_from_spec)
        .collect::<ProviderResult<_>>()?;
    if providers.is_empty() {
        return Err(ProviderError::Config(
            "expected at least one provider spec".into(),
        ));
    }
    Ok(providers)
}
