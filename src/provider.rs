//! Provider interface.
//!
//! A provider wraps one model backend behind a uniform invoke contract. The
//! core never speaks a wire protocol itself; drivers return classified
//! `ProviderError` values so the strategies can make retry decisions without
//! inspecting driver-native failures.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::ProviderResult;
use crate::request::{ProviderRequest, ProviderResponse};

/// Contract every provider driver must satisfy.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Stable provider identifier used in events and failure summaries.
    fn name(&self) -> &str;

    /// Capability tags, e.g. `"chat"`.
    fn capabilities(&self) -> HashSet<String> {
        HashSet::from(["chat".to_string()])
    }

    /// Default model served by this provider, when it has one.
    fn model(&self) -> Option<&str> {
        None
    }

    /// Execute one generation request.
    async fn invoke(&self, request: &ProviderRequest) -> ProviderResult<ProviderResponse>;

    /// Estimated USD cost for a call with the given token counts.
    ///
    /// Providers without pricing information report zero cost.
    fn estimate_cost(&self, tokens_in: u64, tokens_out: u64) -> f64 {
        let _ = (tokens_in, tokens_out);
        0.0
    }
}

/// Shared handle passed between the runner, strategies and workers.
pub type SharedProvider = Arc<dyn ProviderClient>;
