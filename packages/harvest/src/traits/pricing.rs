//! Cost estimation and lookup.

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::error::ProviderResult;
use crate::types::{LlmBackendConfig, Provider};

/// Prices LLM usage in USD.
#[async_trait]
pub trait PricingOracle: Send + Sync {
    /// Token-based cost for a model.
    fn estimate(&self, provider: Provider, model: &str, tokens_in: u64, tokens_out: u64)
        -> Decimal;

    /// Billed cost reported by the provider, if it reports one.
    ///
    /// `Ok(None)` means the provider has no figure for this generation and
    /// the caller should fall back to [`estimate`](Self::estimate). The
    /// lookup goes to the backend's own endpoint with its own key.
    async fn actual_cost(
        &self,
        backend: &LlmBackendConfig,
        generation_id: &str,
    ) -> ProviderResult<Option<Decimal>>;
}
