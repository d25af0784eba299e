//! Static price table and provider cost lookup.

use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

use crate::error::{ProviderError, ProviderErrorKind, ProviderResult};
use crate::traits::pricing::PricingOracle;
use crate::types::{LlmBackendConfig, Provider};

/// USD per 1,000 tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelPrice {
    pub input_per_1k: Decimal,
    pub output_per_1k: Decimal,
}

impl ModelPrice {
    pub fn new(input_per_1k: Decimal, output_per_1k: Decimal) -> Self {
        Self {
            input_per_1k,
            output_per_1k,
        }
    }

    pub fn cost(&self, tokens_in: u64, tokens_out: u64) -> Decimal {
        let thousand = Decimal::from(1_000);
        Decimal::from(tokens_in) * self.input_per_1k / thousand
            + Decimal::from(tokens_out) * self.output_per_1k / thousand
    }
}

/// Price table keyed by (provider, model).
///
/// Unknown models of a paid provider fall back to a deliberately high
/// price so budget checks stay conservative. Local models are free.
pub struct PriceTable {
    prices: HashMap<(Provider, String), ModelPrice>,
    fallback: ModelPrice,
    client: Client,
}

impl Default for PriceTable {
    fn default() -> Self {
        let price = |input: i64, output: i64| ModelPrice::new(Decimal::new(input, 5), Decimal::new(output, 5));
        Self::empty()
            .with_model(Provider::OpenAi, "gpt-4o-mini", price(15, 60))
            .with_model(Provider::OpenAi, "gpt-4o", price(250, 1_000))
            .with_model(Provider::Anthropic, "claude-3-5-haiku-latest", price(80, 400))
            .with_model(Provider::Anthropic, "claude-3-5-sonnet-latest", price(300, 1_500))
            .with_model(Provider::OpenRouter, "openai/gpt-4o-mini", price(15, 60))
            .with_model(Provider::Groq, "llama-3.1-8b-instant", price(5, 8))
            .with_model(Provider::Groq, "llama-3.3-70b-versatile", price(59, 79))
    }
}

impl PriceTable {
    /// A table with no entries and a $0.01/$0.03 per-1k fallback.
    pub fn empty() -> Self {
        Self {
            prices: HashMap::new(),
            fallback: ModelPrice::new(Decimal::new(1, 2), Decimal::new(3, 2)),
            client: Client::new(),
        }
    }

    pub fn with_price(
        self,
        provider: Provider,
        model: impl Into<String>,
        input_per_1k: Decimal,
        output_per_1k: Decimal,
    ) -> Self {
        self.with_model(provider, model, ModelPrice::new(input_per_1k, output_per_1k))
    }

    pub fn with_model(mut self, provider: Provider, model: impl Into<String>, price: ModelPrice) -> Self {
        self.prices.insert((provider, model.into()), price);
        self
    }

    pub fn with_fallback(mut self, price: ModelPrice) -> Self {
        self.fallback = price;
        self
    }

    pub fn price_for(&self, provider: Provider, model: &str) -> ModelPrice {
        if let Some(price) = self.prices.get(&(provider, model.to_string())) {
            return *price;
        }
        if !provider.requires_api_key() {
            return ModelPrice::new(Decimal::ZERO, Decimal::ZERO);
        }
        self.fallback
    }
}

#[derive(Deserialize)]
struct GenerationResponse {
    data: GenerationData,
}

#[derive(Deserialize)]
struct GenerationData {
    total_cost: Option<f64>,
}

fn generation_url(backend: &LlmBackendConfig) -> String {
    format!("{}/generation", backend.endpoint().trim_end_matches('/'))
}

#[async_trait]
impl PricingOracle for PriceTable {
    fn estimate(&self, provider: Provider, model: &str, tokens_in: u64, tokens_out: u64) -> Decimal {
        self.price_for(provider, model).cost(tokens_in, tokens_out)
    }

    async fn actual_cost(
        &self,
        backend: &LlmBackendConfig,
        generation_id: &str,
    ) -> ProviderResult<Option<Decimal>> {
        let provider = backend.provider;
        if !provider.reports_generation_cost() {
            return Ok(None);
        }
        let Some(key) = backend.api_key.as_ref() else {
            return Ok(None);
        };

        let error = |kind, message: String| {
            ProviderError::new(kind, provider, backend.model.clone(), message)
        };
        let response = self
            .client
            .get(generation_url(backend))
            .query(&[("id", generation_id)])
            .bearer_auth(key.expose())
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| error(ProviderErrorKind::Transient, e.to_string()))?;

        // cost data can lag the generation briefly
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            debug!(generation_id, "Generation cost not available yet");
            return Ok(None);
        }
        if !response.status().is_success() {
            let status = response.status().as_u16();
            return Err(error(ProviderErrorKind::Transient, format!("HTTP {status}")).with_status(status));
        }

        let body: GenerationResponse = response
            .json()
            .await
            .map_err(|e| error(ProviderErrorKind::InvalidOutput, e.to_string()))?;

        Ok(body
            .data
            .total_cost
            .and_then(|cost| Decimal::try_from(cost).ok()))
    }
}
