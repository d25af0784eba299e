//! Pipeline configuration.
//!
//! Every section has working defaults; [`PipelineConfig::from_env`] overlays
//! `HARVEST_*` variables (and a `.env` file, if present) on top of them.

use rust_decimal::Decimal;
use std::collections::HashMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::error::EnvConfigError;
use crate::security::SecretString;
use crate::types::{ChainEntry, Provider, Tier};

/// Which backends to try, and with which service keys.
#[derive(Debug, Clone)]
pub struct ChainConfig {
    /// Used when the tier has no chain of its own
    pub default_chain: Vec<ChainEntry>,
    pub tier_chains: HashMap<Tier, Vec<ChainEntry>>,
    /// Last resort; should end in a model that needs no key
    pub floor_chain: Vec<ChainEntry>,
    pub service_keys: HashMap<Provider, SecretString>,
    pub base_urls: HashMap<Provider, String>,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            default_chain: vec![
                ChainEntry::new(Provider::OpenAi, Provider::OpenAi.default_model()),
                ChainEntry::new(Provider::Anthropic, Provider::Anthropic.default_model()),
                ChainEntry::new(Provider::Groq, Provider::Groq.default_model()),
            ],
            tier_chains: HashMap::new(),
            floor_chain: vec![ChainEntry::new(
                Provider::Ollama,
                Provider::Ollama.default_model(),
            )],
            service_keys: HashMap::new(),
            base_urls: HashMap::new(),
        }
    }
}

impl ChainConfig {
    pub fn with_default_chain(mut self, chain: Vec<ChainEntry>) -> Self {
        self.default_chain = chain;
        self
    }

    pub fn with_tier_chain(mut self, tier: Tier, chain: Vec<ChainEntry>) -> Self {
        self.tier_chains.insert(tier, chain);
        self
    }

    pub fn with_floor_chain(mut self, chain: Vec<ChainEntry>) -> Self {
        self.floor_chain = chain;
        self
    }

    pub fn with_service_key(mut self, provider: Provider, key: impl Into<SecretString>) -> Self {
        self.service_keys.insert(provider, key.into());
        self
    }

    pub fn with_base_url(mut self, provider: Provider, url: impl Into<String>) -> Self {
        self.base_urls.insert(provider, url.into());
        self
    }

    /// Chain configured for a tier, or the default chain.
    pub fn chain_for(&self, tier: Tier) -> &[ChainEntry] {
        self.tier_chains
            .get(&tier)
            .filter(|chain| !chain.is_empty())
            .unwrap_or(&self.default_chain)
    }
}

/// Cost estimation for budget admission.
#[derive(Debug, Clone)]
pub struct BudgetConfig {
    /// Input tokens assumed for an average page
    pub avg_input_tokens: u64,
    /// Output tokens assumed per extraction (capped by the model's limit)
    pub expected_output_tokens: u64,
    /// Estimates are multiplied by this; values below 1 are treated as 1
    pub safety_multiplier: Decimal,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            avg_input_tokens: 6_000,
            expected_output_tokens: 1_000,
            safety_multiplier: Decimal::new(15, 1),
        }
    }
}

/// Markup applied to service-key usage.
#[derive(Debug, Clone)]
pub struct BillingConfig {
    pub markups: HashMap<Tier, Decimal>,
    /// Used for tiers without an explicit markup
    pub default_markup: Decimal,
    /// Flat amount added to every charged extraction
    pub fixed_fee: Decimal,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            markups: HashMap::from([
                (Tier::Free, Decimal::new(50, 2)),
                (Tier::Starter, Decimal::new(30, 2)),
                (Tier::Pro, Decimal::new(20, 2)),
                (Tier::Enterprise, Decimal::new(10, 2)),
            ]),
            default_markup: Decimal::new(30, 2),
            fixed_fee: Decimal::ZERO,
        }
    }
}

impl BillingConfig {
    pub fn markup_for(&self, tier: Tier) -> Decimal {
        self.markups
            .get(&tier)
            .copied()
            .unwrap_or(self.default_markup)
    }

    pub fn with_markup(mut self, tier: Tier, markup: Decimal) -> Self {
        self.markups.insert(tier, markup);
        self
    }

    pub fn with_fixed_fee(mut self, fee: Decimal) -> Self {
        self.fixed_fee = fee;
        self
    }
}

/// Fetching and escalation thresholds.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub static_timeout: Duration,
    pub dynamic_timeout: Duration,
    /// Raw HTML shorter than this (bytes) counts as insufficient
    pub min_raw_bytes: usize,
    /// Cleaned text shorter than this (chars) counts as insufficient
    pub min_cleaned_chars: usize,
    /// Response bodies are cut off after this many bytes
    pub max_body_bytes: usize,
    pub user_agent: String,
    /// Rendering service endpoint; dynamic fetch is unavailable without it
    pub renderer_url: Option<String>,
    pub renderer_api_key: Option<SecretString>,
    /// Requests per second across all fetches, if limited
    pub requests_per_second: Option<u32>,
}

pub const DEFAULT_MAX_BODY_BYTES: usize = 5 * 1024 * 1024;

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            static_timeout: Duration::from_secs(30),
            dynamic_timeout: Duration::from_secs(60),
            min_raw_bytes: 500,
            min_cleaned_chars: 200,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            user_agent: concat!("harvest/", env!("CARGO_PKG_VERSION")).to_string(),
            renderer_url: None,
            renderer_api_key: None,
            requests_per_second: None,
        }
    }
}

/// LLM call settings.
#[derive(Debug, Clone)]
pub struct LlmSettings {
    pub temperature: f32,
    pub timeout: Duration,
    /// Cleaned content is truncated to this many chars before prompting
    pub max_content_chars: usize,
    /// Pause between a failed candidate and the next one
    pub inter_provider_delay: Duration,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            temperature: 0.0,
            timeout: Duration::from_secs(120),
            max_content_chars: 100_000,
            inter_provider_delay: Duration::from_secs(1),
        }
    }
}

/// Background usage recorder.
#[derive(Debug, Clone)]
pub struct RecorderConfig {
    pub queue_capacity: usize,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1_024,
        }
    }
}

/// Service key suspension after rate limiting.
#[derive(Debug, Clone)]
pub struct KeyHealthConfig {
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for KeyHealthConfig {
    fn default() -> Self {
        Self {
            base_backoff: Duration::from_secs(30),
            max_backoff: Duration::from_secs(15 * 60),
        }
    }
}

/// All pipeline settings.
#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    pub chain: ChainConfig,
    pub budget: BudgetConfig,
    pub billing: BillingConfig,
    pub fetch: FetchConfig,
    pub llm: LlmSettings,
    pub recorder: RecorderConfig,
    pub key_health: KeyHealthConfig,
}

impl PipelineConfig {
    pub fn with_chain(mut self, chain: ChainConfig) -> Self {
        self.chain = chain;
        self
    }

    pub fn with_budget(mut self, budget: BudgetConfig) -> Self {
        self.budget = budget;
        self
    }

    pub fn with_billing(mut self, billing: BillingConfig) -> Self {
        self.billing = billing;
        self
    }

    pub fn with_fetch(mut self, fetch: FetchConfig) -> Self {
        self.fetch = fetch;
        self
    }

    pub fn with_llm(mut self, llm: LlmSettings) -> Self {
        self.llm = llm;
        self
    }

    pub fn with_recorder(mut self, recorder: RecorderConfig) -> Self {
        self.recorder = recorder;
        self
    }

    pub fn with_key_health(mut self, key_health: KeyHealthConfig) -> Self {
        self.key_health = key_health;
        self
    }

    /// Load from the process environment, reading `.env` first if present.
    pub fn from_env() -> Result<Self, EnvConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, EnvConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Lookup(lookup);
        let mut config = Self::default();

        // Chains
        if let Some(chain) = env.chain("HARVEST_DEFAULT_CHAIN")? {
            config.chain.default_chain = chain;
        }
        if let Some(chain) = env.chain("HARVEST_FLOOR_CHAIN")? {
            config.chain.floor_chain = chain;
        }
        for tier in Tier::ALL {
            let var = format!("HARVEST_CHAIN_{}", tier.as_str().to_ascii_uppercase());
            if let Some(chain) = env.chain(&var)? {
                config.chain.tier_chains.insert(tier, chain);
            }
        }
        for provider in Provider::ALL {
            if let Some(var) = provider.api_key_env() {
                if let Some(key) = env.get(var) {
                    config.chain.service_keys.insert(provider, SecretString::new(key));
                }
            }
            let var = format!("{}_BASE_URL", provider.as_str().to_ascii_uppercase());
            if let Some(url) = env.get(&var) {
                config.chain.base_urls.insert(provider, url);
            }
        }

        // Budget
        if let Some(v) = env.parse("HARVEST_AVG_INPUT_TOKENS")? {
            config.budget.avg_input_tokens = v;
        }
        if let Some(v) = env.parse("HARVEST_EXPECTED_OUTPUT_TOKENS")? {
            config.budget.expected_output_tokens = v;
        }
        if let Some(v) = env.parse("HARVEST_SAFETY_MULTIPLIER")? {
            config.budget.safety_multiplier = v;
        }

        // Billing
        for tier in Tier::ALL {
            let var = format!("HARVEST_MARKUP_{}", tier.as_str().to_ascii_uppercase());
            if let Some(markup) = env.parse(&var)? {
                config.billing.markups.insert(tier, markup);
            }
        }
        if let Some(fee) = env.parse("HARVEST_FIXED_FEE")? {
            config.billing.fixed_fee = fee;
        }

        // Fetch
        if let Some(secs) = env.parse("HARVEST_FETCH_TIMEOUT_SECS")? {
            config.fetch.static_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env.parse("HARVEST_RENDER_TIMEOUT_SECS")? {
            config.fetch.dynamic_timeout = Duration::from_secs(secs);
        }
        if let Some(v) = env.parse("HARVEST_MIN_RAW_BYTES")? {
            config.fetch.min_raw_bytes = v;
        }
        if let Some(v) = env.parse("HARVEST_MIN_CLEANED_CHARS")? {
            config.fetch.min_cleaned_chars = v;
        }
        if let Some(v) = env.parse("HARVEST_MAX_BODY_BYTES")? {
            config.fetch.max_body_bytes = v;
        }
        if let Some(agent) = env.get("HARVEST_USER_AGENT") {
            config.fetch.user_agent = agent;
        }
        config.fetch.renderer_url = env.get("HARVEST_RENDERER_URL");
        config.fetch.renderer_api_key = env.get("HARVEST_RENDERER_API_KEY").map(SecretString::new);
        config.fetch.requests_per_second = env.parse("HARVEST_REQUESTS_PER_SECOND")?;

        // LLM
        if let Some(secs) = env.parse("HARVEST_LLM_TIMEOUT_SECS")? {
            config.llm.timeout = Duration::from_secs(secs);
        }
        if let Some(ms) = env.parse("HARVEST_INTER_PROVIDER_DELAY_MS")? {
            config.llm.inter_provider_delay = Duration::from_millis(ms);
        }
        if let Some(v) = env.parse("HARVEST_MAX_CONTENT_CHARS")? {
            config.llm.max_content_chars = v;
        }

        if let Some(v) = env.parse("HARVEST_RECORDER_QUEUE")? {
            config.recorder.queue_capacity = v;
        }

        Ok(config)
    }
}

struct Lookup<F>(F);

impl<F: Fn(&str) -> Option<String>> Lookup<F> {
    fn get(&self, var: &str) -> Option<String> {
        (self.0)(var).filter(|v| !v.trim().is_empty())
    }

    fn parse<T>(&self, var: &str) -> Result<Option<T>, EnvConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.get(var)
            .map(|raw| {
                raw.trim().parse::<T>().map_err(|e| EnvConfigError::Invalid {
                    var: var.to_string(),
                    reason: e.to_string(),
                })
            })
            .transpose()
    }

    /// Comma-separated `provider:model` list.
    fn chain(&self, var: &str) -> Result<Option<Vec<ChainEntry>>, EnvConfigError> {
        let Some(raw) = self.get(var) else {
            return Ok(None);
        };
        raw.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.parse::<ChainEntry>().map_err(|e| EnvConfigError::Invalid {
                    var: var.to_string(),
                    reason: e.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Some)
    }
}
