//! LLM backend descriptions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::security::SecretString;
use crate::types::UserId;

/// Default cap on completion tokens when a configuration does not set one.
pub const DEFAULT_MAX_OUTPUT_TOKENS: u32 = 4096;

/// An LLM vendor reachable through an OpenAI-compatible API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    OpenAi,
    Anthropic,
    OpenRouter,
    Groq,
    /// Locally hosted models; needs no key
    Ollama,
}

impl Provider {
    pub const ALL: [Provider; 5] = [
        Provider::OpenAi,
        Provider::Anthropic,
        Provider::OpenRouter,
        Provider::Groq,
        Provider::Ollama,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
            Self::OpenRouter => "openrouter",
            Self::Groq => "groq",
            Self::Ollama => "ollama",
        }
    }

    pub fn requires_api_key(self) -> bool {
        !matches!(self, Self::Ollama)
    }

    /// Base URL of the provider's OpenAI-compatible endpoint.
    pub fn default_base_url(self) -> &'static str {
        match self {
            Self::OpenAi => "https://api.openai.com/v1",
            Self::Anthropic => "https://api.anthropic.com/v1",
            Self::OpenRouter => "https://openrouter.ai/api/v1",
            Self::Groq => "https://api.groq.com/openai/v1",
            Self::Ollama => "http://localhost:11434/v1",
        }
    }

    /// Model used when a request names a provider but no model.
    pub fn default_model(self) -> &'static str {
        match self {
            Self::OpenAi => "gpt-4o-mini",
            Self::Anthropic => "claude-3-5-haiku-latest",
            Self::OpenRouter => "openai/gpt-4o-mini",
            Self::Groq => "llama-3.1-8b-instant",
            Self::Ollama => "llama3.1:8b",
        }
    }

    /// Whether the provider can report the billed cost of a generation.
    pub fn reports_generation_cost(self) -> bool {
        matches!(self, Self::OpenRouter)
    }

    /// Environment variable holding the service key for this provider.
    pub fn api_key_env(self) -> Option<&'static str> {
        match self {
            Self::OpenAi => Some("OPENAI_API_KEY"),
            Self::Anthropic => Some("ANTHROPIC_API_KEY"),
            Self::OpenRouter => Some("OPENROUTER_API_KEY"),
            Self::Groq => Some("GROQ_API_KEY"),
            Self::Ollama => None,
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error)]
#[error("unknown provider: {0}")]
pub struct UnknownProvider(pub String);

impl FromStr for Provider {
    type Err = UnknownProvider;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "anthropic" | "claude" => Ok(Self::Anthropic),
            "openrouter" => Ok(Self::OpenRouter),
            "groq" => Ok(Self::Groq),
            "ollama" | "local" => Ok(Self::Ollama),
            other => Err(UnknownProvider(other.to_string())),
        }
    }
}

/// Everything needed to call one backend for one attempt.
#[derive(Debug, Clone)]
pub struct LlmBackendConfig {
    pub provider: Provider,
    pub model: String,
    pub api_key: Option<SecretString>,
    pub base_url: Option<String>,
    pub max_output_tokens: u32,
    /// Send the caller's schema as a strict JSON schema instead of plain JSON mode
    pub strict_schema_mode: bool,
}

impl LlmBackendConfig {
    pub fn new(provider: Provider, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            api_key: None,
            base_url: None,
            max_output_tokens: DEFAULT_MAX_OUTPUT_TOKENS,
            strict_schema_mode: false,
        }
    }

    pub fn with_api_key(mut self, key: SecretString) -> Self {
        self.api_key = Some(key);
        self
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn with_max_output_tokens(mut self, tokens: u32) -> Self {
        self.max_output_tokens = tokens;
        self
    }

    pub fn with_strict_schema_mode(mut self, strict: bool) -> Self {
        self.strict_schema_mode = strict;
        self
    }

    /// Endpoint to send requests to.
    pub fn endpoint(&self) -> &str {
        self.base_url
            .as_deref()
            .unwrap_or_else(|| self.provider.default_base_url())
    }

    /// Identity used for deduplication within a chain.
    pub fn identity(&self) -> (Provider, &str) {
        (self.provider, self.model.as_str())
    }

    /// `provider/model` label for logs and metadata.
    pub fn label(&self) -> String {
        format!("{}/{}", self.provider, self.model)
    }
}

/// One configured chain entry, before it is paired with a key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainEntry {
    pub provider: Provider,
    pub model: String,
    #[serde(default)]
    pub max_output_tokens: Option<u32>,
    #[serde(default)]
    pub strict_schema_mode: bool,
}

impl ChainEntry {
    pub fn new(provider: Provider, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            max_output_tokens: None,
            strict_schema_mode: false,
        }
    }
}

/// Parses `provider:model`, e.g. `openrouter:openai/gpt-4o-mini`.
impl FromStr for ChainEntry {
    type Err = UnknownProvider;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (provider, model) = s.split_once(':').ok_or_else(|| UnknownProvider(s.to_string()))?;
        let provider: Provider = provider.parse()?;
        let model = model.trim();
        let model = if model.is_empty() {
            provider.default_model()
        } else {
            model
        };
        Ok(Self::new(provider, model))
    }
}

/// A per-request backend override supplied by the caller.
///
/// Naming a provider means "use my backend": the key (if any) is the
/// caller's, and the request never falls back to another backend.
#[derive(Debug, Clone, Default)]
pub struct BackendOverride {
    pub provider: Option<Provider>,
    pub model: Option<String>,
    pub api_key: Option<SecretString>,
    pub base_url: Option<String>,
}

impl BackendOverride {
    pub fn new(provider: Provider) -> Self {
        Self {
            provider: Some(provider),
            ..Default::default()
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_api_key(mut self, key: impl Into<SecretString>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }
}

/// A user's saved custom backend, with the key still encrypted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedBackendConfig {
    pub user_id: UserId,
    pub provider: Provider,
    pub model: String,
    pub encrypted_api_key: Option<String>,
    pub base_url: Option<String>,
    pub max_output_tokens: Option<u32>,
    pub strict_schema_mode: bool,
    pub updated_at: DateTime<Utc>,
}

/// Temporary suspension of a service key after rate limiting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeySuspension {
    /// Hex SHA-256 of the key
    pub fingerprint: String,
    pub provider: Provider,
    pub suspended_until: DateTime<Utc>,
    /// Consecutive rate-limit strikes
    pub strikes: u32,
    pub reason: String,
}

impl KeySuspension {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.suspended_until > now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_parse_and_display() {
        for provider in Provider::ALL {
            assert_eq!(provider.as_str().parse::<Provider>().unwrap(), provider);
        }
        assert_eq!("Claude".parse::<Provider>().unwrap(), Provider::Anthropic);
        assert!("bard".parse::<Provider>().is_err());
    }

    #[test]
    fn test_provider_serde_is_lowercase() {
        let json = serde_json::to_string(&Provider::OpenRouter).unwrap();
        assert_eq!(json, "\"openrouter\"");
    }

    #[test]
    fn test_chain_entry_parse() {
        let entry: ChainEntry = "openrouter:meta-llama/llama-3.1-8b".parse().unwrap();
        assert_eq!(entry.provider, Provider::OpenRouter);
        assert_eq!(entry.model, "meta-llama/llama-3.1-8b");

        let entry: ChainEntry = "ollama:".parse().unwrap();
        assert_eq!(entry.model, Provider::Ollama.default_model());

        assert!("gpt-4o".parse::<ChainEntry>().is_err());
    }

    #[test]
    fn test_config_endpoint_defaults_to_provider() {
        let config = LlmBackendConfig::new(Provider::Groq, "llama");
        assert_eq!(config.endpoint(), "https://api.groq.com/openai/v1");

        let config = config.with_base_url("http://proxy.local/v1");
        assert_eq!(config.endpoint(), "http://proxy.local/v1");
    }
}
