//! LLM backend calls.

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

use crate::error::ProviderResult;
use crate::types::LlmBackendConfig;

/// A chat prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

impl Prompt {
    pub fn new(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            user: user.into(),
        }
    }
}

/// Options for one call.
#[derive(Debug, Clone)]
pub struct LlmCallOptions {
    pub temperature: f32,
    pub max_tokens: u32,
    /// Ask for a JSON object response
    pub json_mode: bool,
    /// Schema to enforce when the backend runs in strict schema mode
    pub json_schema: Option<Value>,
    pub timeout: Duration,
}

impl Default for LlmCallOptions {
    fn default() -> Self {
        Self {
            temperature: 0.0,
            max_tokens: crate::types::backend::DEFAULT_MAX_OUTPUT_TOKENS,
            json_mode: true,
            json_schema: None,
            timeout: Duration::from_secs(120),
        }
    }
}

/// A completed call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LlmResponse {
    pub content: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
    /// Provider-side id, used to look up the billed cost
    pub generation_id: Option<String>,
}

/// Client for chat-completion style LLM backends.
///
/// Failures are returned already classified; the client owns the mapping
/// from status codes and error bodies to [`ProviderErrorKind`](crate::error::ProviderErrorKind).
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn call(
        &self,
        config: &LlmBackendConfig,
        prompt: &Prompt,
        opts: &LlmCallOptions,
    ) -> ProviderResult<LlmResponse>;
}
