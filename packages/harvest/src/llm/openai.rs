//! Client for OpenAI-compatible chat completion endpoints.
//!
//! Every supported provider exposes `/chat/completions` with the same
//! request shape, so one client serves the whole chain. The backend config
//! passed per call decides the endpoint, model and key.
//!
//! # Example
//!
//! ```rust,ignore
//! use harvest::llm::OpenAiCompatClient;
//!
//! let client = OpenAiCompatClient::new()?;
//! let response = client.call(&backend, &prompt, &LlmCallOptions::default()).await?;
//! ```

use async_trait::async_trait;
use reqwest::{header, Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::error::{ProviderError, ProviderErrorKind, ProviderResult};
use crate::traits::llm::{LlmCallOptions, LlmClient, LlmResponse, Prompt};
use crate::types::LlmBackendConfig;

/// Stateless client; all per-backend settings arrive with each call.
#[derive(Clone)]
pub struct OpenAiCompatClient {
    client: Client,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    temperature: f32,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    json_schema: Option<JsonSchemaFormat>,
}

#[derive(Serialize)]
struct JsonSchemaFormat {
    name: &'static str,
    strict: bool,
    schema: serde_json::Value,
}

#[derive(Deserialize)]
struct ChatResponse {
    id: Option<String>,
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Deserialize, Default)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

impl OpenAiCompatClient {
    pub fn new() -> ProviderResult<Self> {
        // per-call timeouts come from LlmCallOptions
        Ok(Self {
            client: Client::new(),
        })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

fn response_format(config: &LlmBackendConfig, opts: &LlmCallOptions) -> Option<ResponseFormat> {
    match (&opts.json_schema, config.strict_schema_mode) {
        (Some(schema), true) => Some(ResponseFormat {
            format_type: "json_schema",
            json_schema: Some(JsonSchemaFormat {
                name: "extraction",
                strict: true,
                schema: schema.clone(),
            }),
        }),
        _ if opts.json_mode => Some(ResponseFormat {
            format_type: "json_object",
            json_schema: None,
        }),
        _ => None,
    }
}

/// Map an HTTP failure to an error kind.
pub fn classify_status(status: StatusCode, body: &str) -> ProviderErrorKind {
    let lowered = body.to_ascii_lowercase();
    match status.as_u16() {
        429 => ProviderErrorKind::RateLimit,
        401 | 403 => ProviderErrorKind::Auth,
        400 | 413 | 422
            if lowered.contains("context_length")
                || lowered.contains("context length")
                || lowered.contains("maximum context")
                || lowered.contains("too many tokens") =>
        {
            ProviderErrorKind::ContextLengthExceeded
        }
        400 | 404 | 422 => ProviderErrorKind::MalformedRequest,
        408 | 504 => ProviderErrorKind::Timeout,
        _ => ProviderErrorKind::Transient,
    }
}

/// Parse a `Retry-After` header given in seconds.
fn retry_after(headers: &header::HeaderMap) -> Option<Duration> {
    headers
        .get(header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[async_trait]
impl LlmClient for OpenAiCompatClient {
    async fn call(
        &self,
        config: &LlmBackendConfig,
        prompt: &Prompt,
        opts: &LlmCallOptions,
    ) -> ProviderResult<LlmResponse> {
        let error = |kind, message: String| {
            ProviderError::new(kind, config.provider, config.model.clone(), message)
        };

        let request = ChatRequest {
            model: &config.model,
            messages: [
                ChatMessage {
                    role: "system",
                    content: &prompt.system,
                },
                ChatMessage {
                    role: "user",
                    content: &prompt.user,
                },
            ],
            temperature: opts.temperature,
            max_tokens: opts.max_tokens.min(config.max_output_tokens),
            response_format: response_format(config, opts),
        };

        let url = format!("{}/chat/completions", config.endpoint().trim_end_matches('/'));
        let mut builder = self
            .client
            .post(&url)
            .timeout(opts.timeout)
            .header(header::CONTENT_TYPE, "application/json")
            .json(&request);
        if let Some(key) = &config.api_key {
            builder = builder.bearer_auth(key.expose());
        } else if config.provider.requires_api_key() {
            return Err(error(
                ProviderErrorKind::Auth,
                format!("no API key configured for {}", config.provider),
            ));
        }

        debug!(backend = %config.label(), "Calling LLM");
        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                error(ProviderErrorKind::Timeout, e.to_string())
            } else {
                error(ProviderErrorKind::Transient, e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let hint = retry_after(response.headers());
            let body = response.text().await.unwrap_or_default();
            let mut err = error(classify_status(status, &body), body).with_status(status.as_u16());
            if let Some(hint) = hint {
                err = err.with_retry_after(hint);
            }
            return Err(err);
        }

        let chat: ChatResponse = response
            .json()
            .await
            .map_err(|e| error(ProviderErrorKind::InvalidOutput, e.to_string()))?;

        let content = chat
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| {
                error(
                    ProviderErrorKind::InvalidOutput,
                    "response contained no message".to_string(),
                )
            })?;
        let usage = chat.usage.unwrap_or_default();

        Ok(LlmResponse {
            content,
            tokens_in: usage.prompt_tokens,
            tokens_out: usage.completion_tokens,
            generation_id: chat.id,
        })
    }
}
