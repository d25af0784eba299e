//! Testing utilities including mock implementations.
//!
//! These drive the full pipeline without network calls: scripted pages,
//! scripted model replies and fixed prices.

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::error::{FetchError, FetchResult, ProviderError, ProviderErrorKind, ProviderResult};
use crate::traits::fetcher::ContentFetcher;
use crate::traits::llm::{LlmCallOptions, LlmClient, LlmResponse, Prompt};
use crate::traits::pricing::PricingOracle;
use crate::types::{FetchMode, FetchOptions, FetchedPage, LlmBackendConfig, Provider};

/// Scripted response for one URL.
#[derive(Debug, Clone)]
pub enum MockPage {
    Html { html: String, status: u16 },
    /// Protection page; `suggest_dynamic` says whether a browser may help
    Blocked { signal: String, suggest_dynamic: bool },
    Status(u16),
    Timeout,
}

impl MockPage {
    pub fn html(html: impl Into<String>) -> Self {
        Self::Html {
            html: html.into(),
            status: 200,
        }
    }

    pub fn blocked(signal: impl Into<String>, suggest_dynamic: bool) -> Self {
        Self::Blocked {
            signal: signal.into(),
            suggest_dynamic,
        }
    }
}

/// Record of a fetch made through [`MockFetcher`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockFetchCall {
    pub url: String,
    pub mode: FetchMode,
}

/// A mock fetcher that serves scripted pages by URL.
///
/// Unknown URLs answer 404. Clones share scripts and call tracking.
#[derive(Clone)]
pub struct MockFetcher {
    name: String,
    pages: Arc<RwLock<HashMap<String, MockPage>>>,
    calls: Arc<RwLock<Vec<MockFetchCall>>>,
}

impl Default for MockFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl MockFetcher {
    pub fn new() -> Self {
        Self::named("mock")
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pages: Arc::new(RwLock::new(HashMap::new())),
            calls: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Serve `page` for `url`.
    pub fn with_page(self, url: impl Into<String>, page: MockPage) -> Self {
        self.pages.write().unwrap().insert(url.into(), page);
        self
    }

    pub fn calls(&self) -> Vec<MockFetchCall> {
        self.calls.read().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.read().unwrap().len()
    }
}

#[async_trait]
impl ContentFetcher for MockFetcher {
    async fn fetch(
        &self,
        url: &str,
        mode: FetchMode,
        _opts: &FetchOptions,
    ) -> FetchResult<FetchedPage> {
        self.calls.write().unwrap().push(MockFetchCall {
            url: url.to_string(),
            mode,
        });

        let page = self.pages.read().unwrap().get(url).cloned();
        match page {
            Some(MockPage::Html { html, status }) => {
                Ok(FetchedPage::new(html, url, mode).with_status(status))
            }
            Some(MockPage::Blocked {
                signal,
                suggest_dynamic,
            }) => Err(FetchError::BotProtection {
                message: format!("The site is protected by {signal}."),
                signal,
                suggest_dynamic,
            }),
            Some(MockPage::Status(status)) => Err(FetchError::Status {
                url: url.to_string(),
                status,
            }),
            Some(MockPage::Timeout) => Err(FetchError::Timeout {
                url: url.to_string(),
            }),
            None => Err(FetchError::Status {
                url: url.to_string(),
                status: 404,
            }),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Scripted model reply.
#[derive(Debug, Clone)]
pub enum MockReply {
    Content {
        content: String,
        tokens_in: u64,
        tokens_out: u64,
        generation_id: Option<String>,
    },
    Error {
        kind: ProviderErrorKind,
        message: String,
    },
}

impl MockReply {
    pub fn json(content: impl Into<String>) -> Self {
        Self::Content {
            content: content.into(),
            tokens_in: 1_000,
            tokens_out: 100,
            generation_id: None,
        }
    }

    pub fn error(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self::Error {
            kind,
            message: message.into(),
        }
    }

    pub fn with_tokens(self, tokens_in: u64, tokens_out: u64) -> Self {
        match self {
            Self::Content {
                content,
                generation_id,
                ..
            } => Self::Content {
                content,
                tokens_in,
                tokens_out,
                generation_id,
            },
            other => other,
        }
    }

    pub fn with_generation_id(self, id: impl Into<String>) -> Self {
        match self {
            Self::Content {
                content,
                tokens_in,
                tokens_out,
                ..
            } => Self::Content {
                content,
                tokens_in,
                tokens_out,
                generation_id: Some(id.into()),
            },
            other => other,
        }
    }
}

/// Record of a call made to [`MockLlm`].
#[derive(Debug, Clone)]
pub struct MockLlmCall {
    pub provider: Provider,
    pub model: String,
    /// Fingerprint of the key used, if any
    pub key_fingerprint: Option<String>,
    pub prompt: Prompt,
}

/// A mock LLM client with replies scripted per model.
///
/// Each model has a queue; the last reply repeats once the queue is down
/// to one. Models without a script get the default reply.
#[derive(Clone)]
pub struct MockLlm {
    replies: Arc<RwLock<HashMap<String, VecDeque<MockReply>>>>,
    default_reply: MockReply,
    calls: Arc<RwLock<Vec<MockLlmCall>>>,
    latency: Duration,
}

impl Default for MockLlm {
    fn default() -> Self {
        Self::new()
    }
}

impl MockLlm {
    pub fn new() -> Self {
        Self {
            replies: Arc::new(RwLock::new(HashMap::new())),
            default_reply: MockReply::json("{}"),
            calls: Arc::new(RwLock::new(Vec::new())),
            latency: Duration::ZERO,
        }
    }

    /// Queue a reply for `model`.
    pub fn with_reply(self, model: impl Into<String>, reply: MockReply) -> Self {
        self.replies
            .write()
            .unwrap()
            .entry(model.into())
            .or_default()
            .push_back(reply);
        self
    }

    pub fn with_default_reply(mut self, reply: MockReply) -> Self {
        self.default_reply = reply;
        self
    }

    /// Delay every reply, leaving time to cancel mid-call.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn calls(&self) -> Vec<MockLlmCall> {
        self.calls.read().unwrap().clone()
    }

    /// Models called, in order.
    pub fn models_called(&self) -> Vec<String> {
        self.calls
            .read()
            .unwrap()
            .iter()
            .map(|c| c.model.clone())
            .collect()
    }

    fn next_reply(&self, model: &str) -> MockReply {
        let mut replies = self.replies.write().unwrap();
        match replies.get_mut(model) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or_else(|| self.default_reply.clone()),
            Some(queue) => queue.front().cloned().unwrap_or_else(|| self.default_reply.clone()),
            None => self.default_reply.clone(),
        }
    }
}

#[async_trait]
impl LlmClient for MockLlm {
    async fn call(
        &self,
        config: &LlmBackendConfig,
        prompt: &Prompt,
        _opts: &LlmCallOptions,
    ) -> ProviderResult<LlmResponse> {
        self.calls.write().unwrap().push(MockLlmCall {
            provider: config.provider,
            model: config.model.clone(),
            key_fingerprint: config.api_key.as_ref().map(|k| k.fingerprint()),
            prompt: prompt.clone(),
        });

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        match self.next_reply(&config.model) {
            MockReply::Content {
                content,
                tokens_in,
                tokens_out,
                generation_id,
            } => Ok(LlmResponse {
                content,
                tokens_in,
                tokens_out,
                generation_id,
            }),
            MockReply::Error { kind, message } => Err(ProviderError::new(
                kind,
                config.provider,
                config.model.clone(),
                message,
            )),
        }
    }
}

/// Pricing with a flat per-request cost for each model.
///
/// `estimate` ignores token counts, which makes budget arithmetic in tests
/// exact. Provider-reported costs can be scripted per generation id.
#[derive(Clone, Default)]
pub struct MockPricing {
    flat: Arc<RwLock<HashMap<String, Decimal>>>,
    default_cost: Decimal,
    generations: Arc<RwLock<HashMap<String, Decimal>>>,
}

impl MockPricing {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cost(self, model: impl Into<String>, cost: Decimal) -> Self {
        self.flat.write().unwrap().insert(model.into(), cost);
        self
    }

    pub fn with_default_cost(mut self, cost: Decimal) -> Self {
        self.default_cost = cost;
        self
    }

    /// Report `cost` for `generation_id` as the provider-billed figure.
    pub fn with_generation_cost(self, generation_id: impl Into<String>, cost: Decimal) -> Self {
        self.generations
            .write()
            .unwrap()
            .insert(generation_id.into(), cost);
        self
    }
}

#[async_trait]
impl PricingOracle for MockPricing {
    fn estimate(&self, _provider: Provider, model: &str, _tokens_in: u64, _tokens_out: u64) -> Decimal {
        self.flat
            .read()
            .unwrap()
            .get(model)
            .copied()
            .unwrap_or(self.default_cost)
    }

    async fn actual_cost(
        &self,
        _backend: &LlmBackendConfig,
        generation_id: &str,
    ) -> ProviderResult<Option<Decimal>> {
        Ok(self.generations.read().unwrap().get(generation_id).copied())
    }
}
