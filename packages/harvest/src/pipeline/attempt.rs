//! A single candidate attempt: fetch (or reuse) content, call the model, parse.

use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::LlmSettings;
use crate::error::{ExtractError, ProviderError, ProviderErrorKind};
use crate::pipeline::escalation::{FetchEscalation, FetchedContent};
use crate::pipeline::prompts::{extraction_prompt, parse_json_output, truncate_content};
use crate::traits::llm::{LlmCallOptions, LlmClient};
use crate::types::{ExtractAttemptResult, ExtractContext, ExtractInput, LlmBackendConfig};

/// A failed attempt, with whatever was measured before the failure.
#[derive(Debug)]
pub struct AttemptFailure {
    pub error: ExtractError,
    pub result: ExtractAttemptResult,
}

/// Runs one candidate end to end.
pub struct AttemptRunner {
    escalation: FetchEscalation,
    llm: Arc<dyn LlmClient>,
    settings: LlmSettings,
}

impl AttemptRunner {
    pub fn new(escalation: FetchEscalation, llm: Arc<dyn LlmClient>, settings: LlmSettings) -> Self {
        Self {
            escalation,
            llm,
            settings,
        }
    }

    pub fn settings(&self) -> &LlmSettings {
        &self.settings
    }

    /// Run `candidate` against the page.
    ///
    /// `content` carries the fetched page between candidates of one request:
    /// it is filled by the first successful fetch and reused afterwards.
    pub async fn run(
        &self,
        candidate: &LlmBackendConfig,
        input: &ExtractInput,
        ctx: &ExtractContext,
        content: &mut Option<FetchedContent>,
        cancel: &CancellationToken,
    ) -> Result<ExtractAttemptResult, AttemptFailure> {
        let mut result = ExtractAttemptResult {
            provider: Some(candidate.provider),
            model: Some(candidate.model.clone()),
            final_url: input.url.clone(),
            ..Default::default()
        };

        let fetched = match content.take() {
            Some(fetched) => {
                debug!(backend = %candidate.label(), "Reusing fetched content");
                fetched
            }
            None => self
                .escalation
                .fetch(&input.url, ctx, input.job_id, cancel)
                .await
                .map_err(|error| fail(error, result.clone()))?,
        };
        let fetched = &*content.insert(fetched);

        result.final_url = fetched.page.final_url.clone();
        result.used_dynamic_fetch = fetched.used_dynamic;
        result.retry_count = fetched.retry_count;
        result.fetch_duration_ms = fetched.fetch_duration.as_millis() as u64;

        let (text, truncated) = truncate_content(&fetched.cleaned, self.settings.max_content_chars);
        if truncated {
            debug!(
                chars = fetched.cleaned.chars().count(),
                limit = self.settings.max_content_chars,
                "Truncated content for prompt"
            );
        }
        result.raw_content = text.to_string();

        let prompt = extraction_prompt(
            &input.url,
            &input.instructions,
            input.schema.as_ref(),
            text,
            truncated,
        );
        let opts = LlmCallOptions {
            temperature: self.settings.temperature,
            max_tokens: candidate.max_output_tokens,
            json_mode: true,
            json_schema: input.schema.clone(),
            timeout: self.settings.timeout,
        };

        let started = Instant::now();
        let call = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(fail(ExtractError::Cancelled, result));
            }
            call = tokio::time::timeout(self.settings.timeout, self.llm.call(candidate, &prompt, &opts)) => call,
        };
        result.extract_duration_ms = started.elapsed().as_millis() as u64;

        let response = match call {
            Err(_) => {
                let error = ProviderError::new(
                    ProviderErrorKind::Timeout,
                    candidate.provider,
                    candidate.model.clone(),
                    format!("no response within {}s", self.settings.timeout.as_secs()),
                );
                return Err(fail(error.into(), result));
            }
            Ok(Err(error)) => return Err(fail(error.into(), result)),
            Ok(Ok(response)) => response,
        };

        result.tokens_in = response.tokens_in;
        result.tokens_out = response.tokens_out;
        result.generation_id = response.generation_id;

        match parse_json_output(&response.content) {
            Ok(data) => {
                result.extracted_data = Some(data);
                Ok(result)
            }
            Err(e) => {
                warn!(backend = %candidate.label(), error = %e, "Model output is not valid JSON");
                let error = ProviderError::new(
                    ProviderErrorKind::InvalidOutput,
                    candidate.provider,
                    candidate.model.clone(),
                    format!("output is not valid JSON: {e}"),
                );
                Err(fail(error.into(), result))
            }
        }
    }
}

fn fail(error: ExtractError, mut result: ExtractAttemptResult) -> AttemptFailure {
    result.error = Some(error.to_string());
    result.error_category = Some(error.category());
    AttemptFailure { error, result }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clean::CleanerChain;
    use crate::config::FetchConfig;
    use crate::error::ErrorCategory;
    use crate::traits::fetcher::MockContentFetcher;
    use crate::traits::llm::{LlmResponse, MockLlmClient};
    use crate::types::{FetchedPage, Provider, Tier};
    use uuid::Uuid;

    const PAGE: &str = "<html><body><h1>Widget</h1><p>The widget costs ten dollars and ships worldwide.</p></body></html>";

    fn fetcher(times: usize) -> MockContentFetcher {
        let mut fetcher = MockContentFetcher::new();
        fetcher
            .expect_fetch()
            .times(times)
            .returning(|url, mode, _| Ok(FetchedPage::new(PAGE, url, mode)));
        fetcher.expect_name().return_const("mock".to_string());
        fetcher
    }

    fn runner(fetcher: MockContentFetcher, llm: MockLlmClient, settings: LlmSettings) -> AttemptRunner {
        let escalation = FetchEscalation::new(
            Arc::new(fetcher),
            Arc::new(CleanerChain::standard()),
            FetchConfig {
                min_raw_bytes: 10,
                min_cleaned_chars: 10,
                ..Default::default()
            },
        );
        AttemptRunner::new(escalation, Arc::new(llm), settings)
    }

    fn reply(content: &'static str) -> MockLlmClient {
        let mut llm = MockLlmClient::new();
        llm.expect_call().returning(move |_, _, _| {
            Ok(LlmResponse {
                content: content.to_string(),
                tokens_in: 1_200,
                tokens_out: 80,
                generation_id: Some("gen-1".into()),
            })
        });
        llm
    }

    fn input() -> ExtractInput {
        ExtractInput::new("https://example.com/widget", "Get the product name and price")
    }

    fn ctx() -> ExtractContext {
        ExtractContext::new(Uuid::new_v4(), Tier::Starter)
    }

    #[tokio::test]
    async fn test_success_parses_output() {
        let runner = runner(fetcher(1), reply(r#"{"name": "Widget", "price": 10}"#), LlmSettings::default());
        let candidate = LlmBackendConfig::new(Provider::OpenAi, "gpt-4o-mini");
        let mut content = None;

        let result = runner
            .run(&candidate, &input(), &ctx(), &mut content, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.extracted_data.unwrap()["name"], "Widget");
        assert_eq!(result.tokens_in, 1_200);
        assert_eq!(result.generation_id.as_deref(), Some("gen-1"));
        assert!(result.raw_content.contains("ten dollars"));
        assert!(content.is_some());
    }

    #[tokio::test]
    async fn test_content_reused_across_candidates() {
        // the fetcher allows exactly one call
        let runner = runner(fetcher(1), reply("not json"), LlmSettings::default());
        let mut content = None;

        for model in ["a", "b"] {
            let candidate = LlmBackendConfig::new(Provider::Groq, model);
            let failure = runner
                .run(&candidate, &input(), &ctx(), &mut content, &CancellationToken::new())
                .await
                .unwrap_err();
            assert_eq!(failure.error.category(), ErrorCategory::InvalidOutput);
            assert!(failure.error.should_fallback());
        }
    }

    #[tokio::test]
    async fn test_provider_error_is_recorded() {
        let mut llm = MockLlmClient::new();
        llm.expect_call().returning(|config, _, _| {
            Err(ProviderError::new(
                ProviderErrorKind::RateLimit,
                config.provider,
                config.model.clone(),
                "slow down",
            ))
        });
        let runner = runner(fetcher(1), llm, LlmSettings::default());
        let candidate = LlmBackendConfig::new(Provider::OpenAi, "gpt-4o-mini");

        let failure = runner
            .run(&candidate, &input(), &ctx(), &mut None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(failure.result.error_category, Some(ErrorCategory::RateLimit));
        assert_eq!(failure.result.provider, Some(Provider::OpenAi));
    }

    #[tokio::test]
    async fn test_truncates_long_content() {
        let settings = LlmSettings {
            max_content_chars: 12,
            ..Default::default()
        };
        let runner = runner(fetcher(1), reply("{}"), settings);
        let candidate = LlmBackendConfig::new(Provider::OpenAi, "gpt-4o-mini");

        let result = runner
            .run(&candidate, &input(), &ctx(), &mut None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.raw_content.chars().count(), 12);
    }
}
