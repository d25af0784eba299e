//! The attempt/fallback loop over a resolved chain.

use chrono::Utc;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ExtractError;
use crate::pipeline::attempt::{AttemptFailure, AttemptRunner};
use crate::pipeline::budget::BudgetGate;
use crate::pipeline::escalation::FetchedContent;
use crate::pipeline::keys::KeyHealth;
use crate::pipeline::ledger::CreditLedger;
use crate::types::{
    AttemptOutcome, AttemptRecord, BudgetSkip, ConfigChain, ExtractAttemptResult, ExtractContext,
    ExtractInput, LlmBackendConfig,
};

/// How the budget is enforced for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetMode {
    /// No credit checks (BYOK chains, or checks explicitly skipped)
    Unchecked,
    /// One check against the first candidate before any network call
    Preflight,
    /// Every candidate is admitted against the live balance
    PerCandidate,
}

impl BudgetMode {
    pub fn for_request(ctx: &ExtractContext, chain: &ConfigChain) -> Self {
        if ctx.skip_credit_check || chain.is_byok() {
            Self::Unchecked
        } else if ctx.premium_budget_fallback {
            Self::PerCandidate
        } else {
            Self::Preflight
        }
    }
}

/// Per-request bookkeeping, for metadata and the usage insight.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub attempts: Vec<AttemptRecord>,
    pub budget_skips: Vec<BudgetSkip>,
    pub last_attempt: Option<ExtractAttemptResult>,
    /// Hex SHA-256 of the cleaned content, once a fetch succeeded
    pub content_hash: Option<String>,
}

#[derive(Debug)]
pub enum RunOutcome {
    Success {
        result: ExtractAttemptResult,
        candidate: LlmBackendConfig,
        report: RunReport,
    },
    Failure {
        error: ExtractError,
        report: RunReport,
    },
}

/// Walks a chain, one attempt per candidate, until success or a terminal error.
pub struct AttemptOrchestrator {
    runner: AttemptRunner,
    gate: BudgetGate,
    ledger: Arc<CreditLedger>,
    key_health: Option<Arc<KeyHealth>>,
}

impl AttemptOrchestrator {
    pub fn new(runner: AttemptRunner, gate: BudgetGate, ledger: Arc<CreditLedger>) -> Self {
        Self {
            runner,
            gate,
            ledger,
            key_health: None,
        }
    }

    /// Suspend service keys that hit rate limits.
    pub fn with_key_health(mut self, key_health: Arc<KeyHealth>) -> Self {
        self.key_health = Some(key_health);
        self
    }

    pub fn gate(&self) -> &BudgetGate {
        &self.gate
    }

    pub async fn run(
        &self,
        mut chain: ConfigChain,
        input: &ExtractInput,
        ctx: &ExtractContext,
        cancel: &CancellationToken,
    ) -> RunOutcome {
        let mut report = RunReport::default();
        let mut content: Option<FetchedContent> = None;

        if chain.is_empty() {
            return failure(ExtractError::NoModelsConfigured, report, &content);
        }

        let mode = BudgetMode::for_request(ctx, &chain);
        debug!(
            candidates = chain.len(),
            byok = chain.is_byok(),
            budget_mode = ?mode,
            "Running extraction chain"
        );

        if mode == BudgetMode::Preflight {
            if let Some(first) = chain.first() {
                if let Err(error) = self.preflight(ctx, first).await {
                    return failure(error, report, &content);
                }
            }
        }

        let mut last_error: Option<ExtractError> = None;

        while let Some(candidate) = chain.next() {
            if cancel.is_cancelled() {
                return failure(ExtractError::Cancelled, report, &content);
            }

            if mode == BudgetMode::PerCandidate {
                let available = match self.ledger.available_balance(ctx.user_id, Utc::now()).await {
                    Ok(available) => available,
                    Err(e) => return failure(e.into(), report, &content),
                };
                let admission = self.gate.admit(&candidate, available);
                if !admission.admitted {
                    info!(
                        backend = %candidate.label(),
                        estimated_cost = %admission.estimated_cost,
                        available = %available,
                        "Skipping candidate over budget"
                    );
                    report
                        .budget_skips
                        .push(self.gate.skip(&candidate, admission, available));
                    continue;
                }
            }

            let started = Instant::now();
            match self
                .runner
                .run(&candidate, input, ctx, &mut content, cancel)
                .await
            {
                Ok(result) => {
                    report.attempts.push(AttemptRecord {
                        provider: candidate.provider,
                        model: candidate.model.clone(),
                        outcome: AttemptOutcome::Succeeded,
                        duration_ms: elapsed_ms(started),
                    });
                    self.note_success(&chain, &candidate).await;
                    info!(backend = %candidate.label(), attempts = report.attempts.len(), "Extraction succeeded");

                    report.last_attempt = Some(result.clone());
                    report.content_hash = content_hash(&content);
                    return RunOutcome::Success {
                        result,
                        candidate,
                        report,
                    };
                }
                Err(AttemptFailure { error, result }) => {
                    report.attempts.push(AttemptRecord {
                        provider: candidate.provider,
                        model: candidate.model.clone(),
                        outcome: AttemptOutcome::Failed {
                            category: error.category(),
                            message: error.to_string(),
                        },
                        duration_ms: elapsed_ms(started),
                    });
                    report.last_attempt = Some(result);
                    self.note_failure(&chain, &candidate, &error).await;

                    if !error.should_fallback() {
                        warn!(backend = %candidate.label(), category = %error.category(), error = %error, "Terminal failure");
                        return failure(error, report, &content);
                    }

                    warn!(backend = %candidate.label(), category = %error.category(), error = %error, "Attempt failed; trying next candidate");
                    last_error = Some(error);

                    if !chain.is_exhausted() && !self.pause(cancel).await {
                        return failure(ExtractError::Cancelled, report, &content);
                    }
                }
            }
        }

        let error = match last_error {
            Some(error) => error,
            None if !report.budget_skips.is_empty() => ExtractError::BudgetExhausted {
                skipped: report.budget_skips.len(),
            },
            None => ExtractError::NoModelsConfigured,
        };
        failure(error, report, &content)
    }

    async fn preflight(
        &self,
        ctx: &ExtractContext,
        first: &LlmBackendConfig,
    ) -> Result<(), ExtractError> {
        let available = self.ledger.available_balance(ctx.user_id, Utc::now()).await?;
        let required = self.gate.estimate(first);
        if required > available {
            info!(required = %required, available = %available, "Pre-flight credit check failed");
            return Err(ExtractError::InsufficientCredits {
                required,
                available,
            });
        }
        Ok(())
    }

    /// Wait between candidates. Returns false if cancelled.
    async fn pause(&self, cancel: &CancellationToken) -> bool {
        let delay = self.runner.settings().inter_provider_delay;
        if delay.is_zero() {
            return true;
        }
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    async fn note_success(&self, chain: &ConfigChain, candidate: &LlmBackendConfig) {
        if chain.is_byok() {
            return;
        }
        if let (Some(health), Some(key)) = (&self.key_health, &candidate.api_key) {
            health.record_success(key).await;
        }
    }

    async fn note_failure(&self, chain: &ConfigChain, candidate: &LlmBackendConfig, error: &ExtractError) {
        let ExtractError::Provider(provider_error) = error else {
            return;
        };
        if chain.is_byok() || provider_error.kind != crate::error::ProviderErrorKind::RateLimit {
            return;
        }
        if let (Some(health), Some(key)) = (&self.key_health, &candidate.api_key) {
            if let Err(e) = health
                .record_rate_limit(candidate.provider, key, provider_error.retry_after, Utc::now())
                .await
            {
                warn!(error = %e, "Failed to record key suspension");
            }
        }
    }
}

fn failure(error: ExtractError, mut report: RunReport, content: &Option<FetchedContent>) -> RunOutcome {
    report.content_hash = content_hash(content);
    RunOutcome::Failure { error, report }
}

fn content_hash(content: &Option<FetchedContent>) -> Option<String> {
    content
        .as_ref()
        .map(|c| hex::encode(Sha256::digest(c.cleaned.as_bytes())))
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clean::CleanerChain;
    use crate::config::{BudgetConfig, FetchConfig, KeyHealthConfig, LlmSettings};
    use crate::error::{ErrorCategory, ProviderError, ProviderErrorKind};
    use crate::llm::PriceTable;
    use crate::pipeline::budget::CostEstimator;
    use crate::pipeline::escalation::FetchEscalation;
    use crate::pipeline::ledger::CreditRequest;
    use crate::security::SecretString;
    use crate::stores::MemoryStore;
    use crate::traits::fetcher::MockContentFetcher;
    use crate::traits::store::KeyHealthStore;
    use crate::traits::llm::{LlmResponse, MockLlmClient};
    use crate::types::{FetchedPage, Provider, Tier, TransactionType};
    use rust_decimal::Decimal;
    use std::time::Duration;
    use uuid::Uuid;

    const PAGE: &str = "<html><body><p>Opening hours are nine to five, Monday to Friday.</p></body></html>";

    struct Harness {
        store: Arc<MemoryStore>,
        ledger: Arc<CreditLedger>,
        orchestrator: AttemptOrchestrator,
    }

    fn harness(llm: MockLlmClient) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let ledger = Arc::new(CreditLedger::new(store.clone()));

        let mut fetcher = MockContentFetcher::new();
        fetcher
            .expect_fetch()
            .returning(|url, mode, _| Ok(FetchedPage::new(PAGE, url, mode)));
        fetcher.expect_name().return_const("mock".to_string());

        let escalation = FetchEscalation::new(
            Arc::new(fetcher),
            Arc::new(CleanerChain::standard()),
            FetchConfig {
                min_raw_bytes: 10,
                min_cleaned_chars: 10,
                ..Default::default()
            },
        );
        let settings = LlmSettings {
            inter_provider_delay: Duration::ZERO,
            ..Default::default()
        };
        let runner = AttemptRunner::new(escalation, Arc::new(llm), settings);

        let prices = PriceTable::empty()
            .with_price(Provider::OpenAi, "expensive", Decimal::new(5, 3), Decimal::new(5, 3))
            .with_price(Provider::Groq, "cheap", Decimal::new(5, 4), Decimal::new(5, 4));
        let gate = BudgetGate::new(CostEstimator::new(
            Arc::new(prices),
            BudgetConfig {
                avg_input_tokens: 6_000,
                expected_output_tokens: 4_000,
                safety_multiplier: Decimal::ONE,
            },
        ));
        let health = Arc::new(KeyHealth::new(store.clone(), KeyHealthConfig::default()));

        Harness {
            store,
            ledger: ledger.clone(),
            orchestrator: AttemptOrchestrator::new(runner, gate, ledger).with_key_health(health),
        }
    }

    fn ok_response() -> LlmResponse {
        LlmResponse {
            content: r#"{"hours": "9-5"}"#.into(),
            tokens_in: 100,
            tokens_out: 10,
            generation_id: None,
        }
    }

    fn candidate(provider: Provider, model: &str) -> LlmBackendConfig {
        LlmBackendConfig::new(provider, model).with_api_key(SecretString::new(format!("sk-{model}")))
    }

    fn input() -> ExtractInput {
        ExtractInput::new("https://example.com/hours", "Opening hours")
    }

    async fn fund(h: &Harness, user: Uuid, cents: i64) {
        h.ledger
            .credit(user, CreditRequest::new(TransactionType::Topup, Decimal::new(cents, 2)))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_empty_chain_is_no_models() {
        let h = harness(MockLlmClient::new());
        let ctx = ExtractContext::new(Uuid::new_v4(), Tier::Free);
        let outcome = h
            .orchestrator
            .run(ConfigChain::empty(), &input(), &ctx, &CancellationToken::new())
            .await;
        assert!(matches!(
            outcome,
            RunOutcome::Failure {
                error: ExtractError::NoModelsConfigured,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_fallback_then_success() {
        let mut llm = MockLlmClient::new();
        llm.expect_call().times(3).returning(|config, _, _| match config.model.as_str() {
            "a" => Err(ProviderError::new(ProviderErrorKind::RateLimit, config.provider, "a", "429")),
            "b" => Err(ProviderError::new(ProviderErrorKind::Auth, config.provider, "b", "401")),
            _ => Ok(ok_response()),
        });
        let h = harness(llm);
        let ctx = ExtractContext::new(Uuid::new_v4(), Tier::Pro).with_skip_credit_check(true);
        let chain = ConfigChain::service(vec![
            candidate(Provider::OpenAi, "a"),
            candidate(Provider::OpenAi, "b"),
            candidate(Provider::OpenAi, "c"),
        ]);

        let outcome = h
            .orchestrator
            .run(chain, &input(), &ctx, &CancellationToken::new())
            .await;
        let RunOutcome::Success { candidate, report, .. } = outcome else {
            panic!("expected success");
        };
        assert_eq!(candidate.model, "c");
        assert_eq!(report.attempts.len(), 3);
        assert_eq!(report.attempts.iter().filter(|a| a.succeeded()).count(), 1);
        assert!(report.content_hash.is_some());

        // the rate-limited service key is now suspended
        let fingerprint = SecretString::new("sk-a").fingerprint();
        assert!(h.store.suspension(&fingerprint).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_terminal_error_stops_chain() {
        let mut llm = MockLlmClient::new();
        llm.expect_call().times(1).returning(|config, _, _| {
            Err(ProviderError::new(
                ProviderErrorKind::MalformedRequest,
                config.provider,
                config.model.clone(),
                "bad schema",
            ))
        });
        let h = harness(llm);
        let ctx = ExtractContext::new(Uuid::new_v4(), Tier::Pro).with_skip_credit_check(true);
        let chain = ConfigChain::service(vec![
            candidate(Provider::OpenAi, "a"),
            candidate(Provider::OpenAi, "b"),
        ]);

        let outcome = h
            .orchestrator
            .run(chain, &input(), &ctx, &CancellationToken::new())
            .await;
        let RunOutcome::Failure { error, report } = outcome else {
            panic!("expected failure");
        };
        assert_eq!(error.category(), ErrorCategory::MalformedRequest);
        assert_eq!(report.attempts.len(), 1);
    }

    #[tokio::test]
    async fn test_preflight_blocks_before_network() {
        let mut llm = MockLlmClient::new();
        llm.expect_call().never();
        let h = harness(llm);
        let user = Uuid::new_v4();
        fund(&h, user, 1).await;

        let ctx = ExtractContext::new(user, Tier::Starter);
        let chain = ConfigChain::service(vec![candidate(Provider::OpenAi, "expensive")]);
        let outcome = h
            .orchestrator
            .run(chain, &input(), &ctx, &CancellationToken::new())
            .await;
        assert!(matches!(
            outcome,
            RunOutcome::Failure {
                error: ExtractError::InsufficientCredits { .. },
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_budget_skip_then_cheap_candidate() {
        let mut llm = MockLlmClient::new();
        llm.expect_call()
            .times(1)
            .withf(|config, _, _| config.model == "cheap")
            .returning(|_, _, _| Ok(ok_response()));
        let h = harness(llm);
        let user = Uuid::new_v4();
        fund(&h, user, 1).await;

        // expensive estimates at $0.05, cheap at $0.005, $0.01 available
        let ctx = ExtractContext::new(user, Tier::Enterprise).with_premium_budget_fallback(true);
        let chain = ConfigChain::service(vec![
            candidate(Provider::OpenAi, "expensive"),
            candidate(Provider::Groq, "cheap"),
        ]);
        let outcome = h
            .orchestrator
            .run(chain, &input(), &ctx, &CancellationToken::new())
            .await;
        let RunOutcome::Success { candidate, report, .. } = outcome else {
            panic!("expected success");
        };
        assert_eq!(candidate.model, "cheap");
        assert_eq!(report.budget_skips.len(), 1);
        assert_eq!(report.budget_skips[0].model, "expensive");
        assert_eq!(report.attempts.len(), 1);
    }

    #[tokio::test]
    async fn test_all_skipped_is_budget_exhausted() {
        let mut llm = MockLlmClient::new();
        llm.expect_call().never();
        let h = harness(llm);
        let ctx = ExtractContext::new(Uuid::new_v4(), Tier::Enterprise).with_premium_budget_fallback(true);
        let chain = ConfigChain::service(vec![
            candidate(Provider::OpenAi, "expensive"),
            candidate(Provider::Groq, "cheap"),
        ]);
        let outcome = h
            .orchestrator
            .run(chain, &input(), &ctx, &CancellationToken::new())
            .await;
        assert!(matches!(
            outcome,
            RunOutcome::Failure {
                error: ExtractError::BudgetExhausted { skipped: 2 },
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_byok_chain_ignores_balance() {
        let mut llm = MockLlmClient::new();
        llm.expect_call().times(1).returning(|_, _, _| Ok(ok_response()));
        let h = harness(llm);
        let ctx = ExtractContext::new(Uuid::new_v4(), Tier::Starter);
        let chain = ConfigChain::byok(candidate(Provider::OpenAi, "expensive"));

        let outcome = h
            .orchestrator
            .run(chain, &input(), &ctx, &CancellationToken::new())
            .await;
        assert!(matches!(outcome, RunOutcome::Success { .. }));
    }

    #[tokio::test]
    async fn test_cancelled_request_stops() {
        let mut llm = MockLlmClient::new();
        llm.expect_call().never();
        let h = harness(llm);
        let ctx = ExtractContext::new(Uuid::new_v4(), Tier::Pro).with_skip_credit_check(true);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = h
            .orchestrator
            .run(
                ConfigChain::service(vec![candidate(Provider::OpenAi, "a")]),
                &input(),
                &ctx,
                &cancel,
            )
            .await;
        assert!(matches!(
            outcome,
            RunOutcome::Failure {
                error: ExtractError::Cancelled,
                ..
            }
        ));
    }
}
