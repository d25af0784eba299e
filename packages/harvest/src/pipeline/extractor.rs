//! The extraction entry point.

use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::clean::CleanerChain;
use crate::config::PipelineConfig;
use crate::error::ExtractError;
use crate::pipeline::attempt::AttemptRunner;
use crate::pipeline::billing::BillingPostProcessor;
use crate::pipeline::budget::{BudgetGate, CostEstimator};
use crate::pipeline::chain::{ConfigChainResolver, ResolveRequest};
use crate::pipeline::escalation::FetchEscalation;
use crate::pipeline::keys::KeyHealth;
use crate::pipeline::ledger::CreditLedger;
use crate::pipeline::orchestrator::{AttemptOrchestrator, RunOutcome, RunReport};
use crate::pipeline::recorder::UsageRecorder;
use crate::security::{KeyVault, PlaintextVault};
use crate::traits::cleaner::ContentCleaner;
use crate::traits::fetcher::ContentFetcher;
use crate::traits::llm::LlmClient;
use crate::traits::pricing::PricingOracle;
use crate::traits::store::Store;
use crate::types::{ExtractContext, ExtractInput, ExtractMetadata, ExtractOutput, UserId};

/// Budget-aware extraction pipeline.
///
/// # Example
///
/// ```rust,ignore
/// use harvest::{Extractor, ExtractContext, ExtractInput, Tier};
///
/// let extractor = Extractor::builder(store, fetcher, llm, pricing)
///     .with_config(PipelineConfig::from_env()?)
///     .build();
///
/// let ctx = ExtractContext::for_tier(user_id, Tier::Pro);
/// let output = extractor
///     .extract(user_id, ExtractInput::new(url, "List the opening hours"), &ctx)
///     .await?;
/// ```
pub struct Extractor {
    resolver: ConfigChainResolver,
    orchestrator: AttemptOrchestrator,
    billing: BillingPostProcessor,
    ledger: Arc<CreditLedger>,
    recorder: Arc<UsageRecorder>,
}

pub struct ExtractorBuilder<S: Store + 'static> {
    store: Arc<S>,
    static_fetcher: Arc<dyn ContentFetcher>,
    dynamic_fetcher: Option<Arc<dyn ContentFetcher>>,
    llm: Arc<dyn LlmClient>,
    pricing: Arc<dyn PricingOracle>,
    vault: Arc<dyn KeyVault>,
    cleaner: Arc<dyn ContentCleaner>,
    config: PipelineConfig,
}

impl<S: Store + 'static> ExtractorBuilder<S> {
    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// Browser-rendering fetcher used for escalation.
    pub fn with_dynamic_fetcher(mut self, fetcher: Arc<dyn ContentFetcher>) -> Self {
        self.dynamic_fetcher = Some(fetcher);
        self
    }

    /// Vault for saved custom-backend keys (default: plaintext).
    pub fn with_vault(mut self, vault: Arc<dyn KeyVault>) -> Self {
        self.vault = vault;
        self
    }

    pub fn with_cleaner(mut self, cleaner: Arc<dyn ContentCleaner>) -> Self {
        self.cleaner = cleaner;
        self
    }

    /// Assemble the pipeline. Spawns the usage recorder, so it must be
    /// called within a Tokio runtime.
    pub fn build(self) -> Extractor {
        let config = self.config;
        let ledger = Arc::new(CreditLedger::new(self.store.clone()));
        let key_health = Arc::new(KeyHealth::new(self.store.clone(), config.key_health.clone()));

        let resolver = ConfigChainResolver::new(config.chain.clone(), self.store.clone(), self.vault)
            .with_key_health(key_health.clone());

        let mut escalation =
            FetchEscalation::new(self.static_fetcher, self.cleaner, config.fetch.clone());
        if let Some(dynamic) = self.dynamic_fetcher {
            escalation = escalation.with_dynamic_fetcher(dynamic);
        }
        let runner = AttemptRunner::new(escalation, self.llm, config.llm.clone());
        let gate = BudgetGate::new(CostEstimator::new(self.pricing.clone(), config.budget.clone()));
        let orchestrator =
            AttemptOrchestrator::new(runner, gate, ledger.clone()).with_key_health(key_health);

        let recorder = Arc::new(UsageRecorder::spawn(self.store.clone(), config.recorder.clone()));
        let billing = BillingPostProcessor::new(
            ledger.clone(),
            self.store,
            self.pricing,
            recorder.clone(),
            config.billing,
        );

        Extractor {
            resolver,
            orchestrator,
            billing,
            ledger,
            recorder,
        }
    }
}

impl Extractor {
    pub fn builder<S: Store + 'static>(
        store: Arc<S>,
        static_fetcher: Arc<dyn ContentFetcher>,
        llm: Arc<dyn LlmClient>,
        pricing: Arc<dyn PricingOracle>,
    ) -> ExtractorBuilder<S> {
        ExtractorBuilder {
            store,
            static_fetcher,
            dynamic_fetcher: None,
            llm,
            pricing,
            vault: Arc::new(PlaintextVault),
            cleaner: Arc::new(CleanerChain::standard()),
            config: PipelineConfig::default(),
        }
    }

    /// The credit ledger the pipeline debits.
    pub fn ledger(&self) -> &Arc<CreditLedger> {
        &self.ledger
    }

    /// Usage records dropped because the recorder queue was full.
    pub fn dropped_usage_records(&self) -> u64 {
        self.recorder.dropped()
    }

    pub async fn extract(
        &self,
        user_id: UserId,
        input: ExtractInput,
        ctx: &ExtractContext,
    ) -> Result<ExtractOutput, ExtractError> {
        self.extract_with_cancel(user_id, input, ctx, CancellationToken::new())
            .await
    }

    /// Run one extraction. Cancelling `cancel` aborts in-flight fetch and
    /// model calls; committed debits and queued usage records are kept.
    #[instrument(skip(self, input, ctx, cancel), fields(user_id = %user_id, url = %input.url, tier = %ctx.tier))]
    pub async fn extract_with_cancel(
        &self,
        user_id: UserId,
        input: ExtractInput,
        ctx: &ExtractContext,
        cancel: CancellationToken,
    ) -> Result<ExtractOutput, ExtractError> {
        if let Err(error) = validate(user_id, &input, ctx) {
            warn!(error = %error, "Rejected extraction request");
            self.billing
                .record_failure(ctx, &input, false, &error, &RunReport::default());
            return Err(error);
        }

        let request = ResolveRequest::from_context(ctx, input.backend_override.as_ref());
        let chain = self.resolver.resolve(&request).await;
        let is_byok = chain.is_byok();

        match self.orchestrator.run(chain, &input, ctx, &cancel).await {
            RunOutcome::Success {
                result,
                candidate,
                report,
            } => {
                let usage = match self
                    .billing
                    .settle_success(ctx, &input, &candidate, is_byok, &result, &report)
                    .await
                {
                    Ok(usage) => usage,
                    Err(error) => {
                        self.billing
                            .record_failure(ctx, &input, is_byok, &error, &report);
                        return Err(error);
                    }
                };

                let metadata = ExtractMetadata {
                    final_url: result.final_url.clone(),
                    provider: result.provider,
                    model: result.model.clone(),
                    generation_id: result.generation_id.clone(),
                    used_dynamic_fetch: result.used_dynamic_fetch,
                    retry_count: result.retry_count,
                    fetch_duration_ms: result.fetch_duration_ms,
                    extract_duration_ms: result.extract_duration_ms,
                    budget_skips: report.budget_skips,
                    attempts: report.attempts,
                    job_id: input.job_id,
                };
                info!(
                    backend = %candidate.label(),
                    charged = %usage.charged,
                    "Extraction complete"
                );

                Ok(ExtractOutput {
                    data: result.extracted_data.unwrap_or(Value::Null),
                    usage,
                    metadata,
                })
            }
            RunOutcome::Failure { error, report } => {
                warn!(
                    category = %error.category(),
                    attempts = report.attempts.len(),
                    budget_skips = report.budget_skips.len(),
                    "Extraction failed"
                );
                self.billing
                    .record_failure(ctx, &input, is_byok, &error, &report);
                Err(error)
            }
        }
    }

    /// Flush queued usage records and stop the recorder.
    pub async fn shutdown(&self) {
        self.recorder.shutdown().await;
    }
}

fn validate(user_id: UserId, input: &ExtractInput, ctx: &ExtractContext) -> Result<(), ExtractError> {
    if ctx.user_id != user_id {
        return Err(ExtractError::InvalidInput {
            reason: "context belongs to a different user".into(),
        });
    }
    if input.instructions.trim().is_empty() {
        return Err(ExtractError::InvalidInput {
            reason: "instructions must not be empty".into(),
        });
    }
    let parsed = url::Url::parse(&input.url).map_err(|e| ExtractError::InvalidInput {
        reason: format!("invalid url: {e}"),
    })?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(ExtractError::InvalidInput {
            reason: format!("unsupported url scheme: {}", parsed.scheme()),
        });
    }
    Ok(())
}
