//! Billing after an extraction: cost, markup, debit, usage records.

use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::BillingConfig;
use crate::error::ExtractError;
use crate::pipeline::ledger::CreditLedger;
use crate::pipeline::orchestrator::RunReport;
use crate::pipeline::recorder::{UsageEntry, UsageRecorder};
use crate::traits::pricing::PricingOracle;
use crate::traits::store::UsageStore;
use crate::types::{
    CostSource, ExtractAttemptResult, ExtractContext, ExtractInput, LlmBackendConfig, Tier,
    UsageInsight, UsageRecord, UsageSummary,
};

/// What a request cost and what the user pays for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Charge {
    pub actual_cost: Decimal,
    pub charged: Decimal,
    pub markup_rate: Decimal,
}

pub struct BillingPostProcessor {
    ledger: Arc<CreditLedger>,
    usage: Arc<dyn UsageStore>,
    pricing: Arc<dyn PricingOracle>,
    recorder: Arc<UsageRecorder>,
    config: BillingConfig,
}

impl BillingPostProcessor {
    pub fn new(
        ledger: Arc<CreditLedger>,
        usage: Arc<dyn UsageStore>,
        pricing: Arc<dyn PricingOracle>,
        recorder: Arc<UsageRecorder>,
        config: BillingConfig,
    ) -> Self {
        Self {
            ledger,
            usage,
            pricing,
            recorder,
            config,
        }
    }

    /// `actual × (1 + markup) + fee`; BYOK users are never charged.
    pub fn compute_charge(&self, actual_cost: Decimal, tier: Tier, is_byok: bool) -> Charge {
        if is_byok {
            return Charge {
                actual_cost,
                charged: Decimal::ZERO,
                markup_rate: Decimal::ZERO,
            };
        }
        let markup_rate = self.config.markup_for(tier);
        let charged = actual_cost * (Decimal::ONE + markup_rate) + self.config.fixed_fee;
        Charge {
            actual_cost,
            charged: charged.round_dp(8),
            markup_rate,
        }
    }

    /// Backend cost of a successful attempt: provider-reported when
    /// available, otherwise estimated from token counts.
    pub async fn actual_cost(
        &self,
        candidate: &LlmBackendConfig,
        result: &ExtractAttemptResult,
    ) -> (Decimal, CostSource) {
        if let Some(generation_id) = &result.generation_id {
            match self
                .pricing
                .actual_cost(candidate, generation_id)
                .await
            {
                Ok(Some(cost)) => return (cost, CostSource::Provider),
                Ok(None) => {}
                Err(e) => warn!(
                    provider = %candidate.provider,
                    error = %e,
                    "Cost lookup failed; using estimate"
                ),
            }
        }
        let estimate = self.pricing.estimate(
            candidate.provider,
            &candidate.model,
            result.tokens_in,
            result.tokens_out,
        );
        (estimate, CostSource::Estimated)
    }

    /// Charge for a successful extraction and write its usage records.
    ///
    /// The debit is committed before any record is written; a failed debit
    /// fails the request.
    pub async fn settle_success(
        &self,
        ctx: &ExtractContext,
        input: &ExtractInput,
        candidate: &LlmBackendConfig,
        is_byok: bool,
        result: &ExtractAttemptResult,
        report: &RunReport,
    ) -> Result<UsageSummary, ExtractError> {
        let (actual_cost, cost_source) = self.actual_cost(candidate, result).await;
        let charge = self.compute_charge(actual_cost, ctx.tier, is_byok);

        if charge.charged > Decimal::ZERO {
            self.ledger
                .debit(ctx.user_id, charge.charged, input.job_id)
                .await?;
        }

        info!(
            user_id = %ctx.user_id,
            backend = %candidate.label(),
            actual_cost = %charge.actual_cost,
            charged = %charge.charged,
            is_byok,
            "Charged extraction"
        );

        let record = UsageRecord {
            id: Uuid::new_v4(),
            user_id: ctx.user_id,
            job_id: input.job_id,
            url: input.url.clone(),
            provider: Some(candidate.provider),
            model: Some(candidate.model.clone()),
            tokens_in: result.tokens_in,
            tokens_out: result.tokens_out,
            actual_cost: charge.actual_cost,
            charged: charge.charged,
            is_byok,
            success: true,
            error_category: None,
            created_at: Utc::now(),
        };
        let insight = build_insight(&record, Some(result), None, report);

        if let Err(e) = self.usage.record_usage(&record).await {
            error!(usage_id = %record.id, error = %e, "Failed to write usage record");
        } else if let Err(e) = self.usage.record_insight(&insight).await {
            warn!(usage_id = %record.id, error = %e, "Failed to write usage insight");
        }

        Ok(UsageSummary {
            tokens_in: result.tokens_in,
            tokens_out: result.tokens_out,
            actual_cost: charge.actual_cost,
            charged: charge.charged,
            markup_rate: charge.markup_rate,
            is_byok,
            cost_source,
        })
    }

    /// Queue the zero-charge record for a failed request.
    ///
    /// Goes through the background recorder so it survives caller
    /// cancellation.
    pub fn record_failure(
        &self,
        ctx: &ExtractContext,
        input: &ExtractInput,
        is_byok: bool,
        failure: &ExtractError,
        report: &RunReport,
    ) {
        let last = report.last_attempt.as_ref();
        let record = UsageRecord {
            id: Uuid::new_v4(),
            user_id: ctx.user_id,
            job_id: input.job_id,
            url: input.url.clone(),
            provider: last.and_then(|a| a.provider),
            model: last.and_then(|a| a.model.clone()),
            tokens_in: last.map(|a| a.tokens_in).unwrap_or_default(),
            tokens_out: last.map(|a| a.tokens_out).unwrap_or_default(),
            actual_cost: Decimal::ZERO,
            charged: Decimal::ZERO,
            is_byok,
            success: false,
            error_category: Some(failure.category()),
            created_at: Utc::now(),
        };
        let insight = build_insight(&record, last, Some(failure), report);

        self.recorder.submit(UsageEntry {
            record,
            insight: Some(insight),
        });
    }
}

fn build_insight(
    record: &UsageRecord,
    attempt: Option<&ExtractAttemptResult>,
    failure: Option<&ExtractError>,
    report: &RunReport,
) -> UsageInsight {
    UsageInsight {
        usage_id: record.id,
        user_id: record.user_id,
        error: failure.map(|e| e.to_string()),
        tokens_in: record.tokens_in,
        tokens_out: record.tokens_out,
        fetch_duration_ms: attempt.map(|a| a.fetch_duration_ms).unwrap_or_default(),
        extract_duration_ms: attempt.map(|a| a.extract_duration_ms).unwrap_or_default(),
        provider: record.provider,
        model: record.model.clone(),
        used_dynamic_fetch: attempt.map(|a| a.used_dynamic_fetch).unwrap_or_default(),
        retry_count: attempt.map(|a| a.retry_count).unwrap_or_default(),
        budget_skip_count: report.budget_skips.len() as u32,
        budget_skips: report.budget_skips.clone(),
        attempt_count: report.attempts.len() as u32,
        content_hash: report.content_hash.clone(),
        created_at: record.created_at,
    }
}
