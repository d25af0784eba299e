//! Budget admission control.

use rust_decimal::Decimal;
use std::sync::Arc;

use crate::config::BudgetConfig;
use crate::traits::pricing::PricingOracle;
use crate::types::{BudgetSkip, LlmBackendConfig};

/// Conservative per-attempt cost estimates.
pub struct CostEstimator {
    pricing: Arc<dyn PricingOracle>,
    config: BudgetConfig,
}

impl CostEstimator {
    pub fn new(pricing: Arc<dyn PricingOracle>, config: BudgetConfig) -> Self {
        Self { pricing, config }
    }

    /// Estimated cost of one extraction with this backend.
    ///
    /// Prices an average page plus the expected output, then applies the
    /// safety multiplier so the estimate errs high.
    pub fn estimate(&self, candidate: &LlmBackendConfig) -> Decimal {
        let tokens_out = self
            .config
            .expected_output_tokens
            .min(u64::from(candidate.max_output_tokens));
        let base = self.pricing.estimate(
            candidate.provider,
            &candidate.model,
            self.config.avg_input_tokens,
            tokens_out,
        );
        base * self.config.safety_multiplier.max(Decimal::ONE)
    }
}

/// Whether a candidate fits the budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub admitted: bool,
    pub estimated_cost: Decimal,
}

/// Rejects candidates whose estimate exceeds the available budget.
pub struct BudgetGate {
    estimator: CostEstimator,
}

impl BudgetGate {
    pub fn new(estimator: CostEstimator) -> Self {
        Self { estimator }
    }

    pub fn estimate(&self, candidate: &LlmBackendConfig) -> Decimal {
        self.estimator.estimate(candidate)
    }

    pub fn admit(&self, candidate: &LlmBackendConfig, available: Decimal) -> Admission {
        let estimated_cost = self.estimate(candidate);
        Admission {
            admitted: estimated_cost <= available,
            estimated_cost,
        }
    }

    /// Skip entry for a rejected candidate.
    pub fn skip(
        &self,
        candidate: &LlmBackendConfig,
        admission: Admission,
        available: Decimal,
    ) -> BudgetSkip {
        BudgetSkip {
            provider: candidate.provider,
            model: candidate.model.clone(),
            estimated_cost: admission.estimated_cost,
            available_budget: available,
            reason: format!(
                "estimated cost {} exceeds available budget {}",
                admission.estimated_cost.round_dp(6),
                available.round_dp(6)
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::PriceTable;
    use crate::types::Provider;
    use proptest::prelude::*;

    fn gate(multiplier: Decimal) -> BudgetGate {
        let prices = PriceTable::empty()
            // $1 per 1k input tokens, $2 per 1k output tokens
            .with_price(Provider::OpenAi, "pricey", Decimal::ONE, Decimal::TWO);
        BudgetGate::new(CostEstimator::new(
            Arc::new(prices),
            BudgetConfig {
                avg_input_tokens: 1_000,
                expected_output_tokens: 500,
                safety_multiplier: multiplier,
            },
        ))
    }

    #[test]
    fn test_estimate_applies_multiplier() {
        let gate = gate(Decimal::new(15, 1));
        let candidate = LlmBackendConfig::new(Provider::OpenAi, "pricey");
        // (1.00 + 1.00) * 1.5
        assert_eq!(gate.estimate(&candidate), Decimal::new(300, 2));
    }

    #[test]
    fn test_multiplier_below_one_is_clamped() {
        let gate = gate(Decimal::new(5, 1));
        let candidate = LlmBackendConfig::new(Provider::OpenAi, "pricey");
        assert_eq!(gate.estimate(&candidate), Decimal::new(200, 2));
    }

    #[test]
    fn test_output_estimate_capped_by_model_limit() {
        let gate = gate(Decimal::ONE);
        let candidate = LlmBackendConfig::new(Provider::OpenAi, "pricey").with_max_output_tokens(100);
        // 1.00 + 0.20
        assert_eq!(gate.estimate(&candidate), Decimal::new(120, 2));
    }

    #[test]
    fn test_admit_boundary() {
        let gate = gate(Decimal::ONE);
        let candidate = LlmBackendConfig::new(Provider::OpenAi, "pricey");
        assert!(gate.admit(&candidate, Decimal::TWO).admitted);
        assert!(!gate.admit(&candidate, Decimal::new(199, 2)).admitted);

        let admission = gate.admit(&candidate, Decimal::ONE);
        let skip = gate.skip(&candidate, admission, Decimal::ONE);
        assert_eq!(skip.estimated_cost, Decimal::TWO);
        assert_eq!(skip.available_budget, Decimal::ONE);
    }

    proptest! {
        #[test]
        fn never_admits_over_budget(available_cents in 0i64..100_000, mult_tenths in 0i64..50) {
            let gate = gate(Decimal::new(mult_tenths, 1));
            let candidate = LlmBackendConfig::new(Provider::OpenAi, "pricey");
            let available = Decimal::new(available_cents, 2);
            let admission = gate.admit(&candidate, available);
            if admission.admitted {
                prop_assert!(admission.estimated_cost <= available);
            } else {
                prop_assert!(admission.estimated_cost > available);
            }
        }
    }
}
