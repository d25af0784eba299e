//! Usage telemetry and per-request attempt bookkeeping.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ErrorCategory;
use crate::types::{JobId, Provider, UserId};

/// A candidate skipped because its estimate exceeded the available budget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetSkip {
    pub provider: Provider,
    pub model: String,
    pub estimated_cost: Decimal,
    pub available_budget: Decimal,
    pub reason: String,
}

/// How one candidate attempt ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Succeeded,
    Failed {
        category: ErrorCategory,
        message: String,
    },
}

/// One candidate that was actually attempted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub provider: Provider,
    pub model: String,
    #[serde(flatten)]
    pub outcome: AttemptOutcome,
    pub duration_ms: u64,
}

impl AttemptRecord {
    pub fn succeeded(&self) -> bool {
        self.outcome == AttemptOutcome::Succeeded
    }
}

/// Where the reported cost came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostSource {
    /// Looked up from the provider by generation id
    Provider,
    /// Derived from token counts and the price table
    Estimated,
}

/// Cost summary returned with a successful extraction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageSummary {
    pub tokens_in: u64,
    pub tokens_out: u64,
    /// What the backend cost, before markup
    pub actual_cost: Decimal,
    /// What was debited from the user's credits
    pub charged: Decimal,
    pub markup_rate: Decimal,
    pub is_byok: bool,
    pub cost_source: CostSource,
}

/// Lean billing record, one per extraction request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub id: Uuid,
    pub user_id: UserId,
    pub job_id: Option<JobId>,
    pub url: String,
    pub provider: Option<Provider>,
    pub model: Option<String>,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub actual_cost: Decimal,
    pub charged: Decimal,
    pub is_byok: bool,
    pub success: bool,
    pub error_category: Option<ErrorCategory>,
    pub created_at: DateTime<Utc>,
}

/// Detail record correlated with a [`UsageRecord`] by `usage_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageInsight {
    pub usage_id: Uuid,
    pub user_id: UserId,
    pub error: Option<String>,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub fetch_duration_ms: u64,
    pub extract_duration_ms: u64,
    pub provider: Option<Provider>,
    pub model: Option<String>,
    pub used_dynamic_fetch: bool,
    pub retry_count: u32,
    pub budget_skip_count: u32,
    pub budget_skips: Vec<BudgetSkip>,
    pub attempt_count: u32,
    /// Hex SHA-256 of the cleaned content the model saw
    pub content_hash: Option<String>,
    pub created_at: DateTime<Utc>,
}
