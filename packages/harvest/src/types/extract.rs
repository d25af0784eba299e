//! Extraction request and response types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ErrorCategory;
use crate::types::{
    AttemptRecord, BackendOverride, BudgetSkip, FetchMode, JobId, Provider, UsageSummary,
};

/// What to extract, and from where.
#[derive(Debug, Clone)]
pub struct ExtractInput {
    pub url: String,
    /// Natural-language extraction instructions
    pub instructions: String,
    /// Optional JSON schema for the output
    pub schema: Option<Value>,
    pub job_id: Option<JobId>,
    pub backend_override: Option<BackendOverride>,
}

impl ExtractInput {
    pub fn new(url: impl Into<String>, instructions: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            instructions: instructions.into(),
            schema: None,
            job_id: None,
            backend_override: None,
        }
    }

    pub fn with_schema(mut self, schema: Value) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn with_job_id(mut self, job_id: JobId) -> Self {
        self.job_id = Some(job_id);
        self
    }

    pub fn with_override(mut self, backend: BackendOverride) -> Self {
        self.backend_override = Some(backend);
        self
    }
}

/// Outcome of one candidate attempt, success or failure.
#[derive(Debug, Clone, Default)]
pub struct ExtractAttemptResult {
    pub final_url: String,
    pub extracted_data: Option<Value>,
    /// Cleaned content given to the model
    pub raw_content: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub fetch_duration_ms: u64,
    pub extract_duration_ms: u64,
    pub provider: Option<Provider>,
    pub model: Option<String>,
    pub generation_id: Option<String>,
    pub error: Option<String>,
    pub error_category: Option<ErrorCategory>,
    pub used_dynamic_fetch: bool,
    /// Number of fetch escalations (0 or 1)
    pub retry_count: u32,
}

impl ExtractAttemptResult {
    pub fn fetch_mode(&self) -> FetchMode {
        if self.used_dynamic_fetch {
            FetchMode::Dynamic
        } else {
            FetchMode::Static
        }
    }
}

/// Response metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractMetadata {
    pub final_url: String,
    pub provider: Option<Provider>,
    pub model: Option<String>,
    pub generation_id: Option<String>,
    pub used_dynamic_fetch: bool,
    pub retry_count: u32,
    pub fetch_duration_ms: u64,
    pub extract_duration_ms: u64,
    pub budget_skips: Vec<BudgetSkip>,
    pub attempts: Vec<AttemptRecord>,
    pub job_id: Option<JobId>,
}

/// A successful extraction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractOutput {
    pub data: Value,
    pub usage: UsageSummary,
    pub metadata: ExtractMetadata,
}
