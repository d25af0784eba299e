//! Core data types for the extraction pipeline.

pub mod backend;
pub mod chain;
pub mod context;
pub mod extract;
pub mod fetch;
pub mod ledger;
pub mod usage;

pub use backend::{
    BackendOverride, ChainEntry, KeySuspension, LlmBackendConfig, Provider, SavedBackendConfig,
    UnknownProvider,
};
pub use chain::ConfigChain;
pub use context::{ExtractContext, ForcedModel, Tier};
pub use extract::{ExtractAttemptResult, ExtractInput, ExtractMetadata, ExtractOutput};
pub use fetch::{
    ContentStage, Detection, EscalationTrigger, FetchMode, FetchOptions, FetchedPage,
};
pub use ledger::{
    BillingPeriod, CreditTransaction, NewCreditTransaction, TransactionType, UserBalance,
};
pub use usage::{
    AttemptOutcome, AttemptRecord, BudgetSkip, CostSource, UsageInsight, UsageRecord,
    UsageSummary,
};

/// Identifier of the user an extraction is billed to.
pub type UserId = uuid::Uuid;

/// Identifier of the job an extraction belongs to.
pub type JobId = uuid::Uuid;
