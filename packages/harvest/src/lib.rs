//! Budget-Aware Structured Extraction
//!
//! Extracts structured data from arbitrary web pages by handing the
//! language-understanding step to one of several interchangeable LLM
//! backends, while holding each request to a hard credit budget and working
//! around anti-bot defenses on the target site.
//!
//! # Pipeline
//!
//! 1. Resolve an ordered chain of candidate backends for the user
//! 2. Admit each candidate against the live credit balance
//! 3. Fetch the page, escalating once to browser rendering when blocked
//! 4. Call the model, falling back to the next candidate on retryable failures
//! 5. Derive the cost, apply the tier markup, debit credits, record usage
//!
//! # Usage
//!
//! ```rust,ignore
//! use harvest::{ExtractContext, ExtractInput, Extractor, MemoryStore, Tier};
//! use harvest::testing::{MockFetcher, MockLlm, MockPage, MockPricing};
//!
//! let fetcher = MockFetcher::new().with_page(url, MockPage::html(html));
//! let extractor = Extractor::builder(
//!     Arc::new(MemoryStore::new()),
//!     Arc::new(fetcher),
//!     Arc::new(MockLlm::new()),
//!     Arc::new(MockPricing::new()),
//! )
//! .build();
//!
//! let ctx = ExtractContext::for_tier(user_id, Tier::Pro);
//! let output = extractor
//!     .extract(user_id, ExtractInput::new(url, "Opening hours"), &ctx)
//!     .await?;
//! ```
//!
//! # Modules
//!
//! - [`traits`] - Collaborator contracts (fetcher, cleaner, LLM, pricing, stores)
//! - [`types`] - Request, chain, ledger and usage types
//! - [`pipeline`] - Resolver, budget gate, orchestrator, escalation, billing
//! - [`fetch`] - HTTP and browser fetchers, SSRF guard, rate limiting
//! - [`clean`] - HTML to text cleaners
//! - [`llm`] - OpenAI-compatible client and price table
//! - [`stores`] - Storage implementations (MemoryStore, PostgresStore)
//! - [`security`] - Secret handling, URL validation, key vault
//! - [`testing`] - Mock implementations for testing

pub mod clean;
pub mod config;
pub mod error;
pub mod fetch;
pub mod llm;
pub mod pipeline;
pub mod security;
pub mod stores;
pub mod testing;
pub mod traits;
pub mod types;

// Re-export core types at crate root
pub use config::{
    BillingConfig, BudgetConfig, ChainConfig, FetchConfig, KeyHealthConfig, LlmSettings,
    PipelineConfig, RecorderConfig,
};
pub use error::{
    ConfigError, Disposition, EnvConfigError, ErrorCategory, ExtractError, FetchError,
    LedgerError, ProviderError, ProviderErrorKind, SecurityError, StoreError,
};
pub use traits::{
    cleaner::ContentCleaner,
    detector::ProtectionDetector,
    fetcher::ContentFetcher,
    llm::{LlmCallOptions, LlmClient, LlmResponse, Prompt},
    pricing::PricingOracle,
    store::{
        BackendConfigStore, BalanceStore, KeyHealthStore, LedgerStore, Store, TransactionStore,
        UsageStore,
    },
};
pub use types::{
    AttemptOutcome, AttemptRecord, BackendOverride, BillingPeriod, BudgetSkip, ChainEntry,
    ConfigChain, CostSource, CreditTransaction, Detection, ExtractAttemptResult, ExtractContext,
    ExtractInput, ExtractMetadata, ExtractOutput, FetchMode, FetchOptions, FetchedPage,
    ForcedModel, JobId, LlmBackendConfig, Provider, SavedBackendConfig, Tier, TransactionType,
    UsageInsight, UsageRecord, UsageSummary, UserBalance, UserId,
};

// Re-export pipeline components
pub use pipeline::{
    AttemptOrchestrator, BillingPostProcessor, BudgetGate, ConfigChainResolver, CostEstimator,
    CreditLedger, CreditRequest, ExpirySweeper, Extractor, ExtractorBuilder, FetchEscalation,
    KeyHealth, UsageRecorder,
};

// Re-export collaborators
pub use clean::{CleanerChain, HtmlToMarkdown, WhitespaceNormalizer};
pub use fetch::{
    BrowserFetcher, HeuristicDetector, HttpFetcher, RateLimitedFetcher, SessionStore,
    ValidatedFetcher,
};
pub use llm::{OpenAiCompatClient, PriceTable};
pub use security::{KeyVault, PlaintextVault, SecretString, UrlValidator};

// Re-export stores
pub use stores::MemoryStore;

#[cfg(feature = "postgres")]
pub use stores::PostgresStore;
