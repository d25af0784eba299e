//! Typed errors for the harvest pipeline.
//!
//! Uses `thiserror` for library errors (not `anyhow`) so callers can match
//! on the failure taxonomy. Every [`ExtractError`] maps onto an
//! [`ErrorCategory`], and every category has a fixed [`Disposition`] that
//! tells the attempt loop whether trying another backend can help.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::types::backend::Provider;
use crate::types::ledger::CreditTransaction;
use crate::types::fetch::{ContentStage, EscalationTrigger, FetchMode};

/// Errors surfaced by a single extraction request.
#[derive(Debug, Error)]
pub enum ExtractError {
    /// Dynamic fetching was needed but is not entitled or not configured
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The target page is guarded by an anti-bot system and no further recourse exists
    #[error("bot protection detected ({signal}): {message}")]
    BotProtection { signal: String, message: String },

    /// The page had too little content to extract from
    #[error("insufficient content after {stage}: {chars} chars, need {required}")]
    InsufficientContent {
        stage: ContentStage,
        chars: usize,
        required: usize,
    },

    /// The LLM backend failed
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// Fetching the page failed without a protection signal
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),

    /// Every candidate was skipped because it would exceed the budget
    #[error("budget exhausted: all {skipped} candidates exceed the available balance")]
    BudgetExhausted { skipped: usize },

    /// The pre-flight balance check failed
    #[error("insufficient credits: need {required} USD, {available} USD available")]
    InsufficientCredits {
        required: Decimal,
        available: Decimal,
    },

    /// The resolved chain was empty
    #[error("no LLM providers configured")]
    NoModelsConfigured,

    /// Ledger operation failed
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    /// Storage operation failed
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),

    /// The caller cancelled the request
    #[error("operation cancelled")]
    Cancelled,

    /// The request itself is malformed
    #[error("invalid input: {reason}")]
    InvalidInput { reason: String },
}

/// Entitlement or service configuration prevents browser rendering.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("page requires browser rendering ({trigger}) but the plan does not include dynamic content")]
    DynamicFetchNotEntitled { trigger: EscalationTrigger },

    #[error("page requires browser rendering ({trigger}) but no rendering backend is configured")]
    DynamicFetchUnavailable { trigger: EscalationTrigger },
}

/// Kind of LLM backend failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    RateLimit,
    Auth,
    ContextLengthExceeded,
    Transient,
    Timeout,
    /// The model answered but the answer was not usable JSON
    InvalidOutput,
    /// The request itself was rejected; another backend will reject it too
    MalformedRequest,
}

impl fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::RateLimit => "rate limited",
            Self::Auth => "authentication failed",
            Self::ContextLengthExceeded => "context length exceeded",
            Self::Transient => "transient failure",
            Self::Timeout => "timed out",
            Self::InvalidOutput => "invalid output",
            Self::MalformedRequest => "malformed request",
        };
        f.write_str(s)
    }
}

/// A failed LLM call, carrying the raw provider text.
#[derive(Debug, Clone, Error)]
#[error("{provider}/{model} {kind}: {message}")]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub provider: Provider,
    pub model: String,
    /// Raw provider message (shown verbatim to BYOK users only)
    pub message: String,
    pub status: Option<u16>,
    /// Provider hint for when to retry (from `Retry-After`)
    pub retry_after: Option<Duration>,
}

impl ProviderError {
    pub fn new(
        kind: ProviderErrorKind,
        provider: Provider,
        model: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            provider,
            model: model.into(),
            message: message.into(),
            status: None,
            retry_after: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    /// Whether another backend could succeed where this one failed.
    pub fn is_retryable(&self) -> bool {
        self.kind != ProviderErrorKind::MalformedRequest
    }
}

/// Errors that can occur while fetching a page.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Security validation failed
    #[error("security error: {0}")]
    Security(#[from] SecurityError),

    /// Transport-level failure
    #[error("HTTP error: {0}")]
    Http(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Invalid URL format
    #[error("invalid URL: {url}")]
    InvalidUrl { url: String },

    /// Fetch exceeded its deadline
    #[error("timeout fetching: {url}")]
    Timeout { url: String },

    /// Non-success status with no protection signal
    #[error("HTTP {status} from {url}")]
    Status { url: String, status: u16 },

    /// The protection detector flagged the response
    #[error("bot protection detected ({signal})")]
    BotProtection {
        signal: String,
        message: String,
        suggest_dynamic: bool,
    },

    /// The rendering service failed
    #[error("rendering service error: {0}")]
    Renderer(String),

    /// The fetcher cannot serve this mode
    #[error("{fetcher} does not support {mode} fetching")]
    UnsupportedMode { fetcher: String, mode: FetchMode },

    /// Caller cancelled
    #[error("fetch cancelled")]
    Cancelled,
}

/// Security-related errors, primarily for SSRF protection.
#[derive(Debug, Error)]
pub enum SecurityError {
    /// URL scheme not allowed (e.g., file://, ftp://)
    #[error("disallowed URL scheme: {0}")]
    DisallowedScheme(String),

    /// Host is blocked (e.g., localhost, internal IPs)
    #[error("blocked host: {0}")]
    BlockedHost(String),

    /// IP in blocked CIDR range (e.g., 10.0.0.0/8)
    #[error("blocked IP range: {0}")]
    BlockedCidr(String),

    /// URL has no host
    #[error("URL has no host")]
    NoHost,

    /// DNS resolution failed
    #[error("DNS resolution failed: {0}")]
    DnsResolution(String),

    /// URL parsing failed
    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    /// A stored API key could not be decrypted
    #[error("key decryption failed: {0}")]
    Decrypt(String),
}

/// Ledger-level errors.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// A credit with this external payment id was already applied
    #[error("duplicate payment: {external_payment_id}")]
    DuplicatePayment {
        external_payment_id: String,
        /// The row the first delivery wrote, when it could be read back
        original: Option<Box<CreditTransaction>>,
    },

    #[error("invalid amount {amount}: {reason}")]
    InvalidAmount { amount: Decimal, reason: &'static str },

    /// Expiry for this rollover falls outside the representable time range
    #[error("rollover of {rollover} periods is out of range")]
    RolloverOutOfRange { rollover: i32 },

    #[error(transparent)]
    Store(StoreError),
}

impl LedgerError {
    /// Payment webhooks replay; a duplicate is a no-op for them, not a failure.
    pub fn is_duplicate_payment(&self) -> bool {
        matches!(self, Self::DuplicatePayment { .. })
    }
}

impl From<StoreError> for LedgerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Duplicate { key } => Self::DuplicatePayment {
                external_payment_id: key,
                original: None,
            },
            other => Self::Store(other),
        }
    }
}

/// Repository errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Unique constraint violation
    #[error("unique constraint violated: {key}")]
    Duplicate { key: String },

    #[error("not found: {what}")]
    NotFound { what: String },

    /// Catch-all for backend failures
    #[error("backend error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Errors while loading configuration from the environment.
#[derive(Debug, Error)]
pub enum EnvConfigError {
    #[error("invalid value for {var}: {reason}")]
    Invalid { var: String, reason: String },
}

/// Classification of a failure, used for logging and the fallback decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Config,
    BotProtection,
    InsufficientContent,
    RateLimit,
    Auth,
    ContextLength,
    Transient,
    Timeout,
    InvalidOutput,
    MalformedRequest,
    Fetch,
    BudgetExhausted,
    InsufficientCredits,
    NoModels,
    Ledger,
    Storage,
    Cancelled,
    InvalidInput,
}

/// What the attempt loop does after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Stop and surface this error
    Terminal,
    /// Advance to the next candidate
    Fallback,
}

impl ErrorCategory {
    pub fn disposition(self) -> Disposition {
        match self {
            Self::RateLimit
            | Self::Auth
            | Self::ContextLength
            | Self::Transient
            | Self::Timeout
            | Self::InvalidOutput => Disposition::Fallback,
            // Conditions about the target page, the request or the account:
            // a different model cannot fix them.
            Self::Config
            | Self::BotProtection
            | Self::InsufficientContent
            | Self::MalformedRequest
            | Self::Fetch
            | Self::BudgetExhausted
            | Self::InsufficientCredits
            | Self::NoModels
            | Self::Ledger
            | Self::Storage
            | Self::Cancelled
            | Self::InvalidInput => Disposition::Terminal,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Config => "config",
            Self::BotProtection => "bot_protection",
            Self::InsufficientContent => "insufficient_content",
            Self::RateLimit => "rate_limit",
            Self::Auth => "auth",
            Self::ContextLength => "context_length",
            Self::Transient => "transient",
            Self::Timeout => "timeout",
            Self::InvalidOutput => "invalid_output",
            Self::MalformedRequest => "malformed_request",
            Self::Fetch => "fetch",
            Self::BudgetExhausted => "budget_exhausted",
            Self::InsufficientCredits => "insufficient_credits",
            Self::NoModels => "no_models",
            Self::Ledger => "ledger",
            Self::Storage => "storage",
            Self::Cancelled => "cancelled",
            Self::InvalidInput => "invalid_input",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<ProviderErrorKind> for ErrorCategory {
    fn from(kind: ProviderErrorKind) -> Self {
        match kind {
            ProviderErrorKind::RateLimit => Self::RateLimit,
            ProviderErrorKind::Auth => Self::Auth,
            ProviderErrorKind::ContextLengthExceeded => Self::ContextLength,
            ProviderErrorKind::Transient => Self::Transient,
            ProviderErrorKind::Timeout => Self::Timeout,
            ProviderErrorKind::InvalidOutput => Self::InvalidOutput,
            ProviderErrorKind::MalformedRequest => Self::MalformedRequest,
        }
    }
}

impl ExtractError {
    /// Classify this error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Config(_) => ErrorCategory::Config,
            Self::BotProtection { .. } => ErrorCategory::BotProtection,
            Self::InsufficientContent { .. } => ErrorCategory::InsufficientContent,
            Self::Provider(e) => e.kind.into(),
            Self::Fetch(FetchError::Timeout { .. }) => ErrorCategory::Timeout,
            Self::Fetch(FetchError::Cancelled) => ErrorCategory::Cancelled,
            Self::Fetch(FetchError::BotProtection { .. }) => ErrorCategory::BotProtection,
            Self::Fetch(_) => ErrorCategory::Fetch,
            Self::BudgetExhausted { .. } => ErrorCategory::BudgetExhausted,
            Self::InsufficientCredits { .. } => ErrorCategory::InsufficientCredits,
            Self::NoModelsConfigured => ErrorCategory::NoModels,
            Self::Ledger(_) => ErrorCategory::Ledger,
            Self::Storage(_) => ErrorCategory::Storage,
            Self::Cancelled => ErrorCategory::Cancelled,
            Self::InvalidInput { .. } => ErrorCategory::InvalidInput,
        }
    }

    pub fn should_fallback(&self) -> bool {
        self.category().disposition() == Disposition::Fallback
    }

    /// Build the terminal error for an escalation trigger that has no recourse.
    pub fn from_trigger(trigger: EscalationTrigger) -> Self {
        match trigger {
            EscalationTrigger::BotProtection { signal, message } => {
                Self::BotProtection { signal, message }
            }
            EscalationTrigger::InsufficientContent {
                stage,
                chars,
                required,
            } => Self::InsufficientContent {
                stage,
                chars,
                required,
            },
        }
    }

    /// Message suitable for the end user.
    ///
    /// BYOK users get the raw provider text (it is their account); everyone
    /// else gets a sanitized message, with an upgrade hint where one applies.
    pub fn user_message(&self, is_byok: bool) -> String {
        match self {
            Self::Provider(e) if is_byok => format!("{}: {}", e.provider, e.message),
            Self::Provider(e) => match e.kind {
                ProviderErrorKind::RateLimit => {
                    "The AI provider is temporarily rate limited. Please retry shortly.".into()
                }
                ProviderErrorKind::Auth => {
                    "The AI provider could not be reached with the configured credentials.".into()
                }
                ProviderErrorKind::ContextLengthExceeded => {
                    "The page is too large for the available models.".into()
                }
                ProviderErrorKind::InvalidOutput => {
                    "The AI model returned a response that could not be parsed.".into()
                }
                ProviderErrorKind::MalformedRequest => {
                    "The extraction request was rejected by the AI provider. Check the schema and instructions.".into()
                }
                ProviderErrorKind::Transient | ProviderErrorKind::Timeout => {
                    "The AI provider is temporarily unavailable. Please retry.".into()
                }
            },
            Self::Config(ConfigError::DynamicFetchNotEntitled { .. }) => {
                "This page requires browser rendering, which is not included in your plan. Upgrade to enable dynamic content extraction.".into()
            }
            Self::Config(ConfigError::DynamicFetchUnavailable { .. }) => {
                "This page requires browser rendering, which is not configured on this service.".into()
            }
            Self::BotProtection { message, .. } => message.clone(),
            Self::InsufficientContent { .. } => {
                "The page did not contain enough readable content to extract from.".into()
            }
            Self::Fetch(FetchError::Status { status, .. }) => {
                format!("The page returned HTTP {status}.")
            }
            Self::Fetch(FetchError::Timeout { .. }) => "The page took too long to load.".into(),
            Self::Fetch(FetchError::Security(_) | FetchError::InvalidUrl { .. }) => {
                "The URL is not allowed.".into()
            }
            Self::Fetch(_) => "The page could not be fetched.".into(),
            Self::BudgetExhausted { .. } => {
                "None of the available models fit within your remaining credits. Add credits or upgrade your plan.".into()
            }
            Self::InsufficientCredits {
                required,
                available,
            } => format!(
                "Insufficient credits: this request needs about ${} but ${} is available. Add credits to continue.",
                required.round_dp(4),
                available.round_dp(4)
            ),
            Self::NoModelsConfigured => "No extraction models are configured.".into(),
            Self::Cancelled => "The request was cancelled.".into(),
            Self::InvalidInput { reason } => format!("Invalid request: {reason}"),
            Self::Ledger(_) | Self::Storage(_) => "An internal error occurred.".into(),
        }
    }
}

/// Result type alias for extraction operations.
pub type Result<T> = std::result::Result<T, ExtractError>;

/// Result type alias for fetch operations.
pub type FetchResult<T> = std::result::Result<T, FetchError>;

/// Result type alias for LLM calls.
pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// Result type alias for ledger operations.
pub type LedgerResult<T> = std::result::Result<T, LedgerError>;

/// Result type alias for repository operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Result type alias for security operations.
pub type SecurityResult<T> = std::result::Result<T, SecurityError>;
