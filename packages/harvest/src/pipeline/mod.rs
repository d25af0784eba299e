//! The extraction request pipeline.
//!
//! ```text
//! request ─► ConfigChainResolver ─► AttemptOrchestrator ─┬─► BudgetGate
//!                                                        ├─► FetchEscalation ─► LLM
//!                                                        └─► BillingPostProcessor ─► CreditLedger
//! ```

pub mod attempt;
pub mod billing;
pub mod budget;
pub mod chain;
pub mod escalation;
pub mod extractor;
pub mod keys;
pub mod ledger;
pub mod orchestrator;
pub mod prompts;
pub mod recorder;

pub use attempt::{AttemptFailure, AttemptRunner};
pub use billing::{BillingPostProcessor, Charge};
pub use budget::{Admission, BudgetGate, CostEstimator};
pub use chain::{ConfigChainResolver, ResolveRequest};
pub use escalation::{FetchEscalation, FetchedContent};
pub use extractor::{Extractor, ExtractorBuilder};
pub use keys::KeyHealth;
pub use ledger::{CreditLedger, CreditRequest, ExpirySweeper, ROLLOVER_NEVER_EXPIRES};
pub use orchestrator::{AttemptOrchestrator, BudgetMode, RunOutcome, RunReport};
pub use recorder::{UsageEntry, UsageRecorder};
