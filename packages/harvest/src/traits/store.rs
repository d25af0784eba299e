//! Repository traits.
//!
//! Split into focused traits:
//! - `BalanceStore`: cached balances
//! - `TransactionStore`: the append-only credit log
//! - `UsageStore`: billing records and insights
//! - `BackendConfigStore`: users' saved custom backends
//! - `KeyHealthStore`: rate-limit suspensions of service keys
//!
//! `LedgerStore` and `Store` are composites with blanket impls.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::error::StoreResult;
use crate::types::{
    CreditTransaction, KeySuspension, NewCreditTransaction, SavedBackendConfig, UsageInsight,
    UsageRecord, UserBalance, UserId,
};

/// Cached per-user balances.
#[async_trait]
pub trait BalanceStore: Send + Sync {
    async fn get_balance(&self, user_id: UserId) -> StoreResult<Option<UserBalance>>;

    async fn upsert_balance(&self, balance: &UserBalance) -> StoreResult<()>;
}

/// The credit transaction log.
#[async_trait]
pub trait TransactionStore: Send + Sync {
    /// Append a row and fold it into the cached balance as one atomic unit.
    ///
    /// The store fills in `id` and `balance_after`. Returns
    /// [`StoreError::Duplicate`](crate::error::StoreError::Duplicate) without
    /// writing anything when `external_payment_id` is already present.
    async fn append_transaction(&self, tx: NewCreditTransaction)
        -> StoreResult<CreditTransaction>;

    async fn find_by_external_payment_id(
        &self,
        external_payment_id: &str,
    ) -> StoreResult<Option<CreditTransaction>>;

    /// Sum of amounts created at or before `as_of` and not expired at `as_of`.
    async fn sum_available(&self, user_id: UserId, as_of: DateTime<Utc>) -> StoreResult<Decimal>;

    /// Most recent first.
    async fn list_transactions(
        &self,
        user_id: UserId,
        limit: usize,
    ) -> StoreResult<Vec<CreditTransaction>>;

    /// Set `is_expired` on rows whose expiry has passed. Returns the users touched.
    async fn mark_expired(&self, now: DateTime<Utc>) -> StoreResult<Vec<UserId>>;
}

/// Usage telemetry.
#[async_trait]
pub trait UsageStore: Send + Sync {
    async fn record_usage(&self, record: &UsageRecord) -> StoreResult<()>;

    async fn record_insight(&self, insight: &UsageInsight) -> StoreResult<()>;

    /// Most recent first.
    async fn list_usage(&self, user_id: UserId, limit: usize) -> StoreResult<Vec<UsageRecord>>;
}

/// Saved custom backend configurations.
#[async_trait]
pub trait BackendConfigStore: Send + Sync {
    async fn saved_backend(&self, user_id: UserId) -> StoreResult<Option<SavedBackendConfig>>;

    async fn save_backend(&self, config: &SavedBackendConfig) -> StoreResult<()>;
}

/// Service key suspensions, keyed by key fingerprint.
#[async_trait]
pub trait KeyHealthStore: Send + Sync {
    async fn suspension(&self, fingerprint: &str) -> StoreResult<Option<KeySuspension>>;

    async fn put_suspension(&self, suspension: &KeySuspension) -> StoreResult<()>;

    async fn clear_suspension(&self, fingerprint: &str) -> StoreResult<()>;
}

/// Everything the credit ledger needs.
pub trait LedgerStore: BalanceStore + TransactionStore {}

impl<T: BalanceStore + TransactionStore> LedgerStore for T {}

/// Composite of every repository the pipeline uses.
pub trait Store: LedgerStore + UsageStore + BackendConfigStore + KeyHealthStore {}

impl<T: LedgerStore + UsageStore + BackendConfigStore + KeyHealthStore> Store for T {}
