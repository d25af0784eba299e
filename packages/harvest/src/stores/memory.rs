//! In-memory storage implementation for testing and development.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::{PoisonError, RwLock};
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::traits::store::{
    BalanceStore, BackendConfigStore, KeyHealthStore, TransactionStore, UsageStore,
};
use crate::types::{
    CreditTransaction, KeySuspension, NewCreditTransaction, SavedBackendConfig, UsageInsight,
    UsageRecord, UserBalance, UserId,
};

/// Log and balance cache behind one lock, so an append and its cache
/// update are a single step.
#[derive(Default)]
struct LedgerState {
    transactions: Vec<CreditTransaction>,
    balances: HashMap<UserId, UserBalance>,
    payment_ids: HashSet<String>,
}

/// In-memory implementation of every repository.
///
/// Useful for testing and development. Data is lost on restart.
#[derive(Default)]
pub struct MemoryStore {
    ledger: RwLock<LedgerState>,
    usage: RwLock<Vec<UsageRecord>>,
    insights: RwLock<Vec<UsageInsight>>,
    backends: RwLock<HashMap<UserId, SavedBackendConfig>>,
    suspensions: RwLock<HashMap<String, KeySuspension>>,
}

fn poisoned<T>(_: PoisonError<T>) -> StoreError {
    StoreError::Backend("memory store lock poisoned".into())
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of ledger rows across all users.
    pub fn transaction_count(&self) -> usize {
        self.ledger
            .read()
            .map(|l| l.transactions.len())
            .unwrap_or_default()
    }

    /// All usage insights written so far, oldest first.
    pub fn insights(&self) -> Vec<UsageInsight> {
        self.insights
            .read()
            .map(|i| i.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl BalanceStore for MemoryStore {
    async fn get_balance(&self, user_id: UserId) -> StoreResult<Option<UserBalance>> {
        let ledger = self.ledger.read().map_err(poisoned)?;
        Ok(ledger.balances.get(&user_id).cloned())
    }

    async fn upsert_balance(&self, balance: &UserBalance) -> StoreResult<()> {
        let mut ledger = self.ledger.write().map_err(poisoned)?;
        ledger.balances.insert(balance.user_id, balance.clone());
        Ok(())
    }
}

#[async_trait]
impl TransactionStore for MemoryStore {
    async fn append_transaction(
        &self,
        tx: NewCreditTransaction,
    ) -> StoreResult<CreditTransaction> {
        let mut ledger = self.ledger.write().map_err(poisoned)?;

        if let Some(payment_id) = tx.external_payment_id.as_deref() {
            if ledger.payment_ids.contains(payment_id) {
                return Err(StoreError::Duplicate {
                    key: payment_id.to_string(),
                });
            }
        }

        let balance = ledger
            .balances
            .entry(tx.user_id)
            .or_insert_with(|| UserBalance::empty(tx.user_id, tx.created_at));
        balance.apply(tx.amount, tx.created_at);
        let balance_after = balance.balance;

        let row = CreditTransaction {
            id: Uuid::new_v4(),
            user_id: tx.user_id,
            transaction_type: tx.transaction_type,
            amount: tx.amount,
            balance_after,
            expires_at: tx.expires_at,
            external_payment_id: tx.external_payment_id,
            job_id: tx.job_id,
            description: tx.description,
            is_expired: false,
            created_at: tx.created_at,
        };

        if let Some(payment_id) = row.external_payment_id.clone() {
            ledger.payment_ids.insert(payment_id);
        }
        ledger.transactions.push(row.clone());
        Ok(row)
    }

    async fn find_by_external_payment_id(
        &self,
        external_payment_id: &str,
    ) -> StoreResult<Option<CreditTransaction>> {
        let ledger = self.ledger.read().map_err(poisoned)?;
        Ok(ledger
            .transactions
            .iter()
            .find(|t| t.external_payment_id.as_deref() == Some(external_payment_id))
            .cloned())
    }

    async fn sum_available(&self, user_id: UserId, as_of: DateTime<Utc>) -> StoreResult<Decimal> {
        let ledger = self.ledger.read().map_err(poisoned)?;
        Ok(ledger
            .transactions
            .iter()
            .filter(|t| t.user_id == user_id && t.counts_at(as_of))
            .map(|t| t.amount)
            .sum())
    }

    async fn list_transactions(
        &self,
        user_id: UserId,
        limit: usize,
    ) -> StoreResult<Vec<CreditTransaction>> {
        let ledger = self.ledger.read().map_err(poisoned)?;
        Ok(ledger
            .transactions
            .iter()
            .rev()
            .filter(|t| t.user_id == user_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn mark_expired(&self, now: DateTime<Utc>) -> StoreResult<Vec<UserId>> {
        let mut ledger = self.ledger.write().map_err(poisoned)?;
        let mut users = Vec::new();
        for tx in ledger.transactions.iter_mut() {
            if !tx.is_expired && tx.expired_at(now) {
                tx.is_expired = true;
                if !users.contains(&tx.user_id) {
                    users.push(tx.user_id);
                }
            }
        }
        Ok(users)
    }
}

#[async_trait]
impl UsageStore for MemoryStore {
    async fn record_usage(&self, record: &UsageRecord) -> StoreResult<()> {
        self.usage.write().map_err(poisoned)?.push(record.clone());
        Ok(())
    }

    async fn record_insight(&self, insight: &UsageInsight) -> StoreResult<()> {
        self.insights.write().map_err(poisoned)?.push(insight.clone());
        Ok(())
    }

    async fn list_usage(&self, user_id: UserId, limit: usize) -> StoreResult<Vec<UsageRecord>> {
        let usage = self.usage.read().map_err(poisoned)?;
        Ok(usage
            .iter()
            .rev()
            .filter(|u| u.user_id == user_id)
            .take(limit)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl BackendConfigStore for MemoryStore {
    async fn saved_backend(&self, user_id: UserId) -> StoreResult<Option<SavedBackendConfig>> {
        Ok(self.backends.read().map_err(poisoned)?.get(&user_id).cloned())
    }

    async fn save_backend(&self, config: &SavedBackendConfig) -> StoreResult<()> {
        self.backends
            .write()
            .map_err(poisoned)?
            .insert(config.user_id, config.clone());
        Ok(())
    }
}

#[async_trait]
impl KeyHealthStore for MemoryStore {
    async fn suspension(&self, fingerprint: &str) -> StoreResult<Option<KeySuspension>> {
        Ok(self
            .suspensions
            .read()
            .map_err(poisoned)?
            .get(fingerprint)
            .cloned())
    }

    async fn put_suspension(&self, suspension: &KeySuspension) -> StoreResult<()> {
        self.suspensions
            .write()
            .map_err(poisoned)?
            .insert(suspension.fingerprint.clone(), suspension.clone());
        Ok(())
    }

    async fn clear_suspension(&self, fingerprint: &str) -> StoreResult<()> {
        self.suspensions.write().map_err(poisoned)?.remove(fingerprint);
        Ok(())
    }
}
