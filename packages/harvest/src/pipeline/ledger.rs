//! Credit ledger: an append-only log of signed transactions per user.
//!
//! The available balance is always derived from the log. The cached
//! [`UserBalance`] exists for cheap display reads and is rebuilt by the
//! expiry sweep. Writes for one user are serialized through a per-user
//! async lock, and the store appends a row and updates the cache in one
//! atomic step, so concurrent requests for the same user cannot lose an
//! update.

use chrono::{DateTime, Months, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::error::{LedgerError, LedgerResult, StoreError};
use crate::traits::store::LedgerStore;
use crate::types::{
    BillingPeriod, CreditTransaction, JobId, NewCreditTransaction, TransactionType, UserBalance,
    UserId,
};

/// Rollover value meaning "subscription credits never expire".
pub const ROLLOVER_NEVER_EXPIRES: i32 = -1;

/// Parameters for a credit.
#[derive(Debug, Clone)]
pub struct CreditRequest {
    pub transaction_type: TransactionType,
    pub amount: Decimal,
    pub expires_at: Option<DateTime<Utc>>,
    /// Idempotency key from the payment provider
    pub external_payment_id: Option<String>,
    pub job_id: Option<JobId>,
    pub description: Option<String>,
}

impl CreditRequest {
    pub fn new(transaction_type: TransactionType, amount: Decimal) -> Self {
        Self {
            transaction_type,
            amount,
            expires_at: None,
            external_payment_id: None,
            job_id: None,
            description: None,
        }
    }

    pub fn with_expires_at(mut self, expires_at: Option<DateTime<Utc>>) -> Self {
        self.expires_at = expires_at;
        self
    }

    pub fn with_external_payment_id(mut self, id: impl Into<String>) -> Self {
        self.external_payment_id = Some(id.into());
        self
    }

    pub fn with_job_id(mut self, job_id: Option<JobId>) -> Self {
        self.job_id = job_id;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Expiry of a subscription credit granted at `now`.
///
/// - `rollover < 0`: never expires
/// - `rollover == 0`: end of the current billing period
/// - `rollover == n`: end of the current period plus `n` periods
///
/// Without a known billing period, the calendar month containing `now`
/// stands in for it and `n` is counted in months. A rollover whose expiry
/// cannot be represented is rejected rather than treated as "never".
pub fn subscription_expiry(
    period: Option<BillingPeriod>,
    rollover: i32,
    now: DateTime<Utc>,
) -> LedgerResult<Option<DateTime<Utc>>> {
    if rollover < 0 {
        return Ok(None);
    }
    let extra = rollover as u32;
    let expires_at = match period {
        Some(period) => period.end_after(extra),
        None => BillingPeriod::calendar_month(now)
            .and_then(|month| month.end.checked_add_months(Months::new(extra))),
    };
    expires_at
        .map(Some)
        .ok_or(LedgerError::RolloverOutOfRange { rollover })
}

/// Per-user credit ledger.
pub struct CreditLedger {
    store: Arc<dyn LedgerStore>,
    locks: DashMap<UserId, Arc<Mutex<()>>>,
}

impl CreditLedger {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self {
            store,
            locks: DashMap::new(),
        }
    }

    fn user_lock(&self, user_id: UserId) -> Arc<Mutex<()>> {
        self.locks
            .entry(user_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Sum of non-expired amounts created at or before `as_of`.
    pub async fn available_balance(
        &self,
        user_id: UserId,
        as_of: DateTime<Utc>,
    ) -> LedgerResult<Decimal> {
        Ok(self.store.sum_available(user_id, as_of).await?)
    }

    /// Cached balance, or an empty one for users with no history.
    pub async fn balance(&self, user_id: UserId) -> LedgerResult<UserBalance> {
        Ok(self
            .store
            .get_balance(user_id)
            .await?
            .unwrap_or_else(|| UserBalance::empty(user_id, Utc::now())))
    }

    /// Record usage. `amount` is the positive charge.
    #[instrument(skip(self), fields(user_id = %user_id, amount = %amount))]
    pub async fn debit(
        &self,
        user_id: UserId,
        amount: Decimal,
        job_id: Option<JobId>,
    ) -> LedgerResult<CreditTransaction> {
        if amount <= Decimal::ZERO {
            return Err(LedgerError::InvalidAmount {
                amount,
                reason: "debit amount must be positive",
            });
        }

        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;

        let tx = self
            .store
            .append_transaction(NewCreditTransaction {
                user_id,
                transaction_type: TransactionType::Usage,
                amount: -amount,
                expires_at: None,
                external_payment_id: None,
                job_id,
                description: Some("extraction usage".to_string()),
                created_at: Utc::now(),
            })
            .await?;

        debug!(balance_after = %tx.balance_after, "Debited credits");
        Ok(tx)
    }

    /// Add credits.
    ///
    /// A non-empty `external_payment_id` that was already applied yields
    /// [`LedgerError::DuplicatePayment`] carrying the row the first delivery
    /// wrote, and changes nothing.
    #[instrument(skip(self, request), fields(user_id = %user_id, kind = %request.transaction_type, amount = %request.amount))]
    pub async fn credit(
        &self,
        user_id: UserId,
        request: CreditRequest,
    ) -> LedgerResult<CreditTransaction> {
        match request.transaction_type {
            TransactionType::Usage => {
                return Err(LedgerError::InvalidAmount {
                    amount: request.amount,
                    reason: "usage is recorded through debit",
                })
            }
            TransactionType::Adjustment => {
                if request.amount.is_zero() {
                    return Err(LedgerError::InvalidAmount {
                        amount: request.amount,
                        reason: "adjustment must be non-zero",
                    });
                }
            }
            _ => {
                if request.amount <= Decimal::ZERO {
                    return Err(LedgerError::InvalidAmount {
                        amount: request.amount,
                        reason: "credit amount must be positive",
                    });
                }
            }
        }

        let external_payment_id = request
            .external_payment_id
            .filter(|id| !id.trim().is_empty());

        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;

        let result = self
            .store
            .append_transaction(NewCreditTransaction {
                user_id,
                transaction_type: request.transaction_type,
                amount: request.amount,
                expires_at: request.expires_at,
                external_payment_id,
                job_id: request.job_id,
                description: request.description,
                created_at: Utc::now(),
            })
            .await;

        match result {
            Ok(tx) => {
                info!(balance_after = %tx.balance_after, "Credited account");
                Ok(tx)
            }
            Err(StoreError::Duplicate { key }) => {
                let original = match self.store.find_by_external_payment_id(&key).await {
                    Ok(original) => original,
                    Err(e) => {
                        warn!(error = %e, "Failed to load original payment row");
                        None
                    }
                };
                info!(
                    original_id = ?original.as_ref().map(|tx| tx.id),
                    "Ignoring replayed payment"
                );
                Err(LedgerError::DuplicatePayment {
                    external_payment_id: key,
                    original: original.map(Box::new),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Credit a subscription grant, computing expiry from the rollover policy.
    pub async fn credit_subscription(
        &self,
        user_id: UserId,
        amount: Decimal,
        rollover: i32,
        external_payment_id: Option<String>,
    ) -> LedgerResult<CreditTransaction> {
        let now = Utc::now();
        let period = self.balance(user_id).await?.billing_period();
        if period.is_none() && rollover >= 0 {
            warn!(
                user_id = %user_id,
                "Billing period unknown; subscription credits expire at calendar month end"
            );
        }

        let mut request = CreditRequest::new(TransactionType::Subscription, amount)
            .with_expires_at(subscription_expiry(period, rollover, now)?)
            .with_description("subscription credits");
        request.external_payment_id = external_payment_id;

        self.credit(user_id, request).await
    }

    /// Credit a purchased top-up. Top-ups do not expire.
    pub async fn credit_topup(
        &self,
        user_id: UserId,
        amount: Decimal,
        external_payment_id: Option<String>,
    ) -> LedgerResult<CreditTransaction> {
        let mut request =
            CreditRequest::new(TransactionType::Topup, amount).with_description("credit top-up");
        request.external_payment_id = external_payment_id;
        self.credit(user_id, request).await
    }

    /// Return credits charged for a job.
    pub async fn refund(
        &self,
        user_id: UserId,
        amount: Decimal,
        job_id: Option<JobId>,
        reason: impl Into<String>,
    ) -> LedgerResult<CreditTransaction> {
        let request = CreditRequest::new(TransactionType::Refund, amount)
            .with_job_id(job_id)
            .with_description(reason);
        self.credit(user_id, request).await
    }

    /// Manual correction; `amount` may be negative.
    pub async fn adjust(
        &self,
        user_id: UserId,
        amount: Decimal,
        description: impl Into<String>,
    ) -> LedgerResult<CreditTransaction> {
        let request =
            CreditRequest::new(TransactionType::Adjustment, amount).with_description(description);
        self.credit(user_id, request).await
    }

    /// Record the user's current billing period.
    pub async fn set_billing_period(
        &self,
        user_id: UserId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> LedgerResult<()> {
        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;

        let mut balance = self.balance(user_id).await?;
        balance.period_start = Some(start);
        balance.period_end = Some(end);
        balance.updated_at = Utc::now();
        self.store.upsert_balance(&balance).await?;
        Ok(())
    }

    /// Most recent transactions first.
    pub async fn transactions(
        &self,
        user_id: UserId,
        limit: usize,
    ) -> LedgerResult<Vec<CreditTransaction>> {
        Ok(self.store.list_transactions(user_id, limit).await?)
    }

    /// Mark expired rows and rebuild the cached balance of affected users.
    ///
    /// Returns the number of users whose balance was rebuilt.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> LedgerResult<usize> {
        let users = self.store.mark_expired(now).await?;

        for user_id in &users {
            let lock = self.user_lock(*user_id);
            let _guard = lock.lock().await;

            let available = self.store.sum_available(*user_id, now).await?;
            let mut balance = self.balance(*user_id).await?;
            if balance.balance != available {
                debug!(user_id = %user_id, from = %balance.balance, to = %available, "Rebuilt cached balance");
            }
            balance.balance = available;
            balance.updated_at = now;
            self.store.upsert_balance(&balance).await?;
        }

        Ok(users.len())
    }
}

/// Periodically runs [`CreditLedger::sweep_expired`].
pub struct ExpirySweeper {
    ledger: Arc<CreditLedger>,
    interval: Duration,
}

impl ExpirySweeper {
    pub fn new(ledger: Arc<CreditLedger>, interval: Duration) -> Self {
        Self { ledger, interval }
    }

    /// Run until `cancel` fires.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        match self.ledger.sweep_expired(Utc::now()).await {
                            Ok(0) => {}
                            Ok(users) => info!(users, "Expired subscription credits"),
                            Err(e) => warn!(error = %e, "Credit expiry sweep failed"),
                        }
                    }
                }
            }
            debug!("Expiry sweeper stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::MemoryStore;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use uuid::Uuid;

    fn ledger() -> CreditLedger {
        CreditLedger::new(Arc::new(MemoryStore::new()))
    }

    fn usd(cents: i64) -> Decimal {
        Decimal::new(cents, 2)
    }

    #[test]
    fn test_subscription_expiry_rules() {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let period = BillingPeriod {
            start,
            end: start + ChronoDuration::days(31),
        };
        let now = start + ChronoDuration::days(3);

        assert_eq!(
            subscription_expiry(Some(period), ROLLOVER_NEVER_EXPIRES, now).unwrap(),
            None
        );
        assert_eq!(
            subscription_expiry(Some(period), 0, now).unwrap(),
            Some(period.end)
        );
        assert_eq!(
            subscription_expiry(Some(period), 2, now).unwrap(),
            Some(period.end + ChronoDuration::days(62))
        );
    }

    #[test]
    fn test_huge_rollover_is_rejected() {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let period = BillingPeriod {
            start,
            end: start + ChronoDuration::days(30),
        };
        let now = start + ChronoDuration::days(3);

        for period in [Some(period), None] {
            assert!(matches!(
                subscription_expiry(period, i32::MAX, now),
                Err(LedgerError::RolloverOutOfRange { rollover: i32::MAX })
            ));
        }
    }

    #[test]
    fn test_subscription_expiry_without_period_uses_calendar_month() {
        let now = Utc.with_ymd_and_hms(2024, 1, 15, 8, 0, 0).unwrap();
        assert_eq!(
            subscription_expiry(None, 0, now).unwrap(),
            Some(Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap())
        );
        assert_eq!(
            subscription_expiry(None, 2, now).unwrap(),
            Some(Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap())
        );
    }

    #[tokio::test]
    async fn test_debit_and_credit_move_balance() {
        let ledger = ledger();
        let user = Uuid::new_v4();

        ledger.credit_topup(user, usd(1000), None).await.unwrap();
        let tx = ledger.debit(user, usd(125), None).await.unwrap();

        assert_eq!(tx.amount, usd(-125));
        assert_eq!(tx.balance_after, usd(875));
        assert_eq!(
            ledger.available_balance(user, Utc::now()).await.unwrap(),
            usd(875)
        );
    }

    #[tokio::test]
    async fn test_replayed_payment_is_rejected_without_side_effects() {
        let ledger = ledger();
        let user = Uuid::new_v4();

        let first = ledger
            .credit_topup(user, usd(2000), Some("pi_abc".into()))
            .await
            .unwrap();
        let err = ledger
            .credit_topup(user, usd(2000), Some("pi_abc".into()))
            .await
            .unwrap_err();

        match err {
            LedgerError::DuplicatePayment {
                external_payment_id,
                original,
            } => {
                assert_eq!(external_payment_id, "pi_abc");
                assert_eq!(original.map(|tx| tx.id), Some(first.id));
            }
            other => panic!("expected duplicate payment, got {other:?}"),
        }
        assert_eq!(ledger.balance(user).await.unwrap().balance, usd(2000));
        let history = ledger.transactions(user, 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].balance_after, first.balance_after);
    }

    #[tokio::test]
    async fn test_huge_rollover_with_known_period_is_rejected() {
        let ledger = ledger();
        let user = Uuid::new_v4();
        let now = Utc::now();
        ledger
            .set_billing_period(user, now, now + ChronoDuration::days(30))
            .await
            .unwrap();

        let err = ledger
            .credit_subscription(user, usd(100), i32::MAX, None)
            .await
            .unwrap_err();

        assert!(matches!(err, LedgerError::RolloverOutOfRange { .. }));
        assert!(ledger.transactions(user, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_blank_payment_id_is_not_an_idempotency_key() {
        let ledger = ledger();
        let user = Uuid::new_v4();
        ledger.credit_topup(user, usd(100), Some(" ".into())).await.unwrap();
        ledger.credit_topup(user, usd(100), Some(" ".into())).await.unwrap();
        assert_eq!(ledger.balance(user).await.unwrap().balance, usd(200));
    }

    #[tokio::test]
    async fn test_rejects_invalid_amounts() {
        let ledger = ledger();
        let user = Uuid::new_v4();
        assert!(ledger.debit(user, usd(-5), None).await.is_err());
        assert!(ledger.credit_topup(user, Decimal::ZERO, None).await.is_err());
        assert!(ledger.adjust(user, usd(-300), "chargeback").await.is_ok());
    }

    #[tokio::test]
    async fn test_subscription_uses_billing_period() {
        let ledger = ledger();
        let user = Uuid::new_v4();
        let start = Utc::now() - ChronoDuration::days(1);
        let end = start + ChronoDuration::days(30);
        ledger.set_billing_period(user, start, end).await.unwrap();

        let tx = ledger
            .credit_subscription(user, usd(500), 0, None)
            .await
            .unwrap();
        assert_eq!(tx.expires_at, Some(end));

        let tx = ledger
            .credit_subscription(user, usd(500), ROLLOVER_NEVER_EXPIRES, None)
            .await
            .unwrap();
        assert_eq!(tx.expires_at, None);
    }

    #[tokio::test]
    async fn test_sweep_rebuilds_cached_balance() {
        let ledger = ledger();
        let user = Uuid::new_v4();
        let now = Utc::now();

        ledger
            .credit(
                user,
                CreditRequest::new(TransactionType::Subscription, usd(300))
                    .with_expires_at(Some(now + ChronoDuration::hours(1))),
            )
            .await
            .unwrap();
        ledger.credit_topup(user, usd(100), None).await.unwrap();

        let later = now + ChronoDuration::hours(2);
        assert_eq!(ledger.sweep_expired(later).await.unwrap(), 1);
        assert_eq!(ledger.balance(user).await.unwrap().balance, usd(100));
        assert_eq!(ledger.available_balance(user, later).await.unwrap(), usd(100));
        // lifetime totals are history, not balance
        assert_eq!(ledger.balance(user).await.unwrap().lifetime_added, usd(400));
    }

    #[tokio::test]
    async fn test_concurrent_debits_do_not_lose_updates() {
        let ledger = Arc::new(ledger());
        let user = Uuid::new_v4();
        ledger.credit_topup(user, usd(10_000), None).await.unwrap();

        let handles: Vec<_> = (0..20)
            .map(|_| {
                let ledger = ledger.clone();
                tokio::spawn(async move { ledger.debit(user, usd(100), None).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(ledger.balance(user).await.unwrap().balance, usd(8_000));
        let mut snapshots: Vec<_> = ledger
            .transactions(user, 100)
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.balance_after)
            .collect();
        snapshots.sort();
        snapshots.dedup();
        assert_eq!(snapshots.len(), 21, "every balance_after snapshot is distinct");
    }

    #[tokio::test]
    async fn test_sweeper_stops_on_cancel() {
        let ledger = Arc::new(ledger());
        let cancel = CancellationToken::new();
        let handle = ExpirySweeper::new(ledger, Duration::from_millis(10)).spawn(cancel.clone());
        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();
        handle.await.unwrap();
    }
}
