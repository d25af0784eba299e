//! Credit ledger records.

use chrono::{DateTime, Duration, Months, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::types::{JobId, UserId};

/// Kind of ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[cfg_attr(feature = "postgres", derive(sqlx::Type))]
#[cfg_attr(feature = "postgres", sqlx(type_name = "text", rename_all = "snake_case"))]
pub enum TransactionType {
    Subscription,
    Topup,
    Usage,
    Refund,
    Adjustment,
}

impl TransactionType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Subscription => "subscription",
            Self::Topup => "topup",
            Self::Usage => "usage",
            Self::Refund => "refund",
            Self::Adjustment => "adjustment",
        }
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An immutable ledger row. Only `is_expired` is ever updated, by the sweep.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditTransaction {
    pub id: Uuid,
    pub user_id: UserId,
    pub transaction_type: TransactionType,
    /// Signed: credits positive, usage negative
    pub amount: Decimal,
    /// Cached balance right after this row was written
    pub balance_after: Decimal,
    pub expires_at: Option<DateTime<Utc>>,
    pub external_payment_id: Option<String>,
    pub job_id: Option<JobId>,
    pub description: Option<String>,
    pub is_expired: bool,
    pub created_at: DateTime<Utc>,
}

impl CreditTransaction {
    pub fn expired_at(&self, as_of: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= as_of)
    }

    /// Whether this row contributes to the available balance at `as_of`.
    pub fn counts_at(&self, as_of: DateTime<Utc>) -> bool {
        self.created_at <= as_of && !self.expired_at(as_of)
    }
}

/// A row to append; the store assigns id and `balance_after`.
#[derive(Debug, Clone)]
pub struct NewCreditTransaction {
    pub user_id: UserId,
    pub transaction_type: TransactionType,
    pub amount: Decimal,
    pub expires_at: Option<DateTime<Utc>>,
    pub external_payment_id: Option<String>,
    pub job_id: Option<JobId>,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Cached balance. Always recomputable from the transaction log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserBalance {
    pub user_id: UserId,
    pub balance: Decimal,
    pub lifetime_added: Decimal,
    pub lifetime_spent: Decimal,
    pub period_start: Option<DateTime<Utc>>,
    pub period_end: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl UserBalance {
    pub fn empty(user_id: UserId, now: DateTime<Utc>) -> Self {
        Self {
            user_id,
            balance: Decimal::ZERO,
            lifetime_added: Decimal::ZERO,
            lifetime_spent: Decimal::ZERO,
            period_start: None,
            period_end: None,
            updated_at: now,
        }
    }

    pub fn billing_period(&self) -> Option<BillingPeriod> {
        match (self.period_start, self.period_end) {
            (Some(start), Some(end)) if end > start => Some(BillingPeriod { start, end }),
            _ => None,
        }
    }

    /// Fold one transaction into the cached totals.
    pub fn apply(&mut self, amount: Decimal, at: DateTime<Utc>) {
        self.balance += amount;
        if amount.is_sign_positive() {
            self.lifetime_added += amount;
        } else {
            self.lifetime_spent += -amount;
        }
        self.updated_at = at;
    }
}

/// A subscription billing period.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BillingPeriod {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl BillingPeriod {
    pub fn length(&self) -> Duration {
        self.end - self.start
    }

    /// End of the period `n` periods after this one, or `None` past the
    /// representable range.
    pub fn end_after(&self, n: u32) -> Option<DateTime<Utc>> {
        let extra = self.length().checked_mul(i32::try_from(n).ok()?)?;
        self.end.checked_add_signed(extra)
    }

    /// The calendar month containing `at`, used when the real period is unknown.
    pub fn calendar_month(at: DateTime<Utc>) -> Option<Self> {
        use chrono::{Datelike, TimeZone};
        let start = Utc
            .with_ymd_and_hms(at.year(), at.month(), 1, 0, 0, 0)
            .single()?;
        let end = start.checked_add_months(Months::new(1))?;
        Some(Self { start, end })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_balance_apply_tracks_lifetime_totals() {
        let now = Utc::now();
        let mut balance = UserBalance::empty(Uuid::new_v4(), now);
        balance.apply(Decimal::new(1000, 2), now);
        balance.apply(Decimal::new(-250, 2), now);
        assert_eq!(balance.balance, Decimal::new(750, 2));
        assert_eq!(balance.lifetime_added, Decimal::new(1000, 2));
        assert_eq!(balance.lifetime_spent, Decimal::new(250, 2));
    }

    #[test]
    fn test_calendar_month() {
        let at = Utc.with_ymd_and_hms(2024, 1, 31, 12, 0, 0).unwrap();
        let period = BillingPeriod::calendar_month(at).unwrap();
        assert_eq!(period.start, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        assert_eq!(period.end, Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_period_end_after() {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let period = BillingPeriod {
            start,
            end: start + Duration::days(30),
        };
        assert_eq!(period.end_after(0), Some(period.end));
        assert_eq!(period.end_after(2), Some(start + Duration::days(90)));
    }

    #[test]
    fn test_period_end_after_overflow_is_none() {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let period = BillingPeriod {
            start,
            end: start + Duration::days(30),
        };
        assert_eq!(period.end_after(i32::MAX as u32), None);
        assert_eq!(period.end_after(u32::MAX), None);
    }

    #[test]
    fn test_counts_at_respects_creation_and_expiry() {
        let created = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let tx = CreditTransaction {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            transaction_type: TransactionType::Subscription,
            amount: Decimal::ONE,
            balance_after: Decimal::ONE,
            expires_at: Some(created + Duration::days(10)),
            external_payment_id: None,
            job_id: None,
            description: None,
            is_expired: false,
            created_at: created,
        };
        assert!(!tx.counts_at(created - Duration::seconds(1)));
        assert!(tx.counts_at(created));
        assert!(tx.counts_at(created + Duration::days(9)));
        assert!(!tx.counts_at(created + Duration::days(10)));
    }
}
