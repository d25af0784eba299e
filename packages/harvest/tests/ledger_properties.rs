//! Ledger invariants over arbitrary operation sequences.

use chrono::{Duration as ChronoDuration, Utc};
use proptest::prelude::*;
use rust_decimal::Decimal;
use std::sync::Arc;
use uuid::Uuid;

use harvest::pipeline::ledger::ROLLOVER_NEVER_EXPIRES;
use harvest::{CreditLedger, CreditRequest, LedgerError, MemoryStore, TransactionType};

#[derive(Debug, Clone)]
enum Op {
    Topup(i64),
    Debit(i64),
    /// Credit that has already expired
    Expired(i64),
    /// Credit expiring well after the check
    Expiring(i64),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (1i64..10_000).prop_map(Op::Topup),
        (1i64..10_000).prop_map(Op::Debit),
        (1i64..10_000).prop_map(Op::Expired),
        (1i64..10_000).prop_map(Op::Expiring),
    ]
}

fn cents(n: i64) -> Decimal {
    Decimal::new(n, 2)
}

proptest! {
    #[test]
    fn available_balance_is_sum_of_unexpired_amounts(ops in prop::collection::vec(op(), 0..40)) {
        let (available, expected, rows) = tokio_test::block_on(async {
            let store = Arc::new(MemoryStore::new());
            let ledger = CreditLedger::new(store.clone());
            let user_id = Uuid::new_v4();
            let now = Utc::now();
            let mut expected = Decimal::ZERO;

            for op in &ops {
                match *op {
                    Op::Topup(n) => {
                        ledger.credit_topup(user_id, cents(n), None).await.unwrap();
                        expected += cents(n);
                    }
                    Op::Debit(n) => {
                        ledger.debit(user_id, cents(n), None).await.unwrap();
                        expected -= cents(n);
                    }
                    Op::Expired(n) => {
                        let request = CreditRequest::new(TransactionType::Subscription, cents(n))
                            .with_expires_at(Some(now - ChronoDuration::hours(1)));
                        ledger.credit(user_id, request).await.unwrap();
                    }
                    Op::Expiring(n) => {
                        let request = CreditRequest::new(TransactionType::Subscription, cents(n))
                            .with_expires_at(Some(now + ChronoDuration::days(30)));
                        ledger.credit(user_id, request).await.unwrap();
                        expected += cents(n);
                    }
                }
            }

            let available = ledger
                .available_balance(user_id, Utc::now())
                .await
                .unwrap();
            let rows = ledger.transactions(user_id, usize::MAX).await.unwrap().len();
            (available, expected, rows)
        });

        prop_assert_eq!(available, expected);
        prop_assert_eq!(rows, ops.len());
    }

    #[test]
    fn replayed_payment_credits_once(amount in 1i64..100_000, replays in 1usize..5) {
        let (available, rejected) = tokio_test::block_on(async {
            let store = Arc::new(MemoryStore::new());
            let ledger = CreditLedger::new(store.clone());
            let user_id = Uuid::new_v4();

            ledger
                .credit_topup(user_id, cents(amount), Some("pi_123".to_string()))
                .await
                .unwrap();

            let mut rejected = 0;
            for _ in 0..replays {
                match ledger
                    .credit_topup(user_id, cents(amount), Some("pi_123".to_string()))
                    .await
                {
                    Err(LedgerError::DuplicatePayment { .. }) => rejected += 1,
                    other => panic!("expected duplicate payment, got {other:?}"),
                }
            }

            let available = ledger
                .available_balance(user_id, Utc::now())
                .await
                .unwrap();
            (available, rejected)
        });

        prop_assert_eq!(available, cents(amount));
        prop_assert_eq!(rejected, replays);
    }
}

#[tokio::test]
async fn test_subscription_from_elapsed_period_does_not_count() {
    let store = Arc::new(MemoryStore::new());
    let ledger = CreditLedger::new(store);
    let user_id = Uuid::new_v4();
    let now = Utc::now();

    ledger
        .set_billing_period(
            user_id,
            now - ChronoDuration::days(30),
            now - ChronoDuration::seconds(1),
        )
        .await
        .unwrap();

    // No rollover: expires at the end of a period that is already over
    let tx = ledger
        .credit_subscription(user_id, cents(500), 0, None)
        .await
        .unwrap();
    assert!(tx.expires_at.unwrap() < Utc::now());

    // One period of rollover: still valid for another ~30 days
    ledger
        .credit_subscription(user_id, cents(300), 1, None)
        .await
        .unwrap();

    // Never expires
    let forever = ledger
        .credit_subscription(user_id, cents(200), ROLLOVER_NEVER_EXPIRES, None)
        .await
        .unwrap();
    assert!(forever.expires_at.is_none());

    let available = ledger.available_balance(user_id, Utc::now()).await.unwrap();
    assert_eq!(available, cents(500));

    // The sweep brings the cached balance in line with the log
    let rebuilt = ledger.sweep_expired(Utc::now()).await.unwrap();
    assert_eq!(rebuilt, 1);
    assert_eq!(ledger.balance(user_id).await.unwrap().balance, cents(500));
}

#[tokio::test]
async fn test_concurrent_debits_and_credits_balance_out() {
    let store = Arc::new(MemoryStore::new());
    let ledger = Arc::new(CreditLedger::new(store));
    let user_id = Uuid::new_v4();

    ledger.credit_topup(user_id, cents(10_000), None).await.unwrap();

    let mut handles = Vec::new();
    for i in 0..50 {
        let ledger = ledger.clone();
        handles.push(tokio::spawn(async move {
            if i % 2 == 0 {
                ledger.debit(user_id, cents(100), None).await.map(|_| ())
            } else {
                ledger.credit_topup(user_id, cents(50), None).await.map(|_| ())
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    // 25 debits of 1.00 and 25 credits of 0.50
    let expected = cents(10_000 - 2_500 + 1_250);
    assert_eq!(ledger.available_balance(user_id, Utc::now()).await.unwrap(), expected);
    assert_eq!(ledger.balance(user_id).await.unwrap().balance, expected);
}
