//! Invoice building, numbering and discount tests.

mod common;

use billing_service::error::BillingError;
use billing_service::models::{
    BillingMode, Coupon, EntityKind, EntityRef, InvoiceStatus, ReferralReward, RewardStatus, Usage,
    UsagePrice,
};
use billing_service::services::ledger::{CouponContext, CouponRejection};
use billing_service::services::{ChargeOptions, CouponService};
use chrono::{Duration, Utc};
use common::{t0, TestEngine};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

fn coupon(code: &str, discount_type: &str, value: Decimal, usage_type: &str) -> Coupon {
    Coupon {
        coupon_id: Uuid::new_v4(),
        code: code.to_string(),
        discount_type: discount_type.to_string(),
        discount_value: value,
        valid_from: Some(t0() - Duration::days(30)),
        valid_until: Some(t0() + Duration::days(30)),
        usage_type: usage_type.to_string(),
        max_uses: None,
        current_uses: 0,
        minimum_amount: None,
        applicable_plans: None,
        applicable_modes: None,
        is_active: true,
        created_at: t0() - Duration::days(30),
        updated_at: t0() - Duration::days(30),
    }
}

fn credit(user_id: Uuid, amount: Decimal) -> ReferralReward {
    ReferralReward {
        reward_id: Uuid::new_v4(),
        user_id,
        referral_id: None,
        reward_type: "account_credit".to_string(),
        reward_value: amount,
        remaining_value: Some(amount),
        duration_cycles: None,
        cycles_applied: 0,
        status: "active".to_string(),
        expires_at: None,
        completed_at: None,
        created_at: t0() - Duration::days(10),
        updated_at: t0() - Duration::days(10),
    }
}

#[tokio::test]
async fn concurrent_invoices_get_unique_sequential_numbers() {
    let t = TestEngine::new();
    let transactions: Vec<Uuid> = (0..20)
        .map(|_| t.seed_transaction(dec!(15.00), "pending").transaction_id)
        .collect();

    let mut handles = Vec::new();
    for transaction_id in transactions {
        let invoices = t.engine.invoices.clone();
        handles.push(tokio::spawn(async move {
            invoices
                .build_for_transaction(transaction_id, None, t0())
                .await
                .unwrap()
                .invoice_number
        }));
    }

    let mut numbers = HashSet::new();
    for handle in handles {
        numbers.insert(handle.await.unwrap());
    }

    let expected: HashSet<String> = (1..=20).map(|n| format!("INV-2024-{:04}", n)).collect();
    assert_eq!(numbers, expected);
}

#[tokio::test]
async fn limited_coupon_is_never_over_redeemed() {
    let t = TestEngine::new();
    let mut limited = coupon("LAUNCH", "percentage", dec!(10), "limited");
    limited.max_uses = Some(3);
    t.store.seed_coupon(limited.clone());

    let transactions: Vec<Uuid> = (0..10)
        .map(|_| t.seed_transaction(dec!(100.00), "pending").transaction_id)
        .collect();

    let mut handles = Vec::new();
    for transaction_id in transactions {
        let invoices = t.engine.invoices.clone();
        handles.push(tokio::spawn(async move {
            invoices
                .build_for_transaction(transaction_id, Some("LAUNCH"), t0())
                .await
        }));
    }

    let mut applied = 0;
    let mut rejected = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(invoice) => {
                assert_eq!(invoice.coupon_id, Some(limited.coupon_id));
                assert_eq!(invoice.total, dec!(90.00));
                applied += 1;
            }
            Err(BillingError::InvalidCoupon(CouponRejection::UsageLimitReached)) => rejected += 1,
            Err(other) => panic!("unexpected error: {}", other),
        }
    }

    assert_eq!(applied, 3);
    assert_eq!(rejected, 7);
    assert_eq!(t.store.coupon(limited.coupon_id).unwrap().current_uses, 3);
    assert_eq!(t.store.coupon_usages().len(), 3);
}

#[tokio::test]
async fn completed_transaction_invoice_is_paid_with_coupon_applied() {
    let t = TestEngine::new();
    t.store
        .seed_coupon(coupon("WELCOME", "fixed", dec!(25.00), "reusable"));
    let transaction = t.seed_transaction(dec!(100.00), "completed");

    let invoice = t
        .engine
        .invoices
        .build_for_transaction(transaction.transaction_id, Some("welcome"), t0())
        .await
        .unwrap();

    assert_eq!(invoice.status(), InvoiceStatus::Paid);
    assert!(invoice.paid_at.is_some());
    assert_eq!(invoice.subtotal, dec!(100.00));
    assert_eq!(invoice.discount, dec!(25.00));
    assert_eq!(invoice.total, dec!(75.00));
    assert_eq!(invoice.transaction_id, Some(transaction.transaction_id));

    let usages = t.store.coupon_usages();
    assert_eq!(usages.len(), 1);
    let billable = usages[0].billable().unwrap();
    assert_eq!(billable.kind, EntityKind::Transaction);
    assert_eq!(billable.id, transaction.transaction_id);
    assert_eq!(usages[0].final_amount, dec!(75.00));
}

#[tokio::test]
async fn invalid_coupons_are_rejected_before_anything_is_written() {
    let t = TestEngine::new();
    let mut expired = coupon("OLD", "percentage", dec!(50), "reusable");
    expired.valid_until = Some(t0() - Duration::days(1));
    t.store.seed_coupon(expired);
    let mut minimum = coupon("BIG", "fixed", dec!(10), "reusable");
    minimum.minimum_amount = Some(dec!(500));
    t.store.seed_coupon(minimum);
    let transaction = t.seed_transaction(dec!(100.00), "pending");

    let unknown = t
        .engine
        .invoices
        .build_for_transaction(transaction.transaction_id, Some("NOPE"), t0())
        .await;
    assert!(matches!(
        unknown,
        Err(BillingError::InvalidCoupon(CouponRejection::NotFound))
    ));

    let inactive = t
        .engine
        .invoices
        .build_for_transaction(transaction.transaction_id, Some("OLD"), t0())
        .await;
    assert!(matches!(
        inactive,
        Err(BillingError::InvalidCoupon(CouponRejection::Inactive))
    ));

    let below = t
        .engine
        .invoices
        .build_for_transaction(transaction.transaction_id, Some("BIG"), t0())
        .await;
    assert!(matches!(
        below,
        Err(BillingError::InvalidCoupon(CouponRejection::BelowMinimum { .. }))
    ));

    let missing = t
        .engine
        .invoices
        .build_for_transaction(Uuid::new_v4(), None, t0())
        .await;
    assert!(matches!(missing, Err(BillingError::TransactionNotFound(_))));

    assert!(t.store.invoices().is_empty());
    assert!(t.store.coupon_usages().is_empty());
}

#[tokio::test]
async fn mixed_mode_bills_plan_price_plus_metered_usage() {
    let t = TestEngine::new();
    let subscription = t.billable_subscription(dec!(70.00), "mixed");

    t.store.seed_usage_price(UsagePrice {
        usage_price_id: Uuid::new_v4(),
        plan_id: None,
        action_key: "api_call".to_string(),
        unit_count: 100,
        unit_price: dec!(5.00),
        is_active: true,
    });
    t.store.seed_usage_price(UsagePrice {
        usage_price_id: Uuid::new_v4(),
        plan_id: Some(subscription.plan_id),
        action_key: "document_sign".to_string(),
        unit_count: 1,
        unit_price: dec!(1.50),
        is_active: true,
    });
    for (action_key, quantity, days_into_period) in [
        ("api_call", 150, 2),
        ("api_call", 100, 20),
        ("document_sign", 4, 5),
        ("unpriced_action", 1000, 6),
    ] {
        t.store.record_usage(Usage {
            usage_id: Uuid::new_v4(),
            user_id: subscription.user_id,
            action_key: action_key.to_string(),
            quantity,
            recorded_at: subscription.starts_at + Duration::days(days_into_period),
        });
    }
    // Usage of the new period is billed next cycle.
    t.store.record_usage(Usage {
        usage_id: Uuid::new_v4(),
        user_id: subscription.user_id,
        action_key: "api_call".to_string(),
        quantity: 10_000,
        recorded_at: t0() + Duration::minutes(1),
    });

    let now = t0() + Duration::hours(1);
    let quote = t
        .engine
        .invoices
        .quote_subscription(&subscription, None, now)
        .await
        .unwrap();
    // floor(250 / 100) * 5.00 + 4 * 1.50 = 16.00
    assert_eq!(quote.total, dec!(86.00));

    t.engine
        .scheduler
        .charge_due_subscriptions(&ChargeOptions {
            dry_run: false,
            subscription_id: None,
            now,
        })
        .await
        .unwrap();

    let invoice = &t.store.invoices()[0];
    assert_eq!(invoice.invoice_type, "mixed");
    assert_eq!(invoice.total, dec!(86.00));
    assert_eq!(t.gateway.charges()[0].amount, dec!(86.00));
}

#[tokio::test]
async fn account_credit_is_drawn_down_by_the_renewal() {
    let t = TestEngine::new();
    let subscription = t.billable_subscription(dec!(70.00), "subscription");
    let reward = credit(subscription.user_id, dec!(20.00));
    t.store.seed_reward(reward.clone());

    let now = t0() + Duration::hours(1);
    t.engine
        .scheduler
        .charge_due_subscriptions(&ChargeOptions {
            dry_run: false,
            subscription_id: None,
            now,
        })
        .await
        .unwrap();

    let invoice = &t.store.invoices()[0];
    assert_eq!(invoice.discount, dec!(20.00));
    assert_eq!(invoice.total, dec!(50.00));
    assert_eq!(t.gateway.charges()[0].amount, dec!(50.00));

    let drawn = t.store.reward(reward.reward_id).unwrap();
    assert_eq!(drawn.remaining_value, Some(dec!(0.00)));
    assert_eq!(drawn.status(), RewardStatus::Completed);

    let applications = t.store.reward_applications();
    assert_eq!(applications.len(), 1);
    assert_eq!(applications[0].invoice_id, Some(invoice.invoice_id));
    assert_eq!(applications[0].applied_value, dec!(20.00));
}

#[tokio::test]
async fn paid_invoices_can_only_be_refunded() {
    let t = TestEngine::new();
    let transaction = t.seed_transaction(dec!(40.00), "completed");
    let invoice = t
        .engine
        .invoices
        .build_for_transaction(transaction.transaction_id, None, t0())
        .await
        .unwrap();

    let cancel = t.engine.invoices.cancel(invoice.invoice_id, Utc::now()).await;
    assert!(cancel.is_err());

    let refunded = t
        .engine
        .invoices
        .refund(invoice.invoice_id, Utc::now())
        .await
        .unwrap();
    assert_eq!(refunded.status(), InvoiceStatus::Refunded);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_applications_never_exceed_a_limited_coupon() {
    let t = TestEngine::new();
    let limited = Coupon {
        max_uses: Some(3),
        ..coupon("LAUNCH3", "fixed", dec!(10.00), "limited")
    };
    t.store.seed_coupon(limited.clone());
    let coupons = CouponService::new(t.store.clone());
    let context = Arc::new(CouponContext {
        amount: dec!(70.00),
        plan_id: None,
        billing_mode: Some(BillingMode::Subscription),
    });

    let mut handles = Vec::new();
    for _ in 0..10 {
        let coupons = coupons.clone();
        let context = context.clone();
        handles.push(tokio::spawn(async move {
            let user_id = Uuid::new_v4();
            coupons
                .apply(
                    "LAUNCH3",
                    &context,
                    user_id,
                    Some(EntityRef::subscription(Uuid::new_v4())),
                    t0(),
                )
                .await
        }));
    }

    let mut applied = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok((quote, usage)) => {
                applied += 1;
                assert_eq!(quote.discount, dec!(10.00));
                assert_eq!(usage.final_amount, dec!(60.00));
            }
            Err(e) => assert!(matches!(
                e,
                BillingError::InvalidCoupon(CouponRejection::UsageLimitReached)
            )),
        }
    }

    assert_eq!(applied, 3);
    let stored = t.store.coupon(limited.coupon_id).unwrap();
    assert_eq!(stored.current_uses, 3);
    assert_eq!(t.store.coupon_usages().len(), 3);
}

#[tokio::test]
async fn validating_a_coupon_does_not_redeem_it() {
    let t = TestEngine::new();
    let single = coupon("WELCOME", "percentage", dec!(10), "single");
    t.store.seed_coupon(single.clone());
    let coupons = CouponService::new(t.store.clone());
    let context = CouponContext {
        amount: dec!(70.00),
        plan_id: None,
        billing_mode: None,
    };

    let quote = coupons.validate("WELCOME", &context, t0()).await.unwrap();
    assert_eq!(quote.discount, dec!(7.00));
    assert_eq!(t.store.coupon(single.coupon_id).unwrap().current_uses, 0);

    let user_id = Uuid::new_v4();
    coupons.apply("WELCOME", &context, user_id, None, t0()).await.unwrap();
    let again = coupons.apply("WELCOME", &context, user_id, None, t0()).await;
    assert!(matches!(
        again,
        Err(BillingError::InvalidCoupon(CouponRejection::UsageLimitReached))
    ));
    assert_eq!(t.store.coupon(single.coupon_id).unwrap().current_uses, 1);
}
