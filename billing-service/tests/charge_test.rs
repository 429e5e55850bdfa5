//! Renewal charge integration tests.

mod common;

use billing_service::models::{AttemptStatus, InvoiceStatus};
use billing_service::services::gateway::ScriptedCharge;
use billing_service::services::scheduler::{ChargeErrorCode, ItemOutcome};
use billing_service::services::ChargeOptions;
use chrono::{Duration, TimeZone, Utc};
use common::{t0, TestEngine};
use rust_decimal_macros::dec;
use uuid::Uuid;

fn renewal(now: chrono::DateTime<Utc>) -> ChargeOptions {
    ChargeOptions {
        dry_run: false,
        subscription_id: None,
        now,
    }
}

#[tokio::test]
async fn approved_charge_pays_invoice_and_extends_period() {
    let t = TestEngine::new();
    let subscription = t.billable_subscription(dec!(70.00), "subscription");
    let now = t0() + Duration::hours(1);

    let summary = t
        .engine
        .scheduler
        .charge_due_subscriptions(&renewal(now))
        .await
        .unwrap();

    assert_eq!(summary.total, 1);
    assert_eq!(summary.success, 1);
    let item = &summary.items[0];
    assert_eq!(item.outcome, ItemOutcome::Success);
    assert_eq!(item.amount, Some(dec!(70.00)));
    assert_eq!(item.invoice_number.as_deref(), Some("INV-2024-0001"));

    let renewed = t.subscription(subscription.subscription_id);
    assert_eq!(renewed.starts_at, t0());
    assert_eq!(renewed.ends_at, Utc.with_ymd_and_hms(2024, 4, 1, 12, 0, 0).unwrap());

    let invoices = t.store.invoices();
    assert_eq!(invoices.len(), 1);
    assert_eq!(invoices[0].status(), InvoiceStatus::Paid);
    assert!(invoices[0].paid_at.is_some());
    assert_eq!(invoices[0].period_start, Some(t0()));

    let attempts = t.store.attempts();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].status(), AttemptStatus::Success);
    assert_eq!(attempts[0].retry_count, 0);
    assert!(attempts[0].gateway_order_number.starts_with("ORD-20240301130000-"));

    let charges = t.gateway.charges();
    assert_eq!(charges.len(), 1);
    assert_eq!(charges[0].amount, dec!(70.00));
    assert_eq!(charges[0].order_number, attempts[0].gateway_order_number);

    assert_eq!(t.notifier.templates(), vec!["payment_succeeded"]);
}

#[tokio::test]
async fn declined_charge_keeps_period_and_notifies() {
    let t = TestEngine::new();
    let subscription = t.billable_subscription(dec!(70.00), "subscription");
    t.gateway
        .script([ScriptedCharge::Decline("Fondos insuficientes".to_string())]);

    let summary = t
        .engine
        .scheduler
        .charge_due_subscriptions(&renewal(t0() + Duration::hours(1)))
        .await
        .unwrap();

    assert_eq!(summary.failed, 1);
    let item = &summary.items[0];
    assert_eq!(item.error, Some(ChargeErrorCode::ChargeFailed));
    assert_eq!(item.message, "Fondos insuficientes");
    assert!(!item.cancelled);

    let attempt = &t.store.attempts()[0];
    assert_eq!(attempt.status(), AttemptStatus::Failed);
    assert_eq!(attempt.error_message.as_deref(), Some("Fondos insuficientes"));

    let unchanged = t.subscription(subscription.subscription_id);
    assert!(unchanged.is_active());
    assert_eq!(unchanged.ends_at, t0());

    assert_ne!(t.store.invoices()[0].status(), InvoiceStatus::Paid);
    assert_eq!(t.notifier.templates(), vec!["payment_failed"]);
}

#[tokio::test]
async fn transport_error_fails_the_attempt() {
    let t = TestEngine::new();
    t.billable_subscription(dec!(70.00), "subscription");
    t.gateway
        .script([ScriptedCharge::Error("connection reset".to_string())]);

    let summary = t
        .engine
        .scheduler
        .charge_due_subscriptions(&renewal(t0() + Duration::hours(1)))
        .await
        .unwrap();

    assert_eq!(summary.failed, 1);
    let attempt = &t.store.attempts()[0];
    assert_eq!(attempt.status(), AttemptStatus::Failed);
    assert!(attempt
        .error_message
        .as_deref()
        .is_some_and(|m| m.contains("connection reset")));
}

#[tokio::test]
async fn pending_answer_leaves_attempt_processing() {
    let t = TestEngine::answering(ScriptedCharge::Pending);
    let subscription = t.billable_subscription(dec!(70.00), "subscription");
    let now = t0() + Duration::hours(1);

    let summary = t
        .engine
        .scheduler
        .charge_due_subscriptions(&renewal(now))
        .await
        .unwrap();

    assert_eq!(summary.pending, 1);
    assert_eq!(t.store.attempts()[0].status(), AttemptStatus::Processing);
    assert_eq!(t.subscription(subscription.subscription_id).ends_at, t0());
    assert!(t.notifier.templates().is_empty());

    // The open attempt blocks a second charge of the same period.
    let again = t
        .engine
        .scheduler
        .charge_due_subscriptions(&renewal(now + Duration::minutes(5)))
        .await
        .unwrap();
    assert_eq!(again.skipped, 1);
    assert_eq!(again.items[0].error, Some(ChargeErrorCode::AttemptOutstanding));
    assert_eq!(t.gateway.charge_count(), 1);
}

#[tokio::test]
async fn failed_period_is_left_to_the_retry_pass() {
    let t = TestEngine::answering(ScriptedCharge::Decline("Rechazada".to_string()));
    t.billable_subscription(dec!(70.00), "subscription");

    t.engine
        .scheduler
        .charge_due_subscriptions(&renewal(t0() + Duration::hours(1)))
        .await
        .unwrap();
    let next_day = t
        .engine
        .scheduler
        .charge_due_subscriptions(&renewal(t0() + Duration::days(1)))
        .await
        .unwrap();

    assert_eq!(next_day.skipped, 1);
    assert_eq!(next_day.items[0].error, Some(ChargeErrorCode::InDunning));
    assert_eq!(t.gateway.charge_count(), 1);
}

#[tokio::test]
async fn preconditions_are_reported_as_skips() {
    let t = TestEngine::new();

    let plan = t.seed_plan(dec!(70.00));
    let without_card = t.seed_subscription(&plan, "subscription");

    let expired = t.seed_subscription(&plan, "subscription");
    t.seed_card(expired.user_id, 1, 2024);

    let mut paused = t.seed_subscription(&plan, "subscription");
    paused.status = "paused".to_string();
    t.store.seed_subscription(paused.clone());
    t.seed_card(paused.user_id, 12, 2030);

    let now = t0() + Duration::hours(1);
    let summary = t
        .engine
        .scheduler
        .charge_due_subscriptions(&renewal(now))
        .await
        .unwrap();

    // Paused subscriptions are not due at all.
    assert_eq!(summary.total, 2);
    assert_eq!(summary.skipped, 2);
    let error_for = |id: Uuid| {
        summary
            .items
            .iter()
            .find(|i| i.subscription_id == Some(id))
            .and_then(|i| i.error)
    };
    assert_eq!(
        error_for(without_card.subscription_id),
        Some(ChargeErrorCode::NoPaymentMethod)
    );
    assert_eq!(
        error_for(expired.subscription_id),
        Some(ChargeErrorCode::PaymentMethodExpired)
    );

    let targeted = t
        .engine
        .scheduler
        .charge_due_subscriptions(&ChargeOptions {
            dry_run: false,
            subscription_id: Some(paused.subscription_id),
            now,
        })
        .await
        .unwrap();
    assert_eq!(
        targeted.items[0].error,
        Some(ChargeErrorCode::SubscriptionNotActive)
    );

    let missing = t
        .engine
        .scheduler
        .charge_due_subscriptions(&ChargeOptions {
            dry_run: false,
            subscription_id: Some(Uuid::new_v4()),
            now,
        })
        .await
        .unwrap();
    assert_eq!(missing.items[0].error, Some(ChargeErrorCode::NoSubscription));

    assert_eq!(t.gateway.charge_count(), 0);
    assert!(t.store.invoices().is_empty());
    assert!(t.store.attempts().is_empty());
}

#[tokio::test]
async fn dry_run_prices_without_side_effects() {
    let t = TestEngine::new();
    let subscription = t.billable_subscription(dec!(70.00), "subscription");

    let summary = t
        .engine
        .scheduler
        .charge_due_subscriptions(&ChargeOptions {
            dry_run: true,
            subscription_id: None,
            now: t0() + Duration::hours(1),
        })
        .await
        .unwrap();

    assert!(summary.dry_run);
    assert_eq!(summary.success, 1);
    assert_eq!(summary.items[0].outcome, ItemOutcome::DryRun);
    assert_eq!(summary.items[0].amount, Some(dec!(70.00)));

    assert_eq!(t.gateway.charge_count(), 0);
    assert!(t.store.invoices().is_empty());
    assert!(t.store.attempts().is_empty());
    assert_eq!(t.subscription(subscription.subscription_id).ends_at, t0());
    assert!(t.notifier.templates().is_empty());
}

#[tokio::test]
async fn zero_total_invoice_settles_without_gateway() {
    let t = TestEngine::new();
    let subscription = t.billable_subscription(dec!(0), "subscription");

    let summary = t
        .engine
        .scheduler
        .charge_due_subscriptions(&renewal(t0() + Duration::hours(1)))
        .await
        .unwrap();

    assert_eq!(summary.success, 1);
    assert_eq!(t.gateway.charge_count(), 0);
    assert!(t.store.attempts().is_empty());

    let invoices = t.store.invoices();
    assert_eq!(invoices[0].status(), InvoiceStatus::Paid);
    assert_eq!(invoices[0].total, dec!(0));
    assert_eq!(
        t.subscription(subscription.subscription_id).ends_at,
        Utc.with_ymd_and_hms(2024, 4, 1, 12, 0, 0).unwrap()
    );
    assert_eq!(t.notifier.templates(), vec!["payment_succeeded"]);
}

#[tokio::test]
async fn slow_gateway_times_out_as_failure() {
    let t = TestEngine::new();
    t.billable_subscription(dec!(70.00), "subscription");
    t.gateway
        .script([ScriptedCharge::Delay(std::time::Duration::from_secs(5))]);

    let summary = t
        .engine
        .scheduler
        .charge_due_subscriptions(&renewal(t0() + Duration::hours(1)))
        .await
        .unwrap();

    assert_eq!(summary.failed, 1);
    assert_eq!(t.store.attempts()[0].status(), AttemptStatus::Failed);
}

#[tokio::test]
async fn notice_failures_do_not_fail_the_charge() {
    let t = TestEngine::new();
    let subscription = t.billable_subscription(dec!(70.00), "subscription");
    t.notifier.fail_deliveries(true);

    let summary = t
        .engine
        .scheduler
        .charge_due_subscriptions(&renewal(t0() + Duration::hours(1)))
        .await
        .unwrap();

    assert_eq!(summary.success, 1);
    assert_eq!(t.notifier.send_count(), 0);
    assert_eq!(
        t.subscription(subscription.subscription_id).starts_at,
        t0()
    );
}

#[tokio::test]
async fn unknown_billing_mode_is_reported_and_never_charged() {
    let t = TestEngine::new();
    let subscription = t.billable_subscription(dec!(70.00), "weekly");

    let summary = t
        .engine
        .scheduler
        .charge_due_subscriptions(&renewal(t0() + Duration::hours(1)))
        .await
        .unwrap();

    assert_eq!(summary.failed, 1);
    assert_eq!(summary.items[0].error, Some(ChargeErrorCode::Exception));
    assert_eq!(summary.items[0].outcome, ItemOutcome::Failed);
    assert_eq!(t.gateway.charge_count(), 0);
    assert!(t.store.invoices().is_empty());
    assert_eq!(t.subscription(subscription.subscription_id).ends_at, t0());
}
