//! PaymentsWay webhook and health endpoint tests.

mod common;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    response::Response,
    Router,
};
use billing_service::handlers::SIGNATURE_HEADER;
use billing_service::models::{AttemptStatus, InvoiceStatus, PaymentAttempt, TransactionStatus};
use billing_service::services::attempts::REFUNDED_MESSAGE;
use billing_service::services::reconciliation::PENDING_CASH_MESSAGE;
use billing_service::services::BillingStore;
use billing_service::services::gateway::ScriptedCharge;
use billing_service::services::ChargeOptions;
use billing_service::startup::WEBHOOK_PATH;
use chrono::{Duration, TimeZone, Utc};
use common::{notification_body, t0, TestEngine};
use rust_decimal_macros::dec;
use service_core::utils::signature::sign_payload;
use tower::util::ServiceExt;
use uuid::Uuid;

/// A subscription whose charge is waiting for gateway confirmation.
async fn pending_charge(t: &TestEngine) -> (Uuid, String) {
    let subscription = t.billable_subscription(dec!(70.00), "subscription");
    t.gateway.script([ScriptedCharge::Pending]);
    t.engine
        .scheduler
        .charge_due_subscriptions(&ChargeOptions {
            dry_run: false,
            subscription_id: None,
            now: t0() + Duration::hours(1),
        })
        .await
        .unwrap();
    let order_number = t.store.attempts()[0].gateway_order_number.clone();
    (subscription.subscription_id, order_number)
}

async fn post_webhook(app: &Router, body: String, signature: Option<&str>) -> Response {
    let mut request = Request::builder()
        .method("POST")
        .uri(WEBHOOK_PATH)
        .header("content-type", "application/json");
    if let Some(signature) = signature {
        request = request.header(SIGNATURE_HEADER, signature);
    }
    app.clone()
        .oneshot(request.body(Body::from(body)).unwrap())
        .await
        .unwrap()
}

async fn json_body(response: Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn approval_settles_the_attempt_once() {
    let t = TestEngine::new();
    let (subscription_id, order_number) = pending_charge(&t).await;
    let app = t.router(None);
    let renewed_until = Utc.with_ymd_and_hms(2024, 4, 1, 12, 0, 0).unwrap();

    let response = post_webhook(&app, notification_body(&order_number, 34, "70.00"), None).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["success"], true);
    assert_eq!(body["order_number"], order_number.as_str());
    assert_eq!(body["outcome"]["kind"], "applied");

    assert_eq!(t.store.attempts()[0].status(), AttemptStatus::Success);
    assert_eq!(t.subscription(subscription_id).ends_at, renewed_until);
    assert_eq!(t.notifier.templates(), vec!["payment_succeeded"]);

    // Redelivery is acknowledged without side effects.
    let duplicate = post_webhook(&app, notification_body(&order_number, 34, "70.00"), None).await;
    assert_eq!(duplicate.status(), StatusCode::OK);
    assert_eq!(json_body(duplicate).await["outcome"]["kind"], "duplicate");
    assert_eq!(t.subscription(subscription_id).ends_at, renewed_until);

    // A late decline cannot undo the settled payment.
    let late = post_webhook(&app, notification_body(&order_number, 36, "70.00"), None).await;
    assert_eq!(late.status(), StatusCode::CREATED);
    assert_eq!(t.store.attempts()[0].status(), AttemptStatus::Success);
    assert_eq!(t.notifier.templates(), vec!["payment_succeeded"]);
}

#[tokio::test]
async fn decline_fails_the_attempt_with_the_gateway_cause() {
    let t = TestEngine::new();
    let (subscription_id, order_number) = pending_charge(&t).await;
    let app = t.router(None);

    let response = post_webhook(&app, notification_body(&order_number, 36, "70.00"), None).await;
    assert_eq!(response.status(), StatusCode::CREATED);

    let attempt = &t.store.attempts()[0];
    assert_eq!(attempt.status(), AttemptStatus::Failed);
    assert_eq!(attempt.error_message.as_deref(), Some("Fondos insuficientes"));
    assert!(t.subscription(subscription_id).is_active());
    assert_eq!(t.notifier.templates(), vec!["payment_failed"]);
}

#[tokio::test]
async fn gateway_cancellation_closes_the_attempt_without_renewing() {
    let t = TestEngine::new();
    let (subscription_id, order_number) = pending_charge(&t).await;
    let app = t.router(None);

    let response = post_webhook(&app, notification_body(&order_number, 38, "70.00"), None).await;
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(json_body(response).await["outcome"]["kind"], "applied");

    let attempt = &t.store.attempts()[0];
    assert_eq!(attempt.status(), AttemptStatus::Cancelled);
    assert!(attempt.completed_at.is_some());
    let subscription = t.subscription(subscription_id);
    assert!(subscription.is_active());
    assert_eq!(subscription.ends_at, t0());
    assert!(t.notifier.templates().is_empty());

    // An approval arriving after the cancellation is ignored.
    let late = post_webhook(&app, notification_body(&order_number, 34, "70.00"), None).await;
    assert_eq!(json_body(late).await["outcome"]["kind"], "duplicate");
    assert_eq!(t.store.attempts()[0].status(), AttemptStatus::Cancelled);
    assert_eq!(t.subscription(subscription_id).ends_at, t0());
}

#[tokio::test]
async fn pending_cash_payment_keeps_the_attempt_open() {
    let t = TestEngine::new();
    let (subscription_id, order_number) = pending_charge(&t).await;
    let app = t.router(None);

    let response = post_webhook(&app, notification_body(&order_number, 40, "70.00"), None).await;
    assert_eq!(response.status(), StatusCode::CREATED);

    let attempt = &t.store.attempts()[0];
    assert_eq!(attempt.status(), AttemptStatus::Processing);
    assert_eq!(attempt.gateway_message.as_deref(), Some(PENDING_CASH_MESSAGE));
    assert_eq!(t.subscription(subscription_id).ends_at, t0());
    assert!(t.notifier.templates().is_empty());
}

#[tokio::test]
async fn refund_reverses_a_paid_transaction() {
    let t = TestEngine::new();
    let transaction = t.seed_transaction(dec!(15.00), "pending");
    let invoice = t
        .engine
        .invoices
        .build_for_transaction(transaction.transaction_id, None, t0())
        .await
        .unwrap();
    let order_number = "ORD-20240301120000-0A1B2C".to_string();
    t.store.seed_attempt(PaymentAttempt {
        attempt_id: Uuid::new_v4(),
        user_id: transaction.user_id,
        gateway_id: t.gateway_record.gateway_id,
        payment_method_id: None,
        invoice_id: Some(invoice.invoice_id),
        transaction_id: Some(transaction.transaction_id),
        subscription_id: None,
        amount: invoice.total,
        currency: "COP".to_string(),
        gateway_order_number: order_number.clone(),
        gateway_transaction_id: None,
        status: "processing".to_string(),
        gateway_response: None,
        gateway_message: None,
        error_message: None,
        retry_count: 0,
        attempted_at: Some(t0()),
        completed_at: None,
        created_at: t0(),
        updated_at: t0(),
    });
    let app = t.router(None);

    let approved = post_webhook(&app, notification_body(&order_number, 34, "15.00"), None).await;
    assert_eq!(approved.status(), StatusCode::OK);
    let paid = t.store.get_transaction(transaction.transaction_id).await.unwrap().unwrap();
    assert_eq!(paid.status(), TransactionStatus::Completed);

    let refunded = post_webhook(&app, notification_body(&order_number, 39, "15.00"), None).await;
    assert_eq!(refunded.status(), StatusCode::CREATED);
    assert_eq!(json_body(refunded).await["outcome"]["kind"], "applied");

    let attempt = &t.store.attempts()[0];
    assert_eq!(attempt.status(), AttemptStatus::Cancelled);
    assert_eq!(attempt.gateway_message.as_deref(), Some(REFUNDED_MESSAGE));
    let invoice = t.store.get_invoice(invoice.invoice_id).await.unwrap().unwrap();
    assert_eq!(invoice.status(), InvoiceStatus::Refunded);
    let transaction = t
        .store
        .get_transaction(transaction.transaction_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(transaction.status(), TransactionStatus::Refunded);

    // A second refund notice changes nothing.
    let again = post_webhook(&app, notification_body(&order_number, 39, "15.00"), None).await;
    assert_eq!(again.status(), StatusCode::CREATED);
    assert_eq!(json_body(again).await["outcome"]["kind"], "duplicate");
}

#[tokio::test]
async fn unknown_orders_and_statuses_are_acknowledged() {
    let t = TestEngine::new();
    let (_, order_number) = pending_charge(&t).await;
    let app = t.router(None);

    let unknown_order = post_webhook(
        &app,
        notification_body("ORD-20240101000000-ABCDEF", 36, "70.00"),
        None,
    )
    .await;
    assert_eq!(unknown_order.status(), StatusCode::CREATED);
    let body = json_body(unknown_order).await;
    assert_eq!(body["message"], "Payment attempt not found");
    assert_eq!(body["outcome"]["kind"], "not_found");

    let unknown_status = post_webhook(&app, notification_body(&order_number, 99, "70.00"), None).await;
    assert_eq!(unknown_status.status(), StatusCode::CREATED);
    assert_eq!(json_body(unknown_status).await["outcome"]["kind"], "unrecognized");
    assert_eq!(t.store.attempts()[0].status(), AttemptStatus::Processing);
}

#[tokio::test]
async fn malformed_payload_is_rejected() {
    let t = TestEngine::new();
    let app = t.router(None);

    let response = post_webhook(&app, "{not json".to_string(), None).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let missing_order = post_webhook(&app, r#"{"idstatus": {"id": 34}}"#.to_string(), None).await;
    assert_eq!(missing_order.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn signed_webhooks_require_a_valid_signature() {
    let t = TestEngine::new();
    let (_, order_number) = pending_charge(&t).await;
    let secret = "whsec_test";
    let app = t.router(Some(secret));
    let body = notification_body(&order_number, 34, "70.00");

    let unsigned = post_webhook(&app, body.clone(), None).await;
    assert_eq!(unsigned.status(), StatusCode::UNAUTHORIZED);

    let forged = sign_payload("other-secret", body.as_bytes()).unwrap();
    let wrong = post_webhook(&app, body.clone(), Some(&forged)).await;
    assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(t.store.attempts()[0].status(), AttemptStatus::Processing);

    let signature = sign_payload(secret, body.as_bytes()).unwrap();
    let signed = post_webhook(&app, body, Some(&signature)).await;
    assert_eq!(signed.status(), StatusCode::OK);
    assert_eq!(t.store.attempts()[0].status(), AttemptStatus::Success);
}

#[tokio::test]
async fn health_and_metrics_endpoints_respond() {
    let t = TestEngine::new();
    let app = t.router(None);

    let health = app
        .clone()
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(health.status(), StatusCode::OK);
    let body = json_body(health).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "billing-service");

    let ready = app
        .clone()
        .oneshot(Request::builder().uri("/ready").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(ready.status(), StatusCode::OK);

    let metrics = app
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(metrics.status(), StatusCode::OK);
    assert!(metrics
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains("text/plain")));
}
