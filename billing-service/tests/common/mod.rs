//! Test helpers for billing-service integration tests.
//!
//! Every test gets its own in-process engine: a [`MemoryStore`], a scripted
//! [`MockPaymentGateway`] and a [`RecordingNotifier`], wired exactly as the
//! binaries wire the PostgreSQL store and the real clients.

#![allow(dead_code)]

use billing_service::models::{
    BillingContact, PaymentGatewayRecord, PaymentMethod, Plan, Subscription, Transaction,
};
use billing_service::services::gateway::ScriptedCharge;
use billing_service::services::{
    init_metrics, InvoiceSettings, MemoryStore, MockPaymentGateway, RecordingNotifier,
    SchedulerSettings,
};
use billing_service::startup::{build_router, AppState, BillingEngine};
use axum::Router;
use chrono::{DateTime, Duration, TimeZone, Utc};
use rust_decimal::Decimal;
use secrecy::Secret;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

pub const GATEWAY_SLUG: &str = "paymentsway";

/// End of the first billing period of every seeded subscription.
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
}

pub struct TestEngine {
    pub store: Arc<MemoryStore>,
    pub gateway: Arc<MockPaymentGateway>,
    pub notifier: Arc<RecordingNotifier>,
    pub engine: BillingEngine,
    pub gateway_record: PaymentGatewayRecord,
}

impl TestEngine {
    pub fn new() -> Self {
        Self::with_gateway(MockPaymentGateway::new(GATEWAY_SLUG))
    }

    /// Engine whose gateway answers every unscripted charge with `default`.
    pub fn answering(default: ScriptedCharge) -> Self {
        Self::with_gateway(MockPaymentGateway::with_default(GATEWAY_SLUG, default))
    }

    fn with_gateway(gateway: MockPaymentGateway) -> Self {
        init_metrics();

        let store = Arc::new(MemoryStore::new());
        let gateway = Arc::new(gateway);
        let notifier = Arc::new(RecordingNotifier::new());

        let gateway_record = PaymentGatewayRecord {
            gateway_id: Uuid::new_v4(),
            name: "PaymentsWay".to_string(),
            slug: GATEWAY_SLUG.to_string(),
            is_active: true,
            is_default: true,
            config: json!({}),
        };
        store.seed_gateway(gateway_record.clone());

        let scheduler = SchedulerSettings {
            gateway_timeout: std::time::Duration::from_secs(2),
            ..SchedulerSettings::default()
        };
        let engine = BillingEngine::assemble(
            store.clone(),
            gateway.clone(),
            notifier.clone(),
            InvoiceSettings::default(),
            scheduler,
            std::time::Duration::from_secs(1),
        );

        Self {
            store,
            gateway,
            notifier,
            engine,
            gateway_record,
        }
    }

    /// Router over this engine, optionally requiring signed callbacks.
    pub fn router(&self, webhook_secret: Option<&str>) -> Router {
        let state = AppState::new(
            &self.engine,
            webhook_secret.map(|s| Secret::new(s.to_string())),
            std::time::Duration::from_secs(5),
        );
        build_router(state)
    }

    pub fn seed_plan(&self, price: Decimal) -> Plan {
        let plan = Plan {
            plan_id: Uuid::new_v4(),
            name: "Plan Pro".to_string(),
            description: Some("Monthly professional plan".to_string()),
            price,
            currency: "COP".to_string(),
            is_active: true,
            metadata: json!({}),
            created_at: t0() - Duration::days(90),
            updated_at: t0() - Duration::days(90),
        };
        self.store.seed_plan(plan.clone());
        plan
    }

    /// Active subscription whose current period ends at [`t0`].
    pub fn seed_subscription(&self, plan: &Plan, billing_mode: &str) -> Subscription {
        let subscription = Subscription {
            subscription_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            plan_id: plan.plan_id,
            billing_mode: billing_mode.to_string(),
            status: "active".to_string(),
            starts_at: Utc.with_ymd_and_hms(2024, 2, 1, 12, 0, 0).unwrap(),
            ends_at: t0(),
            metadata: json!({"source": "signup"}),
            created_at: t0() - Duration::days(60),
            updated_at: t0() - Duration::days(60),
        };
        self.store.seed_subscription(subscription.clone());
        subscription
    }

    pub fn seed_contact(&self, user_id: Uuid) -> BillingContact {
        let contact = BillingContact {
            user_id,
            email: format!("{}@example.com", &user_id.to_string()[..8]),
            name: Some("Ana Gómez".to_string()),
        };
        self.store.seed_contact(contact.clone());
        contact
    }

    /// Default card for `user_id`, valid through `month`/`year`.
    pub fn seed_card(&self, user_id: Uuid, month: i32, year: i32) -> PaymentMethod {
        let method = PaymentMethod {
            payment_method_id: Uuid::new_v4(),
            user_id,
            gateway_id: self.gateway_record.gateway_id,
            method_type: "card".to_string(),
            token: format!("tok-{}", &user_id.to_string()[..8]),
            customer_id: Some("PW-PERSON-1".to_string()),
            brand: Some("visa".to_string()),
            last_four: Some("4242".to_string()),
            expiry_month: Some(month),
            expiry_year: Some(year),
            holder_name: Some("Ana Gómez".to_string()),
            is_default: true,
            is_active: true,
            created_at: t0() - Duration::days(60),
            updated_at: t0() - Duration::days(60),
        };
        self.store.seed_payment_method(method.clone());
        method
    }

    /// A plan, a subscription on it, a contact and a long-lived card.
    pub fn billable_subscription(&self, price: Decimal, billing_mode: &str) -> Subscription {
        let plan = self.seed_plan(price);
        let subscription = self.seed_subscription(&plan, billing_mode);
        self.seed_contact(subscription.user_id);
        self.seed_card(subscription.user_id, 12, 2030);
        subscription
    }

    pub fn seed_transaction(&self, amount: Decimal, status: &str) -> Transaction {
        let transaction = Transaction {
            transaction_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            purchasable_type: None,
            purchasable_id: None,
            description: "Paquete de créditos".to_string(),
            amount,
            currency: "COP".to_string(),
            status: status.to_string(),
            completed_at: (status == "completed").then(t0),
            created_at: t0(),
            updated_at: t0(),
        };
        self.store.seed_transaction(transaction.clone());
        transaction
    }

    pub fn subscription(&self, subscription_id: Uuid) -> Subscription {
        self.store
            .subscription(subscription_id)
            .expect("subscription should exist")
    }
}

/// PaymentsWay callback body for `order_number` with status `code`.
pub fn notification_body(order_number: &str, code: i64, amount: &str) -> String {
    json!({
        "id": 98765,
        "idstatus": {"id": code, "nombre": "Estado"},
        "externalorder": order_number,
        "amount": amount.parse::<f64>().unwrap(),
        "innerexception": {"causal": "Fondos insuficientes"},
    })
    .to_string()
}
