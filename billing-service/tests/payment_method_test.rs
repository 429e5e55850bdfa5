//! Payment method registration tests.

mod common;

use billing_service::error::BillingError;
use billing_service::services::gateway::InstrumentData;
use billing_service::services::{MemoryStore, MockPaymentGateway, PaymentMethodService};
use common::{TestEngine, GATEWAY_SLUG};
use std::sync::Arc;
use uuid::Uuid;

fn card(last_four: &str) -> InstrumentData {
    InstrumentData {
        first_name: "Ana".to_string(),
        last_name: "Gómez".to_string(),
        identification_type: "dni".to_string(),
        identification: "52123456".to_string(),
        email: "ana@example.com".to_string(),
        phone: None,
        city: None,
        address: None,
        zipcode: None,
        brand: Some("mastercard".to_string()),
        last_four: Some(last_four.to_string()),
        expiry_month: Some(8),
        expiry_year: Some(2029),
        holder_name: None,
    }
}

#[tokio::test]
async fn first_card_becomes_the_default() {
    let t = TestEngine::new();
    let user_id = Uuid::new_v4();
    let service = &t.engine.payment_methods;

    let first = service
        .register_payment_method(user_id, &card("1111"), false)
        .await
        .unwrap();
    assert!(first.is_default);
    assert_eq!(first.gateway_id, t.gateway_record.gateway_id);
    assert_eq!(first.token, "mock-token-1");
    assert_eq!(first.holder_name.as_deref(), Some("Ana Gómez"));

    let second = service
        .register_payment_method(user_id, &card("2222"), false)
        .await
        .unwrap();
    assert!(!second.is_default);

    let defaults: Vec<_> = t
        .store
        .payment_methods(user_id)
        .into_iter()
        .filter(|m| m.is_default)
        .collect();
    assert_eq!(defaults.len(), 1);
    assert_eq!(defaults[0].payment_method_id, first.payment_method_id);
}

#[tokio::test]
async fn switching_default_leaves_exactly_one() {
    let t = TestEngine::new();
    let user_id = Uuid::new_v4();
    let service = &t.engine.payment_methods;

    service
        .register_payment_method(user_id, &card("1111"), false)
        .await
        .unwrap();
    let second = service
        .register_payment_method(user_id, &card("2222"), true)
        .await
        .unwrap();
    assert!(second.is_default);

    let methods = t.store.payment_methods(user_id);
    assert_eq!(methods.iter().filter(|m| m.is_default).count(), 1);
    assert!(methods
        .iter()
        .any(|m| m.is_default && m.last_four.as_deref() == Some("2222")));
}

#[tokio::test]
async fn foreign_method_cannot_become_default() {
    let t = TestEngine::new();
    let owner = Uuid::new_v4();
    let method = t
        .engine
        .payment_methods
        .register_payment_method(owner, &card("1111"), false)
        .await
        .unwrap();

    let result = t
        .engine
        .payment_methods
        .set_default_payment_method(Uuid::new_v4(), method.payment_method_id)
        .await;

    assert!(result.is_err());
    assert!(t.store.payment_methods(owner)[0].is_default);
}

#[tokio::test]
async fn unregistered_gateway_is_refused() {
    let store = Arc::new(MemoryStore::new());
    let gateway = Arc::new(MockPaymentGateway::new(GATEWAY_SLUG));
    let service = PaymentMethodService::new(store.clone(), gateway.clone());
    let user_id = Uuid::new_v4();

    let result = service
        .register_payment_method(user_id, &card("1111"), true)
        .await;

    assert!(matches!(result, Err(BillingError::GatewayNotRegistered(slug)) if slug == GATEWAY_SLUG));
    assert!(store.payment_methods(user_id).is_empty());
}
