//! Payment method registration.

use crate::error::BillingError;
use crate::models::{NewPaymentMethod, PaymentGatewayRecord, PaymentMethod};
use crate::services::gateway::{InstrumentData, PaymentGateway};
use crate::services::store::BillingStore;
use service_core::error::AppError;
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

#[derive(Clone)]
pub struct PaymentMethodService {
    store: Arc<dyn BillingStore>,
    gateway: Arc<dyn PaymentGateway>,
}

impl PaymentMethodService {
    pub fn new(store: Arc<dyn BillingStore>, gateway: Arc<dyn PaymentGateway>) -> Self {
        Self { store, gateway }
    }

    /// Tokenize the instrument with the gateway and store the token. The
    /// user's first method always becomes the default.
    #[instrument(skip(self, instrument), fields(user_id = %user_id, gateway = self.gateway.slug()))]
    pub async fn register_payment_method(
        &self,
        user_id: Uuid,
        instrument: &InstrumentData,
        make_default: bool,
    ) -> Result<PaymentMethod, BillingError> {
        let gateway = self.gateway_record().await?;
        let tokenized = self.gateway.tokenize(user_id, instrument).await?;

        let method = self
            .store
            .create_payment_method(&NewPaymentMethod {
                user_id,
                gateway_id: gateway.gateway_id,
                method_type: "card".to_string(),
                token: tokenized.token,
                customer_id: tokenized.customer_id,
                brand: instrument.brand.clone(),
                last_four: instrument.last_four.clone(),
                expiry_month: instrument.expiry_month,
                expiry_year: instrument.expiry_year,
                holder_name: instrument.holder_name.clone().or_else(|| {
                    Some(format!("{} {}", instrument.first_name, instrument.last_name))
                }),
            })
            .await?;

        let has_default = self.store.default_payment_method(user_id).await?.is_some();
        let method = if make_default || !has_default {
            self.set_default_payment_method(user_id, method.payment_method_id)
                .await?
        } else {
            method
        };

        info!(
            payment_method_id = %method.payment_method_id,
            is_default = method.is_default,
            "Payment method registered"
        );
        Ok(method)
    }

    /// Make `payment_method_id` the user's only default method.
    #[instrument(skip(self))]
    pub async fn set_default_payment_method(
        &self,
        user_id: Uuid,
        payment_method_id: Uuid,
    ) -> Result<PaymentMethod, BillingError> {
        self.store
            .set_default_payment_method(user_id, payment_method_id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(anyhow::anyhow!(
                    "Payment method {} not found for user {}",
                    payment_method_id,
                    user_id
                ))
                .into()
            })
    }

    async fn gateway_record(&self) -> Result<PaymentGatewayRecord, BillingError> {
        self.store
            .get_gateway(self.gateway.slug())
            .await?
            .filter(|g| g.is_active)
            .ok_or_else(|| BillingError::GatewayNotRegistered(self.gateway.slug().to_string()))
    }
}
