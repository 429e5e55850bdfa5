//! PaymentsWay gateway client.
//!
//! Customer registration and card tokenisation go through the ClientAPI
//! person endpoints; recurring charges reuse the stored token.

use super::{
    ChargeRequest, ChargeResponse, GatewayError, GatewayNotification, InstrumentData,
    PaymentGateway, TokenizedInstrument,
};
use crate::services::metrics::record_gateway_duration;
use async_trait::async_trait;
use rand::distributions::Alphanumeric;
use rand::Rng;
use reqwest::{Client, RequestBuilder};
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, Secret};
use serde::Serialize;
use serde_json::Value;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

pub const DEFAULT_API_URL: &str = "https://serviceregister.paymentsway.co/ClientAPI";

/// Amount the gateway authorises when tokenising a card.
const TOKENIZATION_AMOUNT: &str = "100";

#[derive(Clone, Debug)]
pub struct PaymentsWayConfig {
    pub api_url: String,
    pub api_key: Secret<String>,
    pub merchant_id: String,
    pub form_id: String,
    pub terminal_id: String,
    /// Return URL registered with tokenisation requests.
    pub return_url: String,
    pub currency: String,
    pub timeout_secs: u64,
}

#[derive(Clone)]
pub struct PaymentsWayClient {
    client: Client,
    config: PaymentsWayConfig,
}

#[derive(Debug, Serialize)]
struct CreatePersonRequest<'a> {
    firstname: &'a str,
    lastname: &'a str,
    ididentificationtype: &'static str,
    identification: &'a str,
    email: &'a str,
    phone: &'a str,
    city: &'a str,
    address: &'a str,
    zipcode: &'a str,
}

#[derive(Debug, Serialize)]
struct TokenizeRequest<'a> {
    documento: &'a str,
    identification_type: &'static str,
    idperson: &'a str,
    url: &'a str,
    form_id: &'a str,
    amount: &'static str,
    external_order: String,
    currencycode: &'a str,
    description: &'static str,
    installments: u32,
}

#[derive(Debug, Serialize)]
struct ChargeTokenRequest<'a> {
    merchant_id: &'a str,
    form_id: &'a str,
    terminal_id: &'a str,
    token: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    idperson: Option<&'a str>,
    amount: Decimal,
    currencycode: &'a str,
    external_order: &'a str,
    description: &'a str,
    installments: u32,
}

/// Gateway code for a tax identification type. Unknown types fall back to the
/// generic national id.
pub fn map_identification_type(kind: &str) -> &'static str {
    match kind.to_ascii_lowercase().as_str() {
        "nit" => "6",
        "passport" => "1",
        _ => "4",
    }
}

impl PaymentsWayClient {
    pub fn new(config: PaymentsWayConfig) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| GatewayError::NotConfigured(format!("HTTP client: {}", e)))?;
        Ok(Self { client, config })
    }

    /// Check if the gateway credentials are set.
    pub fn is_configured(&self) -> bool {
        !self.config.api_url.is_empty() && !self.config.api_key.expose_secret().is_empty()
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.api_url.trim_end_matches('/'), path)
    }

    fn ensure_configured(&self) -> Result<(), GatewayError> {
        if self.is_configured() {
            Ok(())
        } else {
            Err(GatewayError::NotConfigured(
                "PaymentsWay credentials not configured".to_string(),
            ))
        }
    }

    /// Send a request and return the JSON body of a 2xx response.
    async fn send(&self, operation: &str, request: RequestBuilder) -> Result<Value, GatewayError> {
        let started = Instant::now();
        let result = request.send().await;
        record_gateway_duration(operation, started.elapsed().as_secs_f64());

        let response = result.map_err(|e| {
            if e.is_timeout() {
                GatewayError::Timeout(self.config.timeout_secs)
            } else {
                GatewayError::Transport(e.to_string())
            }
        })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| GatewayError::Transport(e.to_string()))?;

        debug!(operation, status = %status, body = %body, "PaymentsWay response");

        if !status.is_success() {
            error!(operation, status = %status, "PaymentsWay request failed");
            return Err(GatewayError::Status {
                status: status.as_u16(),
                body,
            });
        }

        serde_json::from_str(&body).map_err(|e| GatewayError::Malformed(e.to_string()))
    }

    #[instrument(skip(self, instrument), fields(user_id = %user_id))]
    async fn create_person(
        &self,
        user_id: Uuid,
        instrument: &InstrumentData,
    ) -> Result<String, GatewayError> {
        let body = CreatePersonRequest {
            firstname: &instrument.first_name,
            lastname: &instrument.last_name,
            ididentificationtype: map_identification_type(&instrument.identification_type),
            identification: &instrument.identification,
            email: &instrument.email,
            phone: instrument.phone.as_deref().unwrap_or_default(),
            city: instrument.city.as_deref().unwrap_or_default(),
            address: instrument.address.as_deref().unwrap_or_default(),
            zipcode: instrument.zipcode.as_deref().unwrap_or_default(),
        };

        let response = self
            .send(
                "create_person",
                self.client
                    .post(self.url("CrearPersona"))
                    .header("x-api-key", self.config.api_key.expose_secret())
                    .json(&body),
            )
            .await?;

        let person_id = scalar_string(&response["id"])
            .ok_or_else(|| GatewayError::Malformed("CrearPersona response has no id".into()))?;
        info!(person_id = %person_id, "PaymentsWay person created");
        Ok(person_id)
    }
}

#[async_trait]
impl PaymentGateway for PaymentsWayClient {
    fn slug(&self) -> &str {
        "paymentsway"
    }

    #[instrument(skip(self, instrument), fields(user_id = %user_id))]
    async fn tokenize(
        &self,
        user_id: Uuid,
        instrument: &InstrumentData,
    ) -> Result<TokenizedInstrument, GatewayError> {
        self.ensure_configured()?;
        let person_id = self.create_person(user_id, instrument).await?;

        let external_order: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(10)
            .map(char::from)
            .collect();
        let body = TokenizeRequest {
            documento: &instrument.identification,
            identification_type: map_identification_type(&instrument.identification_type),
            idperson: &person_id,
            url: &self.config.return_url,
            form_id: &self.config.form_id,
            amount: TOKENIZATION_AMOUNT,
            external_order: format!("TOKEN-{}", external_order),
            currencycode: &self.config.currency,
            description: "Tokenización de tarjeta",
            installments: 1,
        };

        let response = self
            .send(
                "tokenize",
                self.client
                    .post(self.url("TokenizarDatosPersona"))
                    .header("Authorization", self.config.api_key.expose_secret())
                    .json(&body),
            )
            .await?;

        let token = response["data"]["token"]
            .as_str()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| GatewayError::Malformed("tokenisation response has no data.token".into()))?;

        info!(person_id = %person_id, "Card tokenized");
        Ok(TokenizedInstrument {
            token: token.to_string(),
            customer_id: Some(person_id),
        })
    }

    #[instrument(skip(self, request), fields(order_number = %request.order_number, amount = %request.amount))]
    async fn charge_with_token(
        &self,
        request: &ChargeRequest,
    ) -> Result<ChargeResponse, GatewayError> {
        self.ensure_configured()?;

        let body = ChargeTokenRequest {
            merchant_id: &self.config.merchant_id,
            form_id: &self.config.form_id,
            terminal_id: &self.config.terminal_id,
            token: &request.token,
            idperson: request.customer_id.as_deref(),
            amount: request.amount.round_dp(2),
            currencycode: &request.currency,
            external_order: &request.order_number,
            description: &request.description,
            installments: 1,
        };

        let response = self
            .send(
                "charge",
                self.client
                    .post(self.url("CrearTransaccionToken"))
                    .header("Authorization", self.config.api_key.expose_secret())
                    .json(&body),
            )
            .await?;

        let status_code = scalar_string(&response["status_code"])
            .or_else(|| scalar_string(&response["idstatus"]["id"]))
            .ok_or_else(|| GatewayError::Malformed("charge response has no status".into()))?;
        let transaction_id =
            scalar_string(&response["transaction_id"]).or_else(|| scalar_string(&response["id"]));
        let message = response["message"]
            .as_str()
            .or_else(|| response["idstatus"]["nombre"].as_str())
            .map(str::to_string);

        let charge = ChargeResponse {
            transaction_id,
            status_code,
            message,
            raw: response,
        };
        info!(
            status_code = %charge.status_code,
            outcome = ?charge.outcome(),
            "PaymentsWay charge answered"
        );
        Ok(charge)
    }

    #[instrument(skip(self))]
    async fn query_status(&self, order_number: &str) -> Result<GatewayNotification, GatewayError> {
        self.ensure_configured()?;

        let response = self
            .send(
                "query_status",
                self.client
                    .get(self.url("ObtenerTransaccionByExternalOrder"))
                    .header("Authorization", self.config.api_key.expose_secret())
                    .query(&[("external_order", order_number)]),
            )
            .await?;

        // The transaction may come bare, under `data`, or as the first of a list.
        let payload = match &response {
            Value::Object(map) if map.contains_key("idstatus") => response.clone(),
            Value::Object(map) => match map.get("data") {
                Some(Value::Array(items)) => items.first().cloned().unwrap_or(Value::Null),
                Some(data) => data.clone(),
                None => Value::Null,
            },
            Value::Array(items) => items.first().cloned().unwrap_or(Value::Null),
            _ => Value::Null,
        };

        serde_json::from_value(payload).map_err(|e| GatewayError::Malformed(e.to_string()))
    }
}

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> PaymentsWayConfig {
        PaymentsWayConfig {
            api_url: DEFAULT_API_URL.to_string(),
            api_key: Secret::new("pw_test_key".to_string()),
            merchant_id: "M-1".to_string(),
            form_id: "F-1".to_string(),
            terminal_id: "T-1".to_string(),
            return_url: "https://billing.example.com".to_string(),
            currency: "COP".to_string(),
            timeout_secs: 5,
        }
    }

    #[test]
    fn test_is_configured() {
        let client = PaymentsWayClient::new(test_config()).unwrap();
        assert!(client.is_configured());

        let mut empty = test_config();
        empty.api_key = Secret::new(String::new());
        let client = PaymentsWayClient::new(empty).unwrap();
        assert!(!client.is_configured());
    }

    #[test]
    fn test_identification_type_map() {
        assert_eq!(map_identification_type("nit"), "6");
        assert_eq!(map_identification_type("NIT"), "6");
        assert_eq!(map_identification_type("dni"), "4");
        assert_eq!(map_identification_type("passport"), "1");
        assert_eq!(map_identification_type("rfc"), "4");
    }

    #[test]
    fn test_url_joins_base_and_path() {
        let mut config = test_config();
        config.api_url = "http://localhost:9000/ClientAPI/".to_string();
        let client = PaymentsWayClient::new(config).unwrap();
        assert_eq!(
            client.url("CrearPersona"),
            "http://localhost:9000/ClientAPI/CrearPersona"
        );
    }

    #[tokio::test]
    async fn test_unconfigured_client_refuses_to_charge() {
        let mut config = test_config();
        config.api_key = Secret::new(String::new());
        let client = PaymentsWayClient::new(config).unwrap();

        let result = client
            .charge_with_token(&ChargeRequest {
                user_id: Uuid::new_v4(),
                token: "tok".to_string(),
                customer_id: None,
                amount: Decimal::ONE_HUNDRED,
                currency: "COP".to_string(),
                order_number: "ORD-1".to_string(),
                description: "test".to_string(),
            })
            .await;
        assert!(matches!(result, Err(GatewayError::NotConfigured(_))));
    }
}
