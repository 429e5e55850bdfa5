//! Payment gateway boundary.
//!
//! The engine depends only on [`PaymentGateway`]; the PaymentsWay HTTP client
//! and the scripted mock both implement it.

mod mock;
mod paymentsway;

pub use mock::{MockPaymentGateway, ScriptedCharge};
pub use paymentsway::{
    map_identification_type, PaymentsWayClient, PaymentsWayConfig, DEFAULT_API_URL,
};

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Gateway is not configured: {0}")]
    NotConfigured(String),

    #[error("Gateway request timed out after {0}s")]
    Timeout(u64),

    #[error("Gateway transport error: {0}")]
    Transport(String),

    #[error("Gateway returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Gateway response could not be parsed: {0}")]
    Malformed(String),
}

/// Customer and card details collected for tokenisation. The card number
/// itself is captured by the gateway's hosted form, never by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentData {
    pub first_name: String,
    pub last_name: String,
    /// `nit`, `dni`, `passport`, ...
    pub identification_type: String,
    pub identification: String,
    pub email: String,
    pub phone: Option<String>,
    pub city: Option<String>,
    pub address: Option<String>,
    pub zipcode: Option<String>,
    pub brand: Option<String>,
    pub last_four: Option<String>,
    pub expiry_month: Option<i32>,
    pub expiry_year: Option<i32>,
    pub holder_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenizedInstrument {
    pub token: String,
    pub customer_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChargeRequest {
    pub user_id: Uuid,
    pub token: String,
    pub customer_id: Option<String>,
    pub amount: Decimal,
    pub currency: String,
    pub order_number: String,
    pub description: String,
}

/// How the engine reads a synchronous charge answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChargeOutcome {
    Approved,
    Pending,
    Declined,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChargeResponse {
    pub transaction_id: Option<String>,
    pub status_code: String,
    pub message: Option<String>,
    #[serde(default)]
    pub raw: serde_json::Value,
}

impl ChargeResponse {
    pub fn outcome(&self) -> ChargeOutcome {
        match self.status_code.trim() {
            "00" | "34" => ChargeOutcome::Approved,
            "35" | "40" => ChargeOutcome::Pending,
            _ => ChargeOutcome::Declined,
        }
    }
}

/// Gateway status ids carried in `idstatus.id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayStatus {
    Approved,
    PendingAuthorization,
    Declined,
    Cancelled,
    Refunded,
    PendingCash,
}

impl GatewayStatus {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            34 => Some(GatewayStatus::Approved),
            35 => Some(GatewayStatus::PendingAuthorization),
            36 => Some(GatewayStatus::Declined),
            38 => Some(GatewayStatus::Cancelled),
            39 => Some(GatewayStatus::Refunded),
            40 => Some(GatewayStatus::PendingCash),
            _ => None,
        }
    }

    pub fn code(&self) -> i64 {
        match self {
            GatewayStatus::Approved => 34,
            GatewayStatus::PendingAuthorization => 35,
            GatewayStatus::Declined => 36,
            GatewayStatus::Cancelled => 38,
            GatewayStatus::Refunded => 39,
            GatewayStatus::PendingCash => 40,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            GatewayStatus::Approved => "approved",
            GatewayStatus::PendingAuthorization => "pending_authorization",
            GatewayStatus::Declined => "declined",
            GatewayStatus::Cancelled => "cancelled",
            GatewayStatus::Refunded => "refunded",
            GatewayStatus::PendingCash => "pending_cash",
        }
    }

    /// Whether the gateway will report again for this order.
    pub fn is_final(&self) -> bool {
        !matches!(
            self,
            GatewayStatus::PendingAuthorization | GatewayStatus::PendingCash
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusInfo {
    #[serde(deserialize_with = "int_or_string")]
    pub id: i64,
    #[serde(default)]
    pub nombre: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InnerException {
    #[serde(default)]
    pub causal: Option<String>,
}

/// Callback payload, also returned by the status query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayNotification {
    #[serde(rename = "id", default, deserialize_with = "opt_string_or_number")]
    pub transaction_id: Option<String>,
    #[serde(rename = "idstatus")]
    pub status: StatusInfo,
    #[serde(rename = "externalorder")]
    pub order_number: String,
    #[serde(default)]
    pub amount: Option<Decimal>,
    #[serde(rename = "innerexception", default)]
    pub inner_exception: Option<InnerException>,
}

impl GatewayNotification {
    pub fn gateway_status(&self) -> Option<GatewayStatus> {
        GatewayStatus::from_code(self.status.id)
    }

    pub fn decline_cause(&self) -> Option<&str> {
        self.inner_exception
            .as_ref()
            .and_then(|e| e.causal.as_deref())
            .filter(|c| !c.trim().is_empty())
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Scalar {
    Int(i64),
    Float(f64),
    Text(String),
}

fn int_or_string<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    match Scalar::deserialize(deserializer)? {
        Scalar::Int(i) => Ok(i),
        Scalar::Float(f) => Ok(f as i64),
        Scalar::Text(s) => s
            .trim()
            .parse()
            .map_err(|_| serde::de::Error::custom(format!("invalid status id '{}'", s))),
    }
}

fn opt_string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Scalar>::deserialize(deserializer)?.map(|v| match v {
        Scalar::Int(i) => i.to_string(),
        Scalar::Float(f) => f.to_string(),
        Scalar::Text(s) => s,
    }))
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Slug of the `payment_gateways` row this client serves.
    fn slug(&self) -> &str;

    async fn tokenize(
        &self,
        user_id: Uuid,
        instrument: &InstrumentData,
    ) -> Result<TokenizedInstrument, GatewayError>;

    async fn charge_with_token(&self, request: &ChargeRequest)
        -> Result<ChargeResponse, GatewayError>;

    async fn query_status(&self, order_number: &str)
        -> Result<GatewayNotification, GatewayError>;
}
