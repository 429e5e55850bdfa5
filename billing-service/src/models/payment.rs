//! Payment gateway, payment method and payment attempt models.

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Gateway integration row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PaymentGatewayRecord {
    pub gateway_id: Uuid,
    pub name: String,
    pub slug: String,
    pub is_active: bool,
    pub is_default: bool,
    pub config: serde_json::Value,
}

/// Tokenized payment instrument. Raw card data is never stored.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PaymentMethod {
    pub payment_method_id: Uuid,
    pub user_id: Uuid,
    pub gateway_id: Uuid,
    pub method_type: String,
    pub token: String,
    pub customer_id: Option<String>,
    pub brand: Option<String>,
    pub last_four: Option<String>,
    pub expiry_month: Option<i32>,
    pub expiry_year: Option<i32>,
    pub holder_name: Option<String>,
    pub is_default: bool,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PaymentMethod {
    pub fn is_card(&self) -> bool {
        self.method_type == "card"
    }

    /// First instant after the expiry month, or `None` when no expiry is recorded.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        let (year, month) = (self.expiry_year?, u32::try_from(self.expiry_month?).ok()?);
        let (next_year, next_month) = if month >= 12 {
            (year + 1, 1)
        } else {
            (year, month + 1)
        };
        let date = NaiveDate::from_ymd_opt(next_year, next_month, 1)?;
        Some(Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?))
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at().is_some_and(|end| now >= end)
    }

    /// Not yet expired, but expiring within `days` of `now`.
    pub fn is_expiring_soon(&self, now: DateTime<Utc>, days: i64) -> bool {
        self.expires_at()
            .is_some_and(|end| now < end && end - now <= Duration::days(days))
    }

    pub fn display_name(&self) -> String {
        match (&self.brand, &self.last_four) {
            (Some(brand), Some(last_four)) => format!("{} **** {}", brand, last_four),
            (None, Some(last_four)) => format!("**** {}", last_four),
            _ => self.method_type.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewPaymentMethod {
    pub user_id: Uuid,
    pub gateway_id: Uuid,
    pub method_type: String,
    pub token: String,
    pub customer_id: Option<String>,
    pub brand: Option<String>,
    pub last_four: Option<String>,
    pub expiry_month: Option<i32>,
    pub expiry_year: Option<i32>,
    pub holder_name: Option<String>,
}

/// Payment attempt status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Pending,
    Processing,
    Success,
    Failed,
    Cancelled,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptStatus::Pending => "pending",
            AttemptStatus::Processing => "processing",
            AttemptStatus::Success => "success",
            AttemptStatus::Failed => "failed",
            AttemptStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "processing" => AttemptStatus::Processing,
            "success" => AttemptStatus::Success,
            "failed" => AttemptStatus::Failed,
            "cancelled" => AttemptStatus::Cancelled,
            _ => AttemptStatus::Pending,
        }
    }

    /// Pending or processing: the gateway may still report an outcome.
    pub fn is_outstanding(&self) -> bool {
        matches!(self, AttemptStatus::Pending | AttemptStatus::Processing)
    }
}

/// One charge attempt against the gateway.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PaymentAttempt {
    pub attempt_id: Uuid,
    pub user_id: Uuid,
    pub gateway_id: Uuid,
    pub payment_method_id: Option<Uuid>,
    pub invoice_id: Option<Uuid>,
    pub transaction_id: Option<Uuid>,
    pub subscription_id: Option<Uuid>,
    pub amount: Decimal,
    pub currency: String,
    pub gateway_order_number: String,
    pub gateway_transaction_id: Option<String>,
    pub status: String,
    pub gateway_response: Option<serde_json::Value>,
    pub gateway_message: Option<String>,
    pub error_message: Option<String>,
    pub retry_count: i32,
    pub attempted_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PaymentAttempt {
    pub fn status(&self) -> AttemptStatus {
        AttemptStatus::from_string(&self.status)
    }
}

#[derive(Debug, Clone)]
pub struct NewPaymentAttempt {
    pub user_id: Uuid,
    pub gateway_id: Uuid,
    pub payment_method_id: Option<Uuid>,
    pub invoice_id: Option<Uuid>,
    pub transaction_id: Option<Uuid>,
    pub subscription_id: Option<Uuid>,
    pub amount: Decimal,
    pub currency: String,
    pub gateway_order_number: String,
    /// Carried forward from the previous attempt of the same dunning cycle.
    pub retry_count: i32,
    pub created_at: DateTime<Utc>,
}

/// Gateway order number: `ORD-{YYYYMMDDHHMMSS}-{6 hex}`.
pub fn generate_order_number(now: DateTime<Utc>) -> String {
    let suffix: [u8; 3] = rand::random();
    format!(
        "ORD-{}-{}",
        now.format("%Y%m%d%H%M%S"),
        hex::encode_upper(suffix)
    )
}
