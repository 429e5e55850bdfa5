//! Invoice model.

use super::{EntityRef, NewCouponUsage, NewRewardApplication};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceType {
    OneTime,
    Subscription,
    Consumption,
    Mixed,
}

impl InvoiceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceType::OneTime => "one_time",
            InvoiceType::Subscription => "subscription",
            InvoiceType::Consumption => "consumption",
            InvoiceType::Mixed => "mixed",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "subscription" => InvoiceType::Subscription,
            "consumption" => InvoiceType::Consumption,
            "mixed" => InvoiceType::Mixed,
            _ => InvoiceType::OneTime,
        }
    }
}

/// Invoice status. Advances monotonically; `Refunded` may only follow `Paid`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Draft,
    Issued,
    Paid,
    Overdue,
    Cancelled,
    Refunded,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Draft => "draft",
            InvoiceStatus::Issued => "issued",
            InvoiceStatus::Paid => "paid",
            InvoiceStatus::Overdue => "overdue",
            InvoiceStatus::Cancelled => "cancelled",
            InvoiceStatus::Refunded => "refunded",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "issued" => InvoiceStatus::Issued,
            "paid" => InvoiceStatus::Paid,
            "overdue" => InvoiceStatus::Overdue,
            "cancelled" => InvoiceStatus::Cancelled,
            "refunded" => InvoiceStatus::Refunded,
            _ => InvoiceStatus::Draft,
        }
    }

    /// States from which `self` may be entered.
    pub fn allowed_sources(&self) -> &'static [InvoiceStatus] {
        match self {
            InvoiceStatus::Draft => &[],
            InvoiceStatus::Issued => &[InvoiceStatus::Draft],
            InvoiceStatus::Paid => &[
                InvoiceStatus::Draft,
                InvoiceStatus::Issued,
                InvoiceStatus::Overdue,
            ],
            InvoiceStatus::Overdue => &[InvoiceStatus::Issued],
            InvoiceStatus::Cancelled => &[
                InvoiceStatus::Draft,
                InvoiceStatus::Issued,
                InvoiceStatus::Overdue,
            ],
            InvoiceStatus::Refunded => &[InvoiceStatus::Paid],
        }
    }

    pub fn can_transition_to(&self, next: InvoiceStatus) -> bool {
        next.allowed_sources().contains(self)
    }

    pub fn source_strings(&self) -> Vec<String> {
        self.allowed_sources()
            .iter()
            .map(|s| s.as_str().to_string())
            .collect()
    }
}

/// Persisted invoice. Amounts are a frozen snapshot and are never recomputed.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Invoice {
    pub invoice_id: Uuid,
    pub invoice_number: String,
    pub user_id: Uuid,
    pub subscription_id: Option<Uuid>,
    pub transaction_id: Option<Uuid>,
    pub invoice_type: String,
    pub issued_at: DateTime<Utc>,
    pub due_at: Option<DateTime<Utc>>,
    pub period_start: Option<DateTime<Utc>>,
    pub period_end: Option<DateTime<Utc>>,
    pub subtotal: Decimal,
    pub discount: Decimal,
    pub tax: Decimal,
    pub total: Decimal,
    pub currency: String,
    pub coupon_id: Option<Uuid>,
    pub status: String,
    pub paid_at: Option<DateTime<Utc>>,
    pub cufe: Option<String>,
    pub qr_code: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Invoice {
    pub fn status(&self) -> InvoiceStatus {
        InvoiceStatus::from_string(&self.status)
    }

    pub fn invoice_type(&self) -> InvoiceType {
        InvoiceType::from_string(&self.invoice_type)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct InvoiceItem {
    pub invoice_item_id: Uuid,
    pub invoice_id: Uuid,
    pub itemable_type: Option<String>,
    pub itemable_id: Option<Uuid>,
    pub description: String,
    pub quantity: Decimal,
    pub unit_price: Decimal,
    pub discount: Decimal,
    pub tax_rate: Decimal,
    pub tax_amount: Decimal,
    pub subtotal: Decimal,
    pub total: Decimal,
    pub position: i32,
}

impl InvoiceItem {
    pub fn itemable(&self) -> Option<EntityRef> {
        EntityRef::from_columns(self.itemable_type.as_deref(), self.itemable_id)
    }
}

#[derive(Debug, Clone)]
pub struct NewInvoiceItem {
    pub itemable: Option<EntityRef>,
    pub description: String,
    pub quantity: Decimal,
    pub unit_price: Decimal,
    pub discount: Decimal,
    pub tax_rate: Decimal,
    pub tax_amount: Decimal,
    pub subtotal: Decimal,
    pub total: Decimal,
}

/// Everything the store needs to persist an invoice in one transaction.
///
/// The invoice number is allocated by the store from `number_prefix` and the
/// year of `issued_at`. Coupon redemption and reward applications are written
/// in the same transaction so a lost redemption race rolls the invoice back.
#[derive(Debug, Clone)]
pub struct NewInvoice {
    pub number_prefix: String,
    pub invoice_type: InvoiceType,
    pub user_id: Uuid,
    pub subscription_id: Option<Uuid>,
    pub transaction_id: Option<Uuid>,
    pub issued_at: DateTime<Utc>,
    pub due_at: Option<DateTime<Utc>>,
    pub period_start: Option<DateTime<Utc>>,
    pub period_end: Option<DateTime<Utc>>,
    pub subtotal: Decimal,
    pub discount: Decimal,
    pub tax: Decimal,
    pub total: Decimal,
    pub currency: String,
    pub coupon_id: Option<Uuid>,
    pub status: InvoiceStatus,
    pub paid_at: Option<DateTime<Utc>>,
    pub metadata: serde_json::Value,
    pub items: Vec<NewInvoiceItem>,
    pub coupon_redemption: Option<NewCouponUsage>,
    pub reward_applications: Vec<NewRewardApplication>,
}

/// `{PREFIX}-{year}-{sequence:04}`.
pub fn format_invoice_number(prefix: &str, year: i32, sequence: u32) -> String {
    format!("{}-{}-{:04}", prefix, year, sequence)
}

/// Sequence part of an invoice number issued under `prefix` in `year`.
pub fn parse_invoice_sequence(number: &str, prefix: &str, year: i32) -> Option<u32> {
    number
        .strip_prefix(&format!("{}-{}-", prefix, year))
        .and_then(|seq| seq.parse().ok())
}
