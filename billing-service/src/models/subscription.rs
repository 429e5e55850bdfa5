//! Subscription model.

use super::InvoiceType;
use chrono::{DateTime, Duration, Months, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use tracing::warn;
use uuid::Uuid;

/// How a subscription's periodic charge is computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingMode {
    Subscription,
    Consumption,
    Mixed,
    Donation,
}

impl BillingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingMode::Subscription => "subscription",
            BillingMode::Consumption => "consumption",
            BillingMode::Mixed => "mixed",
            BillingMode::Donation => "donation",
        }
    }

    pub fn from_string(s: &str) -> Option<Self> {
        match s {
            "subscription" => Some(BillingMode::Subscription),
            "consumption" => Some(BillingMode::Consumption),
            "mixed" => Some(BillingMode::Mixed),
            "donation" => Some(BillingMode::Donation),
            _ => None,
        }
    }

    /// Whether the flat plan price is part of the charge.
    pub fn includes_plan_price(&self) -> bool {
        !matches!(self, BillingMode::Consumption)
    }

    /// Whether metered usage is part of the charge.
    pub fn includes_consumption(&self) -> bool {
        matches!(self, BillingMode::Consumption | BillingMode::Mixed)
    }

    pub fn invoice_type(&self) -> InvoiceType {
        match self {
            BillingMode::Consumption => InvoiceType::Consumption,
            BillingMode::Mixed => InvoiceType::Mixed,
            BillingMode::Subscription | BillingMode::Donation => InvoiceType::Subscription,
        }
    }
}

/// Subscription status. `Cancelled` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Paused,
    Cancelled,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Paused => "paused",
            SubscriptionStatus::Cancelled => "cancelled",
        }
    }

    /// Unknown values read as `Paused` so a corrupted row is never billed.
    pub fn from_string(s: &str) -> Self {
        match s {
            "active" => SubscriptionStatus::Active,
            "paused" => SubscriptionStatus::Paused,
            "cancelled" => SubscriptionStatus::Cancelled,
            other => {
                warn!(status = other, "Unknown subscription status, treating as paused");
                SubscriptionStatus::Paused
            }
        }
    }
}

/// Subscription. `ends_at` is both the paid-through date and the next due date.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Subscription {
    pub subscription_id: Uuid,
    pub user_id: Uuid,
    pub plan_id: Uuid,
    pub billing_mode: String,
    pub status: String,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    pub fn status(&self) -> SubscriptionStatus {
        SubscriptionStatus::from_string(&self.status)
    }

    /// `None` for a billing mode this engine does not know how to price.
    pub fn billing_mode(&self) -> Option<BillingMode> {
        BillingMode::from_string(&self.billing_mode)
    }

    pub fn is_active(&self) -> bool {
        self.status() == SubscriptionStatus::Active
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.is_active() && self.ends_at <= now
    }

    /// The period that follows a successful charge: `[ends_at, ends_at + 1 month)`.
    pub fn next_period(&self) -> (DateTime<Utc>, DateTime<Utc>) {
        (self.ends_at, add_billing_period(self.ends_at))
    }
}

/// Advance a timestamp by one billing period (one calendar month).
pub fn add_billing_period(at: DateTime<Utc>) -> DateTime<Utc> {
    at.checked_add_months(Months::new(1))
        .unwrap_or_else(|| at + Duration::days(30))
}

/// Audit trail written into subscription metadata on cancellation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cancellation {
    pub reason: String,
    pub details: String,
    pub cancelled_at: DateTime<Utc>,
}

impl Cancellation {
    pub fn payment_failure(cancelled_at: DateTime<Utc>) -> Self {
        Self {
            reason: "payment_failure".to_string(),
            details: "Maximum payment retry attempts reached".to_string(),
            cancelled_at,
        }
    }

    /// Merge into an existing metadata map, keeping unrelated keys.
    pub fn merge_into(&self, metadata: &serde_json::Value) -> serde_json::Value {
        let mut merged = match metadata {
            serde_json::Value::Object(map) => map.clone(),
            _ => serde_json::Map::new(),
        };
        merged.insert(
            "cancellation_reason".to_string(),
            serde_json::Value::String(self.reason.clone()),
        );
        merged.insert(
            "cancellation_details".to_string(),
            serde_json::Value::String(self.details.clone()),
        );
        merged.insert(
            "cancelled_at".to_string(),
            serde_json::Value::String(self.cancelled_at.to_rfc3339()),
        );
        serde_json::Value::Object(merged)
    }
}

/// Where billing notices for a user are sent.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct BillingContact {
    pub user_id: Uuid,
    pub email: String,
    pub name: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn billing_period_clamps_to_month_end() {
        let jan_31 = Utc.with_ymd_and_hms(2024, 1, 31, 10, 0, 0).unwrap();
        let next = add_billing_period(jan_31);
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 2, 29, 10, 0, 0).unwrap());
    }

    #[test]
    fn unknown_column_values_are_not_billable() {
        assert_eq!(SubscriptionStatus::from_string("suspended"), SubscriptionStatus::Paused);
        assert_eq!(SubscriptionStatus::from_string("active"), SubscriptionStatus::Active);
        assert_eq!(BillingMode::from_string("weekly"), None);
        assert_eq!(BillingMode::from_string("donation"), Some(BillingMode::Donation));
    }

    #[test]
    fn cancellation_merges_into_existing_metadata() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let metadata = serde_json::json!({ "source": "signup" });
        let merged = Cancellation::payment_failure(at).merge_into(&metadata);

        assert_eq!(merged["source"], "signup");
        assert_eq!(merged["cancellation_reason"], "payment_failure");
        assert_eq!(
            merged["cancellation_details"],
            "Maximum payment retry attempts reached"
        );
        assert_eq!(merged["cancelled_at"], at.to_rfc3339());
    }

    #[test]
    fn donation_is_billed_at_plan_price() {
        assert!(BillingMode::Donation.includes_plan_price());
        assert!(!BillingMode::Donation.includes_consumption());
        assert!(!BillingMode::Consumption.includes_plan_price());
        assert_eq!(BillingMode::Mixed.invoice_type(), InvoiceType::Mixed);
    }
}
