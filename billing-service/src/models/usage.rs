//! Usage and rate card models.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Rate card entry. A `None` plan is the default rate for every plan.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct UsagePrice {
    pub usage_price_id: Uuid,
    pub plan_id: Option<Uuid>,
    pub action_key: String,
    /// Raw usage units that make up one billable unit.
    pub unit_count: i32,
    pub unit_price: Decimal,
    pub is_active: bool,
}

/// Write-once usage fact.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Usage {
    pub usage_id: Uuid,
    pub user_id: Uuid,
    pub action_key: String,
    pub quantity: i64,
    pub recorded_at: DateTime<Utc>,
}

/// Usage aggregated per action key over a billing period.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct UsageTotal {
    pub action_key: String,
    pub total_quantity: i64,
}
