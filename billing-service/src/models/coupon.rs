//! Coupon model.

use super::EntityRef;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscountType {
    Percentage,
    Fixed,
}

impl DiscountType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscountType::Percentage => "percentage",
            DiscountType::Fixed => "fixed",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "percentage" => DiscountType::Percentage,
            _ => DiscountType::Fixed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CouponUsageType {
    Single,
    Reusable,
    Limited,
}

impl CouponUsageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CouponUsageType::Single => "single",
            CouponUsageType::Reusable => "reusable",
            CouponUsageType::Limited => "limited",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "single" => CouponUsageType::Single,
            "limited" => CouponUsageType::Limited,
            _ => CouponUsageType::Reusable,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Coupon {
    pub coupon_id: Uuid,
    pub code: String,
    pub discount_type: String,
    pub discount_value: Decimal,
    pub valid_from: Option<DateTime<Utc>>,
    pub valid_until: Option<DateTime<Utc>>,
    pub usage_type: String,
    pub max_uses: Option<i32>,
    pub current_uses: i32,
    pub minimum_amount: Option<Decimal>,
    /// `None` applies to every plan.
    pub applicable_plans: Option<Vec<Uuid>>,
    /// `None` applies to every billing mode.
    pub applicable_modes: Option<Vec<String>>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Coupon {
    pub fn discount_type(&self) -> DiscountType {
        DiscountType::from_string(&self.discount_type)
    }

    pub fn usage_type(&self) -> CouponUsageType {
        CouponUsageType::from_string(&self.usage_type)
    }

    /// Upper bound on `current_uses`, if any.
    pub fn use_limit(&self) -> Option<i32> {
        match self.usage_type() {
            CouponUsageType::Single => Some(1),
            CouponUsageType::Limited => Some(self.max_uses.unwrap_or(0)),
            CouponUsageType::Reusable => None,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.use_limit()
            .is_some_and(|limit| self.current_uses >= limit)
    }

    pub fn is_within_window(&self, now: DateTime<Utc>) -> bool {
        self.valid_from.map_or(true, |from| now >= from)
            && self.valid_until.map_or(true, |until| now <= until)
    }
}

/// Audit record of one coupon application.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CouponUsage {
    pub coupon_usage_id: Uuid,
    pub coupon_id: Uuid,
    pub user_id: Uuid,
    pub billable_type: Option<String>,
    pub billable_id: Option<Uuid>,
    pub discount_amount: Decimal,
    pub original_amount: Decimal,
    pub final_amount: Decimal,
    pub used_at: DateTime<Utc>,
}

impl CouponUsage {
    pub fn billable(&self) -> Option<EntityRef> {
        EntityRef::from_columns(self.billable_type.as_deref(), self.billable_id)
    }
}

#[derive(Debug, Clone)]
pub struct NewCouponUsage {
    pub coupon_id: Uuid,
    pub user_id: Uuid,
    pub billable: Option<EntityRef>,
    pub discount_amount: Decimal,
    pub original_amount: Decimal,
    pub final_amount: Decimal,
}
