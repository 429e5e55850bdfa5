//! Referral reward ledger.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RewardType {
    FixedDiscount,
    PercentageRevenue,
    AccountCredit,
    OneTimeCredit,
    PlanUpgrade,
    PermanentDiscount,
}

impl RewardType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RewardType::FixedDiscount => "fixed_discount",
            RewardType::PercentageRevenue => "percentage_revenue",
            RewardType::AccountCredit => "account_credit",
            RewardType::OneTimeCredit => "one_time_credit",
            RewardType::PlanUpgrade => "plan_upgrade",
            RewardType::PermanentDiscount => "permanent_discount",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "percentage_revenue" => RewardType::PercentageRevenue,
            "account_credit" => RewardType::AccountCredit,
            "one_time_credit" => RewardType::OneTimeCredit,
            "plan_upgrade" => RewardType::PlanUpgrade,
            "permanent_discount" => RewardType::PermanentDiscount,
            _ => RewardType::FixedDiscount,
        }
    }

    /// Credits draw down `remaining_value` instead of recurring.
    pub fn is_credit(&self) -> bool {
        matches!(self, RewardType::AccountCredit | RewardType::OneTimeCredit)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RewardStatus {
    Pending,
    Active,
    Completed,
    Expired,
    Cancelled,
}

impl RewardStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RewardStatus::Pending => "pending",
            RewardStatus::Active => "active",
            RewardStatus::Completed => "completed",
            RewardStatus::Expired => "expired",
            RewardStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "active" => RewardStatus::Active,
            "completed" => RewardStatus::Completed,
            "expired" => RewardStatus::Expired,
            "cancelled" => RewardStatus::Cancelled,
            _ => RewardStatus::Pending,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ReferralReward {
    pub reward_id: Uuid,
    pub user_id: Uuid,
    pub referral_id: Option<Uuid>,
    pub reward_type: String,
    pub reward_value: Decimal,
    pub remaining_value: Option<Decimal>,
    pub duration_cycles: Option<i32>,
    pub cycles_applied: i32,
    pub status: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ReferralReward {
    pub fn reward_type(&self) -> RewardType {
        RewardType::from_string(&self.reward_type)
    }

    pub fn status(&self) -> RewardStatus {
        RewardStatus::from_string(&self.status)
    }

    /// Cycle limit, with one-time credits capped at a single cycle.
    pub fn cycle_limit(&self) -> Option<i32> {
        match self.reward_type() {
            RewardType::OneTimeCredit => Some(self.duration_cycles.unwrap_or(1).min(1)),
            _ => self.duration_cycles,
        }
    }

    pub fn can_apply(&self, now: DateTime<Utc>) -> bool {
        if self.status() != RewardStatus::Active {
            return false;
        }
        if self.expires_at.is_some_and(|expires| now > expires) {
            return false;
        }
        if self
            .cycle_limit()
            .is_some_and(|limit| self.cycles_applied >= limit)
        {
            return false;
        }
        if self.reward_type().is_credit()
            && self.remaining_value.unwrap_or(Decimal::ZERO) <= Decimal::ZERO
        {
            return false;
        }
        true
    }
}

/// Audit record of a reward applied to an invoice.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RewardApplication {
    pub application_id: Uuid,
    pub reward_id: Uuid,
    pub invoice_id: Option<Uuid>,
    pub applied_value: Decimal,
    pub applied_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewRewardApplication {
    pub reward_id: Uuid,
    pub applied_value: Decimal,
    /// Whether this application draws down `remaining_value`.
    pub draws_credit: bool,
    /// `cycles_applied` observed when the reward was quoted; the store applies
    /// the increment only if it is unchanged.
    pub expected_cycles_applied: i32,
    pub cycle_limit: Option<i32>,
}
