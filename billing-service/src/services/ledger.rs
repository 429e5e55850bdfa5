//! Ledger and discount calculator.
//!
//! Pure functions: charge breakdowns from plan price and metered usage, and
//! discount quotes from coupons and referral rewards. Nothing here touches the
//! store; callers fetch inputs and persist outcomes.

use crate::models::{
    BillingMode, Coupon, DiscountType, ReferralReward, RewardType, UsagePrice, UsageTotal,
};
use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;
use std::collections::BTreeMap;
use thiserror::Error;
use uuid::Uuid;

/// Fractional digits for invoice-facing amounts.
pub const AMOUNT_SCALE: u32 = 2;
/// Fractional digits for usage pricing.
pub const RATE_SCALE: u32 = 6;

pub fn round_amount(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(AMOUNT_SCALE, RoundingStrategy::MidpointAwayFromZero)
}

pub fn round_rate(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(RATE_SCALE, RoundingStrategy::MidpointAwayFromZero)
}

/// Priced usage for one action key.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsumptionLine {
    pub action_key: String,
    pub total_quantity: i64,
    pub unit_count: i32,
    pub billable_units: i64,
    pub unit_price: Decimal,
    pub amount: Decimal,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConsumptionCharge {
    pub lines: Vec<ConsumptionLine>,
    /// Action keys with usage but no rate; they contribute zero.
    pub unrated_actions: Vec<String>,
    /// Sum of line amounts at rate precision.
    pub total: Decimal,
}

/// Pick the rate for `action_key`: a row for `plan_id` wins over the global row.
pub fn resolve_rate<'a>(
    rates: &'a [UsagePrice],
    plan_id: Uuid,
    action_key: &str,
) -> Option<&'a UsagePrice> {
    let mut global = None;
    for rate in rates
        .iter()
        .filter(|r| r.is_active && r.action_key == action_key)
    {
        match rate.plan_id {
            Some(id) if id == plan_id => return Some(rate),
            None if global.is_none() => global = Some(rate),
            _ => {}
        }
    }
    global
}

/// Σ floor(quantity / unit_count) × unit_price over distinct action keys.
pub fn consumption_charge(
    totals: &[UsageTotal],
    rates: &[UsagePrice],
    plan_id: Uuid,
) -> ConsumptionCharge {
    // Merge duplicate keys so each action is priced once.
    let mut by_key: BTreeMap<&str, i64> = BTreeMap::new();
    for total in totals {
        *by_key.entry(total.action_key.as_str()).or_default() += total.total_quantity;
    }

    let mut charge = ConsumptionCharge::default();
    for (action_key, quantity) in by_key {
        let Some(rate) = resolve_rate(rates, plan_id, action_key) else {
            charge.unrated_actions.push(action_key.to_string());
            continue;
        };
        if rate.unit_count <= 0 {
            charge.unrated_actions.push(action_key.to_string());
            continue;
        }

        let billable_units = quantity.max(0) / i64::from(rate.unit_count);
        let amount = round_rate(Decimal::from(billable_units) * rate.unit_price);
        charge.total += amount;
        charge.lines.push(ConsumptionLine {
            action_key: action_key.to_string(),
            total_quantity: quantity,
            unit_count: rate.unit_count,
            billable_units,
            unit_price: rate.unit_price,
            amount,
        });
    }
    charge.total = round_rate(charge.total);
    charge
}

/// Period charge before discounts.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChargeBreakdown {
    pub billing_mode: BillingMode,
    pub plan_amount: Decimal,
    pub consumption: ConsumptionCharge,
    pub consumption_amount: Decimal,
    pub subtotal: Decimal,
}

pub fn charge_breakdown(
    billing_mode: BillingMode,
    plan_price: Decimal,
    consumption: ConsumptionCharge,
) -> ChargeBreakdown {
    let plan_amount = if billing_mode.includes_plan_price() {
        round_amount(plan_price.max(Decimal::ZERO))
    } else {
        Decimal::ZERO
    };
    let consumption_amount = if billing_mode.includes_consumption() {
        round_amount(consumption.total)
    } else {
        Decimal::ZERO
    };

    ChargeBreakdown {
        billing_mode,
        plan_amount,
        consumption,
        consumption_amount,
        subtotal: plan_amount + consumption_amount,
    }
}

/// Why a coupon cannot be applied.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CouponRejection {
    #[error("coupon not found")]
    NotFound,
    #[error("coupon is not active or outside its validity window")]
    Inactive,
    #[error("coupon usage limit reached")]
    UsageLimitReached,
    #[error("amount is below the coupon minimum of {minimum}")]
    BelowMinimum { minimum: Decimal },
    #[error("coupon does not apply to this plan")]
    PlanNotApplicable,
    #[error("coupon does not apply to this billing mode")]
    ModeNotApplicable,
}

impl CouponRejection {
    pub fn code(&self) -> &'static str {
        match self {
            CouponRejection::NotFound => "coupon_not_found",
            CouponRejection::Inactive => "coupon_inactive",
            CouponRejection::UsageLimitReached => "coupon_exhausted",
            CouponRejection::BelowMinimum { .. } => "coupon_below_minimum",
            CouponRejection::PlanNotApplicable => "coupon_plan_not_applicable",
            CouponRejection::ModeNotApplicable => "coupon_mode_not_applicable",
        }
    }
}

/// What the coupon is being applied to.
#[derive(Debug, Clone, Copy)]
pub struct CouponContext {
    pub amount: Decimal,
    pub plan_id: Option<Uuid>,
    pub billing_mode: Option<BillingMode>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CouponQuote {
    pub coupon_id: Uuid,
    pub code: String,
    pub original_amount: Decimal,
    pub discount: Decimal,
    pub final_amount: Decimal,
}

/// Discount a coupon grants on `amount`, never more than the amount itself.
pub fn coupon_discount(coupon: &Coupon, amount: Decimal) -> Decimal {
    let amount = amount.max(Decimal::ZERO);
    let raw = match coupon.discount_type() {
        DiscountType::Percentage => amount * coupon.discount_value / Decimal::ONE_HUNDRED,
        DiscountType::Fixed => coupon.discount_value.min(amount),
    };
    round_amount(raw.max(Decimal::ZERO).min(amount))
}

/// Read-only validation. Checks run in a fixed order and the first failure wins.
pub fn validate_coupon(
    coupon: Option<&Coupon>,
    context: &CouponContext,
    now: DateTime<Utc>,
) -> Result<CouponQuote, CouponRejection> {
    let coupon = coupon.ok_or(CouponRejection::NotFound)?;

    if !coupon.is_active || !coupon.is_within_window(now) {
        return Err(CouponRejection::Inactive);
    }
    if coupon.is_exhausted() {
        return Err(CouponRejection::UsageLimitReached);
    }
    if let Some(minimum) = coupon.minimum_amount {
        if context.amount < minimum {
            return Err(CouponRejection::BelowMinimum { minimum });
        }
    }
    if let (Some(plans), Some(plan_id)) = (&coupon.applicable_plans, context.plan_id) {
        if !plans.is_empty() && !plans.contains(&plan_id) {
            return Err(CouponRejection::PlanNotApplicable);
        }
    }
    if let (Some(modes), Some(mode)) = (&coupon.applicable_modes, context.billing_mode) {
        if !modes.is_empty() && !modes.iter().any(|m| m == mode.as_str()) {
            return Err(CouponRejection::ModeNotApplicable);
        }
    }

    let discount = coupon_discount(coupon, context.amount);
    Ok(CouponQuote {
        coupon_id: coupon.coupon_id,
        code: coupon.code.clone(),
        original_amount: round_amount(context.amount),
        discount,
        final_amount: round_amount(context.amount - discount),
    })
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RewardQuote {
    pub reward_id: Uuid,
    pub reward_type: RewardType,
    pub applied_value: Decimal,
    pub expected_cycles_applied: i32,
    pub cycle_limit: Option<i32>,
}

/// Discount a single reward grants on `amount`.
pub fn reward_discount(reward: &ReferralReward, amount: Decimal) -> Decimal {
    let amount = amount.max(Decimal::ZERO);
    let raw = match reward.reward_type() {
        RewardType::FixedDiscount => reward.reward_value.min(amount),
        RewardType::PercentageRevenue | RewardType::PermanentDiscount => {
            amount * reward.reward_value / Decimal::ONE_HUNDRED
        }
        RewardType::AccountCredit | RewardType::OneTimeCredit => {
            reward.remaining_value.unwrap_or(Decimal::ZERO).min(amount)
        }
        RewardType::PlanUpgrade => Decimal::ZERO,
    };
    round_amount(raw.max(Decimal::ZERO).min(amount))
}

/// Quote every applicable reward in order, each against what is left of `amount`.
///
/// Zero-value rewards (plan upgrades) are still quoted so their cycle is
/// recorded.
pub fn quote_rewards(
    rewards: &[ReferralReward],
    amount: Decimal,
    now: DateTime<Utc>,
) -> Vec<RewardQuote> {
    let mut remaining = amount.max(Decimal::ZERO);
    let mut quotes = Vec::new();
    for reward in rewards.iter().filter(|r| r.can_apply(now)) {
        let applied_value = reward_discount(reward, remaining);
        remaining -= applied_value;
        quotes.push(RewardQuote {
            reward_id: reward.reward_id,
            reward_type: reward.reward_type(),
            applied_value,
            expected_cycles_applied: reward.cycles_applied,
            cycle_limit: reward.cycle_limit(),
        });
    }
    quotes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CouponUsageType, RewardStatus};
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn rate(plan_id: Option<Uuid>, key: &str, unit_count: i32, unit_price: Decimal) -> UsagePrice {
        UsagePrice {
            usage_price_id: Uuid::new_v4(),
            plan_id,
            action_key: key.to_string(),
            unit_count,
            unit_price,
            is_active: true,
        }
    }

    fn total(key: &str, quantity: i64) -> UsageTotal {
        UsageTotal {
            action_key: key.to_string(),
            total_quantity: quantity,
        }
    }

    fn coupon(discount_type: DiscountType, value: Decimal) -> Coupon {
        let now = Utc::now();
        Coupon {
            coupon_id: Uuid::new_v4(),
            code: "WELCOME".to_string(),
            discount_type: discount_type.as_str().to_string(),
            discount_value: value,
            valid_from: None,
            valid_until: None,
            usage_type: CouponUsageType::Reusable.as_str().to_string(),
            max_uses: None,
            current_uses: 0,
            minimum_amount: None,
            applicable_plans: None,
            applicable_modes: None,
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }

    fn reward(reward_type: RewardType, value: Decimal, remaining: Option<Decimal>) -> ReferralReward {
        let now = Utc::now();
        ReferralReward {
            reward_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            referral_id: None,
            reward_type: reward_type.as_str().to_string(),
            reward_value: value,
            remaining_value: remaining,
            duration_cycles: None,
            cycles_applied: 0,
            status: RewardStatus::Active.as_str().to_string(),
            expires_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn context(amount: Decimal) -> CouponContext {
        CouponContext {
            amount,
            plan_id: None,
            billing_mode: None,
        }
    }

    #[test]
    fn plan_specific_rate_overrides_global_rate() {
        let plan_id = Uuid::new_v4();
        let rates = vec![
            rate(None, "api_call", 100, dec!(5)),
            rate(Some(plan_id), "api_call", 100, dec!(2)),
            rate(Some(Uuid::new_v4()), "api_call", 1, dec!(99)),
        ];

        let charge = consumption_charge(&[total("api_call", 1050)], &rates, plan_id);
        assert_eq!(charge.total, dec!(20));
        assert_eq!(charge.lines[0].billable_units, 10);

        let other_plan = Uuid::new_v4();
        let charge = consumption_charge(&[total("api_call", 1050)], &rates, other_plan);
        assert_eq!(charge.total, dec!(50));
    }

    #[test]
    fn contribution_floors_partial_units() {
        let plan_id = Uuid::new_v4();
        let rates = vec![rate(None, "sms", 50, dec!(0.000125))];

        for (quantity, expected) in [
            (0, dec!(0)),
            (49, dec!(0)),
            (50, dec!(0.000125)),
            (149, dec!(0.000250)),
            (1_000_000, dec!(2.5)),
        ] {
            let charge = consumption_charge(&[total("sms", quantity)], &rates, plan_id);
            assert_eq!(charge.total, expected, "quantity {}", quantity);
        }
    }

    #[test]
    fn unrated_actions_contribute_zero_and_are_reported() {
        let plan_id = Uuid::new_v4();
        let rates = vec![rate(None, "api_call", 10, dec!(1))];
        let charge = consumption_charge(
            &[total("api_call", 25), total("export", 400)],
            &rates,
            plan_id,
        );

        assert_eq!(charge.total, dec!(2));
        assert_eq!(charge.unrated_actions, vec!["export".to_string()]);
    }

    #[test]
    fn inactive_rates_are_ignored() {
        let plan_id = Uuid::new_v4();
        let mut specific = rate(Some(plan_id), "api_call", 1, dec!(3));
        specific.is_active = false;
        let rates = vec![specific, rate(None, "api_call", 1, dec!(1))];

        let chosen = resolve_rate(&rates, plan_id, "api_call").unwrap();
        assert_eq!(chosen.unit_price, dec!(1));
    }

    #[test]
    fn breakdown_depends_on_billing_mode() {
        let consumption = ConsumptionCharge {
            lines: vec![],
            unrated_actions: vec![],
            total: dec!(20.004),
        };

        let mixed = charge_breakdown(BillingMode::Mixed, dec!(50), consumption.clone());
        assert_eq!(mixed.subtotal, dec!(70.00));

        let flat = charge_breakdown(BillingMode::Subscription, dec!(50), consumption.clone());
        assert_eq!(flat.subtotal, dec!(50));
        assert_eq!(flat.consumption_amount, Decimal::ZERO);

        let metered = charge_breakdown(BillingMode::Consumption, dec!(50), consumption);
        assert_eq!(metered.plan_amount, Decimal::ZERO);
        assert_eq!(metered.subtotal, dec!(20.00));
    }

    #[test]
    fn percentage_coupon_respects_minimum() {
        let mut ten_percent = coupon(DiscountType::Percentage, dec!(10));
        ten_percent.minimum_amount = Some(dec!(50));

        let quote = validate_coupon(Some(&ten_percent), &context(dec!(70)), Utc::now()).unwrap();
        assert_eq!(quote.discount, dec!(7));
        assert_eq!(quote.final_amount, dec!(63));

        let err = validate_coupon(Some(&ten_percent), &context(dec!(40)), Utc::now()).unwrap_err();
        assert_eq!(err, CouponRejection::BelowMinimum { minimum: dec!(50) });
    }

    #[test]
    fn fixed_coupon_never_exceeds_amount() {
        let fixed = coupon(DiscountType::Fixed, dec!(25));
        assert_eq!(coupon_discount(&fixed, dec!(100)), dec!(25));
        assert_eq!(coupon_discount(&fixed, dec!(10)), dec!(10));
    }

    #[test]
    fn coupon_checks_run_in_order() {
        let now = Utc::now();
        let plan_id = Uuid::new_v4();

        assert_eq!(
            validate_coupon(None, &context(dec!(10)), now).unwrap_err(),
            CouponRejection::NotFound
        );

        let mut expired = coupon(DiscountType::Fixed, dec!(5));
        expired.valid_until = Some(now - Duration::days(1));
        expired.minimum_amount = Some(dec!(1000));
        assert_eq!(
            validate_coupon(Some(&expired), &context(dec!(10)), now).unwrap_err(),
            CouponRejection::Inactive
        );

        let mut used = coupon(DiscountType::Fixed, dec!(5));
        used.usage_type = "single".to_string();
        used.current_uses = 1;
        assert_eq!(
            validate_coupon(Some(&used), &context(dec!(10)), now).unwrap_err(),
            CouponRejection::UsageLimitReached
        );

        let mut limited = coupon(DiscountType::Fixed, dec!(5));
        limited.usage_type = "limited".to_string();
        limited.max_uses = Some(3);
        limited.current_uses = 2;
        assert!(validate_coupon(Some(&limited), &context(dec!(10)), now).is_ok());
        limited.current_uses = 3;
        assert_eq!(
            validate_coupon(Some(&limited), &context(dec!(10)), now).unwrap_err(),
            CouponRejection::UsageLimitReached
        );

        let mut plan_bound = coupon(DiscountType::Fixed, dec!(5));
        plan_bound.applicable_plans = Some(vec![Uuid::new_v4()]);
        plan_bound.applicable_modes = Some(vec!["consumption".to_string()]);
        let ctx = CouponContext {
            amount: dec!(10),
            plan_id: Some(plan_id),
            billing_mode: Some(BillingMode::Subscription),
        };
        assert_eq!(
            validate_coupon(Some(&plan_bound), &ctx, now).unwrap_err(),
            CouponRejection::PlanNotApplicable
        );

        plan_bound.applicable_plans = Some(vec![plan_id]);
        assert_eq!(
            validate_coupon(Some(&plan_bound), &ctx, now).unwrap_err(),
            CouponRejection::ModeNotApplicable
        );
    }

    #[test]
    fn rewards_stack_against_remaining_amount() {
        let now = Utc::now();
        let rewards = vec![
            reward(RewardType::PercentageRevenue, dec!(10), None),
            reward(RewardType::AccountCredit, dec!(500), Some(dec!(500))),
            reward(RewardType::FixedDiscount, dec!(5), None),
        ];

        let quotes = quote_rewards(&rewards, dec!(100), now);
        let values: Vec<Decimal> = quotes.iter().map(|q| q.applied_value).collect();
        assert_eq!(values, vec![dec!(10), dec!(90), dec!(0)]);
    }

    #[test]
    fn exhausted_rewards_are_not_quoted() {
        let now = Utc::now();
        let mut spent = reward(RewardType::AccountCredit, dec!(50), Some(dec!(0)));
        spent.cycles_applied = 2;
        let mut capped = reward(RewardType::FixedDiscount, dec!(5), None);
        capped.duration_cycles = Some(3);
        capped.cycles_applied = 3;
        let mut one_time = reward(RewardType::OneTimeCredit, dec!(20), Some(dec!(20)));
        one_time.cycles_applied = 1;

        assert!(quote_rewards(&[spent, capped, one_time], dec!(100), now).is_empty());
    }
}
