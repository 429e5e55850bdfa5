//! Invoice builder.
//!
//! Turns a charge breakdown into a persisted, frozen invoice. Amounts are
//! computed here once; the store only allocates the number and writes rows.

use crate::error::BillingError;
use crate::models::{
    EntityKind, EntityRef, Invoice, InvoiceStatus, InvoiceType, NewInvoice, NewInvoiceItem,
    NewRewardApplication, Plan, Subscription, Transaction, TransactionStatus,
};
use crate::services::coupons::{redemption_for, CouponService};
use crate::services::ledger::{
    charge_breakdown, consumption_charge, quote_rewards, round_amount, ChargeBreakdown,
    CouponContext, CouponQuote, CouponRejection, RewardQuote,
};
use crate::services::metrics::record_invoice_issued;
use crate::services::store::BillingStore;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::json;
use service_core::error::AppError;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Numbering and defaults for new invoices.
#[derive(Debug, Clone)]
pub struct InvoiceSettings {
    pub prefix: String,
    pub currency: String,
    pub due_days: i64,
}

impl Default for InvoiceSettings {
    fn default() -> Self {
        Self {
            prefix: "INV".to_string(),
            currency: "COP".to_string(),
            due_days: 30,
        }
    }
}

/// A fully priced subscription period, before anything is persisted.
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionQuote {
    pub subscription_id: Uuid,
    pub plan_id: Uuid,
    pub plan_name: String,
    /// Service period the plan fee covers.
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    /// Usage window priced in arrears.
    pub usage_from: DateTime<Utc>,
    pub usage_to: DateTime<Utc>,
    pub breakdown: ChargeBreakdown,
    pub coupon: Option<CouponQuote>,
    pub rewards: Vec<RewardQuote>,
    pub discount: Decimal,
    pub total: Decimal,
}

#[derive(Clone)]
pub struct InvoiceBuilder {
    store: Arc<dyn BillingStore>,
    coupons: CouponService,
    settings: InvoiceSettings,
}

impl InvoiceBuilder {
    pub fn new(store: Arc<dyn BillingStore>, settings: InvoiceSettings) -> Self {
        Self {
            coupons: CouponService::new(store.clone()),
            store,
            settings,
        }
    }

    pub fn settings(&self) -> &InvoiceSettings {
        &self.settings
    }

    /// Price the next period of `subscription` without persisting anything.
    #[instrument(skip(self, subscription), fields(subscription_id = %subscription.subscription_id))]
    pub async fn quote_subscription(
        &self,
        subscription: &Subscription,
        coupon_code: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<SubscriptionQuote, BillingError> {
        let Some(mode) = subscription.billing_mode() else {
            warn!(billing_mode = %subscription.billing_mode, "Unknown billing mode, refusing to price");
            return Err(BillingError::Store(AppError::InternalError(anyhow::anyhow!(
                "Subscription {} has unknown billing mode '{}'",
                subscription.subscription_id,
                subscription.billing_mode
            ))));
        };
        let plan = self.load_plan(subscription.plan_id).await?;
        let (period_start, period_end) = subscription.next_period();
        let (usage_from, usage_to) = (subscription.starts_at, subscription.ends_at);

        let consumption = if mode.includes_consumption() {
            let totals = self
                .store
                .usage_totals(subscription.user_id, usage_from, usage_to)
                .await?;
            let rates = self.store.rate_card(plan.plan_id).await?;
            consumption_charge(&totals, &rates, plan.plan_id)
        } else {
            Default::default()
        };
        if !consumption.unrated_actions.is_empty() {
            warn!(
                unrated_actions = ?consumption.unrated_actions,
                plan_id = %plan.plan_id,
                "Usage without a rate card entry contributes zero"
            );
        }

        let breakdown = charge_breakdown(mode, plan.price, consumption);

        let coupon = match coupon_code {
            Some(code) => {
                let context = CouponContext {
                    amount: breakdown.subtotal,
                    plan_id: Some(plan.plan_id),
                    billing_mode: Some(mode),
                };
                Some(self.coupons.validate(code, &context, now).await?)
            }
            None => None,
        };
        let coupon_discount = coupon.as_ref().map_or(Decimal::ZERO, |c| c.discount);

        let rewards = self.store.active_rewards(subscription.user_id).await?;
        let reward_quotes = quote_rewards(&rewards, breakdown.subtotal - coupon_discount, now);
        let reward_discount: Decimal = reward_quotes.iter().map(|r| r.applied_value).sum();

        let discount = round_amount((coupon_discount + reward_discount).min(breakdown.subtotal));
        let total = round_amount(breakdown.subtotal - discount);

        Ok(SubscriptionQuote {
            subscription_id: subscription.subscription_id,
            plan_id: plan.plan_id,
            plan_name: plan.name,
            period_start,
            period_end,
            usage_from,
            usage_to,
            breakdown,
            coupon,
            rewards: reward_quotes,
            discount,
            total,
        })
    }

    /// Persist the invoice for the next period of `subscription`, as `draft`.
    #[instrument(skip(self, subscription), fields(subscription_id = %subscription.subscription_id))]
    pub async fn build_for_subscription(
        &self,
        subscription: &Subscription,
        coupon_code: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Invoice, BillingError> {
        let mut retried = false;
        loop {
            let quote = self.quote_subscription(subscription, coupon_code, now).await?;
            let new_invoice = self.subscription_invoice(subscription, &quote, now);

            match self.store.create_invoice(&new_invoice).await {
                Ok(invoice) => {
                    record_invoice_issued(invoice.invoice_type.as_str());
                    info!(
                        invoice_number = %invoice.invoice_number,
                        subtotal = %invoice.subtotal,
                        discount = %invoice.discount,
                        total = %invoice.total,
                        "Subscription invoice created"
                    );
                    return Ok(invoice);
                }
                // A coupon or reward guard moved under us: re-quote once so the
                // rejection surfaces through validation.
                Err(AppError::Conflict(e)) if !retried => {
                    warn!(error = %e, "Invoice discount guard rejected write, re-quoting");
                    retried = true;
                }
                Err(AppError::Conflict(e)) if coupon_code.is_some() => {
                    warn!(error = %e, "Invoice discount guard rejected write twice");
                    return Err(BillingError::InvalidCoupon(
                        CouponRejection::UsageLimitReached,
                    ));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Persist the invoice of a one-time purchase. It is `paid` immediately
    /// when the transaction has already completed.
    #[instrument(skip(self))]
    pub async fn build_for_transaction(
        &self,
        transaction_id: Uuid,
        coupon_code: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Invoice, BillingError> {
        let transaction = self
            .store
            .get_transaction(transaction_id)
            .await?
            .ok_or(BillingError::TransactionNotFound(transaction_id))?;

        let subtotal = round_amount(transaction.amount.max(Decimal::ZERO));
        let coupon = match coupon_code {
            Some(code) => {
                let plan_id = transaction
                    .purchasable()
                    .filter(|r| r.kind == EntityKind::Plan)
                    .map(|r| r.id);
                let context = CouponContext {
                    amount: subtotal,
                    plan_id,
                    billing_mode: None,
                };
                Some(self.coupons.validate(code, &context, now).await?)
            }
            None => None,
        };

        let new_invoice = self.transaction_invoice(&transaction, subtotal, coupon.as_ref(), now);
        let invoice = match self.store.create_invoice(&new_invoice).await {
            Ok(invoice) => invoice,
            Err(AppError::Conflict(e)) => {
                warn!(error = %e, "Coupon redemption lost the usage guard");
                return Err(BillingError::InvalidCoupon(
                    CouponRejection::UsageLimitReached,
                ));
            }
            Err(e) => return Err(e.into()),
        };

        record_invoice_issued(invoice.invoice_type.as_str());
        info!(
            invoice_number = %invoice.invoice_number,
            transaction_id = %transaction_id,
            status = %invoice.status,
            "One-time invoice created"
        );
        Ok(invoice)
    }

    pub async fn mark_issued(&self, invoice_id: Uuid, now: DateTime<Utc>) -> Result<Invoice, AppError> {
        self.transition(invoice_id, InvoiceStatus::Issued, now).await
    }

    pub async fn mark_paid(&self, invoice_id: Uuid, now: DateTime<Utc>) -> Result<Invoice, AppError> {
        self.transition(invoice_id, InvoiceStatus::Paid, now).await
    }

    pub async fn mark_overdue(&self, invoice_id: Uuid, now: DateTime<Utc>) -> Result<Invoice, AppError> {
        self.transition(invoice_id, InvoiceStatus::Overdue, now).await
    }

    pub async fn cancel(&self, invoice_id: Uuid, now: DateTime<Utc>) -> Result<Invoice, AppError> {
        self.transition(invoice_id, InvoiceStatus::Cancelled, now).await
    }

    pub async fn refund(&self, invoice_id: Uuid, now: DateTime<Utc>) -> Result<Invoice, AppError> {
        self.transition(invoice_id, InvoiceStatus::Refunded, now).await
    }

    #[instrument(skip(self))]
    async fn transition(
        &self,
        invoice_id: Uuid,
        to: InvoiceStatus,
        now: DateTime<Utc>,
    ) -> Result<Invoice, AppError> {
        if let Some(invoice) = self.store.transition_invoice(invoice_id, to, now).await? {
            info!(
                invoice_number = %invoice.invoice_number,
                status = to.as_str(),
                "Invoice status changed"
            );
            return Ok(invoice);
        }

        let current = self
            .store
            .get_invoice(invoice_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Invoice {} not found", invoice_id)))?;
        Err(AppError::Conflict(anyhow::anyhow!(
            "Invoice {} cannot move from {} to {}",
            current.invoice_number,
            current.status,
            to.as_str()
        )))
    }

    async fn load_plan(&self, plan_id: Uuid) -> Result<Plan, BillingError> {
        self.store
            .get_plan(plan_id)
            .await?
            .ok_or(BillingError::PlanNotFound(plan_id))
    }

    fn subscription_invoice(
        &self,
        subscription: &Subscription,
        quote: &SubscriptionQuote,
        now: DateTime<Utc>,
    ) -> NewInvoice {
        let month = quote.period_start.format("%b %Y");
        let mut items = Vec::new();
        if quote.breakdown.plan_amount > Decimal::ZERO {
            items.push(line_item(
                Some(EntityRef::plan(quote.plan_id)),
                format!("Plan {} - {}", quote.plan_name, month),
                quote.breakdown.plan_amount,
            ));
        }
        if quote.breakdown.consumption_amount > Decimal::ZERO {
            items.push(line_item(
                Some(EntityRef::subscription(subscription.subscription_id)),
                format!("Consumo - {}", month),
                quote.breakdown.consumption_amount,
            ));
        }
        allocate_discount(&mut items, quote.discount);

        let metadata = json!({
            "billing_mode": quote.breakdown.billing_mode.as_str(),
            "period_start": quote.period_start.to_rfc3339(),
            "period_end": quote.period_end.to_rfc3339(),
            "usage_from": quote.usage_from.to_rfc3339(),
            "usage_to": quote.usage_to.to_rfc3339(),
            "consumption": quote.breakdown.consumption.lines,
            "unrated_actions": quote.breakdown.consumption.unrated_actions,
            "coupon_code": quote.coupon.as_ref().map(|c| c.code.clone()),
            "rewards": quote.rewards,
        });

        NewInvoice {
            number_prefix: self.settings.prefix.clone(),
            invoice_type: quote.breakdown.billing_mode.invoice_type(),
            user_id: subscription.user_id,
            subscription_id: Some(subscription.subscription_id),
            transaction_id: None,
            issued_at: now,
            due_at: Some(now + Duration::days(self.settings.due_days)),
            period_start: Some(quote.period_start),
            period_end: Some(quote.period_end),
            subtotal: quote.breakdown.subtotal,
            discount: quote.discount,
            tax: Decimal::ZERO,
            total: quote.total,
            currency: self.settings.currency.clone(),
            coupon_id: quote.coupon.as_ref().map(|c| c.coupon_id),
            status: InvoiceStatus::Draft,
            paid_at: None,
            metadata,
            items,
            coupon_redemption: quote.coupon.as_ref().map(|c| {
                redemption_for(
                    c,
                    subscription.user_id,
                    Some(EntityRef::subscription(subscription.subscription_id)),
                )
            }),
            reward_applications: quote
                .rewards
                .iter()
                .map(|r| NewRewardApplication {
                    reward_id: r.reward_id,
                    applied_value: r.applied_value,
                    draws_credit: r.reward_type.is_credit(),
                    expected_cycles_applied: r.expected_cycles_applied,
                    cycle_limit: r.cycle_limit,
                })
                .collect(),
        }
    }

    fn transaction_invoice(
        &self,
        transaction: &Transaction,
        subtotal: Decimal,
        coupon: Option<&CouponQuote>,
        now: DateTime<Utc>,
    ) -> NewInvoice {
        let discount = coupon.map_or(Decimal::ZERO, |c| c.discount);
        let mut items = vec![line_item(
            transaction
                .purchasable()
                .or(Some(EntityRef::transaction(transaction.transaction_id))),
            transaction.description.clone(),
            subtotal,
        )];
        allocate_discount(&mut items, discount);

        let completed = transaction.status() == TransactionStatus::Completed;
        NewInvoice {
            number_prefix: self.settings.prefix.clone(),
            invoice_type: InvoiceType::OneTime,
            user_id: transaction.user_id,
            subscription_id: None,
            transaction_id: Some(transaction.transaction_id),
            issued_at: now,
            due_at: Some(now + Duration::days(self.settings.due_days)),
            period_start: None,
            period_end: None,
            subtotal,
            discount,
            tax: Decimal::ZERO,
            total: round_amount(subtotal - discount),
            currency: transaction.currency.clone(),
            coupon_id: coupon.map(|c| c.coupon_id),
            status: if completed {
                InvoiceStatus::Paid
            } else {
                InvoiceStatus::Draft
            },
            paid_at: if completed {
                Some(transaction.completed_at.unwrap_or(now))
            } else {
                None
            },
            metadata: json!({ "coupon_code": coupon.map(|c| c.code.clone()) }),
            items,
            coupon_redemption: coupon.map(|c| {
                redemption_for(
                    c,
                    transaction.user_id,
                    Some(EntityRef::transaction(transaction.transaction_id)),
                )
            }),
            reward_applications: Vec::new(),
        }
    }
}

fn line_item(itemable: Option<EntityRef>, description: String, amount: Decimal) -> NewInvoiceItem {
    NewInvoiceItem {
        itemable,
        description,
        quantity: Decimal::ONE,
        unit_price: amount,
        discount: Decimal::ZERO,
        tax_rate: Decimal::ZERO,
        tax_amount: Decimal::ZERO,
        subtotal: amount,
        total: amount,
    }
}

/// Spread an invoice-level discount over items in order, never taking an
/// item below zero.
fn allocate_discount(items: &mut [NewInvoiceItem], discount: Decimal) {
    let mut left = discount.max(Decimal::ZERO);
    for item in items.iter_mut() {
        let share = left.min(item.subtotal);
        item.discount = share;
        item.total = item.subtotal - share + item.tax_amount;
        left -= share;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn discount_is_allocated_in_item_order() {
        let mut items = vec![
            line_item(None, "Plan".to_string(), dec!(50)),
            line_item(None, "Consumo".to_string(), dec!(20)),
        ];
        allocate_discount(&mut items, dec!(55));

        assert_eq!(items[0].discount, dec!(50));
        assert_eq!(items[0].total, dec!(0));
        assert_eq!(items[1].discount, dec!(5));
        assert_eq!(items[1].total, dec!(15));
    }

    #[test]
    fn discount_never_exceeds_items() {
        let mut items = vec![line_item(None, "Plan".to_string(), dec!(10))];
        allocate_discount(&mut items, dec!(25));
        assert_eq!(items[0].discount, dec!(10));
        assert_eq!(items[0].total, dec!(0));
    }
}
