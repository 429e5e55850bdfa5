//! In-process [`BillingStore`].
//!
//! All state sits behind one mutex, so every trait method is atomic the same
//! way a single Postgres transaction is. Backs the integration tests.

use crate::models::{
    add_billing_period, format_invoice_number, parse_invoice_sequence, AttemptStatus,
    BillingContact, Cancellation, Coupon, CouponUsage, EntityRef, Invoice, InvoiceItem,
    InvoiceStatus, NewCouponUsage, NewInvoice, NewPaymentAttempt, NewPaymentMethod,
    NewRewardApplication, PaymentAttempt, PaymentGatewayRecord, PaymentMethod, Plan,
    ReferralReward, RewardApplication, RewardStatus, Subscription, SubscriptionStatus,
    Transaction, TransactionStatus, Usage, UsagePrice, UsageTotal,
};
use crate::services::attempts::{AttemptTransition, Settlement, SettlementEffect};
use crate::services::store::BillingStore;
use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc};
use rust_decimal::Decimal;
use service_core::error::AppError;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

#[derive(Default)]
struct State {
    plans: HashMap<Uuid, Plan>,
    usage_prices: Vec<UsagePrice>,
    usages: Vec<Usage>,
    subscriptions: HashMap<Uuid, Subscription>,
    contacts: HashMap<Uuid, BillingContact>,
    gateways: Vec<PaymentGatewayRecord>,
    payment_methods: Vec<PaymentMethod>,
    coupons: HashMap<Uuid, Coupon>,
    coupon_usages: Vec<CouponUsage>,
    rewards: HashMap<Uuid, ReferralReward>,
    reward_applications: Vec<RewardApplication>,
    transactions: HashMap<Uuid, Transaction>,
    invoices: Vec<Invoice>,
    invoice_items: Vec<InvoiceItem>,
    attempts: Vec<PaymentAttempt>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

fn conflict(message: String) -> AppError {
    AppError::Conflict(anyhow::anyhow!(message))
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, AppError> {
        self.state
            .lock()
            .map_err(|e| AppError::InternalError(anyhow::anyhow!("Store lock poisoned: {}", e)))
    }

    fn with<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        match self.state.lock() {
            Ok(mut state) => f(&mut state),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    pub fn seed_plan(&self, plan: Plan) {
        self.with(|s| {
            s.plans.insert(plan.plan_id, plan);
        })
    }

    pub fn seed_usage_price(&self, price: UsagePrice) {
        self.with(|s| s.usage_prices.push(price))
    }

    pub fn record_usage(&self, usage: Usage) {
        self.with(|s| s.usages.push(usage))
    }

    pub fn seed_subscription(&self, subscription: Subscription) {
        self.with(|s| {
            s.subscriptions
                .insert(subscription.subscription_id, subscription);
        })
    }

    pub fn seed_contact(&self, contact: BillingContact) {
        self.with(|s| {
            s.contacts.insert(contact.user_id, contact);
        })
    }

    pub fn seed_gateway(&self, gateway: PaymentGatewayRecord) {
        self.with(|s| s.gateways.push(gateway))
    }

    pub fn seed_payment_method(&self, method: PaymentMethod) {
        self.with(|s| s.payment_methods.push(method))
    }

    pub fn seed_coupon(&self, coupon: Coupon) {
        self.with(|s| {
            s.coupons.insert(coupon.coupon_id, coupon);
        })
    }

    pub fn seed_reward(&self, reward: ReferralReward) {
        self.with(|s| {
            s.rewards.insert(reward.reward_id, reward);
        })
    }

    pub fn seed_transaction(&self, transaction: Transaction) {
        self.with(|s| {
            s.transactions
                .insert(transaction.transaction_id, transaction);
        })
    }

    pub fn seed_attempt(&self, attempt: PaymentAttempt) {
        self.with(|s| s.attempts.push(attempt))
    }

    pub fn subscription(&self, subscription_id: Uuid) -> Option<Subscription> {
        self.with(|s| s.subscriptions.get(&subscription_id).cloned())
    }

    pub fn coupon(&self, coupon_id: Uuid) -> Option<Coupon> {
        self.with(|s| s.coupons.get(&coupon_id).cloned())
    }

    pub fn reward(&self, reward_id: Uuid) -> Option<ReferralReward> {
        self.with(|s| s.rewards.get(&reward_id).cloned())
    }

    pub fn coupon_usages(&self) -> Vec<CouponUsage> {
        self.with(|s| s.coupon_usages.clone())
    }

    pub fn reward_applications(&self) -> Vec<RewardApplication> {
        self.with(|s| s.reward_applications.clone())
    }

    pub fn invoices(&self) -> Vec<Invoice> {
        self.with(|s| s.invoices.clone())
    }

    pub fn attempts(&self) -> Vec<PaymentAttempt> {
        self.with(|s| s.attempts.clone())
    }

    pub fn payment_methods(&self, user_id: Uuid) -> Vec<PaymentMethod> {
        self.with(|s| {
            s.payment_methods
                .iter()
                .filter(|m| m.user_id == user_id)
                .cloned()
                .collect()
        })
    }
}

impl State {
    fn next_invoice_number(&self, prefix: &str, year: i32) -> String {
        let last = self
            .invoices
            .iter()
            .filter_map(|i| parse_invoice_sequence(&i.invoice_number, prefix, year))
            .max()
            .unwrap_or(0);
        format_invoice_number(prefix, year, last + 1)
    }

    fn check_coupon_guard(&self, usage: &NewCouponUsage) -> Result<(), AppError> {
        match self.coupons.get(&usage.coupon_id) {
            Some(coupon) if coupon.is_active && !coupon.is_exhausted() => Ok(()),
            Some(coupon) => Err(conflict(format!(
                "Coupon {} is no longer redeemable",
                coupon.code
            ))),
            None => Err(conflict(format!("Coupon {} not found", usage.coupon_id))),
        }
    }

    fn check_reward_guard(&self, application: &NewRewardApplication) -> Result<(), AppError> {
        let reward = self
            .rewards
            .get(&application.reward_id)
            .ok_or_else(|| conflict(format!("Reward {} not found", application.reward_id)))?;

        let unchanged = reward.status() == RewardStatus::Active
            && reward.cycles_applied == application.expected_cycles_applied;
        let has_credit = !application.draws_credit
            || reward.remaining_value.unwrap_or(Decimal::ZERO) >= application.applied_value;
        if unchanged && has_credit {
            Ok(())
        } else {
            Err(conflict(format!(
                "Reward {} changed since it was quoted",
                application.reward_id
            )))
        }
    }

    fn redeem(&mut self, usage: &NewCouponUsage, now: DateTime<Utc>) -> Option<CouponUsage> {
        let coupon = self.coupons.get_mut(&usage.coupon_id)?;
        if !coupon.is_active || coupon.is_exhausted() {
            return None;
        }
        coupon.current_uses += 1;
        coupon.updated_at = now;

        let (billable_type, billable_id) = EntityRef::to_columns(usage.billable.as_ref());
        let recorded = CouponUsage {
            coupon_usage_id: Uuid::new_v4(),
            coupon_id: usage.coupon_id,
            user_id: usage.user_id,
            billable_type: billable_type.map(str::to_string),
            billable_id,
            discount_amount: usage.discount_amount,
            original_amount: usage.original_amount,
            final_amount: usage.final_amount,
            used_at: now,
        };
        self.coupon_usages.push(recorded.clone());
        Some(recorded)
    }

    fn apply_reward(
        &mut self,
        application: &NewRewardApplication,
        invoice_id: Uuid,
        now: DateTime<Utc>,
    ) {
        let Some(reward) = self.rewards.get_mut(&application.reward_id) else {
            return;
        };
        reward.cycles_applied += 1;
        if application.draws_credit {
            let remaining = reward.remaining_value.unwrap_or(Decimal::ZERO) - application.applied_value;
            reward.remaining_value = Some(remaining);
        }
        let cycles_done = application
            .cycle_limit
            .is_some_and(|limit| reward.cycles_applied >= limit);
        let credit_done = application.draws_credit
            && reward.remaining_value.unwrap_or(Decimal::ZERO) <= Decimal::ZERO;
        if cycles_done || credit_done {
            reward.status = RewardStatus::Completed.as_str().to_string();
            reward.completed_at = Some(now);
        }
        reward.updated_at = now;

        self.reward_applications.push(RewardApplication {
            application_id: Uuid::new_v4(),
            reward_id: application.reward_id,
            invoice_id: Some(invoice_id),
            applied_value: application.applied_value,
            applied_at: now,
        });
    }

    fn invoice_mut(&mut self, invoice_id: Uuid) -> Option<&mut Invoice> {
        self.invoices.iter_mut().find(|i| i.invoice_id == invoice_id)
    }

    fn move_invoice(
        &mut self,
        invoice_id: Uuid,
        to: InvoiceStatus,
        now: DateTime<Utc>,
    ) -> Option<Invoice> {
        let invoice = self.invoice_mut(invoice_id)?;
        if !invoice.status().can_transition_to(to) {
            return None;
        }
        invoice.status = to.as_str().to_string();
        if to == InvoiceStatus::Paid {
            invoice.paid_at = Some(now);
        }
        invoice.updated_at = now;
        Some(invoice.clone())
    }

    fn move_transaction(
        &mut self,
        transaction_id: Uuid,
        from: TransactionStatus,
        to: TransactionStatus,
        now: DateTime<Utc>,
    ) -> Option<Transaction> {
        let transaction = self.transactions.get_mut(&transaction_id)?;
        if transaction.status() != from {
            return None;
        }
        transaction.status = to.as_str().to_string();
        if to == TransactionStatus::Completed {
            transaction.completed_at = Some(now);
        }
        transaction.updated_at = now;
        Some(transaction.clone())
    }

    fn extend_subscription(&mut self, subscription_id: Uuid, now: DateTime<Utc>) -> Option<Subscription> {
        let subscription = self.subscriptions.get_mut(&subscription_id)?;
        if !subscription.is_active() {
            return None;
        }
        subscription.starts_at = subscription.ends_at;
        subscription.ends_at = add_billing_period(subscription.ends_at);
        subscription.updated_at = now;
        Some(subscription.clone())
    }

    fn invoice(&self, invoice_id: Uuid) -> Option<Invoice> {
        self.invoices
            .iter()
            .find(|i| i.invoice_id == invoice_id)
            .cloned()
    }
}

#[async_trait]
impl BillingStore for MemoryStore {
    async fn health_check(&self) -> Result<(), AppError> {
        self.lock().map(|_| ())
    }

    async fn get_plan(&self, plan_id: Uuid) -> Result<Option<Plan>, AppError> {
        Ok(self.lock()?.plans.get(&plan_id).cloned())
    }

    async fn rate_card(&self, plan_id: Uuid) -> Result<Vec<UsagePrice>, AppError> {
        Ok(self
            .lock()?
            .usage_prices
            .iter()
            .filter(|p| p.is_active && p.plan_id.map_or(true, |id| id == plan_id))
            .cloned()
            .collect())
    }

    async fn usage_totals(
        &self,
        user_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<UsageTotal>, AppError> {
        let state = self.lock()?;
        let mut totals: BTreeMap<String, i64> = BTreeMap::new();
        for usage in state
            .usages
            .iter()
            .filter(|u| u.user_id == user_id && u.recorded_at >= from && u.recorded_at < to)
        {
            *totals.entry(usage.action_key.clone()).or_default() += usage.quantity;
        }
        Ok(totals
            .into_iter()
            .map(|(action_key, total_quantity)| UsageTotal {
                action_key,
                total_quantity,
            })
            .collect())
    }

    async fn get_subscription(
        &self,
        subscription_id: Uuid,
    ) -> Result<Option<Subscription>, AppError> {
        Ok(self.lock()?.subscriptions.get(&subscription_id).cloned())
    }

    async fn list_due_subscriptions(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Subscription>, AppError> {
        let mut due: Vec<Subscription> = self
            .lock()?
            .subscriptions
            .values()
            .filter(|s| s.is_due(now))
            .cloned()
            .collect();
        due.sort_by_key(|s| s.ends_at);
        Ok(due)
    }

    async fn cancel_subscription(
        &self,
        subscription_id: Uuid,
        cancellation: &Cancellation,
    ) -> Result<Option<Subscription>, AppError> {
        let mut state = self.lock()?;
        let Some(subscription) = state.subscriptions.get_mut(&subscription_id) else {
            return Ok(None);
        };
        if subscription.status() == SubscriptionStatus::Cancelled {
            return Ok(None);
        }
        subscription.status = SubscriptionStatus::Cancelled.as_str().to_string();
        subscription.metadata = cancellation.merge_into(&subscription.metadata);
        subscription.updated_at = cancellation.cancelled_at;
        Ok(Some(subscription.clone()))
    }

    async fn billing_contact(&self, user_id: Uuid) -> Result<Option<BillingContact>, AppError> {
        Ok(self.lock()?.contacts.get(&user_id).cloned())
    }

    async fn get_gateway(&self, slug: &str) -> Result<Option<PaymentGatewayRecord>, AppError> {
        Ok(self
            .lock()?
            .gateways
            .iter()
            .find(|g| g.slug == slug)
            .cloned())
    }

    async fn get_payment_method(
        &self,
        payment_method_id: Uuid,
    ) -> Result<Option<PaymentMethod>, AppError> {
        Ok(self
            .lock()?
            .payment_methods
            .iter()
            .find(|m| m.payment_method_id == payment_method_id)
            .cloned())
    }

    async fn default_payment_method(
        &self,
        user_id: Uuid,
    ) -> Result<Option<PaymentMethod>, AppError> {
        Ok(self
            .lock()?
            .payment_methods
            .iter()
            .find(|m| m.user_id == user_id && m.is_default && m.is_active)
            .cloned())
    }

    async fn create_payment_method(
        &self,
        method: &NewPaymentMethod,
    ) -> Result<PaymentMethod, AppError> {
        let now = Utc::now();
        let created = PaymentMethod {
            payment_method_id: Uuid::new_v4(),
            user_id: method.user_id,
            gateway_id: method.gateway_id,
            method_type: method.method_type.clone(),
            token: method.token.clone(),
            customer_id: method.customer_id.clone(),
            brand: method.brand.clone(),
            last_four: method.last_four.clone(),
            expiry_month: method.expiry_month,
            expiry_year: method.expiry_year,
            holder_name: method.holder_name.clone(),
            is_default: false,
            is_active: true,
            created_at: now,
            updated_at: now,
        };
        self.lock()?.payment_methods.push(created.clone());
        Ok(created)
    }

    async fn set_default_payment_method(
        &self,
        user_id: Uuid,
        payment_method_id: Uuid,
    ) -> Result<Option<PaymentMethod>, AppError> {
        let mut state = self.lock()?;
        let exists = state
            .payment_methods
            .iter()
            .any(|m| m.payment_method_id == payment_method_id && m.user_id == user_id && m.is_active);
        if !exists {
            return Ok(None);
        }

        let now = Utc::now();
        let mut selected = None;
        for method in state.payment_methods.iter_mut().filter(|m| m.user_id == user_id) {
            method.is_default = method.payment_method_id == payment_method_id;
            method.updated_at = now;
            if method.is_default {
                selected = Some(method.clone());
            }
        }
        Ok(selected)
    }

    async fn list_active_card_methods(&self) -> Result<Vec<PaymentMethod>, AppError> {
        Ok(self
            .lock()?
            .payment_methods
            .iter()
            .filter(|m| m.is_active && m.is_card())
            .cloned()
            .collect())
    }

    async fn find_coupon(&self, code: &str) -> Result<Option<Coupon>, AppError> {
        Ok(self
            .lock()?
            .coupons
            .values()
            .find(|c| c.code.eq_ignore_ascii_case(code))
            .cloned())
    }

    async fn redeem_coupon(
        &self,
        usage: &NewCouponUsage,
        now: DateTime<Utc>,
    ) -> Result<Option<CouponUsage>, AppError> {
        Ok(self.lock()?.redeem(usage, now))
    }

    async fn active_rewards(&self, user_id: Uuid) -> Result<Vec<ReferralReward>, AppError> {
        let mut rewards: Vec<ReferralReward> = self
            .lock()?
            .rewards
            .values()
            .filter(|r| r.user_id == user_id && r.status() == RewardStatus::Active)
            .cloned()
            .collect();
        rewards.sort_by_key(|r| r.created_at);
        Ok(rewards)
    }

    async fn get_transaction(
        &self,
        transaction_id: Uuid,
    ) -> Result<Option<Transaction>, AppError> {
        Ok(self.lock()?.transactions.get(&transaction_id).cloned())
    }

    async fn create_invoice(&self, invoice: &NewInvoice) -> Result<Invoice, AppError> {
        let mut state = self.lock()?;

        if let Some(usage) = &invoice.coupon_redemption {
            state.check_coupon_guard(usage)?;
        }
        for application in &invoice.reward_applications {
            state.check_reward_guard(application)?;
        }

        let now = Utc::now();
        let invoice_number = state.next_invoice_number(&invoice.number_prefix, invoice.issued_at.year());
        let created = Invoice {
            invoice_id: Uuid::new_v4(),
            invoice_number,
            user_id: invoice.user_id,
            subscription_id: invoice.subscription_id,
            transaction_id: invoice.transaction_id,
            invoice_type: invoice.invoice_type.as_str().to_string(),
            issued_at: invoice.issued_at,
            due_at: invoice.due_at,
            period_start: invoice.period_start,
            period_end: invoice.period_end,
            subtotal: invoice.subtotal,
            discount: invoice.discount,
            tax: invoice.tax,
            total: invoice.total,
            currency: invoice.currency.clone(),
            coupon_id: invoice.coupon_id,
            status: invoice.status.as_str().to_string(),
            paid_at: invoice.paid_at,
            cufe: None,
            qr_code: None,
            metadata: invoice.metadata.clone(),
            created_at: now,
            updated_at: now,
        };

        for (index, item) in invoice.items.iter().enumerate() {
            let (itemable_type, itemable_id) = EntityRef::to_columns(item.itemable.as_ref());
            state.invoice_items.push(InvoiceItem {
                invoice_item_id: Uuid::new_v4(),
                invoice_id: created.invoice_id,
                itemable_type: itemable_type.map(str::to_string),
                itemable_id,
                description: item.description.clone(),
                quantity: item.quantity,
                unit_price: item.unit_price,
                discount: item.discount,
                tax_rate: item.tax_rate,
                tax_amount: item.tax_amount,
                subtotal: item.subtotal,
                total: item.total,
                position: index as i32 + 1,
            });
        }
        if let Some(usage) = &invoice.coupon_redemption {
            state.redeem(usage, invoice.issued_at);
        }
        for application in &invoice.reward_applications {
            state.apply_reward(application, created.invoice_id, invoice.issued_at);
        }

        state.invoices.push(created.clone());
        Ok(created)
    }

    async fn get_invoice(&self, invoice_id: Uuid) -> Result<Option<Invoice>, AppError> {
        Ok(self.lock()?.invoice(invoice_id))
    }

    async fn invoice_items(&self, invoice_id: Uuid) -> Result<Vec<InvoiceItem>, AppError> {
        let mut items: Vec<InvoiceItem> = self
            .lock()?
            .invoice_items
            .iter()
            .filter(|i| i.invoice_id == invoice_id)
            .cloned()
            .collect();
        items.sort_by_key(|i| i.position);
        Ok(items)
    }

    async fn transition_invoice(
        &self,
        invoice_id: Uuid,
        to: InvoiceStatus,
        now: DateTime<Utc>,
    ) -> Result<Option<Invoice>, AppError> {
        Ok(self.lock()?.move_invoice(invoice_id, to, now))
    }

    async fn settle_zero_invoice(
        &self,
        invoice_id: Uuid,
        subscription_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Settlement, AppError> {
        let mut state = self.lock()?;
        let mut settlement = Settlement::empty();

        match state.move_invoice(invoice_id, InvoiceStatus::Paid, now) {
            Some(paid) => {
                settlement.invoice = Some(paid);
                settlement.subscription = state.extend_subscription(subscription_id, now);
                settlement.period_extended = settlement.subscription.is_some();
            }
            None => {
                settlement.invoice = state.invoice(invoice_id);
                settlement.subscription = state.subscriptions.get(&subscription_id).cloned();
            }
        }
        Ok(settlement)
    }

    async fn create_attempt(
        &self,
        attempt: &NewPaymentAttempt,
    ) -> Result<PaymentAttempt, AppError> {
        let mut state = self.lock()?;

        if state
            .attempts
            .iter()
            .any(|a| a.gateway_order_number == attempt.gateway_order_number)
        {
            return Err(AppError::InternalError(anyhow::anyhow!(
                "Order number {} already exists",
                attempt.gateway_order_number
            )));
        }
        if let Some(subscription_id) = attempt.subscription_id {
            if state
                .attempts
                .iter()
                .any(|a| a.subscription_id == Some(subscription_id) && a.status().is_outstanding())
            {
                return Err(conflict(format!(
                    "Subscription {} already has an outstanding payment attempt",
                    subscription_id
                )));
            }
        }

        let created = PaymentAttempt {
            attempt_id: Uuid::new_v4(),
            user_id: attempt.user_id,
            gateway_id: attempt.gateway_id,
            payment_method_id: attempt.payment_method_id,
            invoice_id: attempt.invoice_id,
            transaction_id: attempt.transaction_id,
            subscription_id: attempt.subscription_id,
            amount: attempt.amount,
            currency: attempt.currency.clone(),
            gateway_order_number: attempt.gateway_order_number.clone(),
            gateway_transaction_id: None,
            status: AttemptStatus::Pending.as_str().to_string(),
            gateway_response: None,
            gateway_message: None,
            error_message: None,
            retry_count: attempt.retry_count,
            attempted_at: None,
            completed_at: None,
            created_at: attempt.created_at,
            updated_at: attempt.created_at,
        };
        state.attempts.push(created.clone());
        Ok(created)
    }

    async fn get_attempt(&self, attempt_id: Uuid) -> Result<Option<PaymentAttempt>, AppError> {
        Ok(self
            .lock()?
            .attempts
            .iter()
            .find(|a| a.attempt_id == attempt_id)
            .cloned())
    }

    async fn find_attempt_by_order_number(
        &self,
        order_number: &str,
    ) -> Result<Option<PaymentAttempt>, AppError> {
        Ok(self
            .lock()?
            .attempts
            .iter()
            .find(|a| a.gateway_order_number == order_number)
            .cloned())
    }

    async fn latest_attempt_for_subscription(
        &self,
        subscription_id: Uuid,
    ) -> Result<Option<PaymentAttempt>, AppError> {
        // Later insertion wins ties on created_at.
        Ok(self
            .lock()?
            .attempts
            .iter()
            .filter(|a| a.subscription_id == Some(subscription_id))
            .fold(None::<&PaymentAttempt>, |latest, a| match latest {
                Some(l) if l.created_at > a.created_at => Some(l),
                _ => Some(a),
            })
            .cloned())
    }

    async fn apply_attempt_transition(
        &self,
        attempt_id: Uuid,
        transition: &AttemptTransition,
        now: DateTime<Utc>,
    ) -> Result<Option<Settlement>, AppError> {
        let mut state = self.lock()?;
        let Some(attempt) = state.attempts.iter_mut().find(|a| a.attempt_id == attempt_id) else {
            return Ok(None);
        };
        if !transition.allowed_from().contains(&attempt.status()) {
            return Ok(None);
        }

        let update = transition.update(now);
        attempt.status = update.status.as_str().to_string();
        if update.gateway_transaction_id.is_some() {
            attempt.gateway_transaction_id = update.gateway_transaction_id;
        }
        if update.gateway_response.is_some() {
            attempt.gateway_response = update.gateway_response;
        }
        if update.gateway_message.is_some() {
            attempt.gateway_message = update.gateway_message;
        }
        if update.error_message.is_some() {
            attempt.error_message = update.error_message;
        }
        if update.attempted_at.is_some() {
            attempt.attempted_at = update.attempted_at;
        }
        if update.completed_at.is_some() {
            attempt.completed_at = update.completed_at;
        }
        attempt.updated_at = now;
        let attempt = attempt.clone();

        let mut settlement = Settlement::empty();
        match transition.effect() {
            SettlementEffect::None => {}
            SettlementEffect::Settle => {
                let paid = attempt
                    .invoice_id
                    .and_then(|id| state.move_invoice(id, InvoiceStatus::Paid, now));
                settlement.transaction = attempt.transaction_id.and_then(|id| {
                    state.move_transaction(id, TransactionStatus::Pending, TransactionStatus::Completed, now)
                });
                // The period moves forward only with the invoice that pays for it.
                if paid.is_some() || attempt.invoice_id.is_none() {
                    settlement.subscription = attempt
                        .subscription_id
                        .and_then(|id| state.extend_subscription(id, now));
                    settlement.period_extended = settlement.subscription.is_some();
                }
                settlement.invoice = paid.or_else(|| attempt.invoice_id.and_then(|id| state.invoice(id)));
            }
            SettlementEffect::Refund => {
                settlement.invoice = attempt
                    .invoice_id
                    .and_then(|id| state.move_invoice(id, InvoiceStatus::Refunded, now));
                settlement.transaction = attempt.transaction_id.and_then(|id| {
                    state.move_transaction(id, TransactionStatus::Completed, TransactionStatus::Refunded, now)
                });
            }
        }
        if settlement.subscription.is_none() {
            settlement.subscription = attempt
                .subscription_id
                .and_then(|id| state.subscriptions.get(&id).cloned());
        }
        settlement.attempt = Some(attempt);
        Ok(Some(settlement))
    }

    async fn increment_retry_count(
        &self,
        attempt_id: Uuid,
        expected: i32,
    ) -> Result<Option<PaymentAttempt>, AppError> {
        let mut state = self.lock()?;
        let attempt = state.attempts.iter_mut().find(|a| {
            a.attempt_id == attempt_id
                && a.retry_count == expected
                && a.status() == AttemptStatus::Failed
        });
        Ok(attempt.map(|a| {
            a.retry_count += 1;
            a.clone()
        }))
    }

    async fn list_retry_candidates(
        &self,
        created_after: DateTime<Utc>,
        max_retries: i32,
    ) -> Result<Vec<PaymentAttempt>, AppError> {
        let state = self.lock()?;
        let mut latest: HashMap<Uuid, &PaymentAttempt> = HashMap::new();
        for attempt in &state.attempts {
            let Some(subscription_id) = attempt.subscription_id else {
                continue;
            };
            let newer = latest
                .get(&subscription_id)
                .map_or(true, |current| attempt.created_at >= current.created_at);
            if newer {
                latest.insert(subscription_id, attempt);
            }
        }

        let mut candidates: Vec<PaymentAttempt> = latest
            .into_values()
            .filter(|a| {
                a.status() == AttemptStatus::Failed
                    && a.created_at >= created_after
                    && a.retry_count < max_retries
            })
            .cloned()
            .collect();
        candidates.sort_by_key(|a| a.created_at);
        Ok(candidates)
    }

    async fn list_stale_attempts(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<PaymentAttempt>, AppError> {
        Ok(self
            .lock()?
            .attempts
            .iter()
            .filter(|a| a.status().is_outstanding() && a.created_at < older_than)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{InvoiceType, NewInvoiceItem};
    use chrono::TimeZone;

    fn invoice_at(issued_at: DateTime<Utc>) -> NewInvoice {
        NewInvoice {
            number_prefix: "INV".to_string(),
            invoice_type: InvoiceType::OneTime,
            user_id: Uuid::new_v4(),
            subscription_id: None,
            transaction_id: None,
            issued_at,
            due_at: None,
            period_start: None,
            period_end: None,
            subtotal: Decimal::TEN,
            discount: Decimal::ZERO,
            tax: Decimal::ZERO,
            total: Decimal::TEN,
            currency: "COP".to_string(),
            coupon_id: None,
            status: InvoiceStatus::Draft,
            paid_at: None,
            metadata: serde_json::json!({}),
            items: vec![NewInvoiceItem {
                itemable: None,
                description: "Item".to_string(),
                quantity: Decimal::ONE,
                unit_price: Decimal::TEN,
                discount: Decimal::ZERO,
                tax_rate: Decimal::ZERO,
                tax_amount: Decimal::ZERO,
                subtotal: Decimal::TEN,
                total: Decimal::TEN,
            }],
            coupon_redemption: None,
            reward_applications: Vec::new(),
        }
    }

    #[tokio::test]
    async fn invoice_numbers_restart_each_year() {
        let store = MemoryStore::new();
        let dec = Utc.with_ymd_and_hms(2023, 12, 31, 23, 0, 0).unwrap();
        let jan = Utc.with_ymd_and_hms(2024, 1, 1, 1, 0, 0).unwrap();

        let a = store.create_invoice(&invoice_at(dec)).await.unwrap();
        let b = store.create_invoice(&invoice_at(dec)).await.unwrap();
        let c = store.create_invoice(&invoice_at(jan)).await.unwrap();

        assert_eq!(a.invoice_number, "INV-2023-0001");
        assert_eq!(b.invoice_number, "INV-2023-0002");
        assert_eq!(c.invoice_number, "INV-2024-0001");
        assert_eq!(store.invoice_items(a.invoice_id).await.unwrap()[0].position, 1);
    }

    #[tokio::test]
    async fn paid_invoice_only_moves_to_refunded() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let invoice = store.create_invoice(&invoice_at(now)).await.unwrap();

        let paid = store
            .transition_invoice(invoice.invoice_id, InvoiceStatus::Paid, now)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(paid.paid_at, Some(now));
        assert!(store
            .transition_invoice(invoice.invoice_id, InvoiceStatus::Cancelled, now)
            .await
            .unwrap()
            .is_none());
        assert!(store
            .transition_invoice(invoice.invoice_id, InvoiceStatus::Refunded, now)
            .await
            .unwrap()
            .is_some());
    }

    fn attempt_for(subscription_id: Uuid, order_number: &str) -> NewPaymentAttempt {
        NewPaymentAttempt {
            user_id: Uuid::new_v4(),
            gateway_id: Uuid::new_v4(),
            payment_method_id: None,
            invoice_id: None,
            transaction_id: None,
            subscription_id: Some(subscription_id),
            amount: Decimal::TEN,
            currency: "COP".to_string(),
            gateway_order_number: order_number.to_string(),
            retry_count: 0,
            created_at: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn order_number_collision_is_not_an_outstanding_conflict() {
        let store = MemoryStore::new();
        let subscription_id = Uuid::new_v4();
        store
            .create_attempt(&attempt_for(subscription_id, "ORD-20240301120000-AAAAAA"))
            .await
            .unwrap();

        let outstanding = store
            .create_attempt(&attempt_for(subscription_id, "ORD-20240301120000-BBBBBB"))
            .await;
        assert!(matches!(outstanding, Err(AppError::Conflict(_))));

        let collision = store
            .create_attempt(&attempt_for(Uuid::new_v4(), "ORD-20240301120000-AAAAAA"))
            .await;
        match collision {
            Err(AppError::InternalError(e)) => assert!(e.to_string().contains("already exists")),
            other => panic!("expected order number error, got {:?}", other.map(|a| a.attempt_id)),
        }
    }
}
