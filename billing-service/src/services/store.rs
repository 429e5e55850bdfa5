//! Persistence boundary for the billing engine.
//!
//! Every multi-row write that must be atomic (invoice + items + coupon
//! redemption, attempt settlement) is a single trait method so each
//! implementation can run it in one transaction.

use crate::models::{
    BillingContact, Cancellation, Coupon, CouponUsage, Invoice, InvoiceItem,
    InvoiceStatus, NewCouponUsage, NewInvoice, NewPaymentAttempt, NewPaymentMethod,
    PaymentAttempt, PaymentGatewayRecord, PaymentMethod, Plan, ReferralReward, Subscription,
    Transaction, UsagePrice, UsageTotal,
};
use crate::services::attempts::{AttemptTransition, Settlement};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use service_core::error::AppError;
use uuid::Uuid;

#[async_trait]
pub trait BillingStore: Send + Sync {
    async fn health_check(&self) -> Result<(), AppError>;

    // Catalogue and usage

    async fn get_plan(&self, plan_id: Uuid) -> Result<Option<Plan>, AppError>;

    /// Active rate rows for `plan_id` together with the global (null-plan) rows.
    async fn rate_card(&self, plan_id: Uuid) -> Result<Vec<UsagePrice>, AppError>;

    /// Usage summed per action key over `[from, to)`.
    async fn usage_totals(
        &self,
        user_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<UsageTotal>, AppError>;

    // Subscriptions

    async fn get_subscription(&self, subscription_id: Uuid)
        -> Result<Option<Subscription>, AppError>;

    /// Active subscriptions with `ends_at <= now`, oldest due first.
    async fn list_due_subscriptions(&self, now: DateTime<Utc>)
        -> Result<Vec<Subscription>, AppError>;

    /// Cancel an active or paused subscription. Returns `None` if it was
    /// already cancelled.
    async fn cancel_subscription(
        &self,
        subscription_id: Uuid,
        cancellation: &Cancellation,
    ) -> Result<Option<Subscription>, AppError>;

    async fn billing_contact(&self, user_id: Uuid) -> Result<Option<BillingContact>, AppError>;

    // Gateways and payment methods

    async fn get_gateway(&self, slug: &str) -> Result<Option<PaymentGatewayRecord>, AppError>;

    async fn get_payment_method(
        &self,
        payment_method_id: Uuid,
    ) -> Result<Option<PaymentMethod>, AppError>;

    /// The user's active default method, if any.
    async fn default_payment_method(&self, user_id: Uuid)
        -> Result<Option<PaymentMethod>, AppError>;

    async fn create_payment_method(
        &self,
        method: &NewPaymentMethod,
    ) -> Result<PaymentMethod, AppError>;

    /// Clear every other default flag of the user and set this one, atomically.
    async fn set_default_payment_method(
        &self,
        user_id: Uuid,
        payment_method_id: Uuid,
    ) -> Result<Option<PaymentMethod>, AppError>;

    async fn list_active_card_methods(&self) -> Result<Vec<PaymentMethod>, AppError>;

    // Coupons and rewards

    async fn find_coupon(&self, code: &str) -> Result<Option<Coupon>, AppError>;

    /// Increment `current_uses` only while the coupon is below its limit and
    /// record the usage. Returns `None` when the guard rejects the redemption.
    async fn redeem_coupon(
        &self,
        usage: &NewCouponUsage,
        now: DateTime<Utc>,
    ) -> Result<Option<CouponUsage>, AppError>;

    async fn active_rewards(&self, user_id: Uuid) -> Result<Vec<ReferralReward>, AppError>;

    // Transactions and invoices

    async fn get_transaction(&self, transaction_id: Uuid)
        -> Result<Option<Transaction>, AppError>;

    /// Persist an invoice with its items, coupon redemption and reward
    /// applications. The invoice number is allocated under a per-year lock.
    /// Fails with `AppError::Conflict` when the coupon or a reward guard
    /// rejects the write; nothing is persisted in that case.
    async fn create_invoice(&self, invoice: &NewInvoice) -> Result<Invoice, AppError>;

    async fn get_invoice(&self, invoice_id: Uuid) -> Result<Option<Invoice>, AppError>;

    async fn invoice_items(&self, invoice_id: Uuid) -> Result<Vec<InvoiceItem>, AppError>;

    /// Move an invoice to `to` if its current status is an allowed source.
    /// Returns `None` when the compare-and-swap does not match.
    async fn transition_invoice(
        &self,
        invoice_id: Uuid,
        to: InvoiceStatus,
        now: DateTime<Utc>,
    ) -> Result<Option<Invoice>, AppError>;

    /// Mark a zero-total invoice paid and extend its subscription, without
    /// any gateway involvement.
    async fn settle_zero_invoice(
        &self,
        invoice_id: Uuid,
        subscription_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Settlement, AppError>;

    // Payment attempts

    /// Fails with `AppError::Conflict` if the subscription already has a
    /// pending or processing attempt, and with `AppError::InternalError` if
    /// the order number is taken.
    async fn create_attempt(&self, attempt: &NewPaymentAttempt)
        -> Result<PaymentAttempt, AppError>;

    async fn get_attempt(&self, attempt_id: Uuid) -> Result<Option<PaymentAttempt>, AppError>;

    async fn find_attempt_by_order_number(
        &self,
        order_number: &str,
    ) -> Result<Option<PaymentAttempt>, AppError>;

    async fn latest_attempt_for_subscription(
        &self,
        subscription_id: Uuid,
    ) -> Result<Option<PaymentAttempt>, AppError>;

    /// Compare-and-swap the attempt from one of `transition.allowed_from()`
    /// to its target, applying the settlement side effects in the same
    /// transaction. Returns `None` when the attempt was not in an allowed state.
    async fn apply_attempt_transition(
        &self,
        attempt_id: Uuid,
        transition: &AttemptTransition,
        now: DateTime<Utc>,
    ) -> Result<Option<Settlement>, AppError>;

    /// Bump `retry_count` from `expected` to `expected + 1` on a failed
    /// attempt. Returns `None` when another pass got there first.
    async fn increment_retry_count(
        &self,
        attempt_id: Uuid,
        expected: i32,
    ) -> Result<Option<PaymentAttempt>, AppError>;

    /// The latest attempt of every subscription, when that attempt failed
    /// after `created_after` with `retry_count < max_retries`.
    async fn list_retry_candidates(
        &self,
        created_after: DateTime<Utc>,
        max_retries: i32,
    ) -> Result<Vec<PaymentAttempt>, AppError>;

    /// Pending or processing attempts created before `older_than`.
    async fn list_stale_attempts(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<PaymentAttempt>, AppError>;
}

