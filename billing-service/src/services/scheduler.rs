//! Renewal and retry scheduler.
//!
//! Batch passes over due subscriptions, failed attempts, stale attempts and
//! expiring cards. Every unit of work is independent: its outcome lands in a
//! [`ChargeReport`] and an error in one item never aborts the batch.

use crate::models::{
    AttemptStatus, Cancellation, Invoice, NewPaymentAttempt, PaymentAttempt, Subscription,
    generate_order_number,
};
use crate::services::attempts::{
    AttemptTransition, PaymentAttemptService, Settlement, TransitionOutcome,
};
use crate::services::gateway::{ChargeOutcome, ChargeRequest, GatewayError, PaymentGateway};
use crate::services::invoices::InvoiceBuilder;
use crate::services::metrics::{record_cancellation, record_charge};
use crate::services::notifier::Notifications;
use crate::services::reconciliation::{
    ReconciliationOutcome, ReconciliationProcessor, DECLINED_MESSAGE,
};
use crate::services::store::BillingStore;
use crate::error::BillingError;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use service_core::error::AppError;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

pub const STALE_ATTEMPT_MESSAGE: &str = "Gateway confirmation timed out";

/// Why a unit of work did not charge. Expected steady-state outcomes, not errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChargeErrorCode {
    NoPaymentMethod,
    PaymentMethodExpired,
    SubscriptionNotActive,
    AttemptOutstanding,
    InDunning,
    RetryInProgress,
    BackoffPending,
    ChargeFailed,
    Exception,
    NotFailed,
    MaxRetriesReached,
    NoSubscription,
}

impl ChargeErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChargeErrorCode::NoPaymentMethod => "no_payment_method",
            ChargeErrorCode::PaymentMethodExpired => "payment_method_expired",
            ChargeErrorCode::SubscriptionNotActive => "subscription_not_active",
            ChargeErrorCode::AttemptOutstanding => "attempt_outstanding",
            ChargeErrorCode::InDunning => "in_dunning",
            ChargeErrorCode::RetryInProgress => "retry_in_progress",
            ChargeErrorCode::BackoffPending => "backoff_pending",
            ChargeErrorCode::ChargeFailed => "charge_failed",
            ChargeErrorCode::Exception => "exception",
            ChargeErrorCode::NotFailed => "not_failed",
            ChargeErrorCode::MaxRetriesReached => "max_retries_reached",
            ChargeErrorCode::NoSubscription => "no_subscription",
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            ChargeErrorCode::NoPaymentMethod => "User has no active default payment method",
            ChargeErrorCode::PaymentMethodExpired => "Default payment method has expired",
            ChargeErrorCode::SubscriptionNotActive => "Subscription is not active",
            ChargeErrorCode::AttemptOutstanding => "A payment attempt is already in flight",
            ChargeErrorCode::InDunning => "Current period is already in the retry cycle",
            ChargeErrorCode::RetryInProgress => "Another pass is retrying this attempt",
            ChargeErrorCode::BackoffPending => "Retry backoff has not elapsed",
            ChargeErrorCode::ChargeFailed => "Charge was declined or could not be completed",
            ChargeErrorCode::Exception => "Unexpected error",
            ChargeErrorCode::NotFailed => "Attempt is not in failed state",
            ChargeErrorCode::MaxRetriesReached => "Maximum payment retries reached",
            ChargeErrorCode::NoSubscription => "Attempt has no active subscription",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemOutcome {
    Success,
    /// Dispatched; the gateway settles it later.
    Pending,
    Failed,
    Skipped,
    /// Would have been charged.
    DryRun,
}

impl ItemOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemOutcome::Success => "success",
            ItemOutcome::Pending => "pending",
            ItemOutcome::Failed => "failed",
            ItemOutcome::Skipped => "skipped",
            ItemOutcome::DryRun => "dry_run",
        }
    }
}

/// Result of one unit of batch work.
#[derive(Debug, Clone, Serialize)]
pub struct ChargeReport {
    pub success: bool,
    pub outcome: ItemOutcome,
    pub error: Option<ChargeErrorCode>,
    pub message: String,
    pub subscription_id: Option<Uuid>,
    pub attempt_id: Option<Uuid>,
    pub order_number: Option<String>,
    pub invoice_id: Option<Uuid>,
    pub invoice_number: Option<String>,
    pub payment_method_id: Option<Uuid>,
    pub amount: Option<Decimal>,
    pub retry_count: Option<i32>,
    pub cancelled: bool,
}

impl ChargeReport {
    fn new(outcome: ItemOutcome, message: impl Into<String>) -> Self {
        Self {
            success: matches!(
                outcome,
                ItemOutcome::Success | ItemOutcome::Pending | ItemOutcome::DryRun
            ),
            outcome,
            error: None,
            message: message.into(),
            subscription_id: None,
            attempt_id: None,
            order_number: None,
            invoice_id: None,
            invoice_number: None,
            payment_method_id: None,
            amount: None,
            retry_count: None,
            cancelled: false,
        }
    }

    pub fn skipped(subscription_id: Option<Uuid>, code: ChargeErrorCode) -> Self {
        Self {
            error: Some(code),
            subscription_id,
            ..Self::new(ItemOutcome::Skipped, code.message())
        }
    }

    pub fn exception(subscription_id: Option<Uuid>, err: &dyn std::fmt::Display) -> Self {
        Self {
            error: Some(ChargeErrorCode::Exception),
            subscription_id,
            ..Self::new(ItemOutcome::Failed, err.to_string())
        }
    }

    fn with_attempt(mut self, attempt: &PaymentAttempt) -> Self {
        self.subscription_id = self.subscription_id.or(attempt.subscription_id);
        self.attempt_id = Some(attempt.attempt_id);
        self.order_number = Some(attempt.gateway_order_number.clone());
        self.amount = Some(attempt.amount);
        self.retry_count = Some(attempt.retry_count);
        self
    }

    fn with_invoice(mut self, invoice: &Invoice) -> Self {
        self.invoice_id = Some(invoice.invoice_id);
        self.invoice_number = Some(invoice.invoice_number.clone());
        self.amount = self.amount.or(Some(invoice.total));
        self
    }
}

/// Counts and items of one batch pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchSummary {
    pub total: usize,
    pub success: usize,
    pub failed: usize,
    pub skipped: usize,
    pub pending: usize,
    pub cancelled: usize,
    pub dry_run: bool,
    pub items: Vec<ChargeReport>,
}

impl BatchSummary {
    pub fn new(dry_run: bool) -> Self {
        Self {
            dry_run,
            ..Default::default()
        }
    }

    pub fn push(&mut self, report: ChargeReport) {
        self.total += 1;
        match report.outcome {
            ItemOutcome::Success | ItemOutcome::DryRun => self.success += 1,
            ItemOutcome::Pending => self.pending += 1,
            ItemOutcome::Failed => self.failed += 1,
            ItemOutcome::Skipped => self.skipped += 1,
        }
        if report.cancelled {
            self.cancelled += 1;
        }
        self.items.push(report);
    }
}

/// What triggered a charge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChargeContext {
    Renewal,
    /// Re-drive of a failed attempt; the new attempt carries this count.
    Retry { retry_count: i32 },
}

impl ChargeContext {
    pub fn retry_count(&self) -> i32 {
        match self {
            ChargeContext::Renewal => 0,
            ChargeContext::Retry { retry_count } => *retry_count,
        }
    }

    pub fn pass(&self) -> &'static str {
        match self {
            ChargeContext::Renewal => "renewal",
            ChargeContext::Retry { .. } => "retry",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChargeOptions {
    pub dry_run: bool,
    pub subscription_id: Option<Uuid>,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RetryOptions {
    pub window_days: i64,
    pub max_retries: i32,
    pub dry_run: bool,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub max_retries: i32,
    pub retry_window_days: i64,
    pub stale_after: Duration,
    pub card_notice_days: i64,
    pub gateway_timeout: std::time::Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_window_days: 10,
            stale_after: Duration::minutes(60),
            card_notice_days: 30,
            gateway_timeout: std::time::Duration::from_secs(30),
        }
    }
}

/// Earliest time a failed attempt may be retried: `created_at + 2^retry_count` days.
pub fn retry_due_at(attempt: &PaymentAttempt) -> DateTime<Utc> {
    let exponent = attempt.retry_count.clamp(0, 16) as u32;
    attempt.created_at + Duration::days(1i64 << exponent)
}

pub fn is_retry_due(attempt: &PaymentAttempt, now: DateTime<Utc>) -> bool {
    now >= retry_due_at(attempt)
}

/// Where a subscription whose current period already failed stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DunningState {
    /// The failed attempt is still a retry-pass candidate.
    Retrying,
    /// Out of the retry window with retries left: the due pass charges again.
    Lapsed,
    /// The retry ceiling is reached: the subscription must be cancelled.
    Exhausted,
}

pub fn dunning_state(
    latest: &PaymentAttempt,
    now: DateTime<Utc>,
    settings: &SchedulerSettings,
) -> DunningState {
    if latest.retry_count >= settings.max_retries {
        DunningState::Exhausted
    } else if now < latest.created_at + Duration::days(settings.retry_window_days) {
        DunningState::Retrying
    } else {
        DunningState::Lapsed
    }
}

/// Cancel a subscription whose dunning cycle is exhausted and send the notice.
/// Returns `None` when it was already cancelled.
pub async fn cancel_for_payment_failure(
    store: &dyn BillingStore,
    notifications: &Notifications,
    subscription_id: Uuid,
    now: DateTime<Utc>,
) -> Result<Option<Subscription>, AppError> {
    let cancellation = Cancellation::payment_failure(now);
    let cancelled = store
        .cancel_subscription(subscription_id, &cancellation)
        .await?;

    if let Some(subscription) = &cancelled {
        record_cancellation(&cancellation.reason);
        warn!(
            subscription_id = %subscription_id,
            user_id = %subscription.user_id,
            reason = %cancellation.reason,
            "Subscription cancelled after exhausting payment retries"
        );
        notifications.subscription_cancelled(subscription).await;
    }
    Ok(cancelled)
}

#[derive(Clone)]
pub struct BillingScheduler {
    store: Arc<dyn BillingStore>,
    gateway: Arc<dyn PaymentGateway>,
    invoices: InvoiceBuilder,
    attempts: PaymentAttemptService,
    reconciliation: ReconciliationProcessor,
    notifications: Notifications,
    settings: SchedulerSettings,
}

impl BillingScheduler {
    pub fn new(
        store: Arc<dyn BillingStore>,
        gateway: Arc<dyn PaymentGateway>,
        invoices: InvoiceBuilder,
        notifications: Notifications,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            attempts: PaymentAttemptService::new(store.clone()),
            reconciliation: ReconciliationProcessor::new(
                store.clone(),
                notifications.clone(),
                settings.max_retries,
            ),
            store,
            gateway,
            invoices,
            notifications,
            settings,
        }
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    /// Charge every due subscription, or only `options.subscription_id`.
    #[instrument(skip(self, options), fields(dry_run = options.dry_run))]
    pub async fn charge_due_subscriptions(
        &self,
        options: &ChargeOptions,
    ) -> Result<BatchSummary, AppError> {
        let mut summary = BatchSummary::new(options.dry_run);

        let subscriptions = match options.subscription_id {
            Some(id) => match self.store.get_subscription(id).await? {
                Some(subscription) => vec![subscription],
                None => {
                    summary.push(ChargeReport::skipped(
                        Some(id),
                        ChargeErrorCode::NoSubscription,
                    ));
                    return Ok(summary);
                }
            },
            None => self.store.list_due_subscriptions(options.now).await?,
        };

        info!(count = subscriptions.len(), "Charging due subscriptions");

        for subscription in &subscriptions {
            let report = match self
                .charge_subscription(subscription, ChargeContext::Renewal, options.dry_run, options.now)
                .await
            {
                Ok(report) => report,
                Err(e) => {
                    error!(
                        subscription_id = %subscription.subscription_id,
                        error = %e,
                        "Subscription charge failed unexpectedly"
                    );
                    ChargeReport::exception(Some(subscription.subscription_id), &e)
                }
            };
            record_charge(ChargeContext::Renewal.pass(), report.outcome.as_str());
            summary.push(report);
        }

        info!(
            total = summary.total,
            success = summary.success,
            failed = summary.failed,
            skipped = summary.skipped,
            pending = summary.pending,
            "Due-charge pass finished"
        );
        Ok(summary)
    }

    /// Re-drive the latest failed attempt of each subscription once its
    /// backoff has elapsed.
    #[instrument(skip(self, options), fields(dry_run = options.dry_run, max_retries = options.max_retries))]
    pub async fn retry_failed_payments(
        &self,
        options: &RetryOptions,
    ) -> Result<BatchSummary, AppError> {
        let mut summary = BatchSummary::new(options.dry_run);
        let created_after = options.now - Duration::days(options.window_days);
        let candidates = self
            .store
            .list_retry_candidates(created_after, options.max_retries)
            .await?;

        info!(count = candidates.len(), "Retrying failed payments");

        for attempt in &candidates {
            let report = match self.retry_attempt(attempt, options).await {
                Ok(report) => report,
                Err(e) => {
                    error!(
                        attempt_id = %attempt.attempt_id,
                        error = %e,
                        "Payment retry failed unexpectedly"
                    );
                    ChargeReport::exception(attempt.subscription_id, &e).with_attempt(attempt)
                }
            };
            record_charge("retry", report.outcome.as_str());
            summary.push(report);
        }

        info!(
            total = summary.total,
            success = summary.success,
            failed = summary.failed,
            skipped = summary.skipped,
            cancelled = summary.cancelled,
            "Retry pass finished"
        );
        Ok(summary)
    }

    #[instrument(skip(self, attempt, options), fields(attempt_id = %attempt.attempt_id, retry_count = attempt.retry_count))]
    async fn retry_attempt(
        &self,
        attempt: &PaymentAttempt,
        options: &RetryOptions,
    ) -> Result<ChargeReport, AppError> {
        let skip = |code| Ok(ChargeReport::skipped(attempt.subscription_id, code).with_attempt(attempt));

        if attempt.status() != AttemptStatus::Failed {
            return skip(ChargeErrorCode::NotFailed);
        }
        if attempt.retry_count >= options.max_retries {
            return skip(ChargeErrorCode::MaxRetriesReached);
        }
        let subscription = match attempt.subscription_id {
            Some(id) => self.store.get_subscription(id).await?,
            None => None,
        };
        let Some(subscription) = subscription else {
            return skip(ChargeErrorCode::NoSubscription);
        };
        if !subscription.is_active() {
            return skip(ChargeErrorCode::SubscriptionNotActive);
        }
        if !is_retry_due(attempt, options.now) {
            info!(due_at = %retry_due_at(attempt), "Retry backoff not elapsed");
            return skip(ChargeErrorCode::BackoffPending);
        }

        if options.dry_run {
            return self
                .charge_subscription(
                    &subscription,
                    ChargeContext::Retry {
                        retry_count: attempt.retry_count + 1,
                    },
                    true,
                    options.now,
                )
                .await;
        }

        let Some(bumped) = self
            .store
            .increment_retry_count(attempt.attempt_id, attempt.retry_count)
            .await?
        else {
            return skip(ChargeErrorCode::RetryInProgress);
        };

        info!(
            subscription_id = %subscription.subscription_id,
            retry_count = bumped.retry_count,
            "Retrying subscription charge"
        );
        let mut report = self
            .charge_subscription(
                &subscription,
                ChargeContext::Retry {
                    retry_count: bumped.retry_count,
                },
                false,
                options.now,
            )
            .await?;

        // A retry that could not even reach the gateway still uses up the cycle.
        if matches!(
            report.error,
            Some(ChargeErrorCode::NoPaymentMethod | ChargeErrorCode::PaymentMethodExpired)
        ) {
            report.retry_count = Some(bumped.retry_count);
            if bumped.retry_count >= options.max_retries {
                report.cancelled = cancel_for_payment_failure(
                    self.store.as_ref(),
                    &self.notifications,
                    subscription.subscription_id,
                    options.now,
                )
                .await?
                .is_some();
            }
        }
        Ok(report)
    }

    /// Charge one subscription: check preconditions, build the period invoice,
    /// dispatch an attempt and settle it from the gateway's answer.
    #[instrument(skip(self, subscription), fields(subscription_id = %subscription.subscription_id, pass = context.pass()))]
    pub async fn charge_subscription(
        &self,
        subscription: &Subscription,
        mut context: ChargeContext,
        dry_run: bool,
        now: DateTime<Utc>,
    ) -> Result<ChargeReport, AppError> {
        let subscription_id = Some(subscription.subscription_id);
        let skip = |code: ChargeErrorCode| {
            info!(reason = code.as_str(), "Subscription charge skipped");
            Ok(ChargeReport::skipped(subscription_id, code))
        };

        if !subscription.is_active() {
            return skip(ChargeErrorCode::SubscriptionNotActive);
        }

        let latest = self
            .store
            .latest_attempt_for_subscription(subscription.subscription_id)
            .await?;
        if let Some(latest) = &latest {
            if latest.status().is_outstanding() {
                return skip(ChargeErrorCode::AttemptOutstanding);
            }
            if context == ChargeContext::Renewal
                && latest.status() == AttemptStatus::Failed
                && latest.created_at >= subscription.ends_at
            {
                match dunning_state(latest, now, &self.settings) {
                    DunningState::Retrying => return skip(ChargeErrorCode::InDunning),
                    DunningState::Exhausted => {
                        return self.cancel_exhausted(subscription, latest, dry_run, now).await;
                    }
                    DunningState::Lapsed => {
                        info!(
                            retry_count = latest.retry_count,
                            "Retry window lapsed, charging the period again"
                        );
                        context = ChargeContext::Retry {
                            retry_count: latest.retry_count + 1,
                        };
                    }
                }
            }
        }

        let Some(method) = self
            .store
            .default_payment_method(subscription.user_id)
            .await?
        else {
            return skip(ChargeErrorCode::NoPaymentMethod);
        };
        if method.is_expired(now) {
            return skip(ChargeErrorCode::PaymentMethodExpired);
        }

        if dry_run {
            let quote = self
                .invoices
                .quote_subscription(subscription, None, now)
                .await
                .map_err(AppError::from)?;
            let mut report = ChargeReport::new(
                ItemOutcome::DryRun,
                format!("Would charge {} {}", quote.total, self.invoices.settings().currency),
            );
            report.subscription_id = subscription_id;
            report.payment_method_id = Some(method.payment_method_id);
            report.amount = Some(quote.total);
            report.retry_count = Some(context.retry_count());
            return Ok(report);
        }

        let gateway = self
            .store
            .get_gateway(self.gateway.slug())
            .await?
            .filter(|g| g.is_active)
            .ok_or_else(|| BillingError::GatewayNotRegistered(self.gateway.slug().to_string()))
            .map_err(AppError::from)?;

        let invoice = self
            .invoices
            .build_for_subscription(subscription, None, now)
            .await
            .map_err(AppError::from)?;

        if invoice.total <= Decimal::ZERO {
            let settlement = self
                .store
                .settle_zero_invoice(invoice.invoice_id, subscription.subscription_id, now)
                .await?;
            let paid = settlement.invoice.clone().unwrap_or_else(|| invoice.clone());
            self.notifications
                .payment_succeeded(&paid, settlement.subscription.as_ref())
                .await;
            info!(invoice_number = %invoice.invoice_number, "Zero-total invoice settled without a charge");
            let mut report = ChargeReport::new(ItemOutcome::Success, "Nothing to charge, invoice settled")
                .with_invoice(&paid);
            report.subscription_id = subscription_id;
            report.payment_method_id = Some(method.payment_method_id);
            return Ok(report);
        }

        let new_attempt = NewPaymentAttempt {
            user_id: subscription.user_id,
            gateway_id: gateway.gateway_id,
            payment_method_id: Some(method.payment_method_id),
            invoice_id: Some(invoice.invoice_id),
            transaction_id: None,
            subscription_id,
            amount: invoice.total,
            currency: invoice.currency.clone(),
            gateway_order_number: generate_order_number(now),
            retry_count: context.retry_count(),
            created_at: now,
        };
        let attempt = match self.attempts.open(&new_attempt).await {
            Ok(attempt) => attempt,
            Err(AppError::Conflict(e)) => {
                warn!(error = %e, "Another pass opened an attempt first");
                self.invoices.cancel(invoice.invoice_id, now).await?;
                return skip(ChargeErrorCode::AttemptOutstanding);
            }
            Err(e) => {
                error!(
                    order_number = %new_attempt.gateway_order_number,
                    error = %e,
                    "Could not open payment attempt"
                );
                self.invoices.cancel(invoice.invoice_id, now).await?;
                return Err(e);
            }
        };

        let dispatched = match self
            .attempts
            .apply(&attempt, &AttemptTransition::Dispatch, now)
            .await?
        {
            TransitionOutcome::Applied(settlement) => settlement.attempt.unwrap_or(attempt),
            TransitionOutcome::Ignored { .. } => {
                return self
                    .report_current(&attempt, &invoice, method.payment_method_id)
                    .await;
            }
        };

        let request = ChargeRequest {
            user_id: subscription.user_id,
            token: method.token.clone(),
            customer_id: method.customer_id.clone(),
            amount: dispatched.amount,
            currency: dispatched.currency.clone(),
            order_number: dispatched.gateway_order_number.clone(),
            description: format!("Factura {}", invoice.invoice_number),
        };

        let answer = tokio::time::timeout(
            self.settings.gateway_timeout,
            self.gateway.charge_with_token(&request),
        )
        .await
        .unwrap_or_else(|_| Err(GatewayError::Timeout(self.settings.gateway_timeout.as_secs())));

        let transition = match &answer {
            Ok(response) => {
                let raw = serde_json::to_value(response).unwrap_or(serde_json::Value::Null);
                match response.outcome() {
                    ChargeOutcome::Approved => AttemptTransition::Succeed {
                        gateway_transaction_id: response.transaction_id.clone(),
                        response: raw,
                    },
                    ChargeOutcome::Pending => AttemptTransition::StillPending {
                        message: response.message.clone(),
                        response: raw,
                    },
                    ChargeOutcome::Declined => AttemptTransition::Fail {
                        error_message: response
                            .message
                            .clone()
                            .filter(|m| !m.trim().is_empty())
                            .unwrap_or_else(|| DECLINED_MESSAGE.to_string()),
                        response: Some(raw),
                    },
                }
            }
            Err(e) => {
                warn!(order_number = %dispatched.gateway_order_number, error = %e, "Gateway charge failed");
                AttemptTransition::Fail {
                    error_message: e.to_string(),
                    response: None,
                }
            }
        };

        match self.attempts.apply(&dispatched, &transition, now).await? {
            TransitionOutcome::Applied(settlement) => {
                self.report_settled(&dispatched, &invoice, &transition, settlement, method.payment_method_id, now)
                    .await
            }
            // A webhook settled the attempt while the charge call was in flight.
            TransitionOutcome::Ignored { .. } => {
                self.report_current(&dispatched, &invoice, method.payment_method_id)
                    .await
            }
        }
    }

    /// Cancel a subscription whose latest failed attempt already sits at the
    /// retry ceiling. Covers cancellations lost after the attempt committed.
    async fn cancel_exhausted(
        &self,
        subscription: &Subscription,
        latest: &PaymentAttempt,
        dry_run: bool,
        now: DateTime<Utc>,
    ) -> Result<ChargeReport, AppError> {
        let mut report = ChargeReport::skipped(
            Some(subscription.subscription_id),
            ChargeErrorCode::MaxRetriesReached,
        )
        .with_attempt(latest);
        if !dry_run {
            report.cancelled = cancel_for_payment_failure(
                self.store.as_ref(),
                &self.notifications,
                subscription.subscription_id,
                now,
            )
            .await?
            .is_some();
        }
        Ok(report)
    }

    async fn report_settled(
        &self,
        attempt: &PaymentAttempt,
        invoice: &Invoice,
        transition: &AttemptTransition,
        settlement: Settlement,
        payment_method_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<ChargeReport, AppError> {
        let updated = settlement.attempt.clone().unwrap_or_else(|| attempt.clone());
        let paid = settlement.invoice.clone().unwrap_or_else(|| invoice.clone());

        let mut report = match transition {
            AttemptTransition::Succeed { .. } => {
                self.notifications
                    .payment_succeeded(&paid, settlement.subscription.as_ref())
                    .await;
                ChargeReport::new(ItemOutcome::Success, "Payment approved")
            }
            AttemptTransition::Fail { error_message, .. } => {
                let mut report = ChargeReport::new(ItemOutcome::Failed, error_message.clone());
                report.error = Some(ChargeErrorCode::ChargeFailed);
                report.cancelled = self.after_failure(&updated, Some(&paid), now).await?;
                report
            }
            _ => ChargeReport::new(
                ItemOutcome::Pending,
                updated
                    .gateway_message
                    .clone()
                    .unwrap_or_else(|| "Awaiting gateway confirmation".to_string()),
            ),
        }
        .with_attempt(&updated)
        .with_invoice(&paid);
        report.payment_method_id = Some(payment_method_id);
        Ok(report)
    }

    async fn report_current(
        &self,
        attempt: &PaymentAttempt,
        invoice: &Invoice,
        payment_method_id: Uuid,
    ) -> Result<ChargeReport, AppError> {
        let current = self
            .store
            .get_attempt(attempt.attempt_id)
            .await?
            .unwrap_or_else(|| attempt.clone());
        let mut report = match current.status() {
            AttemptStatus::Success => ChargeReport::new(ItemOutcome::Success, "Payment approved"),
            AttemptStatus::Pending | AttemptStatus::Processing => {
                ChargeReport::new(ItemOutcome::Pending, "Awaiting gateway confirmation")
            }
            AttemptStatus::Failed | AttemptStatus::Cancelled => {
                let mut report = ChargeReport::new(
                    ItemOutcome::Failed,
                    current
                        .error_message
                        .clone()
                        .unwrap_or_else(|| format!("Attempt {}", current.status.as_str())),
                );
                report.error = Some(ChargeErrorCode::ChargeFailed);
                report
            }
        }
        .with_attempt(&current)
        .with_invoice(invoice);
        report.payment_method_id = Some(payment_method_id);
        Ok(report)
    }

    /// Notify a failed charge and cancel the subscription once the attempt's
    /// retry count has reached the ceiling. Returns whether it cancelled.
    async fn after_failure(
        &self,
        attempt: &PaymentAttempt,
        invoice: Option<&Invoice>,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let subscription = match attempt.subscription_id {
            Some(id) => self.store.get_subscription(id).await?,
            None => None,
        };
        self.notifications
            .payment_failed(attempt, invoice, subscription.as_ref())
            .await;

        match subscription {
            Some(subscription)
                if subscription.is_active() && attempt.retry_count >= self.settings.max_retries =>
            {
                let cancelled = cancel_for_payment_failure(
                    self.store.as_ref(),
                    &self.notifications,
                    subscription.subscription_id,
                    now,
                )
                .await?;
                Ok(cancelled.is_some())
            }
            _ => Ok(false),
        }
    }

    /// Settle attempts stuck in pending or processing: ask the gateway first,
    /// otherwise fail them so they become eligible for retry.
    #[instrument(skip(self))]
    pub async fn sweep_stale_attempts(&self, now: DateTime<Utc>) -> Result<BatchSummary, AppError> {
        let mut summary = BatchSummary::new(false);
        let stale = self
            .store
            .list_stale_attempts(now - self.settings.stale_after)
            .await?;

        info!(count = stale.len(), "Sweeping stale payment attempts");

        for attempt in &stale {
            let report = match self.sweep_attempt(attempt, now).await {
                Ok(report) => report,
                Err(e) => {
                    error!(attempt_id = %attempt.attempt_id, error = %e, "Stale attempt sweep failed");
                    ChargeReport::exception(attempt.subscription_id, &e).with_attempt(attempt)
                }
            };
            summary.push(report);
        }
        Ok(summary)
    }

    #[instrument(skip(self, attempt), fields(attempt_id = %attempt.attempt_id, order_number = %attempt.gateway_order_number))]
    async fn sweep_attempt(
        &self,
        attempt: &PaymentAttempt,
        now: DateTime<Utc>,
    ) -> Result<ChargeReport, AppError> {
        let queried = tokio::time::timeout(
            self.settings.gateway_timeout,
            self.gateway.query_status(&attempt.gateway_order_number),
        )
        .await;

        match queried {
            Ok(Ok(notification))
                if notification.gateway_status().is_some_and(|s| s.is_final()) =>
            {
                let raw = serde_json::to_value(&notification).unwrap_or(serde_json::Value::Null);
                let reconciled = self.reconciliation.process(&notification, raw, now).await?;
                let outcome = match reconciled.outcome {
                    ReconciliationOutcome::Applied {
                        status: AttemptStatus::Success,
                    } => ItemOutcome::Success,
                    ReconciliationOutcome::Applied { .. } => ItemOutcome::Failed,
                    _ => ItemOutcome::Skipped,
                };
                let current = self
                    .store
                    .get_attempt(attempt.attempt_id)
                    .await?
                    .unwrap_or_else(|| attempt.clone());
                return Ok(ChargeReport::new(outcome, reconciled.message).with_attempt(&current));
            }
            Ok(Ok(_)) => info!("Gateway still reports the order as pending"),
            Ok(Err(e)) => warn!(error = %e, "Gateway status query failed"),
            Err(_) => warn!("Gateway status query timed out"),
        }

        let transition = AttemptTransition::Fail {
            error_message: STALE_ATTEMPT_MESSAGE.to_string(),
            response: None,
        };
        match self.attempts.apply(attempt, &transition, now).await? {
            TransitionOutcome::Applied(settlement) => {
                let failed = settlement.attempt.unwrap_or_else(|| attempt.clone());
                let invoice = match failed.invoice_id {
                    Some(id) => self.store.get_invoice(id).await?,
                    None => None,
                };
                let cancelled = self.after_failure(&failed, invoice.as_ref(), now).await?;
                let mut report = ChargeReport::new(ItemOutcome::Failed, STALE_ATTEMPT_MESSAGE)
                    .with_attempt(&failed);
                report.error = Some(ChargeErrorCode::ChargeFailed);
                report.cancelled = cancelled;
                Ok(report)
            }
            TransitionOutcome::Ignored { current, .. } => Ok(ChargeReport::new(
                ItemOutcome::Skipped,
                format!("Attempt already {}", current.as_str()),
            )
            .with_attempt(attempt)),
        }
    }

    /// Send a `card_expiring` notice for every active card inside the notice window.
    #[instrument(skip(self))]
    pub async fn notify_expiring_cards(&self, now: DateTime<Utc>) -> Result<BatchSummary, AppError> {
        let mut summary = BatchSummary::new(false);
        let methods = self.store.list_active_card_methods().await?;

        for method in methods
            .iter()
            .filter(|m| m.is_expiring_soon(now, self.settings.card_notice_days))
        {
            self.notifications.card_expiring(method).await;
            let mut report = ChargeReport::new(
                ItemOutcome::Success,
                format!("Expiry notice sent for {}", method.display_name()),
            );
            report.payment_method_id = Some(method.payment_method_id);
            summary.push(report);
        }

        info!(notified = summary.total, "Expiring-card scan finished");
        Ok(summary)
    }
}
