//! Reconciliation of gateway notifications.
//!
//! A notification is keyed by the attempt's order number and mapped through a
//! fixed status table onto an attempt transition. Redelivery and out-of-order
//! delivery are absorbed by the transition's compare-and-swap: only the first
//! delivery that lands has side effects.

use crate::models::{AttemptStatus, Invoice, PaymentAttempt, Subscription};
use crate::services::attempts::{AttemptTransition, PaymentAttemptService, TransitionOutcome};
use crate::services::gateway::{GatewayNotification, GatewayStatus};
use crate::services::metrics::record_webhook;
use crate::services::notifier::Notifications;
use crate::services::scheduler::cancel_for_payment_failure;
use crate::services::store::BillingStore;
use chrono::{DateTime, Utc};
use serde::Serialize;
use service_core::error::AppError;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

pub const DECLINED_MESSAGE: &str = "Pago rechazado";
pub const PENDING_CASH_MESSAGE: &str = "Pendiente de pago en efectivo";
pub const PENDING_MESSAGE: &str = "Pendiente de autorización";
pub const NOT_FOUND_MESSAGE: &str = "Payment attempt not found";

/// Coarse answer for the transport layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Acknowledgement {
    /// The gateway reported a final approval.
    FinalSuccess,
    /// Recognised or ignored, but not a final approval.
    Accepted,
}

impl Acknowledgement {
    pub fn http_status(&self) -> u16 {
        match self {
            Acknowledgement::FinalSuccess => 200,
            Acknowledgement::Accepted => 201,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Acknowledgement::FinalSuccess => "final_success",
            Acknowledgement::Accepted => "accepted",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReconciliationOutcome {
    Applied { status: AttemptStatus },
    /// Already settled or moved elsewhere; no side effects.
    Duplicate { current: AttemptStatus },
    NotFound,
    Unrecognized { code: i64 },
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconciliationReport {
    pub order_number: String,
    pub ack: Acknowledgement,
    pub outcome: ReconciliationOutcome,
    pub message: String,
}

/// Map a gateway status onto the attempt transition it requests.
pub fn transition_for(
    status: GatewayStatus,
    notification: &GatewayNotification,
    response: serde_json::Value,
) -> AttemptTransition {
    match status {
        GatewayStatus::Approved => AttemptTransition::Succeed {
            gateway_transaction_id: notification.transaction_id.clone(),
            response,
        },
        GatewayStatus::PendingAuthorization => AttemptTransition::StillPending {
            message: Some(
                notification
                    .status
                    .nombre
                    .clone()
                    .unwrap_or_else(|| PENDING_MESSAGE.to_string()),
            ),
            response,
        },
        GatewayStatus::Declined => AttemptTransition::Fail {
            error_message: notification
                .decline_cause()
                .unwrap_or(DECLINED_MESSAGE)
                .to_string(),
            response: Some(response),
        },
        GatewayStatus::Cancelled => AttemptTransition::Cancel { response },
        GatewayStatus::Refunded => AttemptTransition::Refund { response },
        GatewayStatus::PendingCash => AttemptTransition::StillPending {
            message: Some(PENDING_CASH_MESSAGE.to_string()),
            response,
        },
    }
}

#[derive(Clone)]
pub struct ReconciliationProcessor {
    store: Arc<dyn BillingStore>,
    attempts: PaymentAttemptService,
    notifications: Notifications,
    max_retries: i32,
}

impl ReconciliationProcessor {
    pub fn new(
        store: Arc<dyn BillingStore>,
        notifications: Notifications,
        max_retries: i32,
    ) -> Self {
        Self {
            attempts: PaymentAttemptService::new(store.clone()),
            store,
            notifications,
            max_retries,
        }
    }

    /// Apply one gateway notification. `raw` is stored as the gateway response.
    #[instrument(
        skip(self, notification, raw),
        fields(order_number = %notification.order_number, status_id = notification.status.id)
    )]
    pub async fn process(
        &self,
        notification: &GatewayNotification,
        raw: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<ReconciliationReport, AppError> {
        let status = notification.gateway_status();
        let status_label = status.map_or("unknown", |s| s.as_str());
        let ack = if status == Some(GatewayStatus::Approved) {
            Acknowledgement::FinalSuccess
        } else {
            Acknowledgement::Accepted
        };
        let report = |outcome: ReconciliationOutcome, message: String| {
            record_webhook(status_label, ack.as_str());
            ReconciliationReport {
                order_number: notification.order_number.clone(),
                ack,
                outcome,
                message,
            }
        };

        let Some(attempt) = self
            .store
            .find_attempt_by_order_number(&notification.order_number)
            .await?
        else {
            warn!("Gateway notification for unknown order");
            return Ok(report(
                ReconciliationOutcome::NotFound,
                NOT_FOUND_MESSAGE.to_string(),
            ));
        };

        let Some(status) = status else {
            warn!(
                status_name = ?notification.status.nombre,
                attempt_id = %attempt.attempt_id,
                "Unknown gateway status ignored"
            );
            return Ok(report(
                ReconciliationOutcome::Unrecognized {
                    code: notification.status.id,
                },
                format!("Unknown status {}", notification.status.id),
            ));
        };

        if let Some(amount) = notification.amount {
            if amount.round_dp(2) != attempt.amount.round_dp(2) {
                warn!(
                    attempt_id = %attempt.attempt_id,
                    expected = %attempt.amount,
                    reported = %amount,
                    "Gateway amount differs from attempt amount"
                );
            }
        }

        if status == GatewayStatus::Approved && attempt.status() == AttemptStatus::Failed {
            error!(
                attempt_id = %attempt.attempt_id,
                gateway_transaction_id = ?notification.transaction_id,
                "Approval received for a failed attempt, manual review required"
            );
        }

        let transition = transition_for(status, notification, raw);
        match self.attempts.apply(&attempt, &transition, now).await? {
            TransitionOutcome::Applied(settlement) => {
                let updated = settlement.attempt.clone().unwrap_or_else(|| attempt.clone());
                match status {
                    GatewayStatus::Approved => {
                        if let Some(invoice) = &settlement.invoice {
                            self.notifications
                                .payment_succeeded(invoice, settlement.subscription.as_ref())
                                .await;
                        }
                    }
                    GatewayStatus::Declined => self.after_decline(&updated, now).await?,
                    _ => {}
                }
                info!(
                    attempt_id = %attempt.attempt_id,
                    status = updated.status.as_str(),
                    "Gateway notification applied"
                );
                Ok(report(
                    ReconciliationOutcome::Applied {
                        status: updated.status(),
                    },
                    format!("Payment {}", status.as_str()),
                ))
            }
            TransitionOutcome::Ignored { current, reason } => {
                info!(attempt_id = %attempt.attempt_id, reason = %reason, "Duplicate or late notification");
                Ok(report(
                    ReconciliationOutcome::Duplicate { current },
                    format!("Already {}", current.as_str()),
                ))
            }
        }
    }

    /// A declined attempt notifies the customer and, once the dunning
    /// ceiling is reached, cancels the subscription.
    async fn after_decline(
        &self,
        attempt: &PaymentAttempt,
        now: DateTime<Utc>,
    ) -> Result<(), AppError> {
        let (invoice, subscription) = self.context(attempt).await?;
        self.notifications
            .payment_failed(attempt, invoice.as_ref(), subscription.as_ref())
            .await;

        if let Some(subscription) = subscription {
            if attempt.retry_count >= self.max_retries && subscription.is_active() {
                cancel_for_payment_failure(
                    self.store.as_ref(),
                    &self.notifications,
                    subscription.subscription_id,
                    now,
                )
                .await?;
            }
        }
        Ok(())
    }

    async fn context(
        &self,
        attempt: &PaymentAttempt,
    ) -> Result<(Option<Invoice>, Option<Subscription>), AppError> {
        let invoice = match attempt.invoice_id {
            Some(id) => self.store.get_invoice(id).await?,
            None => None,
        };
        let subscription = match attempt.subscription_id {
            Some(id) => self.store.get_subscription(id).await?,
            None => None,
        };
        Ok((invoice, subscription))
    }
}
