//! Payment attempt state machine.
//!
//! ```text
//! pending ──dispatch──▶ processing ──succeed──▶ success ──refund──▶ cancelled
//!    │                     │  ▲ still_pending
//!    │                     │  └──┘
//!    └──fail/cancel───────▶├──fail────▶ failed
//!                          └──cancel──▶ cancelled
//! ```
//!
//! Every transition is a compare-and-swap in the store keyed on the states it
//! may leave from, so concurrent callers (a batch pass and a webhook) settle an
//! attempt exactly once. Only the caller whose swap lands sees the side effects.

use crate::models::{
    AttemptStatus, Invoice, NewPaymentAttempt, PaymentAttempt, Subscription, Transaction,
};
use crate::services::metrics::record_attempt_transition;
use crate::services::store::BillingStore;
use chrono::{DateTime, Utc};
use serde::Serialize;
use service_core::error::AppError;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, instrument, warn};

/// Gateway message recorded on refunded attempts.
pub const REFUNDED_MESSAGE: &str = "refunded";

/// A typed transition of one attempt row.
#[derive(Debug, Clone)]
pub enum AttemptTransition {
    /// Sent to the gateway.
    Dispatch,
    /// Gateway acknowledged but has not settled (authorization or cash payment pending).
    StillPending {
        message: Option<String>,
        response: serde_json::Value,
    },
    Succeed {
        gateway_transaction_id: Option<String>,
        response: serde_json::Value,
    },
    Fail {
        error_message: String,
        response: Option<serde_json::Value>,
    },
    Cancel {
        response: serde_json::Value,
    },
    Refund {
        response: serde_json::Value,
    },
}

/// Side effects a transition carries beyond the attempt row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettlementEffect {
    None,
    /// Invoice paid, transaction completed, subscription extended by one period.
    Settle,
    /// Invoice and transaction refunded.
    Refund,
}

/// Column values written by a transition. `None` leaves a column unchanged.
#[derive(Debug, Clone)]
pub struct AttemptUpdate {
    pub status: AttemptStatus,
    pub gateway_transaction_id: Option<String>,
    pub gateway_response: Option<serde_json::Value>,
    pub gateway_message: Option<String>,
    pub error_message: Option<String>,
    pub attempted_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl AttemptTransition {
    pub fn name(&self) -> &'static str {
        match self {
            AttemptTransition::Dispatch => "dispatch",
            AttemptTransition::StillPending { .. } => "still_pending",
            AttemptTransition::Succeed { .. } => "succeed",
            AttemptTransition::Fail { .. } => "fail",
            AttemptTransition::Cancel { .. } => "cancel",
            AttemptTransition::Refund { .. } => "refund",
        }
    }

    pub fn target(&self) -> AttemptStatus {
        match self {
            AttemptTransition::Dispatch | AttemptTransition::StillPending { .. } => {
                AttemptStatus::Processing
            }
            AttemptTransition::Succeed { .. } => AttemptStatus::Success,
            AttemptTransition::Fail { .. } => AttemptStatus::Failed,
            AttemptTransition::Cancel { .. } | AttemptTransition::Refund { .. } => {
                AttemptStatus::Cancelled
            }
        }
    }

    /// States this transition may leave from. Success, failed and cancelled
    /// are absorbing except that a settled payment can still be refunded.
    pub fn allowed_from(&self) -> &'static [AttemptStatus] {
        match self {
            AttemptTransition::Dispatch => &[AttemptStatus::Pending],
            AttemptTransition::StillPending { .. }
            | AttemptTransition::Succeed { .. }
            | AttemptTransition::Fail { .. }
            | AttemptTransition::Cancel { .. } => {
                &[AttemptStatus::Pending, AttemptStatus::Processing]
            }
            AttemptTransition::Refund { .. } => {
                &[AttemptStatus::Processing, AttemptStatus::Success]
            }
        }
    }

    pub fn allowed_from_strings(&self) -> Vec<String> {
        self.allowed_from()
            .iter()
            .map(|s| s.as_str().to_string())
            .collect()
    }

    pub fn effect(&self) -> SettlementEffect {
        match self {
            AttemptTransition::Succeed { .. } => SettlementEffect::Settle,
            AttemptTransition::Refund { .. } => SettlementEffect::Refund,
            _ => SettlementEffect::None,
        }
    }

    pub fn check(&self, current: AttemptStatus) -> Result<(), TransitionError> {
        if self.allowed_from().contains(&current) {
            Ok(())
        } else {
            Err(TransitionError::Illegal {
                from: current,
                transition: self.name(),
            })
        }
    }

    pub fn update(&self, now: DateTime<Utc>) -> AttemptUpdate {
        let mut update = AttemptUpdate {
            status: self.target(),
            gateway_transaction_id: None,
            gateway_response: None,
            gateway_message: None,
            error_message: None,
            attempted_at: None,
            completed_at: None,
        };
        match self {
            AttemptTransition::Dispatch => update.attempted_at = Some(now),
            AttemptTransition::StillPending { message, response } => {
                update.gateway_message = message.clone();
                update.gateway_response = Some(response.clone());
            }
            AttemptTransition::Succeed {
                gateway_transaction_id,
                response,
            } => {
                update.gateway_transaction_id = gateway_transaction_id.clone();
                update.gateway_response = Some(response.clone());
                update.completed_at = Some(now);
            }
            AttemptTransition::Fail {
                error_message,
                response,
            } => {
                update.error_message = Some(error_message.clone());
                update.gateway_response = response.clone();
                update.completed_at = Some(now);
            }
            AttemptTransition::Cancel { response } => {
                update.gateway_response = Some(response.clone());
                update.completed_at = Some(now);
            }
            AttemptTransition::Refund { response } => {
                update.gateway_response = Some(response.clone());
                update.gateway_message = Some(REFUNDED_MESSAGE.to_string());
                update.completed_at = Some(now);
            }
        }
        update
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("transition '{transition}' is not allowed from '{}'", from.as_str())]
    Illegal {
        from: AttemptStatus,
        transition: &'static str,
    },
}

/// What a landed transition changed.
#[derive(Debug, Clone, Serialize)]
pub struct Settlement {
    pub attempt: Option<PaymentAttempt>,
    pub invoice: Option<Invoice>,
    pub transaction: Option<Transaction>,
    pub subscription: Option<Subscription>,
    /// True only for the caller that moved `ends_at` forward.
    pub period_extended: bool,
}

impl Settlement {
    pub fn empty() -> Self {
        Self {
            attempt: None,
            invoice: None,
            transaction: None,
            subscription: None,
            period_extended: false,
        }
    }
}

#[derive(Debug, Clone)]
pub enum TransitionOutcome {
    Applied(Settlement),
    /// The attempt was already elsewhere: duplicate delivery, late result or a lost race.
    Ignored {
        current: AttemptStatus,
        reason: String,
    },
}

impl TransitionOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, TransitionOutcome::Applied(_))
    }
}

/// Drives attempts through their lifecycle on top of a [`BillingStore`].
#[derive(Clone)]
pub struct PaymentAttemptService {
    store: Arc<dyn BillingStore>,
}

impl PaymentAttemptService {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self { store }
    }

    /// Create a `pending` attempt. Fails with `Conflict` if the subscription
    /// already has one outstanding.
    #[instrument(skip(self, attempt), fields(order_number = %attempt.gateway_order_number))]
    pub async fn open(&self, attempt: &NewPaymentAttempt) -> Result<PaymentAttempt, AppError> {
        let created = self.store.create_attempt(attempt).await?;
        info!(
            attempt_id = %created.attempt_id,
            amount = %created.amount,
            retry_count = created.retry_count,
            "Payment attempt opened"
        );
        Ok(created)
    }

    #[instrument(
        skip(self, attempt, transition),
        fields(attempt_id = %attempt.attempt_id, transition = transition.name())
    )]
    pub async fn apply(
        &self,
        attempt: &PaymentAttempt,
        transition: &AttemptTransition,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome, AppError> {
        if let Err(e) = transition.check(attempt.status()) {
            info!(error = %e, "Attempt transition ignored");
            return Ok(TransitionOutcome::Ignored {
                current: attempt.status(),
                reason: e.to_string(),
            });
        }

        match self
            .store
            .apply_attempt_transition(attempt.attempt_id, transition, now)
            .await?
        {
            Some(settlement) => {
                record_attempt_transition(transition.name());
                info!(
                    order_number = %attempt.gateway_order_number,
                    status = transition.target().as_str(),
                    period_extended = settlement.period_extended,
                    "Attempt transition applied"
                );
                Ok(TransitionOutcome::Applied(settlement))
            }
            None => {
                // Another caller moved the attempt between our read and the swap.
                let current = self
                    .store
                    .get_attempt(attempt.attempt_id)
                    .await?
                    .map(|a| a.status())
                    .unwrap_or_else(|| attempt.status());
                warn!(
                    current = current.as_str(),
                    "Attempt transition lost compare-and-swap"
                );
                Ok(TransitionOutcome::Ignored {
                    current,
                    reason: format!("attempt is already {}", current.as_str()),
                })
            }
        }
    }
}
