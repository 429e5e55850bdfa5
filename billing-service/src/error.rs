//! Engine-level error types.

use crate::services::gateway::GatewayError;
use crate::services::ledger::CouponRejection;
use service_core::error::AppError;
use thiserror::Error;
use uuid::Uuid;

/// Failures of invoice building and charge orchestration.
///
/// Batch preconditions (missing payment method, retry ceiling, ...) are not
/// errors; they are reported as [`crate::services::scheduler::ChargeErrorCode`].
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Invalid coupon: {0}")]
    InvalidCoupon(#[from] CouponRejection),

    #[error("Plan {0} not found")]
    PlanNotFound(Uuid),

    #[error("Transaction {0} not found")]
    TransactionNotFound(Uuid),

    #[error("Payment gateway '{0}' is not registered")]
    GatewayNotRegistered(String),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Store(#[from] AppError),
}

impl From<BillingError> for AppError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::InvalidCoupon(rejection) => {
                AppError::BadRequest(anyhow::anyhow!("Invalid coupon: {}", rejection))
            }
            BillingError::PlanNotFound(_) | BillingError::TransactionNotFound(_) => {
                AppError::NotFound(anyhow::anyhow!(err.to_string()))
            }
            BillingError::GatewayNotRegistered(_) => {
                AppError::ConfigError(anyhow::anyhow!(err.to_string()))
            }
            BillingError::Gateway(e) => AppError::BadGateway(e.to_string()),
            BillingError::Store(inner) => inner,
        }
    }
}
