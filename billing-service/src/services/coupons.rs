//! Coupon validation and redemption.

use crate::error::BillingError;
use crate::models::{CouponUsage, EntityRef, NewCouponUsage};
use crate::services::ledger::{validate_coupon, CouponContext, CouponQuote, CouponRejection};
use crate::services::store::BillingStore;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

#[derive(Clone)]
pub struct CouponService {
    store: Arc<dyn BillingStore>,
}

impl CouponService {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self { store }
    }

    /// Read-only: quote the discount `code` grants in `context`.
    #[instrument(skip(self, context), fields(code = %code))]
    pub async fn validate(
        &self,
        code: &str,
        context: &CouponContext,
        now: DateTime<Utc>,
    ) -> Result<CouponQuote, BillingError> {
        let coupon = self.store.find_coupon(code).await?;
        validate_coupon(coupon.as_ref(), context, now).map_err(|rejection| {
            info!(reason = rejection.code(), "Coupon rejected");
            BillingError::InvalidCoupon(rejection)
        })
    }

    /// Validate and redeem in one step. The usage counter is incremented by a
    /// guarded update, so concurrent redemptions never exceed the limit.
    #[instrument(skip(self, context, billable), fields(code = %code, user_id = %user_id))]
    pub async fn apply(
        &self,
        code: &str,
        context: &CouponContext,
        user_id: Uuid,
        billable: Option<EntityRef>,
        now: DateTime<Utc>,
    ) -> Result<(CouponQuote, CouponUsage), BillingError> {
        let quote = self.validate(code, context, now).await?;
        let usage = self
            .store
            .redeem_coupon(&redemption_for(&quote, user_id, billable), now)
            .await?;

        match usage {
            Some(usage) => {
                info!(
                    coupon_id = %quote.coupon_id,
                    discount = %quote.discount,
                    "Coupon applied"
                );
                Ok((quote, usage))
            }
            None => {
                warn!(coupon_id = %quote.coupon_id, "Coupon redemption lost the usage guard");
                Err(BillingError::InvalidCoupon(CouponRejection::UsageLimitReached))
            }
        }
    }
}

/// The usage row recorded when `quote` is redeemed.
pub fn redemption_for(
    quote: &CouponQuote,
    user_id: Uuid,
    billable: Option<EntityRef>,
) -> NewCouponUsage {
    NewCouponUsage {
        coupon_id: quote.coupon_id,
        user_id,
        billable,
        discount_amount: quote.discount,
        original_amount: quote.original_amount,
        final_amount: quote.final_amount,
    }
}
