//! Domain models for billing-service.

mod coupon;
mod invoice;
mod payment;
mod plan;
mod reference;
mod referral;
mod subscription;
mod transaction;
mod usage;

pub use coupon::{Coupon, CouponUsage, CouponUsageType, DiscountType, NewCouponUsage};
pub use invoice::{
    format_invoice_number, parse_invoice_sequence, Invoice, InvoiceItem, InvoiceStatus,
    InvoiceType, NewInvoice, NewInvoiceItem,
};
pub use payment::{
    generate_order_number, AttemptStatus, NewPaymentAttempt, NewPaymentMethod, PaymentAttempt,
    PaymentGatewayRecord, PaymentMethod,
};
pub use plan::Plan;
pub use reference::{EntityKind, EntityRef};
pub use referral::{NewRewardApplication, ReferralReward, RewardApplication, RewardStatus, RewardType};
pub use subscription::{
    add_billing_period, BillingContact, BillingMode, Cancellation, Subscription,
    SubscriptionStatus,
};
pub use transaction::{Transaction, TransactionStatus};
pub use usage::{Usage, UsagePrice, UsageTotal};
