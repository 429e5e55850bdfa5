//! Services module for billing-service.

pub mod attempts;
pub mod coupons;
pub mod database;
pub mod gateway;
pub mod invoices;
pub mod ledger;
pub mod memory;
pub mod metrics;
pub mod notifier;
pub mod payment_methods;
pub mod reconciliation;
pub mod scheduler;
pub mod store;

pub use attempts::{AttemptTransition, PaymentAttemptService, Settlement, TransitionOutcome};
pub use coupons::CouponService;
pub use database::Database;
pub use gateway::{
    GatewayError, GatewayNotification, MockPaymentGateway, PaymentGateway, PaymentsWayClient,
    PaymentsWayConfig,
};
pub use invoices::{InvoiceBuilder, InvoiceSettings};
pub use memory::MemoryStore;
pub use metrics::{get_metrics, init_metrics};
pub use notifier::{BillingNotifier, Notifications, RecordingNotifier, SmtpNotifier, SmtpSettings};
pub use payment_methods::PaymentMethodService;
pub use reconciliation::{Acknowledgement, ReconciliationProcessor, ReconciliationReport};
pub use scheduler::{
    BatchSummary, BillingScheduler, ChargeOptions, ChargeReport, RetryOptions, SchedulerSettings,
};
pub use store::BillingStore;
