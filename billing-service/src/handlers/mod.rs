//! HTTP handlers for billing-service.
//!
//! Gateway callbacks plus the infrastructure probes. Batch passes are driven
//! by `billing-cli`, not over HTTP.

pub mod health;
pub mod webhooks;

pub use health::{health_check, metrics_handler, readiness_check};
pub use webhooks::{paymentsway_webhook, SIGNATURE_HEADER};
