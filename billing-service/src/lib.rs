//! Recurring billing and payment reconciliation engine for the PaymentsWay
//! gateway.
//!
//! The library hosts the engine; `billing-service` serves gateway callbacks
//! and `billing-cli` runs the scheduled passes.

pub mod config;
pub mod error;
pub mod handlers;
pub mod models;
pub mod services;
pub mod startup;
