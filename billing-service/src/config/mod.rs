//! Configuration module for billing-service.

use crate::services::gateway::{PaymentsWayConfig, DEFAULT_API_URL};
use crate::services::invoices::InvoiceSettings;
use crate::services::notifier::SmtpSettings;
use crate::services::scheduler::SchedulerSettings;
use secrecy::Secret;
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct BillingConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub paymentsway: PaymentsWayConfig,
    /// Shared secret for `X-PaymentsWay-Signature`. Unsigned notifications
    /// are accepted when unset.
    pub webhook_secret: Option<Secret<String>>,
    pub invoices: InvoiceSettings,
    pub scheduler: SchedulerSettings,
    pub smtp: SmtpSettings,
    pub notification_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: Secret<String>,
    pub max_connections: u32,
    pub min_connections: u32,
}

impl BillingConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;
        let is_prod = env::var("ENVIRONMENT").unwrap_or_else(|_| "dev".to_string()) == "prod";

        let currency = get_env("BILLING_CURRENCY", Some("COP"), false)?;
        let gateway_timeout = parse_env("PAYMENTSWAY_TIMEOUT_SECS", 30u64)?;

        Ok(Self {
            common,
            service_name: env::var("SERVICE_NAME")
                .unwrap_or_else(|_| "billing-service".to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok(),
            database: DatabaseConfig {
                url: Secret::new(get_env("BILLING_DATABASE_URL", None, is_prod)?),
                max_connections: parse_env("BILLING_DB_MAX_CONNECTIONS", 10)?,
                min_connections: parse_env("BILLING_DB_MIN_CONNECTIONS", 1)?,
            },
            paymentsway: PaymentsWayConfig {
                api_url: get_env("PAYMENTSWAY_API_URL", Some(DEFAULT_API_URL), false)?,
                api_key: Secret::new(get_env("PAYMENTSWAY_API_KEY", Some(""), is_prod)?),
                merchant_id: get_env("PAYMENTSWAY_MERCHANT_ID", Some(""), is_prod)?,
                form_id: get_env("PAYMENTSWAY_FORM_ID", Some(""), is_prod)?,
                terminal_id: get_env("PAYMENTSWAY_TERMINAL_ID", Some(""), is_prod)?,
                return_url: get_env(
                    "PAYMENTSWAY_RETURN_URL",
                    Some("http://localhost:8080/payments/return"),
                    is_prod,
                )?,
                currency: currency.clone(),
                timeout_secs: gateway_timeout,
            },
            webhook_secret: env::var("PAYMENTSWAY_WEBHOOK_SECRET")
                .ok()
                .filter(|s| !s.is_empty())
                .map(Secret::new),
            invoices: InvoiceSettings {
                prefix: get_env("INVOICE_PREFIX", Some("INV"), false)?,
                currency,
                due_days: parse_env("INVOICE_DUE_DAYS", 30)?,
            },
            scheduler: SchedulerSettings {
                max_retries: parse_env("BILLING_MAX_PAYMENT_RETRIES", 3)?,
                retry_window_days: parse_env("BILLING_RETRY_WINDOW_DAYS", 10)?,
                stale_after: chrono::Duration::minutes(parse_env(
                    "BILLING_STALE_ATTEMPT_MINUTES",
                    60,
                )?),
                card_notice_days: parse_env("BILLING_CARD_EXPIRY_NOTICE_DAYS", 30)?,
                gateway_timeout: Duration::from_secs(gateway_timeout),
            },
            smtp: SmtpSettings {
                host: get_env("SMTP_HOST", Some("smtp.gmail.com"), false)?,
                port: parse_env("SMTP_PORT", 587)?,
                user: get_env("SMTP_USER", Some(""), false)?,
                password: Secret::new(get_env("SMTP_PASSWORD", Some(""), false)?),
                from_email: get_env("SMTP_FROM_EMAIL", Some("billing@example.com"), false)?,
                from_name: get_env("SMTP_FROM_NAME", Some("Billing"), false)?,
                enabled: env::var("SMTP_ENABLED")
                    .unwrap_or_else(|_| "false".to_string())
                    .parse()
                    .unwrap_or(false),
            },
            notification_timeout: Duration::from_secs(parse_env(
                "BILLING_NOTIFICATION_TIMEOUT_SECS",
                10,
            )?),
        })
    }
}

fn get_env(key: &str, default: Option<&str>, is_prod: bool) -> Result<String, AppError> {
    match env::var(key) {
        Ok(val) => Ok(val),
        Err(_) => {
            if is_prod {
                Err(AppError::ConfigError(anyhow::anyhow!(
                    "{} is required in production but not set",
                    key
                )))
            } else if let Some(def) = default {
                Ok(def.to_string())
            } else {
                Err(AppError::ConfigError(anyhow::anyhow!(
                    "{} is required but not set",
                    key
                )))
            }
        }
    }
}

/// Numeric setting with a default. A present but malformed value is an error.
fn parse_env<T>(key: &str, default: T) -> Result<T, AppError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(val) => val.trim().parse().map_err(|e| {
            AppError::ConfigError(anyhow::anyhow!("{} is not a valid number: {}", key, e))
        }),
        Err(_) => Ok(default),
    }
}
