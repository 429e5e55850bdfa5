//! Metrics module for billing-service.
//! Provides Prometheus metrics for charges, reconciliation and notifications.

use once_cell::sync::Lazy;
use prometheus::{
    histogram_opts, opts, register_histogram_vec, register_int_counter_vec, Encoder, HistogramVec,
    IntCounterVec, TextEncoder,
};
use std::sync::OnceLock;

/// Database query duration histogram
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        histogram_opts!(
            "billing_db_query_duration_seconds",
            "Database query duration"
        ),
        &["operation"]
    )
    .expect("Failed to register DB_QUERY_DURATION")
});

/// Charge outcomes by pass (renewal, retry) and result
pub static CHARGES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Webhook notifications by gateway status and acknowledgement
pub static WEBHOOKS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Invoices persisted by invoice type
pub static INVOICES_ISSUED_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Payment attempt transitions that landed
pub static ATTEMPT_TRANSITIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Subscriptions cancelled by reason
pub static CANCELLATIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Notification sends that failed or timed out
pub static NOTIFICATION_FAILURES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Gateway call latency
pub static GATEWAY_REQUEST_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Initialize all metrics. Call once at startup.
pub fn init_metrics() {
    CHARGES_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "billing_charges_total",
                "Subscription charges by pass and outcome"
            ),
            &["pass", "outcome"]
        )
        .expect("Failed to register CHARGES_TOTAL")
    });

    WEBHOOKS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "billing_webhooks_total",
                "Gateway notifications by status and acknowledgement"
            ),
            &["status", "ack"]
        )
        .expect("Failed to register WEBHOOKS_TOTAL")
    });

    INVOICES_ISSUED_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!("billing_invoices_issued_total", "Invoices persisted by type"),
            &["invoice_type"]
        )
        .expect("Failed to register INVOICES_ISSUED_TOTAL")
    });

    ATTEMPT_TRANSITIONS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "billing_attempt_transitions_total",
                "Payment attempt transitions applied"
            ),
            &["transition"]
        )
        .expect("Failed to register ATTEMPT_TRANSITIONS_TOTAL")
    });

    CANCELLATIONS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "billing_subscription_cancellations_total",
                "Subscriptions cancelled by reason"
            ),
            &["reason"]
        )
        .expect("Failed to register CANCELLATIONS_TOTAL")
    });

    NOTIFICATION_FAILURES_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "billing_notification_failures_total",
                "Billing notices that could not be sent"
            ),
            &["template"]
        )
        .expect("Failed to register NOTIFICATION_FAILURES_TOTAL")
    });

    GATEWAY_REQUEST_DURATION.get_or_init(|| {
        register_histogram_vec!(
            histogram_opts!(
                "billing_gateway_request_duration_seconds",
                "Payment gateway request duration",
                vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
            ),
            &["operation"]
        )
        .expect("Failed to register GATEWAY_REQUEST_DURATION")
    });

    // Force initialization of lazy statics
    let _ = &*DB_QUERY_DURATION;
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

/// Record a charge outcome.
pub fn record_charge(pass: &str, outcome: &str) {
    if let Some(counter) = CHARGES_TOTAL.get() {
        counter.with_label_values(&[pass, outcome]).inc();
    }
}

/// Record a processed webhook.
pub fn record_webhook(status: &str, ack: &str) {
    if let Some(counter) = WEBHOOKS_TOTAL.get() {
        counter.with_label_values(&[status, ack]).inc();
    }
}

/// Record an invoice issued.
pub fn record_invoice_issued(invoice_type: &str) {
    if let Some(counter) = INVOICES_ISSUED_TOTAL.get() {
        counter.with_label_values(&[invoice_type]).inc();
    }
}

/// Record an attempt transition.
pub fn record_attempt_transition(transition: &str) {
    if let Some(counter) = ATTEMPT_TRANSITIONS_TOTAL.get() {
        counter.with_label_values(&[transition]).inc();
    }
}

/// Record a subscription cancellation.
pub fn record_cancellation(reason: &str) {
    if let Some(counter) = CANCELLATIONS_TOTAL.get() {
        counter.with_label_values(&[reason]).inc();
    }
}

/// Record a notification that was not delivered.
pub fn record_notification_failure(template: &str) {
    if let Some(counter) = NOTIFICATION_FAILURES_TOTAL.get() {
        counter.with_label_values(&[template]).inc();
    }
}

/// Record gateway request duration.
pub fn record_gateway_duration(operation: &str, duration_secs: f64) {
    if let Some(histogram) = GATEWAY_REQUEST_DURATION.get() {
        histogram
            .with_label_values(&[operation])
            .observe(duration_secs);
    }
}
