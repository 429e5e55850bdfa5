//! PaymentsWay callback ingress.

use crate::services::gateway::GatewayNotification;
use crate::startup::AppState;
use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use secrecy::ExposeSecret;
use serde_json::json;
use service_core::error::AppError;
use service_core::utils::signature::verify_payload_signature;

pub const SIGNATURE_HEADER: &str = "X-PaymentsWay-Signature";

/// Receive a gateway notification.
///
/// Answers 200 for a final approval and 201 for every other recognised,
/// duplicate or unknown-order notification. Only unexpected failures
/// produce a 500.
pub async fn paymentsway_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Result<Response, AppError> {
    if let Some(secret) = &state.webhook_secret {
        let signature = headers
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                tracing::warn!("Missing {} header", SIGNATURE_HEADER);
                AppError::Unauthorized(anyhow::anyhow!("Missing webhook signature"))
            })?;

        let is_valid = verify_payload_signature(secret.expose_secret(), body.as_bytes(), signature)
            .map_err(|e| {
                tracing::error!(error = %e, "Webhook signature verification error");
                AppError::InternalError(anyhow::anyhow!("Webhook verification failed"))
            })?;

        if !is_valid {
            tracing::warn!("Invalid webhook signature");
            return Err(AppError::Unauthorized(anyhow::anyhow!(
                "Invalid webhook signature"
            )));
        }
    }

    let raw: serde_json::Value = serde_json::from_str(&body).map_err(|e| {
        tracing::warn!(error = %e, "Webhook body is not JSON");
        AppError::BadRequest(anyhow::anyhow!("Invalid webhook payload"))
    })?;
    let notification: GatewayNotification = serde_json::from_value(raw.clone()).map_err(|e| {
        tracing::warn!(error = %e, "Webhook body is not a PaymentsWay notification");
        AppError::BadRequest(anyhow::anyhow!("Invalid webhook payload"))
    })?;

    tracing::info!(
        order_number = %notification.order_number,
        status_id = notification.status.id,
        "Processing PaymentsWay webhook"
    );

    let processing = state.reconciliation.process(&notification, raw, Utc::now());
    let result = tokio::time::timeout(state.webhook_timeout, processing).await;

    match result {
        Ok(Ok(report)) => {
            let status = StatusCode::from_u16(report.ack.http_status()).unwrap_or(StatusCode::OK);
            Ok((
                status,
                Json(json!({
                    "success": true,
                    "message": report.message,
                    "order_number": report.order_number,
                    "outcome": report.outcome,
                })),
            )
                .into_response())
        }
        Ok(Err(e)) => {
            tracing::error!(
                order_number = %notification.order_number,
                error = %e,
                "Webhook processing error"
            );
            Ok(processing_error())
        }
        Err(_) => {
            tracing::error!(
                order_number = %notification.order_number,
                timeout_secs = state.webhook_timeout.as_secs(),
                "Webhook processing timed out"
            );
            Ok(processing_error())
        }
    }
}

fn processing_error() -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({
            "success": false,
            "message": "Error processing webhook",
        })),
    )
        .into_response()
}
