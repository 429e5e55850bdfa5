//! Billing notices.
//!
//! The engine hands a [`BillingNotice`] to a [`BillingNotifier`] through
//! [`Notifications`], which resolves the recipient, bounds the send with a
//! timeout and swallows failures after logging and counting them.

use crate::models::{BillingContact, Invoice, PaymentAttempt, PaymentMethod, Subscription};
use crate::services::metrics::record_notification_failure;
use crate::services::store::BillingStore;
use async_trait::async_trait;
use lettre::{
    message::{header::ContentType, Mailbox},
    transport::smtp::authentication::Credentials,
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use secrecy::{ExposeSecret, Secret};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Provider not enabled: {0}")]
    NotEnabled(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Send error: {0}")]
    SendFailed(String),

    #[error("Invalid recipient: {0}")]
    InvalidRecipient(String),
}

/// The fixed set of billing templates and the data each one renders.
#[derive(Debug, Clone)]
pub enum BillingNotice {
    PaymentSucceeded {
        invoice: Invoice,
        subscription: Option<Subscription>,
    },
    PaymentFailed {
        attempt: PaymentAttempt,
        invoice: Option<Invoice>,
        subscription: Option<Subscription>,
    },
    SubscriptionCancelled {
        subscription: Subscription,
    },
    CardExpiring {
        method: PaymentMethod,
    },
}

impl BillingNotice {
    pub fn template(&self) -> &'static str {
        match self {
            BillingNotice::PaymentSucceeded { .. } => "payment_succeeded",
            BillingNotice::PaymentFailed { .. } => "payment_failed",
            BillingNotice::SubscriptionCancelled { .. } => "subscription_cancelled",
            BillingNotice::CardExpiring { .. } => "card_expiring",
        }
    }

    pub fn user_id(&self) -> Uuid {
        match self {
            BillingNotice::PaymentSucceeded { invoice, .. } => invoice.user_id,
            BillingNotice::PaymentFailed { attempt, .. } => attempt.user_id,
            BillingNotice::SubscriptionCancelled { subscription } => subscription.user_id,
            BillingNotice::CardExpiring { method } => method.user_id,
        }
    }

    pub fn subject(&self) -> String {
        match self {
            BillingNotice::PaymentSucceeded { invoice, .. } => {
                format!("Pago Exitoso - Factura {}", invoice.invoice_number)
            }
            BillingNotice::PaymentFailed {
                invoice: Some(invoice),
                ..
            } => format!("Fallo en el Pago - Factura {}", invoice.invoice_number),
            BillingNotice::PaymentFailed { .. } => "Fallo en el Pago".to_string(),
            BillingNotice::SubscriptionCancelled { .. } => "Suscripción Cancelada".to_string(),
            BillingNotice::CardExpiring { .. } => "Tu Tarjeta Está por Expirar".to_string(),
        }
    }

    pub fn body(&self, contact: &BillingContact) -> String {
        let greeting = format!("Hola {},", contact.name.as_deref().unwrap_or("cliente"));
        let detail = match self {
            BillingNotice::PaymentSucceeded {
                invoice,
                subscription,
            } => {
                let mut text = format!(
                    "Recibimos tu pago de {} {} para la factura {}.",
                    invoice.total, invoice.currency, invoice.invoice_number
                );
                if let Some(subscription) = subscription {
                    text.push_str(&format!(
                        " Tu suscripción está activa hasta el {}.",
                        subscription.ends_at.format("%Y-%m-%d")
                    ));
                }
                text
            }
            BillingNotice::PaymentFailed { attempt, .. } => format!(
                "No pudimos procesar tu pago de {} {} (orden {}). Motivo: {}. \
                 Intentaremos nuevamente en los próximos días.",
                attempt.amount,
                attempt.currency,
                attempt.gateway_order_number,
                attempt
                    .error_message
                    .as_deref()
                    .unwrap_or("sin detalle del procesador")
            ),
            BillingNotice::SubscriptionCancelled { subscription } => format!(
                "Tu suscripción fue cancelada el {} porque no fue posible procesar el pago.",
                subscription.updated_at.format("%Y-%m-%d")
            ),
            BillingNotice::CardExpiring { method } => format!(
                "Tu medio de pago {} vence el {:02}/{}. Actualízalo para evitar interrupciones.",
                method.display_name(),
                method.expiry_month.unwrap_or_default(),
                method.expiry_year.unwrap_or_default()
            ),
        };
        format!("{}\n\n{}\n", greeting, detail)
    }
}

#[async_trait]
pub trait BillingNotifier: Send + Sync {
    async fn deliver(
        &self,
        to: &BillingContact,
        notice: &BillingNotice,
    ) -> Result<(), ProviderError>;

    fn is_enabled(&self) -> bool;
}

#[derive(Debug, Clone)]
pub struct SmtpSettings {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Secret<String>,
    pub from_email: String,
    pub from_name: String,
    pub enabled: bool,
}

pub struct SmtpNotifier {
    settings: SmtpSettings,
    transport: Option<AsyncSmtpTransport<Tokio1Executor>>,
}

impl SmtpNotifier {
    pub fn new(settings: SmtpSettings) -> Result<Self, ProviderError> {
        if !settings.enabled {
            return Ok(Self {
                settings,
                transport: None,
            });
        }

        let creds = Credentials::new(
            settings.user.clone(),
            settings.password.expose_secret().clone(),
        );

        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&settings.host)
            .map_err(|e| {
                ProviderError::Configuration(format!("Failed to create SMTP relay: {}", e))
            })?
            .port(settings.port)
            .credentials(creds)
            .build();

        Ok(Self {
            settings,
            transport: Some(transport),
        })
    }
}

#[async_trait]
impl BillingNotifier for SmtpNotifier {
    async fn deliver(
        &self,
        to: &BillingContact,
        notice: &BillingNotice,
    ) -> Result<(), ProviderError> {
        let transport = self.transport.as_ref().ok_or_else(|| {
            ProviderError::NotEnabled("SMTP notifier is not enabled".to_string())
        })?;

        let from: Mailbox = format!("{} <{}>", self.settings.from_name, self.settings.from_email)
            .parse()
            .map_err(|e| ProviderError::Configuration(format!("Invalid from address: {}", e)))?;
        let recipient: Mailbox = to
            .email
            .parse()
            .map_err(|e| ProviderError::InvalidRecipient(format!("Invalid recipient: {}", e)))?;

        let message = Message::builder()
            .from(from)
            .to(recipient)
            .subject(notice.subject())
            .header(ContentType::TEXT_PLAIN)
            .body(notice.body(to))
            .map_err(|e| ProviderError::SendFailed(format!("Failed to build message: {}", e)))?;

        transport
            .send(message)
            .await
            .map_err(|e| ProviderError::SendFailed(format!("Failed to send email: {}", e)))?;

        info!(
            to = %to.email,
            template = notice.template(),
            "Billing notice sent"
        );
        Ok(())
    }

    fn is_enabled(&self) -> bool {
        self.settings.enabled
    }
}

/// Notifier that keeps every notice in memory.
pub struct RecordingNotifier {
    sent: Mutex<Vec<(String, BillingNotice)>>,
    send_count: AtomicU64,
    failing: AtomicBool,
}

impl Default for RecordingNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            send_count: AtomicU64::new(0),
            failing: AtomicBool::new(false),
        }
    }

    /// Make every following delivery fail.
    pub fn fail_deliveries(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn send_count(&self) -> u64 {
        self.send_count.load(Ordering::SeqCst)
    }

    /// Templates delivered so far, in order.
    pub fn templates(&self) -> Vec<&'static str> {
        self.sent
            .lock()
            .map(|sent| sent.iter().map(|(_, n)| n.template()).collect())
            .unwrap_or_default()
    }

    pub fn recipients(&self) -> Vec<String> {
        self.sent
            .lock()
            .map(|sent| sent.iter().map(|(to, _)| to.clone()).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl BillingNotifier for RecordingNotifier {
    async fn deliver(
        &self,
        to: &BillingContact,
        notice: &BillingNotice,
    ) -> Result<(), ProviderError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ProviderError::Connection("recording notifier set to fail".into()));
        }
        self.send_count.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut sent) = self.sent.lock() {
            sent.push((to.email.clone(), notice.clone()));
        }
        info!(
            to = %to.email,
            template = notice.template(),
            "[MOCK] Billing notice would be sent"
        );
        Ok(())
    }

    fn is_enabled(&self) -> bool {
        true
    }
}

/// Fire-and-forget dispatch of billing notices.
#[derive(Clone)]
pub struct Notifications {
    notifier: Arc<dyn BillingNotifier>,
    store: Arc<dyn BillingStore>,
    timeout: Duration,
}

impl Notifications {
    pub fn new(
        notifier: Arc<dyn BillingNotifier>,
        store: Arc<dyn BillingStore>,
        timeout: Duration,
    ) -> Self {
        Self {
            notifier,
            store,
            timeout,
        }
    }

    pub async fn payment_succeeded(&self, invoice: &Invoice, subscription: Option<&Subscription>) {
        self.dispatch(BillingNotice::PaymentSucceeded {
            invoice: invoice.clone(),
            subscription: subscription.cloned(),
        })
        .await
    }

    pub async fn payment_failed(
        &self,
        attempt: &PaymentAttempt,
        invoice: Option<&Invoice>,
        subscription: Option<&Subscription>,
    ) {
        self.dispatch(BillingNotice::PaymentFailed {
            attempt: attempt.clone(),
            invoice: invoice.cloned(),
            subscription: subscription.cloned(),
        })
        .await
    }

    pub async fn subscription_cancelled(&self, subscription: &Subscription) {
        self.dispatch(BillingNotice::SubscriptionCancelled {
            subscription: subscription.clone(),
        })
        .await
    }

    pub async fn card_expiring(&self, method: &PaymentMethod) {
        self.dispatch(BillingNotice::CardExpiring {
            method: method.clone(),
        })
        .await
    }

    /// Resolve the recipient and deliver. Never fails.
    pub async fn dispatch(&self, notice: BillingNotice) {
        let template = notice.template();
        if !self.notifier.is_enabled() {
            info!(template, "Notifier disabled, notice skipped");
            return;
        }

        let contact = match self.store.billing_contact(notice.user_id()).await {
            Ok(Some(contact)) => contact,
            Ok(None) => {
                warn!(template, user_id = %notice.user_id(), "No billing contact, notice skipped");
                record_notification_failure(template);
                return;
            }
            Err(e) => {
                error!(template, error = %e, "Failed to resolve billing contact");
                record_notification_failure(template);
                return;
            }
        };

        match tokio::time::timeout(self.timeout, self.notifier.deliver(&contact, &notice)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(template, to = %contact.email, error = %e, "Billing notice failed");
                record_notification_failure(template);
            }
            Err(_) => {
                error!(
                    template,
                    to = %contact.email,
                    timeout_secs = self.timeout.as_secs(),
                    "Billing notice timed out"
                );
                record_notification_failure(template);
            }
        }
    }
}
