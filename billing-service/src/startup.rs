//! Application startup and lifecycle management.

use crate::config::BillingConfig;
use crate::handlers::{health_check, metrics_handler, paymentsway_webhook, readiness_check};
use crate::services::{
    init_metrics, BillingNotifier, BillingScheduler, BillingStore, Database, InvoiceBuilder,
    InvoiceSettings, Notifications, PaymentGateway, PaymentMethodService, PaymentsWayClient,
    ReconciliationProcessor, SchedulerSettings, SmtpNotifier,
};
use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use secrecy::{ExposeSecret, Secret};
use service_core::error::AppError;
use service_core::middleware::metrics::metrics_middleware;
use service_core::middleware::tracing::request_id_middleware;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

pub const WEBHOOK_PATH: &str = "/webhooks/billing/paymentsway";

/// The engine's services wired over one store, gateway and notifier.
#[derive(Clone)]
pub struct BillingEngine {
    pub store: Arc<dyn BillingStore>,
    pub gateway: Arc<dyn PaymentGateway>,
    pub notifications: Notifications,
    pub invoices: InvoiceBuilder,
    pub scheduler: BillingScheduler,
    pub reconciliation: ReconciliationProcessor,
    pub payment_methods: PaymentMethodService,
}

impl BillingEngine {
    pub fn assemble(
        store: Arc<dyn BillingStore>,
        gateway: Arc<dyn PaymentGateway>,
        notifier: Arc<dyn BillingNotifier>,
        invoice_settings: InvoiceSettings,
        scheduler_settings: SchedulerSettings,
        notification_timeout: Duration,
    ) -> Self {
        let notifications = Notifications::new(notifier, store.clone(), notification_timeout);
        let invoices = InvoiceBuilder::new(store.clone(), invoice_settings);
        let reconciliation = ReconciliationProcessor::new(
            store.clone(),
            notifications.clone(),
            scheduler_settings.max_retries,
        );
        let scheduler = BillingScheduler::new(
            store.clone(),
            gateway.clone(),
            invoices.clone(),
            notifications.clone(),
            scheduler_settings,
        );
        let payment_methods = PaymentMethodService::new(store.clone(), gateway.clone());

        Self {
            store,
            gateway,
            notifications,
            invoices,
            scheduler,
            reconciliation,
            payment_methods,
        }
    }

    /// Connect to PostgreSQL and build the PaymentsWay and SMTP clients.
    pub async fn from_config(config: &BillingConfig, run_migrations: bool) -> Result<Self, AppError> {
        let db = Database::new(
            config.database.url.expose_secret(),
            config.database.max_connections,
            config.database.min_connections,
        )
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to connect to PostgreSQL");
            e
        })?;

        if run_migrations {
            db.run_migrations().await.map_err(|e| {
                tracing::error!(error = %e, "Failed to run migrations");
                e
            })?;
        }

        let gateway = PaymentsWayClient::new(config.paymentsway.clone()).map_err(|e| {
            AppError::ConfigError(anyhow::anyhow!("Failed to configure PaymentsWay client: {}", e))
        })?;
        if gateway.is_configured() {
            tracing::info!("PaymentsWay client initialized");
        } else {
            tracing::warn!("PaymentsWay credentials not configured - charges will fail");
        }

        let notifier = SmtpNotifier::new(config.smtp.clone()).map_err(|e| {
            AppError::ConfigError(anyhow::anyhow!("Failed to configure SMTP notifier: {}", e))
        })?;
        if !notifier.is_enabled() {
            tracing::warn!("SMTP disabled - billing notices will not be delivered");
        }

        Ok(Self::assemble(
            Arc::new(db),
            Arc::new(gateway),
            Arc::new(notifier),
            config.invoices.clone(),
            config.scheduler.clone(),
            config.notification_timeout,
        ))
    }
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn BillingStore>,
    pub reconciliation: ReconciliationProcessor,
    pub webhook_secret: Option<Secret<String>>,
    /// Upper bound on processing a single callback.
    pub webhook_timeout: Duration,
}

impl AppState {
    pub fn new(
        engine: &BillingEngine,
        webhook_secret: Option<Secret<String>>,
        webhook_timeout: Duration,
    ) -> Self {
        Self {
            store: engine.store.clone(),
            reconciliation: engine.reconciliation.clone(),
            webhook_secret,
            webhook_timeout,
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/metrics", get(metrics_handler))
        .route(WEBHOOK_PATH, post(paymentsway_webhook))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(metrics_middleware))
        .layer(middleware::from_fn(request_id_middleware))
        .with_state(state)
}

/// Application container for managing server lifecycle.
pub struct Application {
    port: u16,
    listener: TcpListener,
    router: Router,
}

impl Application {
    /// Build the application with the given configuration.
    pub async fn build(config: BillingConfig) -> Result<Self, AppError> {
        Self::build_internal(config, true).await
    }

    /// Build the application without running migrations.
    pub async fn build_without_migrations(config: BillingConfig) -> Result<Self, AppError> {
        Self::build_internal(config, false).await
    }

    async fn build_internal(config: BillingConfig, run_migrations: bool) -> Result<Self, AppError> {
        init_metrics();

        let engine = BillingEngine::from_config(&config, run_migrations).await?;
        if config.webhook_secret.is_none() {
            tracing::warn!("PAYMENTSWAY_WEBHOOK_SECRET not set - webhooks are accepted unsigned");
        }

        let state = AppState::new(
            &engine,
            config.webhook_secret.clone(),
            config.scheduler.gateway_timeout,
        );
        let router = build_router(state);

        let addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %addr, "Failed to bind HTTP listener");
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();

        tracing::info!(http_port = port, "Billing service listener bound");

        Ok(Self {
            port,
            listener,
            router,
        })
    }

    /// Get the HTTP port the server is listening on.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Run the application until stopped.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        tracing::info!(
            service = "billing-service",
            version = env!("CARGO_PKG_VERSION"),
            http_port = self.port,
            "Service ready to accept connections"
        );

        axum::serve(self.listener, self.router).await.map_err(|e| {
            tracing::error!(error = %e, "HTTP server error");
            std::io::Error::other(format!("HTTP server error: {}", e))
        })
    }
}
