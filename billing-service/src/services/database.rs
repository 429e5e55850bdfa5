//! PostgreSQL implementation of [`BillingStore`].

use crate::models::{
    BillingContact, Cancellation, Coupon, CouponUsage, EntityRef, Invoice, InvoiceItem,
    InvoiceStatus, NewCouponUsage, NewInvoice, NewPaymentAttempt, NewPaymentMethod,
    NewRewardApplication, PaymentAttempt, PaymentGatewayRecord, PaymentMethod, Plan,
    ReferralReward, Subscription, Transaction, TransactionStatus, UsagePrice, UsageTotal,
};
use crate::services::attempts::{AttemptTransition, Settlement, SettlementEffect};
use crate::services::metrics::DB_QUERY_DURATION;
use crate::services::store::BillingStore;
use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc};
use service_core::error::AppError;
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{info, instrument, warn};
use uuid::Uuid;

const SUBSCRIPTION_COLUMNS: &str = "subscription_id, user_id, plan_id, billing_mode, status, \
     starts_at, ends_at, metadata, created_at, updated_at";

const PAYMENT_METHOD_COLUMNS: &str = "payment_method_id, user_id, gateway_id, method_type, \
     token, customer_id, brand, last_four, expiry_month, expiry_year, holder_name, is_default, \
     is_active, created_at, updated_at";

const INVOICE_COLUMNS: &str = "invoice_id, invoice_number, user_id, subscription_id, \
     transaction_id, invoice_type, issued_at, due_at, period_start, period_end, subtotal, \
     discount, tax, total, currency, coupon_id, status, paid_at, cufe, qr_code, metadata, \
     created_at, updated_at";

const TRANSACTION_COLUMNS: &str = "transaction_id, user_id, purchasable_type, purchasable_id, \
     description, amount, currency, status, completed_at, created_at, updated_at";

const ATTEMPT_COLUMNS: &str = "attempt_id, user_id, gateway_id, payment_method_id, invoice_id, \
     transaction_id, subscription_id, amount, currency, gateway_order_number, \
     gateway_transaction_id, status, gateway_response, gateway_message, error_message, \
     retry_count, attempted_at, completed_at, created_at, updated_at";

const COUPON_COLUMNS: &str = "coupon_id, code, discount_type, discount_value, valid_from, \
     valid_until, usage_type, max_uses, current_uses, minimum_amount, applicable_plans, \
     applicable_modes, is_active, created_at, updated_at";

fn db_error(context: &'static str) -> impl FnOnce(sqlx::Error) -> AppError {
    move |e| AppError::DatabaseError(anyhow::anyhow!("{}: {}", context, e))
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db_err) if db_err.is_unique_violation())
}

const ORDER_NUMBER_CONSTRAINT: &str = "payment_attempts_gateway_order_number_key";

fn violates_constraint(e: &sqlx::Error, constraint: &str) -> bool {
    matches!(e, sqlx::Error::Database(db_err) if db_err.constraint() == Some(constraint))
}

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    #[instrument(skip(database_url), fields(service = "billing-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }
}

// =========================================================================
// Statements shared by transactional operations
// =========================================================================

async fn fetch_invoice(
    conn: &mut PgConnection,
    invoice_id: Uuid,
) -> Result<Option<Invoice>, AppError> {
    sqlx::query_as::<_, Invoice>(&format!(
        "SELECT {} FROM invoices WHERE invoice_id = $1",
        INVOICE_COLUMNS
    ))
    .bind(invoice_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(db_error("Failed to get invoice"))
}

async fn fetch_subscription(
    conn: &mut PgConnection,
    subscription_id: Uuid,
) -> Result<Option<Subscription>, AppError> {
    sqlx::query_as::<_, Subscription>(&format!(
        "SELECT {} FROM subscriptions WHERE subscription_id = $1",
        SUBSCRIPTION_COLUMNS
    ))
    .bind(subscription_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(db_error("Failed to get subscription"))
}

/// Compare-and-swap an invoice into `to` from one of its allowed sources.
async fn move_invoice(
    conn: &mut PgConnection,
    invoice_id: Uuid,
    to: InvoiceStatus,
    now: DateTime<Utc>,
) -> Result<Option<Invoice>, AppError> {
    sqlx::query_as::<_, Invoice>(&format!(
        r#"
        UPDATE invoices
        SET status = $2,
            paid_at = CASE WHEN $2 = 'paid' THEN $3 ELSE paid_at END,
            updated_at = $3
        WHERE invoice_id = $1 AND status = ANY($4)
        RETURNING {}
        "#,
        INVOICE_COLUMNS
    ))
    .bind(invoice_id)
    .bind(to.as_str())
    .bind(now)
    .bind(to.source_strings())
    .fetch_optional(&mut *conn)
    .await
    .map_err(db_error("Failed to transition invoice"))
}

async fn move_transaction(
    conn: &mut PgConnection,
    transaction_id: Uuid,
    from: TransactionStatus,
    to: TransactionStatus,
    now: DateTime<Utc>,
) -> Result<Option<Transaction>, AppError> {
    sqlx::query_as::<_, Transaction>(&format!(
        r#"
        UPDATE transactions
        SET status = $3,
            completed_at = CASE WHEN $3 = 'completed' THEN $4 ELSE completed_at END,
            updated_at = $4
        WHERE transaction_id = $1 AND status = $2
        RETURNING {}
        "#,
        TRANSACTION_COLUMNS
    ))
    .bind(transaction_id)
    .bind(from.as_str())
    .bind(to.as_str())
    .bind(now)
    .fetch_optional(&mut *conn)
    .await
    .map_err(db_error("Failed to transition transaction"))
}

/// Advance an active subscription by one period.
async fn extend_subscription(
    conn: &mut PgConnection,
    subscription_id: Uuid,
    now: DateTime<Utc>,
) -> Result<Option<Subscription>, AppError> {
    sqlx::query_as::<_, Subscription>(&format!(
        r#"
        UPDATE subscriptions
        SET starts_at = ends_at,
            ends_at = ends_at + INTERVAL '1 month',
            updated_at = $2
        WHERE subscription_id = $1 AND status = 'active'
        RETURNING {}
        "#,
        SUBSCRIPTION_COLUMNS
    ))
    .bind(subscription_id)
    .bind(now)
    .fetch_optional(&mut *conn)
    .await
    .map_err(db_error("Failed to extend subscription"))
}

/// Guarded increment of `current_uses` plus the usage row.
async fn redeem_guarded(
    conn: &mut PgConnection,
    usage: &NewCouponUsage,
    now: DateTime<Utc>,
) -> Result<Option<CouponUsage>, AppError> {
    let claimed = sqlx::query_scalar::<_, Uuid>(
        r#"
        UPDATE coupons
        SET current_uses = current_uses + 1, updated_at = $2
        WHERE coupon_id = $1
          AND is_active
          AND (
                usage_type = 'reusable'
             OR (usage_type = 'single' AND current_uses < 1)
             OR (usage_type = 'limited' AND current_uses < COALESCE(max_uses, 0))
          )
        RETURNING coupon_id
        "#,
    )
    .bind(usage.coupon_id)
    .bind(now)
    .fetch_optional(&mut *conn)
    .await
    .map_err(db_error("Failed to claim coupon use"))?;

    if claimed.is_none() {
        return Ok(None);
    }

    let (billable_type, billable_id) = EntityRef::to_columns(usage.billable.as_ref());
    let recorded = sqlx::query_as::<_, CouponUsage>(
        r#"
        INSERT INTO coupon_usages (coupon_usage_id, coupon_id, user_id, billable_type, billable_id, discount_amount, original_amount, final_amount, used_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        RETURNING coupon_usage_id, coupon_id, user_id, billable_type, billable_id, discount_amount, original_amount, final_amount, used_at
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(usage.coupon_id)
    .bind(usage.user_id)
    .bind(billable_type)
    .bind(billable_id)
    .bind(usage.discount_amount)
    .bind(usage.original_amount)
    .bind(usage.final_amount)
    .bind(now)
    .fetch_one(&mut *conn)
    .await
    .map_err(db_error("Failed to record coupon usage"))?;

    Ok(Some(recorded))
}

/// Apply one reward to an invoice if it has not moved since it was quoted.
async fn apply_reward_guarded(
    conn: &mut PgConnection,
    application: &NewRewardApplication,
    invoice_id: Uuid,
    now: DateTime<Utc>,
) -> Result<bool, AppError> {
    let applied = sqlx::query_scalar::<_, Uuid>(
        r#"
        UPDATE referral_rewards
        SET cycles_applied = cycles_applied + 1,
            remaining_value = CASE WHEN $3 THEN remaining_value - $4 ELSE remaining_value END,
            status = CASE
                WHEN ($5::INT IS NOT NULL AND cycles_applied + 1 >= $5)
                  OR ($3 AND remaining_value - $4 <= 0) THEN 'completed'
                ELSE status END,
            completed_at = CASE
                WHEN ($5::INT IS NOT NULL AND cycles_applied + 1 >= $5)
                  OR ($3 AND remaining_value - $4 <= 0) THEN $6
                ELSE completed_at END,
            updated_at = $6
        WHERE reward_id = $1
          AND status = 'active'
          AND cycles_applied = $2
          AND (NOT $3 OR COALESCE(remaining_value, 0) >= $4)
        RETURNING reward_id
        "#,
    )
    .bind(application.reward_id)
    .bind(application.expected_cycles_applied)
    .bind(application.draws_credit)
    .bind(application.applied_value)
    .bind(application.cycle_limit)
    .bind(now)
    .fetch_optional(&mut *conn)
    .await
    .map_err(db_error("Failed to apply referral reward"))?;

    if applied.is_none() {
        return Ok(false);
    }

    sqlx::query(
        r#"
        INSERT INTO referral_reward_applications (application_id, reward_id, invoice_id, applied_value, applied_at)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(application.reward_id)
    .bind(invoice_id)
    .bind(application.applied_value)
    .bind(now)
    .execute(&mut *conn)
    .await
    .map_err(db_error("Failed to record reward application"))?;

    Ok(true)
}

#[async_trait]
impl BillingStore for Database {
    #[instrument(skip(self))]
    async fn health_check(&self) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["health_check"])
            .start_timer();

        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Health check failed: {}", e)))?;

        timer.observe_duration();
        Ok(())
    }

    // =========================================================================
    // Catalogue and usage
    // =========================================================================

    #[instrument(skip(self), fields(plan_id = %plan_id))]
    async fn get_plan(&self, plan_id: Uuid) -> Result<Option<Plan>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_plan"])
            .start_timer();

        let plan = sqlx::query_as::<_, Plan>(
            r#"
            SELECT plan_id, name, description, price, currency, is_active, metadata, created_at, updated_at
            FROM plans
            WHERE plan_id = $1
            "#,
        )
        .bind(plan_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get plan: {}", e)))?;

        timer.observe_duration();
        Ok(plan)
    }

    #[instrument(skip(self), fields(plan_id = %plan_id))]
    async fn rate_card(&self, plan_id: Uuid) -> Result<Vec<UsagePrice>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["rate_card"])
            .start_timer();

        let rates = sqlx::query_as::<_, UsagePrice>(
            r#"
            SELECT usage_price_id, plan_id, action_key, unit_count, unit_price, is_active
            FROM usage_prices
            WHERE is_active AND (plan_id = $1 OR plan_id IS NULL)
            ORDER BY action_key
            "#,
        )
        .bind(plan_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to load rate card: {}", e)))?;

        timer.observe_duration();
        Ok(rates)
    }

    #[instrument(skip(self), fields(user_id = %user_id))]
    async fn usage_totals(
        &self,
        user_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<UsageTotal>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["usage_totals"])
            .start_timer();

        let totals = sqlx::query_as::<_, UsageTotal>(
            r#"
            SELECT action_key, SUM(quantity)::BIGINT AS total_quantity
            FROM usages
            WHERE user_id = $1 AND recorded_at >= $2 AND recorded_at < $3
            GROUP BY action_key
            ORDER BY action_key
            "#,
        )
        .bind(user_id)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to sum usage: {}", e)))?;

        timer.observe_duration();
        Ok(totals)
    }

    // =========================================================================
    // Subscriptions
    // =========================================================================

    #[instrument(skip(self), fields(subscription_id = %subscription_id))]
    async fn get_subscription(
        &self,
        subscription_id: Uuid,
    ) -> Result<Option<Subscription>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_subscription"])
            .start_timer();

        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(db_error("Failed to acquire connection"))?;
        let subscription = fetch_subscription(&mut conn, subscription_id).await?;

        timer.observe_duration();
        Ok(subscription)
    }

    #[instrument(skip(self))]
    async fn list_due_subscriptions(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Subscription>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_due_subscriptions"])
            .start_timer();

        let subscriptions = sqlx::query_as::<_, Subscription>(&format!(
            r#"
            SELECT {}
            FROM subscriptions
            WHERE status = 'active' AND ends_at <= $1
            ORDER BY ends_at ASC
            "#,
            SUBSCRIPTION_COLUMNS
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to list due subscriptions: {}", e))
        })?;

        timer.observe_duration();
        Ok(subscriptions)
    }

    #[instrument(skip(self, cancellation), fields(subscription_id = %subscription_id, reason = %cancellation.reason))]
    async fn cancel_subscription(
        &self,
        subscription_id: Uuid,
        cancellation: &Cancellation,
    ) -> Result<Option<Subscription>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["cancel_subscription"])
            .start_timer();

        let audit = cancellation.merge_into(&serde_json::json!({}));
        let subscription = sqlx::query_as::<_, Subscription>(&format!(
            r#"
            UPDATE subscriptions
            SET status = 'cancelled',
                metadata = COALESCE(metadata, '{{}}'::jsonb) || $2::jsonb,
                updated_at = $3
            WHERE subscription_id = $1 AND status IN ('active', 'paused')
            RETURNING {}
            "#,
            SUBSCRIPTION_COLUMNS
        ))
        .bind(subscription_id)
        .bind(&audit)
        .bind(cancellation.cancelled_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to cancel subscription: {}", e))
        })?;

        timer.observe_duration();
        if subscription.is_some() {
            info!(subscription_id = %subscription_id, "Subscription cancelled");
        }
        Ok(subscription)
    }

    #[instrument(skip(self), fields(user_id = %user_id))]
    async fn billing_contact(&self, user_id: Uuid) -> Result<Option<BillingContact>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["billing_contact"])
            .start_timer();

        let contact = sqlx::query_as::<_, BillingContact>(
            "SELECT user_id, email, name FROM billing_contacts WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to get billing contact: {}", e))
        })?;

        timer.observe_duration();
        Ok(contact)
    }

    // =========================================================================
    // Gateways and payment methods
    // =========================================================================

    #[instrument(skip(self))]
    async fn get_gateway(&self, slug: &str) -> Result<Option<PaymentGatewayRecord>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_gateway"])
            .start_timer();

        let gateway = sqlx::query_as::<_, PaymentGatewayRecord>(
            "SELECT gateway_id, name, slug, is_active, is_default, config FROM payment_gateways WHERE slug = $1",
        )
        .bind(slug)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get gateway: {}", e)))?;

        timer.observe_duration();
        Ok(gateway)
    }

    #[instrument(skip(self), fields(payment_method_id = %payment_method_id))]
    async fn get_payment_method(
        &self,
        payment_method_id: Uuid,
    ) -> Result<Option<PaymentMethod>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_payment_method"])
            .start_timer();

        let method = sqlx::query_as::<_, PaymentMethod>(&format!(
            "SELECT {} FROM payment_methods WHERE payment_method_id = $1",
            PAYMENT_METHOD_COLUMNS
        ))
        .bind(payment_method_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to get payment method: {}", e))
        })?;

        timer.observe_duration();
        Ok(method)
    }

    #[instrument(skip(self), fields(user_id = %user_id))]
    async fn default_payment_method(
        &self,
        user_id: Uuid,
    ) -> Result<Option<PaymentMethod>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["default_payment_method"])
            .start_timer();

        let method = sqlx::query_as::<_, PaymentMethod>(&format!(
            "SELECT {} FROM payment_methods WHERE user_id = $1 AND is_default AND is_active",
            PAYMENT_METHOD_COLUMNS
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to get default payment method: {}", e))
        })?;

        timer.observe_duration();
        Ok(method)
    }

    #[instrument(skip(self, method), fields(user_id = %method.user_id))]
    async fn create_payment_method(
        &self,
        method: &NewPaymentMethod,
    ) -> Result<PaymentMethod, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_payment_method"])
            .start_timer();

        let created = sqlx::query_as::<_, PaymentMethod>(&format!(
            r#"
            INSERT INTO payment_methods (payment_method_id, user_id, gateway_id, method_type, token, customer_id, brand, last_four, expiry_month, expiry_year, holder_name)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING {}
            "#,
            PAYMENT_METHOD_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(method.user_id)
        .bind(method.gateway_id)
        .bind(&method.method_type)
        .bind(&method.token)
        .bind(&method.customer_id)
        .bind(&method.brand)
        .bind(&method.last_four)
        .bind(method.expiry_month)
        .bind(method.expiry_year)
        .bind(&method.holder_name)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to create payment method: {}", e))
        })?;

        timer.observe_duration();
        info!(payment_method_id = %created.payment_method_id, "Payment method created");
        Ok(created)
    }

    #[instrument(skip(self), fields(user_id = %user_id, payment_method_id = %payment_method_id))]
    async fn set_default_payment_method(
        &self,
        user_id: Uuid,
        payment_method_id: Uuid,
    ) -> Result<Option<PaymentMethod>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["set_default_payment_method"])
            .start_timer();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(db_error("Failed to begin transaction"))?;

        sqlx::query(
            r#"
            UPDATE payment_methods
            SET is_default = FALSE, updated_at = NOW()
            WHERE user_id = $1 AND is_default AND payment_method_id <> $2
            "#,
        )
        .bind(user_id)
        .bind(payment_method_id)
        .execute(&mut *tx)
        .await
        .map_err(db_error("Failed to clear default payment method"))?;

        let method = sqlx::query_as::<_, PaymentMethod>(&format!(
            r#"
            UPDATE payment_methods
            SET is_default = TRUE, updated_at = NOW()
            WHERE payment_method_id = $1 AND user_id = $2 AND is_active
            RETURNING {}
            "#,
            PAYMENT_METHOD_COLUMNS
        ))
        .bind(payment_method_id)
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_error("Failed to set default payment method"))?;

        if method.is_none() {
            tx.rollback().await.ok();
            timer.observe_duration();
            return Ok(None);
        }

        tx.commit()
            .await
            .map_err(db_error("Failed to commit transaction"))?;

        timer.observe_duration();
        info!("Default payment method updated");
        Ok(method)
    }

    #[instrument(skip(self))]
    async fn list_active_card_methods(&self) -> Result<Vec<PaymentMethod>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_active_card_methods"])
            .start_timer();

        let methods = sqlx::query_as::<_, PaymentMethod>(&format!(
            r#"
            SELECT {}
            FROM payment_methods
            WHERE is_active AND method_type = 'card'
              AND expiry_year IS NOT NULL AND expiry_month IS NOT NULL
            ORDER BY expiry_year, expiry_month
            "#,
            PAYMENT_METHOD_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to list card methods: {}", e))
        })?;

        timer.observe_duration();
        Ok(methods)
    }

    // =========================================================================
    // Coupons and rewards
    // =========================================================================

    #[instrument(skip(self))]
    async fn find_coupon(&self, code: &str) -> Result<Option<Coupon>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_coupon"])
            .start_timer();

        let coupon = sqlx::query_as::<_, Coupon>(&format!(
            "SELECT {} FROM coupons WHERE LOWER(code) = LOWER($1)",
            COUPON_COLUMNS
        ))
        .bind(code)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to find coupon: {}", e)))?;

        timer.observe_duration();
        Ok(coupon)
    }

    #[instrument(skip(self, usage), fields(coupon_id = %usage.coupon_id, user_id = %usage.user_id))]
    async fn redeem_coupon(
        &self,
        usage: &NewCouponUsage,
        now: DateTime<Utc>,
    ) -> Result<Option<CouponUsage>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["redeem_coupon"])
            .start_timer();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(db_error("Failed to begin transaction"))?;

        let redeemed = redeem_guarded(&mut tx, usage, now).await?;
        if redeemed.is_none() {
            tx.rollback().await.ok();
            timer.observe_duration();
            return Ok(None);
        }

        tx.commit()
            .await
            .map_err(db_error("Failed to commit transaction"))?;

        timer.observe_duration();
        info!("Coupon redeemed");
        Ok(redeemed)
    }

    #[instrument(skip(self), fields(user_id = %user_id))]
    async fn active_rewards(&self, user_id: Uuid) -> Result<Vec<ReferralReward>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["active_rewards"])
            .start_timer();

        let rewards = sqlx::query_as::<_, ReferralReward>(
            r#"
            SELECT reward_id, user_id, referral_id, reward_type, reward_value, remaining_value, duration_cycles, cycles_applied, status, expires_at, completed_at, created_at, updated_at
            FROM referral_rewards
            WHERE user_id = $1 AND status = 'active'
            ORDER BY created_at ASC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to list referral rewards: {}", e))
        })?;

        timer.observe_duration();
        Ok(rewards)
    }

    // =========================================================================
    // Transactions and invoices
    // =========================================================================

    #[instrument(skip(self), fields(transaction_id = %transaction_id))]
    async fn get_transaction(
        &self,
        transaction_id: Uuid,
    ) -> Result<Option<Transaction>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_transaction"])
            .start_timer();

        let transaction = sqlx::query_as::<_, Transaction>(&format!(
            "SELECT {} FROM transactions WHERE transaction_id = $1",
            TRANSACTION_COLUMNS
        ))
        .bind(transaction_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to get transaction: {}", e))
        })?;

        timer.observe_duration();
        Ok(transaction)
    }

    #[instrument(skip(self, invoice), fields(user_id = %invoice.user_id, invoice_type = invoice.invoice_type.as_str()))]
    async fn create_invoice(&self, invoice: &NewInvoice) -> Result<Invoice, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_invoice"])
            .start_timer();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(db_error("Failed to begin transaction"))?;

        // Serialise numbering per prefix and year; the lock is released on commit.
        let year = invoice.issued_at.year();
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(format!("invoice_number:{}-{}", invoice.number_prefix, year))
            .execute(&mut *tx)
            .await
            .map_err(db_error("Failed to lock invoice numbering"))?;

        let number_stem = format!("{}-{}-", invoice.number_prefix, year);
        let last_sequence = sqlx::query_scalar::<_, i32>(
            r#"
            SELECT COALESCE(MAX(CAST(SUBSTRING(invoice_number FROM $2::INT) AS INT)), 0)
            FROM invoices
            WHERE invoice_number LIKE $1 || '%'
            "#,
        )
        .bind(&number_stem)
        .bind(number_stem.chars().count() as i32 + 1)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_error("Failed to read invoice sequence"))?;
        let invoice_number = crate::models::format_invoice_number(
            &invoice.number_prefix,
            year,
            last_sequence.max(0) as u32 + 1,
        );

        if let Some(usage) = &invoice.coupon_redemption {
            if redeem_guarded(&mut tx, usage, invoice.issued_at).await?.is_none() {
                tx.rollback().await.ok();
                timer.observe_duration();
                warn!(coupon_id = %usage.coupon_id, "Coupon guard rejected invoice");
                return Err(AppError::Conflict(anyhow::anyhow!(
                    "Coupon {} is no longer redeemable",
                    usage.coupon_id
                )));
            }
        }

        let created = sqlx::query_as::<_, Invoice>(&format!(
            r#"
            INSERT INTO invoices (invoice_id, invoice_number, user_id, subscription_id, transaction_id, invoice_type, issued_at, due_at, period_start, period_end, subtotal, discount, tax, total, currency, coupon_id, status, paid_at, metadata)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
            RETURNING {}
            "#,
            INVOICE_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(&invoice_number)
        .bind(invoice.user_id)
        .bind(invoice.subscription_id)
        .bind(invoice.transaction_id)
        .bind(invoice.invoice_type.as_str())
        .bind(invoice.issued_at)
        .bind(invoice.due_at)
        .bind(invoice.period_start)
        .bind(invoice.period_end)
        .bind(invoice.subtotal)
        .bind(invoice.discount)
        .bind(invoice.tax)
        .bind(invoice.total)
        .bind(&invoice.currency)
        .bind(invoice.coupon_id)
        .bind(invoice.status.as_str())
        .bind(invoice.paid_at)
        .bind(&invoice.metadata)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                AppError::Conflict(anyhow::anyhow!("Invoice number {} already exists", invoice_number))
            } else {
                AppError::DatabaseError(anyhow::anyhow!("Failed to create invoice: {}", e))
            }
        })?;

        for (index, item) in invoice.items.iter().enumerate() {
            let (itemable_type, itemable_id) = EntityRef::to_columns(item.itemable.as_ref());
            sqlx::query(
                r#"
                INSERT INTO invoice_items (invoice_item_id, invoice_id, itemable_type, itemable_id, description, quantity, unit_price, discount, tax_rate, tax_amount, subtotal, total, position)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(created.invoice_id)
            .bind(itemable_type)
            .bind(itemable_id)
            .bind(&item.description)
            .bind(item.quantity)
            .bind(item.unit_price)
            .bind(item.discount)
            .bind(item.tax_rate)
            .bind(item.tax_amount)
            .bind(item.subtotal)
            .bind(item.total)
            .bind(index as i32 + 1)
            .execute(&mut *tx)
            .await
            .map_err(db_error("Failed to create invoice item"))?;
        }

        for application in &invoice.reward_applications {
            if !apply_reward_guarded(&mut tx, application, created.invoice_id, invoice.issued_at)
                .await?
            {
                tx.rollback().await.ok();
                timer.observe_duration();
                warn!(reward_id = %application.reward_id, "Reward guard rejected invoice");
                return Err(AppError::Conflict(anyhow::anyhow!(
                    "Reward {} changed since it was quoted",
                    application.reward_id
                )));
            }
        }

        tx.commit()
            .await
            .map_err(db_error("Failed to commit transaction"))?;

        timer.observe_duration();
        info!(
            invoice_id = %created.invoice_id,
            invoice_number = %created.invoice_number,
            total = %created.total,
            "Invoice created"
        );
        Ok(created)
    }

    #[instrument(skip(self), fields(invoice_id = %invoice_id))]
    async fn get_invoice(&self, invoice_id: Uuid) -> Result<Option<Invoice>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_invoice"])
            .start_timer();

        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(db_error("Failed to acquire connection"))?;
        let invoice = fetch_invoice(&mut conn, invoice_id).await?;

        timer.observe_duration();
        Ok(invoice)
    }

    #[instrument(skip(self), fields(invoice_id = %invoice_id))]
    async fn invoice_items(&self, invoice_id: Uuid) -> Result<Vec<InvoiceItem>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["invoice_items"])
            .start_timer();

        let items = sqlx::query_as::<_, InvoiceItem>(
            r#"
            SELECT invoice_item_id, invoice_id, itemable_type, itemable_id, description, quantity, unit_price, discount, tax_rate, tax_amount, subtotal, total, position
            FROM invoice_items
            WHERE invoice_id = $1
            ORDER BY position ASC
            "#,
        )
        .bind(invoice_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to list invoice items: {}", e))
        })?;

        timer.observe_duration();
        Ok(items)
    }

    #[instrument(skip(self), fields(invoice_id = %invoice_id, to = to.as_str()))]
    async fn transition_invoice(
        &self,
        invoice_id: Uuid,
        to: InvoiceStatus,
        now: DateTime<Utc>,
    ) -> Result<Option<Invoice>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["transition_invoice"])
            .start_timer();

        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(db_error("Failed to acquire connection"))?;
        let invoice = move_invoice(&mut conn, invoice_id, to, now).await?;

        timer.observe_duration();
        Ok(invoice)
    }

    #[instrument(skip(self), fields(invoice_id = %invoice_id, subscription_id = %subscription_id))]
    async fn settle_zero_invoice(
        &self,
        invoice_id: Uuid,
        subscription_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Settlement, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["settle_zero_invoice"])
            .start_timer();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(db_error("Failed to begin transaction"))?;

        let mut settlement = Settlement::empty();
        match move_invoice(&mut tx, invoice_id, InvoiceStatus::Paid, now).await? {
            Some(paid) => {
                settlement.invoice = Some(paid);
                settlement.subscription = extend_subscription(&mut tx, subscription_id, now).await?;
                settlement.period_extended = settlement.subscription.is_some();
            }
            None => {
                settlement.invoice = fetch_invoice(&mut tx, invoice_id).await?;
                settlement.subscription = fetch_subscription(&mut tx, subscription_id).await?;
            }
        }

        tx.commit()
            .await
            .map_err(db_error("Failed to commit transaction"))?;

        timer.observe_duration();
        Ok(settlement)
    }

    // =========================================================================
    // Payment attempts
    // =========================================================================

    #[instrument(skip(self, attempt), fields(order_number = %attempt.gateway_order_number))]
    async fn create_attempt(
        &self,
        attempt: &NewPaymentAttempt,
    ) -> Result<PaymentAttempt, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_attempt"])
            .start_timer();

        let created = sqlx::query_as::<_, PaymentAttempt>(&format!(
            r#"
            INSERT INTO payment_attempts (attempt_id, user_id, gateway_id, payment_method_id, invoice_id, transaction_id, subscription_id, amount, currency, gateway_order_number, status, retry_count, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, 'pending', $11, $12, $12)
            RETURNING {}
            "#,
            ATTEMPT_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(attempt.user_id)
        .bind(attempt.gateway_id)
        .bind(attempt.payment_method_id)
        .bind(attempt.invoice_id)
        .bind(attempt.transaction_id)
        .bind(attempt.subscription_id)
        .bind(attempt.amount)
        .bind(&attempt.currency)
        .bind(&attempt.gateway_order_number)
        .bind(attempt.retry_count)
        .bind(attempt.created_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            if violates_constraint(&e, ORDER_NUMBER_CONSTRAINT) {
                AppError::InternalError(anyhow::anyhow!(
                    "Order number {} already exists",
                    attempt.gateway_order_number
                ))
            } else if is_unique_violation(&e) {
                AppError::Conflict(anyhow::anyhow!(
                    "Subscription already has an outstanding payment attempt"
                ))
            } else {
                AppError::DatabaseError(anyhow::anyhow!("Failed to create payment attempt: {}", e))
            }
        })?;

        timer.observe_duration();
        Ok(created)
    }

    #[instrument(skip(self), fields(attempt_id = %attempt_id))]
    async fn get_attempt(&self, attempt_id: Uuid) -> Result<Option<PaymentAttempt>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_attempt"])
            .start_timer();

        let attempt = sqlx::query_as::<_, PaymentAttempt>(&format!(
            "SELECT {} FROM payment_attempts WHERE attempt_id = $1",
            ATTEMPT_COLUMNS
        ))
        .bind(attempt_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to get payment attempt: {}", e))
        })?;

        timer.observe_duration();
        Ok(attempt)
    }

    #[instrument(skip(self))]
    async fn find_attempt_by_order_number(
        &self,
        order_number: &str,
    ) -> Result<Option<PaymentAttempt>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_attempt_by_order_number"])
            .start_timer();

        let attempt = sqlx::query_as::<_, PaymentAttempt>(&format!(
            "SELECT {} FROM payment_attempts WHERE gateway_order_number = $1",
            ATTEMPT_COLUMNS
        ))
        .bind(order_number)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to find payment attempt: {}", e))
        })?;

        timer.observe_duration();
        Ok(attempt)
    }

    #[instrument(skip(self), fields(subscription_id = %subscription_id))]
    async fn latest_attempt_for_subscription(
        &self,
        subscription_id: Uuid,
    ) -> Result<Option<PaymentAttempt>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["latest_attempt_for_subscription"])
            .start_timer();

        let attempt = sqlx::query_as::<_, PaymentAttempt>(&format!(
            r#"
            SELECT {}
            FROM payment_attempts
            WHERE subscription_id = $1
            ORDER BY created_at DESC
            LIMIT 1
            "#,
            ATTEMPT_COLUMNS
        ))
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to get latest payment attempt: {}", e))
        })?;

        timer.observe_duration();
        Ok(attempt)
    }

    #[instrument(skip(self, transition), fields(attempt_id = %attempt_id, transition = transition.name()))]
    async fn apply_attempt_transition(
        &self,
        attempt_id: Uuid,
        transition: &AttemptTransition,
        now: DateTime<Utc>,
    ) -> Result<Option<Settlement>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["apply_attempt_transition"])
            .start_timer();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(db_error("Failed to begin transaction"))?;

        let update = transition.update(now);
        let attempt = sqlx::query_as::<_, PaymentAttempt>(&format!(
            r#"
            UPDATE payment_attempts
            SET status = $2,
                gateway_transaction_id = COALESCE($3, gateway_transaction_id),
                gateway_response = COALESCE($4, gateway_response),
                gateway_message = COALESCE($5, gateway_message),
                error_message = COALESCE($6, error_message),
                attempted_at = COALESCE($7, attempted_at),
                completed_at = COALESCE($8, completed_at),
                updated_at = $9
            WHERE attempt_id = $1 AND status = ANY($10)
            RETURNING {}
            "#,
            ATTEMPT_COLUMNS
        ))
        .bind(attempt_id)
        .bind(update.status.as_str())
        .bind(&update.gateway_transaction_id)
        .bind(&update.gateway_response)
        .bind(&update.gateway_message)
        .bind(&update.error_message)
        .bind(update.attempted_at)
        .bind(update.completed_at)
        .bind(now)
        .bind(transition.allowed_from_strings())
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_error("Failed to update payment attempt"))?;

        let Some(attempt) = attempt else {
            tx.rollback().await.ok();
            timer.observe_duration();
            return Ok(None);
        };

        let mut settlement = Settlement::empty();
        match transition.effect() {
            SettlementEffect::None => {}
            SettlementEffect::Settle => {
                let paid = match attempt.invoice_id {
                    Some(id) => move_invoice(&mut tx, id, InvoiceStatus::Paid, now).await?,
                    None => None,
                };
                if let Some(id) = attempt.transaction_id {
                    settlement.transaction = move_transaction(
                        &mut tx,
                        id,
                        TransactionStatus::Pending,
                        TransactionStatus::Completed,
                        now,
                    )
                    .await?;
                }
                // The period moves forward only with the invoice that pays for it.
                if paid.is_some() || attempt.invoice_id.is_none() {
                    if let Some(id) = attempt.subscription_id {
                        settlement.subscription = extend_subscription(&mut tx, id, now).await?;
                        settlement.period_extended = settlement.subscription.is_some();
                    }
                }
                settlement.invoice = match (paid, attempt.invoice_id) {
                    (Some(paid), _) => Some(paid),
                    (None, Some(id)) => fetch_invoice(&mut tx, id).await?,
                    (None, None) => None,
                };
            }
            SettlementEffect::Refund => {
                if let Some(id) = attempt.invoice_id {
                    settlement.invoice =
                        move_invoice(&mut tx, id, InvoiceStatus::Refunded, now).await?;
                }
                if let Some(id) = attempt.transaction_id {
                    settlement.transaction = move_transaction(
                        &mut tx,
                        id,
                        TransactionStatus::Completed,
                        TransactionStatus::Refunded,
                        now,
                    )
                    .await?;
                }
            }
        }
        if settlement.subscription.is_none() {
            if let Some(id) = attempt.subscription_id {
                settlement.subscription = fetch_subscription(&mut tx, id).await?;
            }
        }

        tx.commit()
            .await
            .map_err(db_error("Failed to commit transaction"))?;

        timer.observe_duration();
        info!(
            order_number = %attempt.gateway_order_number,
            status = %attempt.status,
            period_extended = settlement.period_extended,
            "Payment attempt updated"
        );
        settlement.attempt = Some(attempt);
        Ok(Some(settlement))
    }

    #[instrument(skip(self), fields(attempt_id = %attempt_id, expected = expected))]
    async fn increment_retry_count(
        &self,
        attempt_id: Uuid,
        expected: i32,
    ) -> Result<Option<PaymentAttempt>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["increment_retry_count"])
            .start_timer();

        let attempt = sqlx::query_as::<_, PaymentAttempt>(&format!(
            r#"
            UPDATE payment_attempts
            SET retry_count = retry_count + 1, updated_at = NOW()
            WHERE attempt_id = $1 AND retry_count = $2 AND status = 'failed'
            RETURNING {}
            "#,
            ATTEMPT_COLUMNS
        ))
        .bind(attempt_id)
        .bind(expected)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to increment retry count: {}", e))
        })?;

        timer.observe_duration();
        Ok(attempt)
    }

    #[instrument(skip(self))]
    async fn list_retry_candidates(
        &self,
        created_after: DateTime<Utc>,
        max_retries: i32,
    ) -> Result<Vec<PaymentAttempt>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_retry_candidates"])
            .start_timer();

        let attempts = sqlx::query_as::<_, PaymentAttempt>(&format!(
            r#"
            SELECT {columns}
            FROM (
                SELECT DISTINCT ON (subscription_id) {columns}
                FROM payment_attempts
                WHERE subscription_id IS NOT NULL
                ORDER BY subscription_id, created_at DESC
            ) latest
            WHERE status = 'failed' AND created_at >= $1 AND retry_count < $2
            ORDER BY created_at ASC
            "#,
            columns = ATTEMPT_COLUMNS
        ))
        .bind(created_after)
        .bind(max_retries)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to list retry candidates: {}", e))
        })?;

        timer.observe_duration();
        Ok(attempts)
    }

    #[instrument(skip(self))]
    async fn list_stale_attempts(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<PaymentAttempt>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_stale_attempts"])
            .start_timer();

        let attempts = sqlx::query_as::<_, PaymentAttempt>(&format!(
            r#"
            SELECT {}
            FROM payment_attempts
            WHERE status IN ('pending', 'processing') AND created_at < $1
            ORDER BY created_at ASC
            "#,
            ATTEMPT_COLUMNS
        ))
        .bind(older_than)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to list stale attempts: {}", e))
        })?;

        timer.observe_duration();
        Ok(attempts)
    }
}
