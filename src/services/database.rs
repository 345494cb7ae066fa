//! Database service: connection pool plus the two narrow store surfaces
//! the pipeline uses: the renewal scan and bulk update on subscriptions,
//! and the bulk append of billing events.

use crate::error::AppError;
use crate::models::{
    BillingEvent, Merchant, PaymentChannel, PlanPricing, Product, ProductPlan, Subscription,
    SubscriptionBulkUpdate, SubscriptionStatus,
};
use crate::services::metrics::DB_QUERY_DURATION;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use std::time::Duration as StdDuration;
use tracing::{info, instrument, warn};
use uuid::Uuid;

pub const DEFAULT_PAGE_SIZE: i64 = 10_000;

/// Read side of the renewal pipeline plus the consumer's bulk update.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// Page of subscriptions due today, strictly ascending by `id`,
    /// starting after `cursor` when present.
    async fn find_renewable(
        &self,
        limit: i64,
        cursor: Option<i64>,
    ) -> Result<Vec<Subscription>, AppError>;

    /// Apply every entry in a single atomic statement.
    async fn bulk_update(&self, updates: &[SubscriptionBulkUpdate]) -> Result<u64, AppError>;
}

/// Append-only billing event sink.
#[async_trait]
pub trait BillingEventStore: Send + Sync {
    async fn create_events(&self, rows: &[BillingEvent]) -> Result<u64, AppError>;
}

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new connection pool.
    #[instrument(skip(database_url))]
    pub async fn new(
        database_url: &str,
        connection_limit: u32,
        pool_timeout_secs: u64,
        connect_timeout_secs: u64,
    ) -> Result<Self, AppError> {
        info!(
            connection_limit = connection_limit,
            "Connecting to PostgreSQL"
        );

        let connect = PgPoolOptions::new()
            .max_connections(connection_limit)
            .acquire_timeout(StdDuration::from_secs(pool_timeout_secs))
            .idle_timeout(StdDuration::from_secs(600))
            .connect(database_url);

        let pool = tokio::time::timeout(StdDuration::from_secs(connect_timeout_secs), connect)
            .await
            .map_err(|_| {
                AppError::DatabaseError(anyhow::anyhow!(
                    "Timed out connecting to PostgreSQL after {}s",
                    connect_timeout_secs
                ))
            })?
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check database health.
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), AppError> {
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

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Flat row produced by the renewal scan join.
#[derive(Debug, FromRow)]
struct RenewableRow {
    id: i64,
    subscription_id: String,
    msisdn: String,
    status: String,
    auto_renew: bool,
    next_billing_at: DateTime<Utc>,
    last_payment_succeed_at: Option<DateTime<Utc>>,
    last_payment_failed_at: Option<DateTime<Utc>>,
    payment_channel_reference: Option<String>,
    consent_id: Option<String>,
    merchant_transaction_id: String,
    payment_channel_id: Uuid,
    payment_channel_code: String,
    charging_config: Option<serde_json::Value>,
    plan_id: Uuid,
    plan_name: String,
    billing_cycle_days: i32,
    base_amount: Option<Decimal>,
    currency: Option<String>,
    product_id: Uuid,
    product_code: String,
    product_name: String,
    merchant_id: Uuid,
    merchant_name: String,
}

impl From<RenewableRow> for Subscription {
    fn from(row: RenewableRow) -> Self {
        Subscription {
            id: row.id,
            subscription_id: row.subscription_id,
            msisdn: row.msisdn,
            status: row.status,
            auto_renew: row.auto_renew,
            next_billing_at: row.next_billing_at,
            last_payment_succeed_at: row.last_payment_succeed_at,
            last_payment_failed_at: row.last_payment_failed_at,
            payment_channel: PaymentChannel {
                payment_channel_id: row.payment_channel_id,
                code: row.payment_channel_code,
            },
            charging_config: row.charging_config,
            product_plan: ProductPlan {
                plan_id: row.plan_id,
                name: row.plan_name,
                billing_cycle_days: row.billing_cycle_days,
            },
            plan_pricing: PlanPricing {
                base_amount: row.base_amount,
                currency: row.currency.map(|c| c.trim().to_string()),
            },
            product: Product {
                product_id: row.product_id,
                code: row.product_code,
                name: row.product_name,
            },
            merchant: Merchant {
                merchant_id: row.merchant_id,
                name: row.merchant_name,
            },
            payment_channel_reference: row.payment_channel_reference,
            consent_id: row.consent_id,
            merchant_transaction_id: row.merchant_transaction_id,
        }
    }
}

/// Today's dispatch window: 00:00:00.000 to 23:59:59.999 UTC.
pub fn dispatch_window(now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = now
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .expect("midnight is a valid time")
        .and_utc();
    let end = start + Duration::days(1) - Duration::milliseconds(1);
    (start, end)
}

#[async_trait]
impl SubscriptionStore for Database {
    #[instrument(skip(self), fields(limit = limit))]
    async fn find_renewable(
        &self,
        limit: i64,
        cursor: Option<i64>,
    ) -> Result<Vec<Subscription>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_renewable"])
            .start_timer();

        let (window_start, window_end) = dispatch_window(Utc::now());

        let rows = sqlx::query_as::<_, RenewableRow>(
            r#"
            SELECT s.id, s.subscription_id, s.msisdn, s.status, s.auto_renew, s.next_billing_at,
                   s.last_payment_succeed_at, s.last_payment_failed_at,
                   s.payment_channel_reference, s.consent_id, s.merchant_transaction_id,
                   pc.payment_channel_id, pc.code AS payment_channel_code,
                   cc.config AS charging_config,
                   pp.plan_id, pp.name AS plan_name, pp.billing_cycle_days,
                   pr.base_amount, pr.currency,
                   p.product_id, p.code AS product_code, p.name AS product_name,
                   m.merchant_id, m.name AS merchant_name
            FROM subscriptions s
            JOIN payment_channels pc ON s.payment_channel_id = pc.payment_channel_id
            JOIN product_plans pp ON s.plan_id = pp.plan_id
            JOIN plan_pricings pr ON pr.plan_id = pp.plan_id
            JOIN products p ON s.product_id = p.product_id
            JOIN merchants m ON s.merchant_id = m.merchant_id
            LEFT JOIN charging_configurations cc ON cc.subscription_id = s.subscription_id
            WHERE s.auto_renew = TRUE
              AND s.status IN ('ACTIVE', 'SUSPENDED_PAYMENT_FAILED')
              AND s.next_billing_at >= $1
              AND s.next_billing_at <= $2
              AND ($3::bigint IS NULL OR s.id > $3)
            ORDER BY s.id
            LIMIT $4
            "#,
        )
        .bind(window_start)
        .bind(window_end)
        .bind(cursor)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to find renewable rows: {}", e))
        })?;

        timer.observe_duration();

        Ok(rows.into_iter().map(Subscription::from).collect())
    }

    #[instrument(skip(self, updates), fields(count = updates.len()))]
    async fn bulk_update(&self, updates: &[SubscriptionBulkUpdate]) -> Result<u64, AppError> {
        if updates.is_empty() {
            return Ok(0);
        }

        let timer = DB_QUERY_DURATION
            .with_label_values(&["bulk_update"])
            .start_timer();

        let applied_at = Utc::now();
        let mut ids = Vec::with_capacity(updates.len());
        let mut statuses = Vec::with_capacity(updates.len());
        let mut succeed_ats: Vec<Option<DateTime<Utc>>> = Vec::with_capacity(updates.len());
        let mut failed_ats: Vec<Option<DateTime<Utc>>> = Vec::with_capacity(updates.len());
        let mut next_billing_ats = Vec::with_capacity(updates.len());

        for update in updates {
            ids.push(update.subscription_id.clone());
            let status = if update.success {
                SubscriptionStatus::Active
            } else {
                SubscriptionStatus::SuspendedPaymentFailed
            };
            statuses.push(status.as_str().to_string());
            succeed_ats.push(update.success.then_some(applied_at));
            failed_ats.push((!update.success).then_some(applied_at));
            next_billing_ats.push(update.next_billing_at);
        }

        let result = sqlx::query(
            r#"
            UPDATE subscriptions AS s
            SET status = u.status,
                last_payment_succeed_at = u.succeed_at,
                last_payment_failed_at = u.failed_at,
                next_billing_at = u.next_billing_at,
                updated_utc = NOW()
            FROM UNNEST($1::text[], $2::text[], $3::timestamptz[], $4::timestamptz[], $5::timestamptz[])
                AS u(subscription_id, status, succeed_at, failed_at, next_billing_at)
            WHERE s.subscription_id = u.subscription_id
            "#,
        )
        .bind(&ids)
        .bind(&statuses)
        .bind(&succeed_ats)
        .bind(&failed_ats)
        .bind(&next_billing_ats)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to bulk update subscriptions: {}", e))
        })?;

        timer.observe_duration();

        let affected = result.rows_affected();
        if affected != updates.len() as u64 {
            warn!(
                expected = updates.len(),
                affected = affected,
                "Bulk update touched fewer rows than requested"
            );
        }

        Ok(affected)
    }
}

#[async_trait]
impl BillingEventStore for Database {
    #[instrument(skip(self, rows), fields(count = rows.len()))]
    async fn create_events(&self, rows: &[BillingEvent]) -> Result<u64, AppError> {
        if rows.is_empty() {
            return Ok(0);
        }

        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_events"])
            .start_timer();

        let mut event_ids = Vec::with_capacity(rows.len());
        let mut subscription_ids = Vec::with_capacity(rows.len());
        let mut merchant_ids = Vec::with_capacity(rows.len());
        let mut product_ids = Vec::with_capacity(rows.len());
        let mut plan_ids = Vec::with_capacity(rows.len());
        let mut channel_ids = Vec::with_capacity(rows.len());
        let mut msisdns = Vec::with_capacity(rows.len());
        let mut reference_ids = Vec::with_capacity(rows.len());
        let mut event_types = Vec::with_capacity(rows.len());
        let mut statuses = Vec::with_capacity(rows.len());
        let mut amounts = Vec::with_capacity(rows.len());
        let mut currencies = Vec::with_capacity(rows.len());
        let mut request_payloads = Vec::with_capacity(rows.len());
        let mut response_payloads = Vec::with_capacity(rows.len());
        let mut response_messages = Vec::with_capacity(rows.len());
        let mut durations = Vec::with_capacity(rows.len());
        let mut response_codes = Vec::with_capacity(rows.len());

        for row in rows {
            event_ids.push(row.event_id);
            subscription_ids.push(row.subscription_id.clone());
            merchant_ids.push(row.merchant_id);
            product_ids.push(row.product_id);
            plan_ids.push(row.plan_id);
            channel_ids.push(row.payment_channel_id);
            msisdns.push(row.msisdn.clone());
            reference_ids.push(row.payment_reference_id);
            event_types.push(row.event_type.clone());
            statuses.push(row.status.as_str().to_string());
            amounts.push(row.amount);
            currencies.push(row.currency.clone());
            request_payloads.push(row.request_payload.clone());
            response_payloads.push(row.response_payload.clone());
            response_messages.push(row.response_message.clone());
            durations.push(row.duration_ms);
            response_codes.push(row.response_code);
        }

        let result = sqlx::query(
            r#"
            INSERT INTO billing_events (
                event_id, subscription_id, merchant_id, product_id, plan_id,
                payment_channel_id, msisdn, payment_reference_id, event_type, status,
                amount, currency, request_payload, response_payload, response_message,
                duration_ms, response_code
            )
            SELECT * FROM UNNEST(
                $1::uuid[], $2::text[], $3::uuid[], $4::uuid[], $5::uuid[],
                $6::uuid[], $7::text[], $8::uuid[], $9::text[], $10::text[],
                $11::numeric[], $12::text[], $13::jsonb[], $14::jsonb[], $15::text[],
                $16::bigint[], $17::int[]
            )
            "#,
        )
        .bind(&event_ids)
        .bind(&subscription_ids)
        .bind(&merchant_ids)
        .bind(&product_ids)
        .bind(&plan_ids)
        .bind(&channel_ids)
        .bind(&msisdns)
        .bind(&reference_ids)
        .bind(&event_types)
        .bind(&statuses)
        .bind(&amounts)
        .bind(&currencies)
        .bind(&request_payloads)
        .bind(&response_payloads)
        .bind(&response_messages)
        .bind(&durations)
        .bind(&response_codes)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to insert billing events: {}", e))
        })?;

        timer.observe_duration();

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn dispatch_window_covers_the_utc_day() {
        let now = Utc.with_ymd_and_hms(2025, 6, 15, 13, 45, 0).unwrap();
        let (start, end) = dispatch_window(now);
        assert_eq!(start, Utc.with_ymd_and_hms(2025, 6, 15, 0, 0, 0).unwrap());
        assert_eq!(
            end,
            Utc.with_ymd_and_hms(2025, 6, 15, 23, 59, 59).unwrap()
                + Duration::milliseconds(999)
        );
    }

    #[test]
    fn dispatch_window_is_stable_at_midnight() {
        let now = Utc.with_ymd_and_hms(2025, 6, 15, 0, 0, 0).unwrap();
        let (start, _) = dispatch_window(now);
        assert_eq!(start, now);
    }
}
