//! Per-operator renewal charge worker.
//!
//! Consumes delivered jobs, calls the operator's gateway, applies the
//! same-day re-queue window on failure and appends the charge outcome to
//! the result ledger. The worker never talks to the database; everything
//! it needs rides in the job snapshot.

use crate::error::AppError;
use crate::models::{ChargeOutcome, ChargingConfig, Operator, RenewalJob, Subscription};
use crate::services::gateways::{ChargeRequest, GatewayClient};
use crate::services::metrics;
use crate::services::queue::{EnqueueOptions, EnqueueOutcome, JobHandler, JobQueue};
use crate::services::ResultLedger;
use crate::workers::scheduler::BUSINESS_TZ;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Delay before a failed charge is retried the same local day.
pub const REQUEUE_DELAY: Duration = Duration::from_secs(8 * 3600);

pub const DEFAULT_CURRENCY: &str = "BDT";

pub struct OperatorWorker {
    operator: Operator,
    gateway: Arc<dyn GatewayClient>,
    queue: Arc<dyn JobQueue>,
    ledger: Arc<dyn ResultLedger>,
}

impl OperatorWorker {
    pub fn new(
        operator: Operator,
        gateway: Arc<dyn GatewayClient>,
        queue: Arc<dyn JobQueue>,
        ledger: Arc<dyn ResultLedger>,
    ) -> Self {
        Self {
            operator,
            gateway,
            queue,
            ledger,
        }
    }

    fn build_request(
        &self,
        snapshot: &Subscription,
        payment_reference_id: Uuid,
        config: ChargingConfig,
    ) -> ChargeRequest {
        ChargeRequest {
            subscription_id: snapshot.subscription_id.clone(),
            msisdn: snapshot.msisdn.clone(),
            amount: snapshot.plan_pricing.base_amount.unwrap_or(Decimal::ZERO),
            currency: snapshot
                .plan_pricing
                .currency
                .clone()
                .unwrap_or_else(|| DEFAULT_CURRENCY.to_string()),
            reference_code: payment_reference_id.to_string(),
            description: format!("{} subscription renewal", snapshot.product.name),
            billing_cycle_days: snapshot.product_plan.billing_cycle_days,
            product_code: snapshot.product.code.clone(),
            payment_channel_reference: snapshot.payment_channel_reference.clone(),
            config,
        }
    }

    async fn maybe_requeue(&self, job: &RenewalJob) {
        if !self.operator.requeues_same_day() {
            return;
        }
        if !fits_before_local_midnight(Utc::now(), REQUEUE_DELAY, BUSINESS_TZ) {
            debug!(
                subscription_id = %job.subscription_id,
                "Retry would land past local midnight, leaving to next dispatch"
            );
            return;
        }

        let opts = EnqueueOptions {
            delay: REQUEUE_DELAY,
            job_id: job.subscription_id.clone(),
            remove_on_complete: true,
            remove_on_fail: true,
        };
        match self.queue.enqueue(job, opts).await {
            Ok(EnqueueOutcome::Enqueued) => {
                info!(
                    subscription_id = %job.subscription_id,
                    delay_hours = 8,
                    "Failed charge re-queued for a same-day retry"
                );
                metrics::record_job_requeued(self.queue.name());
            }
            Ok(EnqueueOutcome::Duplicate) => {
                debug!(subscription_id = %job.subscription_id, "Retry already pending");
            }
            Err(e) => {
                warn!(
                    subscription_id = %job.subscription_id,
                    error = %e,
                    "Failed to re-queue; next dispatch will pick the subscription up"
                );
            }
        }
    }
}

#[async_trait]
impl JobHandler for OperatorWorker {
    async fn handle(&self, job: RenewalJob) -> Result<(), AppError> {
        let payment_reference_id = Uuid::new_v4();
        let snapshot = &job.snapshot;

        let config = ChargingConfig::parse(self.operator, snapshot.charging_config.as_ref());
        if self.operator.requires_charging_config() && config.is_unknown() {
            warn!(
                subscription_id = %job.subscription_id,
                operator = self.operator.as_str(),
                "Charging configuration absent, skipping charge attempt"
            );
            return Ok(());
        }

        let request = self.build_request(snapshot, payment_reference_id, config);
        let result = self.gateway.charge(&request).await;
        metrics::record_charge_attempt(self.operator.as_str(), result.success);

        if !result.success {
            self.maybe_requeue(&job).await;
        }

        let message = if result.success {
            "Charge successful".to_string()
        } else {
            result
                .error
                .as_ref()
                .map(|fault| fault.message.clone())
                .unwrap_or_else(|| "Charge failed".to_string())
        };

        let outcome = ChargeOutcome {
            subscription_id: job.subscription_id.clone(),
            snapshot: job.snapshot.clone(),
            timestamp: Utc::now(),
            success: result.success,
            payment_reference_id,
            http_status: result.http_status,
            request_payload: result.request_payload,
            response_payload: result.response_payload,
            response_duration_ms: result.duration_ms,
            error: result.error,
            message,
        };

        let raw = serde_json::to_string(&outcome)?;
        self.ledger.push_outcome(&raw).await?;

        Ok(())
    }
}

/// True when `now + delay` still falls before the next local midnight,
/// i.e. the retry stays inside the same business day.
pub fn fits_before_local_midnight(now: DateTime<Utc>, delay: Duration, tz: Tz) -> bool {
    use chrono::TimeZone as _;

    let local_now = now.with_timezone(&tz);
    let retry_local = local_now + chrono::Duration::from_std(delay).unwrap_or_default();

    let next_day = local_now
        .date_naive()
        .succ_opt()
        .expect("calendar does not end today");
    let next_midnight = tz
        .from_local_datetime(
            &next_day
                .and_hms_opt(0, 0, 0)
                .expect("midnight is a valid time"),
        )
        .earliest()
        .expect("midnight resolves in this timezone");

    retry_local < next_midnight
}
