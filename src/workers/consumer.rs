//! Result consumer: the periodic bounded drain of the charge-outcome
//! ledger.
//!
//! Each tick pops at most `MAX_BATCH_SIZE` outcomes, turns every valid
//! one into exactly one subscription update, one billing event and one
//! notification, applies the bulk mutations in order and fans the
//! notifications out to the broker. Outcomes are already gone from the
//! ledger by the time the mutations run, so a failed batch is pushed
//! back to the tail; duplicate re-processing is tolerated because
//! downstream consumers dedup on the merchant transaction id.

use crate::error::AppError;
use crate::models::{
    BillingEvent, BillingEventStatus, ChargeOutcome, FallbackMessage, NotificationEvent,
    NotificationPayload, SubscriptionBulkUpdate, EVENT_TYPE_RENEWAL, NOTIFICATION_SOURCE,
};
use crate::services::broker::send_batch;
use crate::services::metrics;
use crate::services::{BillingEventStore, NotificationBroker, ResultLedger, SubscriptionStore};
use crate::workers::operator::DEFAULT_CURRENCY;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{error, warn};
use uuid::Uuid;

pub const MAX_BATCH_SIZE: usize = 250;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainSummary {
    /// Entries popped from the ledger this tick.
    pub drained: usize,
    pub malformed: usize,
    /// Valid outcomes applied to the stores.
    pub applied: usize,
    /// Notifications routed to the fallback store.
    pub fallback: usize,
    /// True when the batch failed and its entries were pushed back.
    pub requeued: bool,
}

pub struct ResultConsumer {
    ledger: Arc<dyn ResultLedger>,
    subscriptions: Arc<dyn SubscriptionStore>,
    events: Arc<dyn BillingEventStore>,
    broker: Arc<dyn NotificationBroker>,
    max_batch: usize,
}

impl ResultConsumer {
    pub fn new(
        ledger: Arc<dyn ResultLedger>,
        subscriptions: Arc<dyn SubscriptionStore>,
        events: Arc<dyn BillingEventStore>,
        broker: Arc<dyn NotificationBroker>,
    ) -> Self {
        Self {
            ledger,
            subscriptions,
            events,
            broker,
            max_batch: MAX_BATCH_SIZE,
        }
    }

    pub async fn drain_once(&self) -> Result<DrainSummary, AppError> {
        let mut raw_entries = Vec::new();
        while raw_entries.len() < self.max_batch {
            match self.ledger.pop_outcome().await? {
                Some(entry) => raw_entries.push(entry),
                None => break,
            }
        }

        let mut summary = DrainSummary {
            drained: raw_entries.len(),
            ..Default::default()
        };
        if let Ok(depth) = self.ledger.ledger_len().await {
            metrics::set_ledger_depth(depth as i64);
        }
        if raw_entries.is_empty() {
            return Ok(summary);
        }
        metrics::record_ledger_drain(raw_entries.len());

        let mut outcomes = Vec::with_capacity(raw_entries.len());
        for raw in &raw_entries {
            match serde_json::from_str::<ChargeOutcome>(raw) {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    warn!(error = %e, "Skipping malformed ledger entry");
                    summary.malformed += 1;
                }
            }
        }

        let now = Utc::now();
        let mut updates = Vec::with_capacity(outcomes.len());
        let mut events = Vec::with_capacity(outcomes.len());
        let mut notifications = Vec::with_capacity(outcomes.len());
        for outcome in &outcomes {
            updates.push(build_update(outcome, now));
            events.push(build_billing_event(outcome));
            notifications.push(build_notification(outcome, now));
        }

        match self.apply(&updates, &events, notifications).await {
            Ok(fallback) => {
                summary.applied = outcomes.len();
                summary.fallback = fallback;
            }
            Err(e) => {
                error!(
                    batch_size = raw_entries.len(),
                    error = %e,
                    "Drain batch failed, pushing entries back to the ledger"
                );
                for raw in &raw_entries {
                    if let Err(push_err) = self.ledger.push_outcome(raw).await {
                        error!(error = %push_err, "Outcome lost: compensating push failed");
                    }
                }
                summary.requeued = true;
            }
        }

        Ok(summary)
    }

    /// Bulk update, bulk insert, then the notification fan-out, in order.
    /// Returns how many notifications were routed to fallback.
    async fn apply(
        &self,
        updates: &[SubscriptionBulkUpdate],
        events: &[BillingEvent],
        notifications: Vec<NotificationPayload>,
    ) -> Result<usize, AppError> {
        self.subscriptions.bulk_update(updates).await?;
        self.events.create_events(events).await?;

        let failed = send_batch(self.broker.as_ref(), notifications).await;
        let fallback = failed.len();
        for payload in failed {
            let message = FallbackMessage::new(payload, Utc::now());
            let raw = serde_json::to_string(&message)?;
            if let Err(e) = self.ledger.fallback_set(&message.key(), &raw).await {
                error!(
                    message_id = %message.payload.id,
                    error = %e,
                    "Failed to persist fallback notification"
                );
            } else {
                metrics::record_notification("fallback");
            }
        }

        Ok(fallback)
    }
}

fn next_billing_at(outcome: &ChargeOutcome, now: DateTime<Utc>) -> DateTime<Utc> {
    let cycle_days = outcome.snapshot.product_plan.billing_cycle_days.max(1) as i64;
    now + Duration::seconds(cycle_days * 86_400)
}

fn build_update(outcome: &ChargeOutcome, now: DateTime<Utc>) -> SubscriptionBulkUpdate {
    SubscriptionBulkUpdate {
        subscription_id: outcome.subscription_id.clone(),
        success: outcome.success,
        next_billing_at: next_billing_at(outcome, now),
    }
}

fn build_billing_event(outcome: &ChargeOutcome) -> BillingEvent {
    let snapshot = &outcome.snapshot;
    BillingEvent {
        event_id: Uuid::new_v4(),
        subscription_id: outcome.subscription_id.clone(),
        merchant_id: snapshot.merchant.merchant_id,
        product_id: snapshot.product.product_id,
        plan_id: snapshot.product_plan.plan_id,
        payment_channel_id: snapshot.payment_channel.payment_channel_id,
        msisdn: snapshot.msisdn.clone(),
        payment_reference_id: outcome.payment_reference_id,
        event_type: EVENT_TYPE_RENEWAL.to_string(),
        status: BillingEventStatus::from_success(outcome.success),
        amount: snapshot.plan_pricing.base_amount.unwrap_or(Decimal::ZERO),
        currency: snapshot
            .plan_pricing
            .currency
            .clone()
            .unwrap_or_else(|| DEFAULT_CURRENCY.to_string()),
        request_payload: outcome.request_payload.clone(),
        response_payload: outcome.response_payload.clone(),
        response_message: outcome.message.clone(),
        duration_ms: outcome.response_duration_ms as i64,
        response_code: outcome.http_status as i32,
    }
}

fn build_notification(outcome: &ChargeOutcome, now: DateTime<Utc>) -> NotificationPayload {
    let snapshot = &outcome.snapshot;
    NotificationPayload {
        id: Uuid::new_v4(),
        source: NOTIFICATION_SOURCE.to_string(),
        subscription_id: outcome.subscription_id.clone(),
        merchant_transaction_id: snapshot.merchant_transaction_id.clone(),
        keyword: snapshot.product.name.clone(),
        msisdn: snapshot.msisdn.clone(),
        payment_provider: snapshot.payment_channel.code.clone(),
        event_type: NotificationEvent::from_success(outcome.success)
            .as_str()
            .to_string(),
        amount: snapshot.plan_pricing.base_amount.unwrap_or(Decimal::ZERO),
        currency: snapshot
            .plan_pricing
            .currency
            .clone()
            .unwrap_or_else(|| DEFAULT_CURRENCY.to_string()),
        billing_cycle_days: snapshot.product_plan.billing_cycle_days,
        metadata: None,
        timestamp: now,
    }
}
