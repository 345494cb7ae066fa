//! Notification fallback retrier.
//!
//! Sweeps the fallback keys, attempting redelivery with a capped retry
//! count. A sweep stops as soon as the broker reports disconnected; the
//! remaining keys wait for the next tick.

use crate::error::AppError;
use crate::models::FallbackMessage;
use crate::services::metrics;
use crate::services::{NotificationBroker, ResultLedger};
use std::sync::Arc;
use tracing::{error, info, warn};

pub const MAX_FALLBACK_RETRIES: u32 = 5;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepSummary {
    pub scanned: usize,
    pub delivered: usize,
    /// Messages that hit the retry cap and were dropped.
    pub exhausted: usize,
    /// Messages that failed again and were written back.
    pub deferred: usize,
    /// True when the sweep stopped early on a disconnected broker.
    pub halted: bool,
}

pub struct NotificationRetrier {
    ledger: Arc<dyn ResultLedger>,
    broker: Arc<dyn NotificationBroker>,
    max_retries: u32,
}

impl NotificationRetrier {
    pub fn new(ledger: Arc<dyn ResultLedger>, broker: Arc<dyn NotificationBroker>) -> Self {
        Self {
            ledger,
            broker,
            max_retries: MAX_FALLBACK_RETRIES,
        }
    }

    pub async fn sweep_once(&self) -> Result<SweepSummary, AppError> {
        let keys = self.ledger.fallback_keys().await?;
        let mut summary = SweepSummary::default();

        for key in keys {
            if !self.broker.is_connected() {
                summary.halted = true;
                break;
            }
            summary.scanned += 1;

            let Some(raw) = self.ledger.fallback_get(&key).await? else {
                continue;
            };

            let mut message = match serde_json::from_str::<FallbackMessage>(&raw) {
                Ok(message) => message,
                Err(e) => {
                    warn!(key = %key, error = %e, "Dropping unparseable fallback entry");
                    self.ledger.fallback_delete(&key).await?;
                    continue;
                }
            };

            if message.retry_count >= self.max_retries {
                error!(
                    message_id = %message.payload.id,
                    subscription_id = %message.payload.subscription_id,
                    retry_count = message.retry_count,
                    "Notification permanently failed, dropping"
                );
                metrics::record_notification("permanent_failure");
                self.ledger.fallback_delete(&key).await?;
                summary.exhausted += 1;
                continue;
            }

            match self
                .broker
                .publish(&message.payload, message.retry_count)
                .await
            {
                Ok(()) => {
                    self.ledger.fallback_delete(&key).await?;
                    metrics::record_notification("published");
                    summary.delivered += 1;
                }
                Err(e) => {
                    message.retry_count += 1;
                    warn!(
                        message_id = %message.payload.id,
                        retry_count = message.retry_count,
                        error = %e,
                        "Fallback redelivery failed"
                    );
                    let raw = serde_json::to_string(&message)?;
                    self.ledger.fallback_set(&key, &raw).await?;
                    summary.deferred += 1;
                }
            }
        }

        if summary.delivered > 0 || summary.exhausted > 0 {
            info!(
                delivered = summary.delivered,
                exhausted = summary.exhausted,
                deferred = summary.deferred,
                "Fallback sweep complete"
            );
        }

        Ok(summary)
    }
}
