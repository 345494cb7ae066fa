//! Daily renewal dispatcher.
//!
//! Pages through today's due subscriptions in cursor order and enqueues
//! one delayed job per row onto the operator's queue, timed to the exact
//! per-subscription due moment. The cursor survives a failed run so the
//! next invocation resumes instead of restarting the day.

use crate::error::AppError;
use crate::models::{Operator, RenewalJob, Subscription};
use crate::services::metrics;
use crate::services::queue::{EnqueueOptions, EnqueueOutcome, JobQueue};
use crate::services::SubscriptionStore;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Pause between pages so one dispatch run does not monopolize the store.
const PAGE_PAUSE: Duration = Duration::from_millis(50);

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchSummary {
    pub pages: usize,
    pub enqueued: usize,
    pub duplicates: usize,
    pub skipped_unknown: usize,
    pub overdue: usize,
}

pub struct RenewalDispatcher {
    store: Arc<dyn SubscriptionStore>,
    queues: HashMap<&'static str, Arc<dyn JobQueue>>,
    page_size: i64,
    cursor: Mutex<Option<i64>>,
}

impl RenewalDispatcher {
    pub fn new(
        store: Arc<dyn SubscriptionStore>,
        queues: HashMap<&'static str, Arc<dyn JobQueue>>,
        page_size: i64,
    ) -> Self {
        Self {
            store,
            queues,
            page_size,
            cursor: Mutex::new(None),
        }
    }

    fn cursor(&self) -> Option<i64> {
        *self.cursor.lock().expect("cursor lock poisoned")
    }

    fn set_cursor(&self, value: Option<i64>) {
        *self.cursor.lock().expect("cursor lock poisoned") = value;
    }

    /// One full dispatch pass. On error the cursor keeps the last fully
    /// dispatched page so a re-run picks up where this one stopped.
    pub async fn run_once(&self) -> Result<DispatchSummary, AppError> {
        let mut summary = DispatchSummary::default();

        loop {
            let page = self.store.find_renewable(self.page_size, self.cursor()).await?;
            if page.is_empty() {
                self.set_cursor(None);
                break;
            }

            summary.pages += 1;
            let last_id = page.last().map(|row| row.id);

            for row in page {
                self.dispatch_row(row, &mut summary).await?;
            }

            self.set_cursor(last_id);
            tokio::time::sleep(PAGE_PAUSE).await;
        }

        info!(
            pages = summary.pages,
            enqueued = summary.enqueued,
            duplicates = summary.duplicates,
            skipped_unknown = summary.skipped_unknown,
            overdue = summary.overdue,
            "Renewal dispatch complete"
        );

        Ok(summary)
    }

    async fn dispatch_row(
        &self,
        row: Subscription,
        summary: &mut DispatchSummary,
    ) -> Result<(), AppError> {
        let Some(operator) = row.operator() else {
            warn!(
                subscription_id = %row.subscription_id,
                channel = %row.payment_channel.code,
                "Unknown payment channel, skipping"
            );
            summary.skipped_unknown += 1;
            return Ok(());
        };

        let Some(queue) = self.queues.get(operator.queue_name()) else {
            warn!(
                subscription_id = %row.subscription_id,
                operator = operator.as_str(),
                "No queue registered for operator, skipping"
            );
            summary.skipped_unknown += 1;
            return Ok(());
        };

        let delay = delay_until(&row, operator, summary);
        let job = RenewalJob::new(row);
        let job_id = job.subscription_id.clone();

        match queue
            .enqueue(
                &job,
                EnqueueOptions {
                    delay,
                    job_id: job_id.clone(),
                    remove_on_complete: true,
                    remove_on_fail: false,
                },
            )
            .await?
        {
            EnqueueOutcome::Enqueued => {
                summary.enqueued += 1;
                metrics::record_job_dispatched(queue.name());
            }
            EnqueueOutcome::Duplicate => {
                debug!(job_id = %job_id, queue = queue.name(), "Job already pending");
                summary.duplicates += 1;
            }
        }

        Ok(())
    }
}

fn delay_until(row: &Subscription, operator: Operator, summary: &mut DispatchSummary) -> Duration {
    let delay_ms = (row.next_billing_at - Utc::now()).num_milliseconds();
    if delay_ms < 0 {
        warn!(
            subscription_id = %row.subscription_id,
            operator = operator.as_str(),
            overdue_ms = -delay_ms,
            "Subscription overdue, charging immediately"
        );
        summary.overdue += 1;
        Duration::ZERO
    } else {
        Duration::from_millis(delay_ms as u64)
    }
}
