//! Per-operator delayed job queue with deduplication, plus the bounded
//! worker host that delivers due jobs.
//!
//! The queue is a Redis sorted set of job ids scored by due time, with a
//! companion hash holding serialized payloads. `ZADD NX` gives job-id
//! dedup while a job is pending; the claim script removes due members and
//! their payloads atomically, so a job is handed to exactly one worker.

use crate::error::AppError;
use crate::models::RenewalJob;
use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::Script;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tracing::{info, warn};

/// Atomically claim up to ARGV[2] due jobs and their payloads.
const CLAIM_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, ARGV[2])
local out = {}
for i, id in ipairs(due) do
  redis.call('ZREM', KEYS[1], id)
  local payload = redis.call('HGET', KEYS[2], id)
  redis.call('HDEL', KEYS[2], id)
  if payload then
    out[#out + 1] = payload
  end
end
return out
"#;

#[derive(Debug, Clone)]
pub struct EnqueueOptions {
    pub delay: Duration,
    pub job_id: String,
    /// Claimed jobs leave the queue regardless; these exist so call sites
    /// state their completion semantics explicitly.
    pub remove_on_complete: bool,
    pub remove_on_fail: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued,
    /// A job with the same id is already pending; the new copy was dropped.
    Duplicate,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    fn name(&self) -> &str;

    async fn enqueue(
        &self,
        job: &RenewalJob,
        opts: EnqueueOptions,
    ) -> Result<EnqueueOutcome, AppError>;

    /// Claim up to `limit` jobs whose due time is at or before `now_ms`.
    async fn claim_due(&self, now_ms: i64, limit: usize) -> Result<Vec<RenewalJob>, AppError>;

    async fn pending_count(&self) -> Result<u64, AppError>;
}

pub struct RedisJobQueue {
    name: String,
    scheduled_key: String,
    payload_key: String,
    manager: ConnectionManager,
    claim: Script,
}

impl RedisJobQueue {
    pub fn new(name: &str, manager: ConnectionManager, key_prefix: Option<&str>) -> Self {
        let prefix = key_prefix.unwrap_or_default();
        Self {
            name: name.to_string(),
            scheduled_key: format!("{}queue:{}:scheduled", prefix, name),
            payload_key: format!("{}queue:{}:payloads", prefix, name),
            manager,
            claim: Script::new(CLAIM_SCRIPT),
        }
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn enqueue(
        &self,
        job: &RenewalJob,
        opts: EnqueueOptions,
    ) -> Result<EnqueueOutcome, AppError> {
        let raw = serde_json::to_string(job)?;
        let due_ms = Utc::now().timestamp_millis() + opts.delay.as_millis() as i64;

        let mut conn = self.manager.clone();
        let added: i64 = redis::cmd("ZADD")
            .arg(&self.scheduled_key)
            .arg("NX")
            .arg(due_ms)
            .arg(&opts.job_id)
            .query_async(&mut conn)
            .await?;

        if added == 0 {
            return Ok(EnqueueOutcome::Duplicate);
        }

        let _: i64 = redis::cmd("HSET")
            .arg(&self.payload_key)
            .arg(&opts.job_id)
            .arg(raw)
            .query_async(&mut conn)
            .await?;

        Ok(EnqueueOutcome::Enqueued)
    }

    async fn claim_due(&self, now_ms: i64, limit: usize) -> Result<Vec<RenewalJob>, AppError> {
        let mut conn = self.manager.clone();
        let raw: Vec<String> = self
            .claim
            .key(&self.scheduled_key)
            .key(&self.payload_key)
            .arg(now_ms)
            .arg(limit)
            .invoke_async(&mut conn)
            .await?;

        let mut jobs = Vec::with_capacity(raw.len());
        for entry in raw {
            match serde_json::from_str::<RenewalJob>(&entry) {
                Ok(job) => jobs.push(job),
                Err(e) => {
                    warn!(queue = %self.name, error = %e, "Dropping unparseable job payload");
                }
            }
        }
        Ok(jobs)
    }

    async fn pending_count(&self) -> Result<u64, AppError> {
        let mut conn = self.manager.clone();
        let count: u64 = redis::cmd("ZCARD")
            .arg(&self.scheduled_key)
            .query_async(&mut conn)
            .await?;
        Ok(count)
    }
}

/// Handles one delivered job. A returned error marks the delivery failed;
/// the host logs it with the job id and does not retry.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, job: RenewalJob) -> Result<(), AppError>;
}

/// Polls a queue for due jobs and dispatches each to a handler task,
/// bounded by the operator's concurrency.
pub struct WorkerHost {
    queue: Arc<dyn JobQueue>,
    concurrency: usize,
    poll_interval: Duration,
    shutdown_grace: Duration,
}

impl WorkerHost {
    pub fn new(queue: Arc<dyn JobQueue>, concurrency: usize) -> Self {
        Self {
            queue,
            concurrency,
            poll_interval: Duration::from_secs(1),
            shutdown_grace: Duration::from_secs(30),
        }
    }

    pub async fn run(&self, handler: Arc<dyn JobHandler>, mut shutdown: watch::Receiver<bool>) {
        info!(
            queue = %self.queue.name(),
            concurrency = self.concurrency,
            "Worker host started"
        );

        let semaphore = Arc::new(Semaphore::new(self.concurrency));

        loop {
            if *shutdown.borrow() {
                break;
            }

            let available = semaphore.available_permits();
            if available > 0 {
                match self
                    .queue
                    .claim_due(Utc::now().timestamp_millis(), available)
                    .await
                {
                    Ok(jobs) if !jobs.is_empty() => {
                        for job in jobs {
                            let permit = match semaphore.clone().acquire_owned().await {
                                Ok(p) => p,
                                Err(_) => return,
                            };
                            let handler = handler.clone();
                            let queue_name = self.queue.name().to_string();
                            tokio::spawn(async move {
                                let job_id = job.subscription_id.clone();
                                if let Err(e) = handler.handle(job).await {
                                    warn!(
                                        queue = %queue_name,
                                        job_id = %job_id,
                                        error = %e,
                                        "Renewal job failed"
                                    );
                                }
                                drop(permit);
                            });
                        }
                        // Claim again immediately while jobs are flowing.
                        continue;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(queue = %self.queue.name(), error = %e, "Failed to claim due jobs");
                    }
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = shutdown.changed() => {}
            }
        }

        // Let in-flight jobs finish within the grace period.
        let drained = tokio::time::timeout(
            self.shutdown_grace,
            semaphore.acquire_many(self.concurrency as u32),
        )
        .await;
        match drained {
            Ok(_) => info!(queue = %self.queue.name(), "Worker host stopped"),
            Err(_) => warn!(
                queue = %self.queue.name(),
                "Worker host stopped with jobs still in flight"
            ),
        }
    }
}
