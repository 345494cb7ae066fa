//! Test helpers: in-memory fakes for the queue, ledger, stores, broker
//! and gateway seams, plus subscription builders.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dcb_renewal_service::error::AppError;
use dcb_renewal_service::models::{
    BillingEvent, Merchant, NotificationPayload, Operator, PaymentChannel, PlanPricing, Product,
    ProductPlan, RenewalJob, Subscription, SubscriptionBulkUpdate, SubscriptionStatus,
};
use dcb_renewal_service::services::gateways::{ChargeRequest, ChargeResult, GatewayClient};
use dcb_renewal_service::services::queue::{EnqueueOptions, EnqueueOutcome, JobQueue};
use dcb_renewal_service::services::{
    BillingEventStore, NotificationBroker, ResultLedger, SubscriptionStore,
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::json;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Subscription builders
// ---------------------------------------------------------------------------

pub fn subscription(id: i64, subscription_id: &str, channel_code: &str) -> Subscription {
    Subscription {
        id,
        subscription_id: subscription_id.to_string(),
        msisdn: format!("88017000000{:02}", id % 100),
        status: SubscriptionStatus::Active.as_str().to_string(),
        auto_renew: true,
        next_billing_at: Utc::now(),
        last_payment_succeed_at: None,
        last_payment_failed_at: None,
        payment_channel: PaymentChannel {
            payment_channel_id: Uuid::new_v4(),
            code: channel_code.to_string(),
        },
        charging_config: None,
        product_plan: ProductPlan {
            plan_id: Uuid::new_v4(),
            name: "Monthly".to_string(),
            billing_cycle_days: 30,
        },
        plan_pricing: PlanPricing {
            base_amount: Some(dec!(50)),
            currency: Some("BDT".to_string()),
        },
        product: Product {
            product_id: Uuid::new_v4(),
            code: "HealthTips".to_string(),
            name: "Health Tips".to_string(),
        },
        merchant: Merchant {
            merchant_id: Uuid::new_v4(),
            name: "Acme Content".to_string(),
        },
        payment_channel_reference: None,
        consent_id: Some(format!("consent-{}", id)),
        merchant_transaction_id: format!("mtx-{}", subscription_id),
    }
}

pub fn gp_subscription(id: i64, subscription_id: &str) -> Subscription {
    subscription(id, subscription_id, "GP")
}

pub fn robi_subscription(id: i64, subscription_id: &str) -> Subscription {
    let mut sub = subscription(id, subscription_id, "ROBI");
    sub.charging_config = Some(json!({
        "apiKey": "robi-key",
        "username": "sp_user",
        "onBehalfOf": "Acme",
        "purchaseCategoryCode": "Service",
        "channel": "WAP",
        "subscriptionID": format!("robi-{}", subscription_id),
        "unSubURL": "https://example.com/unsub",
        "contactInfo": "support@example.com"
    }));
    sub
}

// ---------------------------------------------------------------------------
// In-memory job queue
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct ScheduledJob {
    pub job_id: String,
    pub due_ms: i64,
    pub delay_ms: u64,
    pub job: RenewalJob,
}

pub struct InMemoryQueue {
    name: String,
    scheduled: Mutex<Vec<ScheduledJob>>,
}

impl InMemoryQueue {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            scheduled: Mutex::new(Vec::new()),
        }
    }

    pub fn scheduled(&self) -> Vec<ScheduledJob> {
        self.scheduled.lock().unwrap().clone()
    }

    pub fn delay_of(&self, job_id: &str) -> Option<u64> {
        self.scheduled
            .lock()
            .unwrap()
            .iter()
            .find(|j| j.job_id == job_id)
            .map(|j| j.delay_ms)
    }
}

#[async_trait]
impl JobQueue for InMemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn enqueue(
        &self,
        job: &RenewalJob,
        opts: EnqueueOptions,
    ) -> Result<EnqueueOutcome, AppError> {
        let mut scheduled = self.scheduled.lock().unwrap();
        if scheduled.iter().any(|j| j.job_id == opts.job_id) {
            return Ok(EnqueueOutcome::Duplicate);
        }
        let delay_ms = opts.delay.as_millis() as u64;
        scheduled.push(ScheduledJob {
            job_id: opts.job_id,
            due_ms: Utc::now().timestamp_millis() + delay_ms as i64,
            delay_ms,
            job: job.clone(),
        });
        Ok(EnqueueOutcome::Enqueued)
    }

    async fn claim_due(&self, now_ms: i64, limit: usize) -> Result<Vec<RenewalJob>, AppError> {
        let mut scheduled = self.scheduled.lock().unwrap();
        scheduled.sort_by_key(|j| j.due_ms);
        let mut claimed = Vec::new();
        let mut remaining = Vec::new();
        for entry in scheduled.drain(..) {
            if entry.due_ms <= now_ms && claimed.len() < limit {
                claimed.push(entry.job);
            } else {
                remaining.push(entry);
            }
        }
        *scheduled = remaining;
        Ok(claimed)
    }

    async fn pending_count(&self) -> Result<u64, AppError> {
        Ok(self.scheduled.lock().unwrap().len() as u64)
    }
}

// ---------------------------------------------------------------------------
// In-memory ledger + fallback KV
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct InMemoryLedger {
    list: Mutex<VecDeque<String>>,
    kv: Mutex<BTreeMap<String, String>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<String> {
        self.list.lock().unwrap().iter().cloned().collect()
    }

    pub fn kv_snapshot(&self) -> BTreeMap<String, String> {
        self.kv.lock().unwrap().clone()
    }

    pub fn seed_fallback(&self, key: &str, value: &str) {
        self.kv
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
    }
}

#[async_trait]
impl ResultLedger for InMemoryLedger {
    async fn push_outcome(&self, raw: &str) -> Result<(), AppError> {
        self.list.lock().unwrap().push_back(raw.to_string());
        Ok(())
    }

    async fn pop_outcome(&self) -> Result<Option<String>, AppError> {
        Ok(self.list.lock().unwrap().pop_front())
    }

    async fn ledger_len(&self) -> Result<u64, AppError> {
        Ok(self.list.lock().unwrap().len() as u64)
    }

    async fn fallback_get(&self, key: &str) -> Result<Option<String>, AppError> {
        Ok(self.kv.lock().unwrap().get(key).cloned())
    }

    async fn fallback_set(&self, key: &str, value: &str) -> Result<(), AppError> {
        self.kv
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn fallback_delete(&self, key: &str) -> Result<(), AppError> {
        self.kv.lock().unwrap().remove(key);
        Ok(())
    }

    async fn fallback_keys(&self) -> Result<Vec<String>, AppError> {
        Ok(self.kv.lock().unwrap().keys().cloned().collect())
    }
}

// ---------------------------------------------------------------------------
// In-memory subscription + billing event store
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct InMemoryStore {
    rows: Mutex<Vec<Subscription>>,
    updates: Mutex<Vec<SubscriptionBulkUpdate>>,
    events: Mutex<Vec<BillingEvent>>,
    find_calls: AtomicUsize,
    fail_find_on_call: Mutex<Option<usize>>,
    fail_bulk_update: AtomicBool,
    fail_create_events: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rows(rows: Vec<Subscription>) -> Self {
        let store = Self::new();
        *store.rows.lock().unwrap() = rows;
        store
    }

    pub fn fail_find_on_call(&self, call: usize) {
        *self.fail_find_on_call.lock().unwrap() = Some(call);
    }

    pub fn fail_bulk_update(&self, fail: bool) {
        self.fail_bulk_update.store(fail, Ordering::SeqCst);
    }

    pub fn fail_create_events(&self, fail: bool) {
        self.fail_create_events.store(fail, Ordering::SeqCst);
    }

    pub fn updates(&self) -> Vec<SubscriptionBulkUpdate> {
        self.updates.lock().unwrap().clone()
    }

    pub fn events(&self) -> Vec<BillingEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn row(&self, subscription_id: &str) -> Option<Subscription> {
        self.rows
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.subscription_id == subscription_id)
            .cloned()
    }
}

#[async_trait]
impl SubscriptionStore for InMemoryStore {
    async fn find_renewable(
        &self,
        limit: i64,
        cursor: Option<i64>,
    ) -> Result<Vec<Subscription>, AppError> {
        let call = self.find_calls.fetch_add(1, Ordering::SeqCst) + 1;
        let mut fail_on = self.fail_find_on_call.lock().unwrap();
        if *fail_on == Some(call) {
            *fail_on = None;
            return Err(AppError::DatabaseError(anyhow::anyhow!(
                "injected find_renewable failure"
            )));
        }
        drop(fail_on);

        let rows = self.rows.lock().unwrap();
        let mut page: Vec<Subscription> = rows
            .iter()
            .filter(|r| r.auto_renew)
            .filter(|r| {
                matches!(
                    r.status.as_str(),
                    "ACTIVE" | "SUSPENDED_PAYMENT_FAILED"
                )
            })
            .filter(|r| cursor.map(|c| r.id > c).unwrap_or(true))
            .cloned()
            .collect();
        page.sort_by_key(|r| r.id);
        page.truncate(limit as usize);
        Ok(page)
    }

    async fn bulk_update(&self, updates: &[SubscriptionBulkUpdate]) -> Result<u64, AppError> {
        if self.fail_bulk_update.load(Ordering::SeqCst) {
            return Err(AppError::DatabaseError(anyhow::anyhow!(
                "injected bulk_update failure"
            )));
        }

        let applied_at = Utc::now();
        let mut rows = self.rows.lock().unwrap();
        for update in updates {
            if let Some(row) = rows
                .iter_mut()
                .find(|r| r.subscription_id == update.subscription_id)
            {
                row.status = if update.success {
                    SubscriptionStatus::Active.as_str().to_string()
                } else {
                    SubscriptionStatus::SuspendedPaymentFailed.as_str().to_string()
                };
                row.last_payment_succeed_at = update.success.then_some(applied_at);
                row.last_payment_failed_at = (!update.success).then_some(applied_at);
                row.next_billing_at = update.next_billing_at;
            }
        }
        self.updates.lock().unwrap().extend_from_slice(updates);
        Ok(updates.len() as u64)
    }
}

#[async_trait]
impl BillingEventStore for InMemoryStore {
    async fn create_events(&self, rows: &[BillingEvent]) -> Result<u64, AppError> {
        if self.fail_create_events.load(Ordering::SeqCst) {
            return Err(AppError::DatabaseError(anyhow::anyhow!(
                "injected create_events failure"
            )));
        }
        self.events.lock().unwrap().extend_from_slice(rows);
        Ok(rows.len() as u64)
    }
}

// ---------------------------------------------------------------------------
// Mock notification broker
// ---------------------------------------------------------------------------

pub struct MockBroker {
    connected: AtomicBool,
    fail_publish: AtomicBool,
    published: Mutex<Vec<(NotificationPayload, u32)>>,
}

impl MockBroker {
    pub fn new(connected: bool) -> Self {
        Self {
            connected: AtomicBool::new(connected),
            fail_publish: AtomicBool::new(false),
            published: Mutex::new(Vec::new()),
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn fail_publish(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    pub fn published(&self) -> Vec<(NotificationPayload, u32)> {
        self.published.lock().unwrap().clone()
    }
}

#[async_trait]
impl NotificationBroker for MockBroker {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn publish(
        &self,
        payload: &NotificationPayload,
        retry_count: u32,
    ) -> Result<(), AppError> {
        if !self.is_connected() || self.fail_publish.load(Ordering::SeqCst) {
            return Err(AppError::BrokerError(anyhow::anyhow!(
                "mock broker unavailable"
            )));
        }
        self.published
            .lock()
            .unwrap()
            .push((payload.clone(), retry_count));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Mock gateway
// ---------------------------------------------------------------------------

pub struct MockGateway {
    operator: Operator,
    scripted: Mutex<VecDeque<ChargeResult>>,
    default_success: bool,
    requests: Mutex<Vec<ChargeRequest>>,
}

impl MockGateway {
    pub fn succeeding(operator: Operator) -> Self {
        Self {
            operator,
            scripted: Mutex::new(VecDeque::new()),
            default_success: true,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(operator: Operator) -> Self {
        Self {
            operator,
            scripted: Mutex::new(VecDeque::new()),
            default_success: false,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn script(&self, result: ChargeResult) {
        self.scripted.lock().unwrap().push_back(result);
    }

    pub fn requests(&self) -> Vec<ChargeRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn charge_result(success: bool, http_status: u16) -> ChargeResult {
        ChargeResult {
            success,
            http_status,
            request_payload: json!({"mock": true}),
            response_payload: json!({"mock": true}),
            duration_ms: 12,
            error: (!success).then(|| dcb_renewal_service::models::GatewayFault {
                code: http_status.to_string(),
                message: format!("mock gateway returned {}", http_status),
            }),
        }
    }
}

#[async_trait]
impl GatewayClient for MockGateway {
    fn operator(&self) -> Operator {
        self.operator
    }

    async fn charge(&self, req: &ChargeRequest) -> ChargeResult {
        self.requests.lock().unwrap().push(req.clone());
        if let Some(result) = self.scripted.lock().unwrap().pop_front() {
            return result;
        }
        let status = if self.default_success { 200 } else { 500 };
        Self::charge_result(self.default_success, status)
    }
}

// ---------------------------------------------------------------------------
// Misc helpers
// ---------------------------------------------------------------------------

pub fn assert_close_to(actual: DateTime<Utc>, expected: DateTime<Utc>, tolerance_secs: i64) {
    let diff = (actual - expected).num_seconds().abs();
    assert!(
        diff <= tolerance_secs,
        "expected {} within {}s of {}, diff was {}s",
        actual,
        tolerance_secs,
        expected,
        diff
    );
}

pub const BASE_AMOUNT: Decimal = dec!(50);
