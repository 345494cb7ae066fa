//! Notification retrier integration tests: redelivery, the retry cap and
//! the disconnected-broker short circuit.

mod common;

use chrono::Utc;
use common::{InMemoryLedger, MockBroker};
use dcb_renewal_service::models::{FallbackMessage, NotificationEvent, NotificationPayload};
use dcb_renewal_service::workers::{NotificationRetrier, MAX_FALLBACK_RETRIES};
use rust_decimal_macros::dec;
use std::sync::Arc;
use uuid::Uuid;

fn payload(subscription_id: &str) -> NotificationPayload {
    NotificationPayload {
        id: Uuid::new_v4(),
        source: "dcb-renewal-service".to_string(),
        subscription_id: subscription_id.to_string(),
        merchant_transaction_id: format!("mtx-{}", subscription_id),
        keyword: "Health Tips".to_string(),
        msisdn: "8801700000001".to_string(),
        payment_provider: "GP".to_string(),
        event_type: NotificationEvent::RenewSuccess.as_str().to_string(),
        amount: dec!(50),
        currency: "BDT".to_string(),
        billing_cycle_days: 30,
        metadata: None,
        timestamp: Utc::now(),
    }
}

fn seed(ledger: &InMemoryLedger, subscription_id: &str, retry_count: u32) -> String {
    let mut message = FallbackMessage::new(payload(subscription_id), Utc::now());
    message.retry_count = retry_count;
    let key = message.key();
    ledger.seed_fallback(&key, &serde_json::to_string(&message).unwrap());
    key
}

#[tokio::test]
async fn delivers_and_deletes_each_fallback_exactly_once() {
    let ledger = Arc::new(InMemoryLedger::new());
    let broker = Arc::new(MockBroker::new(true));
    seed(&ledger, "S1", 0);
    seed(&ledger, "S2", 2);
    let retrier = NotificationRetrier::new(ledger.clone(), broker.clone());

    let summary = retrier.sweep_once().await.unwrap();
    assert_eq!(summary.delivered, 2);
    assert_eq!(summary.exhausted, 0);
    assert!(ledger.kv_snapshot().is_empty());

    // The stored retry count rides in the publish.
    let mut counts: Vec<u32> = broker.published().iter().map(|(_, c)| *c).collect();
    counts.sort();
    assert_eq!(counts, vec![0, 2]);

    // A second sweep finds nothing.
    let summary = retrier.sweep_once().await.unwrap();
    assert_eq!(summary.scanned, 0);
    assert_eq!(broker.published().len(), 2);
}

#[tokio::test]
async fn disconnected_broker_halts_the_sweep() {
    let ledger = Arc::new(InMemoryLedger::new());
    let broker = Arc::new(MockBroker::new(false));
    seed(&ledger, "S1", 0);
    let retrier = NotificationRetrier::new(ledger.clone(), broker.clone());

    let summary = retrier.sweep_once().await.unwrap();
    assert!(summary.halted);
    assert_eq!(summary.scanned, 0);
    // Nothing was touched; the message waits for the next tick.
    assert_eq!(ledger.kv_snapshot().len(), 1);
}

#[tokio::test]
async fn failed_redelivery_increments_the_retry_count() {
    let ledger = Arc::new(InMemoryLedger::new());
    let broker = Arc::new(MockBroker::new(true));
    broker.fail_publish(true);
    let key = seed(&ledger, "S1", 1);
    let retrier = NotificationRetrier::new(ledger.clone(), broker.clone());

    let summary = retrier.sweep_once().await.unwrap();
    assert_eq!(summary.deferred, 1);

    let raw = ledger.kv_snapshot().get(&key).cloned().unwrap();
    let message: FallbackMessage = serde_json::from_str(&raw).unwrap();
    assert_eq!(message.retry_count, 2);
}

#[tokio::test]
async fn retry_cap_drops_the_message_without_publishing() {
    let ledger = Arc::new(InMemoryLedger::new());
    let broker = Arc::new(MockBroker::new(true));
    seed(&ledger, "S1", MAX_FALLBACK_RETRIES);
    let retrier = NotificationRetrier::new(ledger.clone(), broker.clone());

    let summary = retrier.sweep_once().await.unwrap();
    assert_eq!(summary.exhausted, 1);
    assert_eq!(summary.delivered, 0);
    assert!(broker.published().is_empty());
    assert!(ledger.kv_snapshot().is_empty());
}

#[tokio::test]
async fn message_exhausts_after_the_full_retry_ladder() {
    let ledger = Arc::new(InMemoryLedger::new());
    let broker = Arc::new(MockBroker::new(true));
    broker.fail_publish(true);
    seed(&ledger, "S1", 0);
    let retrier = NotificationRetrier::new(ledger.clone(), broker.clone());

    for _ in 0..MAX_FALLBACK_RETRIES {
        let summary = retrier.sweep_once().await.unwrap();
        assert_eq!(summary.deferred, 1);
    }

    // Attempts are spent; the next sweep drops the message for good.
    let summary = retrier.sweep_once().await.unwrap();
    assert_eq!(summary.exhausted, 1);
    assert!(ledger.kv_snapshot().is_empty());
}
