//! Dispatcher integration tests: one delayed job per due subscription,
//! job-id deduplication, unknown-operator skips and cursor resumption.

mod common;

use chrono::{Duration as ChronoDuration, Utc};
use common::{gp_subscription, robi_subscription, subscription, InMemoryQueue, InMemoryStore};
use dcb_renewal_service::models::Operator;
use dcb_renewal_service::services::queue::JobQueue;
use dcb_renewal_service::workers::RenewalDispatcher;
use std::collections::HashMap;
use std::sync::Arc;

fn dispatcher_with(
    store: Arc<InMemoryStore>,
    page_size: i64,
) -> (RenewalDispatcher, Arc<InMemoryQueue>, Arc<InMemoryQueue>) {
    let gp_queue = Arc::new(InMemoryQueue::new(Operator::Gp.queue_name()));
    let robi_queue = Arc::new(InMemoryQueue::new(Operator::Robi.queue_name()));
    let mut queues: HashMap<&'static str, Arc<dyn JobQueue>> = HashMap::new();
    queues.insert(Operator::Gp.queue_name(), gp_queue.clone());
    queues.insert(Operator::Robi.queue_name(), robi_queue.clone());
    (
        RenewalDispatcher::new(store, queues, page_size),
        gp_queue,
        robi_queue,
    )
}

#[tokio::test]
async fn enqueues_one_job_per_due_subscription() {
    let mut s1 = gp_subscription(1, "S1");
    s1.next_billing_at = Utc::now() + ChronoDuration::hours(3);
    let s2 = robi_subscription(2, "S2");
    let store = Arc::new(InMemoryStore::with_rows(vec![s1, s2]));
    let (dispatcher, gp_queue, robi_queue) = dispatcher_with(store, 100);

    let summary = dispatcher.run_once().await.unwrap();
    assert_eq!(summary.enqueued, 2);
    assert_eq!(summary.duplicates, 0);
    assert_eq!(summary.skipped_unknown, 0);

    let gp_jobs = gp_queue.scheduled();
    assert_eq!(gp_jobs.len(), 1);
    assert_eq!(gp_jobs[0].job_id, "S1");
    assert_eq!(gp_jobs[0].job.snapshot.subscription_id, "S1");
    // Delay tracks the due moment, about three hours out.
    let delay = gp_jobs[0].delay_ms as i64;
    assert!((delay - 3 * 3600 * 1000).abs() < 5_000, "delay was {}ms", delay);

    assert_eq!(robi_queue.scheduled().len(), 1);
}

#[tokio::test]
async fn overdue_subscription_is_charged_immediately() {
    let mut s1 = gp_subscription(1, "S1");
    s1.next_billing_at = Utc::now() - ChronoDuration::hours(2);
    let store = Arc::new(InMemoryStore::with_rows(vec![s1]));
    let (dispatcher, gp_queue, _) = dispatcher_with(store, 100);

    let summary = dispatcher.run_once().await.unwrap();
    assert_eq!(summary.enqueued, 1);
    assert_eq!(summary.overdue, 1);
    assert_eq!(gp_queue.delay_of("S1"), Some(0));
}

#[tokio::test]
async fn unknown_operator_is_skipped() {
    let store = Arc::new(InMemoryStore::with_rows(vec![
        subscription(1, "S1", "BANGLALINK"),
        gp_subscription(2, "S2"),
    ]));
    let (dispatcher, gp_queue, robi_queue) = dispatcher_with(store, 100);

    let summary = dispatcher.run_once().await.unwrap();
    assert_eq!(summary.enqueued, 1);
    assert_eq!(summary.skipped_unknown, 1);
    assert_eq!(gp_queue.scheduled().len(), 1);
    assert_eq!(robi_queue.scheduled().len(), 0);
}

#[tokio::test]
async fn second_dispatch_deduplicates_pending_jobs() {
    let store = Arc::new(InMemoryStore::with_rows(vec![
        gp_subscription(1, "S1"),
        gp_subscription(2, "S2"),
    ]));
    let (dispatcher, gp_queue, _) = dispatcher_with(store, 100);

    let first = dispatcher.run_once().await.unwrap();
    assert_eq!(first.enqueued, 2);

    let second = dispatcher.run_once().await.unwrap();
    assert_eq!(second.enqueued, 0);
    assert_eq!(second.duplicates, 2);
    assert_eq!(gp_queue.scheduled().len(), 2);
}

#[tokio::test]
async fn failed_page_preserves_the_cursor_for_resumption() {
    let rows: Vec<_> = (1..=25).map(|i| gp_subscription(i, &format!("S{}", i))).collect();
    let store = Arc::new(InMemoryStore::with_rows(rows));
    // Pages of 10: calls 1 and 2 succeed, call 3 fails.
    store.fail_find_on_call(3);
    let (dispatcher, gp_queue, _) = dispatcher_with(store.clone(), 10);

    let result = dispatcher.run_once().await;
    assert!(result.is_err(), "third page failure must surface");
    assert_eq!(gp_queue.scheduled().len(), 20);

    // The retry resumes after the last dispatched page: rows 1-20 are not
    // re-read, rows 21-25 are enqueued exactly once.
    let summary = dispatcher.run_once().await.unwrap();
    assert_eq!(summary.enqueued, 5);
    assert_eq!(summary.duplicates, 0);
    assert_eq!(gp_queue.scheduled().len(), 25);

    let mut job_ids: Vec<_> = gp_queue.scheduled().into_iter().map(|j| j.job_id).collect();
    job_ids.sort();
    job_ids.dedup();
    assert_eq!(job_ids.len(), 25);
}
