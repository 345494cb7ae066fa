//! Prometheus metrics for the renewal pipeline.

use once_cell::sync::Lazy;
use prometheus::{
    histogram_opts, opts, register_histogram, register_histogram_vec, register_int_counter_vec,
    register_int_gauge, Encoder, Histogram, HistogramVec, IntCounterVec, IntGauge, TextEncoder,
};
use std::sync::OnceLock;

/// Database query duration histogram
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        histogram_opts!("renewal_db_query_duration_seconds", "Database query duration"),
        &["operation"]
    )
    .expect("Failed to register DB_QUERY_DURATION")
});

/// Carrier gateway call duration histogram
pub static GATEWAY_REQUEST_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Charge attempts counter by operator and result
pub static CHARGE_ATTEMPTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Renewal jobs enqueued by the dispatcher
pub static JOBS_DISPATCHED_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Same-day re-queues scheduled by workers
pub static JOBS_REQUEUED_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Outcomes drained from the ledger per consumer tick
pub static LEDGER_DRAIN_SIZE: OnceLock<Histogram> = OnceLock::new();

/// Current result ledger depth
pub static LEDGER_DEPTH: OnceLock<IntGauge> = OnceLock::new();

/// Notifications by terminal outcome
pub static NOTIFICATIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Initialize all metrics. Call once at startup.
pub fn init_metrics() {
    GATEWAY_REQUEST_DURATION.get_or_init(|| {
        register_histogram_vec!(
            histogram_opts!(
                "renewal_gateway_request_duration_seconds",
                "Carrier gateway call duration",
                vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
            ),
            &["operator"]
        )
        .expect("Failed to register GATEWAY_REQUEST_DURATION")
    });

    CHARGE_ATTEMPTS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "renewal_charge_attempts_total",
                "Charge attempts by operator and result"
            ),
            &["operator", "result"]
        )
        .expect("Failed to register CHARGE_ATTEMPTS_TOTAL")
    });

    JOBS_DISPATCHED_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "renewal_jobs_dispatched_total",
                "Renewal jobs enqueued per queue"
            ),
            &["queue"]
        )
        .expect("Failed to register JOBS_DISPATCHED_TOTAL")
    });

    JOBS_REQUEUED_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "renewal_jobs_requeued_total",
                "Same-day re-queues scheduled per queue"
            ),
            &["queue"]
        )
        .expect("Failed to register JOBS_REQUEUED_TOTAL")
    });

    LEDGER_DRAIN_SIZE.get_or_init(|| {
        register_histogram!(histogram_opts!(
            "renewal_ledger_drain_size",
            "Outcomes drained from the ledger per consumer tick",
            vec![0.0, 1.0, 10.0, 50.0, 100.0, 250.0]
        ))
        .expect("Failed to register LEDGER_DRAIN_SIZE")
    });

    LEDGER_DEPTH.get_or_init(|| {
        register_int_gauge!(opts!("renewal_ledger_depth", "Current result ledger depth"))
            .expect("Failed to register LEDGER_DEPTH")
    });

    NOTIFICATIONS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "renewal_notifications_total",
                "Notifications by terminal outcome"
            ),
            &["outcome"]
        )
        .expect("Failed to register NOTIFICATIONS_TOTAL")
    });

    // Force initialization of lazy statics
    let _ = &*DB_QUERY_DURATION;
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .expect("Failed to encode metrics");
    String::from_utf8(buffer).expect("Failed to convert metrics to string")
}

pub fn record_charge_attempt(operator: &str, success: bool) {
    if let Some(counter) = CHARGE_ATTEMPTS_TOTAL.get() {
        let result = if success { "success" } else { "failure" };
        counter.with_label_values(&[operator, result]).inc();
    }
}

pub fn record_gateway_duration(operator: &str, duration_secs: f64) {
    if let Some(histogram) = GATEWAY_REQUEST_DURATION.get() {
        histogram
            .with_label_values(&[operator])
            .observe(duration_secs);
    }
}

pub fn record_job_dispatched(queue: &str) {
    if let Some(counter) = JOBS_DISPATCHED_TOTAL.get() {
        counter.with_label_values(&[queue]).inc();
    }
}

pub fn record_job_requeued(queue: &str) {
    if let Some(counter) = JOBS_REQUEUED_TOTAL.get() {
        counter.with_label_values(&[queue]).inc();
    }
}

pub fn record_ledger_drain(size: usize) {
    if let Some(histogram) = LEDGER_DRAIN_SIZE.get() {
        histogram.observe(size as f64);
    }
}

pub fn set_ledger_depth(depth: i64) {
    if let Some(gauge) = LEDGER_DEPTH.get() {
        gauge.set(depth);
    }
}

pub fn record_notification(outcome: &str) {
    if let Some(counter) = NOTIFICATIONS_TOTAL.get() {
        counter.with_label_values(&[outcome]).inc();
    }
}
