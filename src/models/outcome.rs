//! Job payloads and charge outcomes flowing through the queue and ledger.

use super::Subscription;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Payload of one delayed renewal job. The snapshot is the full joined
/// subscription row at dispatch time; the subscription id doubles as the
/// queue deduplication key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenewalJob {
    pub subscription_id: String,
    pub snapshot: Subscription,
}

impl RenewalJob {
    pub fn new(snapshot: Subscription) -> Self {
        Self {
            subscription_id: snapshot.subscription_id.clone(),
            snapshot,
        }
    }
}

/// Error detail attached to a failed gateway call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayFault {
    pub code: String,
    pub message: String,
}

/// One charge attempt's result, appended to the result ledger by a
/// worker and drained by the result consumer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChargeOutcome {
    pub subscription_id: String,
    pub snapshot: Subscription,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub payment_reference_id: Uuid,
    pub http_status: u16,
    pub request_payload: serde_json::Value,
    pub response_payload: serde_json::Value,
    pub response_duration_ms: u64,
    pub error: Option<GatewayFault>,
    pub message: String,
}

/// Per-subscription entry of the consumer's atomic bulk update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionBulkUpdate {
    pub subscription_id: String,
    pub success: bool,
    pub next_billing_at: DateTime<Utc>,
}
