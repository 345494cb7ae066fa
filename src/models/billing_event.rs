//! Billing event rows, the append-only record of terminal charge outcomes.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const EVENT_TYPE_RENEWAL: &str = "RENEWAL";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BillingEventStatus {
    Success,
    Failed,
}

impl BillingEventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingEventStatus::Success => "SUCCESS",
            BillingEventStatus::Failed => "FAILED",
        }
    }

    pub fn from_success(success: bool) -> Self {
        if success {
            BillingEventStatus::Success
        } else {
            BillingEventStatus::Failed
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingEvent {
    pub event_id: Uuid,
    pub subscription_id: String,
    pub merchant_id: Uuid,
    pub product_id: Uuid,
    pub plan_id: Uuid,
    pub payment_channel_id: Uuid,
    pub msisdn: String,
    pub payment_reference_id: Uuid,
    pub event_type: String,
    pub status: BillingEventStatus,
    pub amount: Decimal,
    pub currency: String,
    pub request_payload: serde_json::Value,
    pub response_payload: serde_json::Value,
    pub response_message: String,
    pub duration_ms: i64,
    pub response_code: i32,
}
