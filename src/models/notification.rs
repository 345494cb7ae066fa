//! Downstream notification payloads and their disk-durable fallback form.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const NOTIFICATION_SOURCE: &str = "dcb-renewal-service";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationEvent {
    RenewSuccess,
    RenewFail,
}

impl NotificationEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationEvent::RenewSuccess => "renew.success",
            NotificationEvent::RenewFail => "renew.fail",
        }
    }

    pub fn from_success(success: bool) -> Self {
        if success {
            NotificationEvent::RenewSuccess
        } else {
            NotificationEvent::RenewFail
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationPayload {
    pub id: Uuid,
    pub source: String,
    pub subscription_id: String,
    pub merchant_transaction_id: String,
    pub keyword: String,
    pub msisdn: String,
    pub payment_provider: String,
    pub event_type: String,
    pub amount: Decimal,
    pub currency: String,
    pub billing_cycle_days: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

/// A notification that could not be handed to the broker, persisted in
/// the fallback KV until redelivered or permanently failed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackMessage {
    #[serde(flatten)]
    pub payload: NotificationPayload,
    pub failed_at: DateTime<Utc>,
    pub retry_count: u32,
}

impl FallbackMessage {
    pub fn new(payload: NotificationPayload, failed_at: DateTime<Utc>) -> Self {
        Self {
            payload,
            failed_at,
            retry_count: 0,
        }
    }

    /// Redis key under which this message is stored.
    pub fn key(&self) -> String {
        format!("notification:fallback:{}", self.payload.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn sample_payload() -> NotificationPayload {
        NotificationPayload {
            id: Uuid::new_v4(),
            source: NOTIFICATION_SOURCE.to_string(),
            subscription_id: "sub-1".to_string(),
            merchant_transaction_id: "mtx-1".to_string(),
            keyword: "HealthTips".to_string(),
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

    #[test]
    fn fallback_round_trip_keeps_payload_fields() {
        let message = FallbackMessage::new(sample_payload(), Utc::now());
        let raw = serde_json::to_string(&message).unwrap();
        let back: FallbackMessage = serde_json::from_str(&raw).unwrap();
        assert_eq!(back.payload.subscription_id, "sub-1");
        assert_eq!(back.retry_count, 0);
    }

    #[test]
    fn fallback_key_embeds_payload_id() {
        let message = FallbackMessage::new(sample_payload(), Utc::now());
        assert_eq!(
            message.key(),
            format!("notification:fallback:{}", message.payload.id)
        );
    }
}
