//! Subscription snapshot model.
//!
//! The renewal scan reads subscriptions with every joined record the
//! downstream pipeline needs, so the snapshot that rides in a job payload
//! is self-contained and workers never go back to the database.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Subscription status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubscriptionStatus {
    Active,
    SuspendedPaymentFailed,
    Cancelled,
    Expired,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "ACTIVE",
            SubscriptionStatus::SuspendedPaymentFailed => "SUSPENDED_PAYMENT_FAILED",
            SubscriptionStatus::Cancelled => "CANCELLED",
            SubscriptionStatus::Expired => "EXPIRED",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "SUSPENDED_PAYMENT_FAILED" => SubscriptionStatus::SuspendedPaymentFailed,
            "CANCELLED" => SubscriptionStatus::Cancelled,
            "EXPIRED" => SubscriptionStatus::Expired,
            _ => SubscriptionStatus::Active,
        }
    }
}

/// Carrier behind a payment channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operator {
    Gp,
    Robi,
    RobiMife,
}

impl Operator {
    /// Map a payment channel code onto its operator. Unknown codes are
    /// skipped by the dispatcher, hence the Option.
    pub fn from_channel_code(code: &str) -> Option<Self> {
        match code {
            "GP" => Some(Operator::Gp),
            "ROBI" => Some(Operator::Robi),
            "ROBI_MIFE" => Some(Operator::RobiMife),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::Gp => "GP",
            Operator::Robi => "ROBI",
            Operator::RobiMife => "ROBI_MIFE",
        }
    }

    /// ROBI_MIFE subscriptions ride the ROBI queue and gateway.
    pub fn queue_name(&self) -> &'static str {
        match self {
            Operator::Gp => "renewal_gp",
            Operator::Robi | Operator::RobiMife => "renewal_robi",
        }
    }

    /// Whether a failed charge is retried once more later the same day.
    pub fn requeues_same_day(&self) -> bool {
        matches!(self, Operator::Gp)
    }

    /// Whether a charge request cannot be built without operator config.
    pub fn requires_charging_config(&self) -> bool {
        matches!(self, Operator::Robi | Operator::RobiMife)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentChannel {
    pub payment_channel_id: Uuid,
    pub code: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductPlan {
    pub plan_id: Uuid,
    pub name: String,
    pub billing_cycle_days: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanPricing {
    pub base_amount: Option<Decimal>,
    pub currency: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Product {
    pub product_id: Uuid,
    pub code: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Merchant {
    pub merchant_id: Uuid,
    pub name: String,
}

/// Fully joined subscription row as read by the renewal scan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    /// Monotone integer used as the paging cursor.
    pub id: i64,
    pub subscription_id: String,
    pub msisdn: String,
    pub status: String,
    pub auto_renew: bool,
    pub next_billing_at: DateTime<Utc>,
    pub last_payment_succeed_at: Option<DateTime<Utc>>,
    pub last_payment_failed_at: Option<DateTime<Utc>>,
    pub payment_channel: PaymentChannel,
    pub charging_config: Option<serde_json::Value>,
    pub product_plan: ProductPlan,
    pub plan_pricing: PlanPricing,
    pub product: Product,
    pub merchant: Merchant,
    pub payment_channel_reference: Option<String>,
    pub consent_id: Option<String>,
    pub merchant_transaction_id: String,
}

impl Subscription {
    pub fn operator(&self) -> Option<Operator> {
        Operator::from_channel_code(&self.payment_channel.code)
    }
}
