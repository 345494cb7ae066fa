//! Carrier gateway clients.
//!
//! Each operator speaks its own wire dialect; the trait narrows them to a
//! canonical charge call. Gateway calls never fail at the type level: a
//! declined charge, a non-2xx status and a transport fault all come back
//! as a `ChargeResult` with `success = false`.

pub mod gp;
pub mod robi;

pub use gp::GpGatewayClient;
pub use robi::RobiGatewayClient;

use crate::models::{ChargingConfig, GatewayFault, Operator};
use async_trait::async_trait;
use rust_decimal::Decimal;

/// Canonical charge request built by the operator worker.
#[derive(Debug, Clone)]
pub struct ChargeRequest {
    pub subscription_id: String,
    pub msisdn: String,
    pub amount: Decimal,
    pub currency: String,
    /// Fresh payment reference for this attempt.
    pub reference_code: String,
    pub description: String,
    pub billing_cycle_days: i32,
    pub product_code: String,
    pub payment_channel_reference: Option<String>,
    pub config: ChargingConfig,
}

/// Uniform outcome of a gateway call.
#[derive(Debug, Clone)]
pub struct ChargeResult {
    pub success: bool,
    pub http_status: u16,
    pub request_payload: serde_json::Value,
    pub response_payload: serde_json::Value,
    pub duration_ms: u64,
    pub error: Option<GatewayFault>,
}

#[async_trait]
pub trait GatewayClient: Send + Sync {
    fn operator(&self) -> Operator;

    async fn charge(&self, req: &ChargeRequest) -> ChargeResult;
}

/// Map a billing cycle length onto the wire subscription period.
/// Total over all inputs; unknown cycles charge as daily.
pub fn subscription_period(billing_cycle_days: i32) -> &'static str {
    match billing_cycle_days {
        1 => "P1D",
        7 => "P1W",
        30 => "P1M",
        180 => "P6M",
        365 => "P1Y",
        _ => "P1D",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn period_mapping_table() {
        assert_eq!(subscription_period(1), "P1D");
        assert_eq!(subscription_period(7), "P1W");
        assert_eq!(subscription_period(30), "P1M");
        assert_eq!(subscription_period(180), "P6M");
        assert_eq!(subscription_period(365), "P1Y");
    }

    #[test]
    fn period_mapping_is_total() {
        let valid = ["P1D", "P1W", "P1M", "P6M", "P1Y"];
        for days in -1000..=1000 {
            assert!(valid.contains(&subscription_period(days)));
        }
        assert_eq!(subscription_period(i32::MIN), "P1D");
        assert_eq!(subscription_period(i32::MAX), "P1D");
    }
}
