//! ROBI payment gateway client.
//!
//! Flat JSON POST to `/api/renewSubscription`. Success is declared by the
//! response body: `transactionOperationStatus` equal to `charged`,
//! case-insensitively, regardless of the HTTP status family.

use super::{ChargeRequest, ChargeResult, GatewayClient};
use crate::config::RobiGatewayConfig;
use crate::error::AppError;
use crate::models::{ChargingConfig, GatewayFault, Operator};
use crate::services::metrics;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use std::time::{Duration, Instant};

pub struct RobiGatewayClient {
    client: Client,
    config: RobiGatewayConfig,
}

impl RobiGatewayClient {
    pub fn new(config: RobiGatewayConfig) -> Result<Self, AppError> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| AppError::InternalError(anyhow::anyhow!(e)))?;
        Ok(Self { client, config })
    }
}

fn build_payload(req: &ChargeRequest) -> Option<serde_json::Value> {
    let ChargingConfig::Robi(config) = &req.config else {
        return None;
    };

    Some(json!({
        "apiKey": config.api_key,
        "username": config.username,
        "spTransID": req.reference_code,
        "description": req.description,
        "currency": req.currency,
        "amount": req.amount,
        "onBehalfOf": config.on_behalf_of,
        "purchaseCategoryCode": config.purchase_category_code,
        "referenceCode": req.reference_code,
        "channel": config.channel,
        "taxAmount": 0,
        "msisdn": req.msisdn,
        "operator": "ROBI",
        "subscriptionID": config.subscription_id,
        "unSubURL": config.unsub_url,
        "contactInfo": config.contact_info,
    }))
}

fn is_charged(response: &serde_json::Value) -> bool {
    response
        .get("transactionOperationStatus")
        .and_then(|v| v.as_str())
        .map(|s| s.eq_ignore_ascii_case("charged"))
        .unwrap_or(false)
}

#[async_trait]
impl GatewayClient for RobiGatewayClient {
    fn operator(&self) -> Operator {
        Operator::Robi
    }

    async fn charge(&self, req: &ChargeRequest) -> ChargeResult {
        let Some(request_payload) = build_payload(req) else {
            // The worker skips config-less jobs before calling; this is a
            // belt against a mis-built request reaching the wire.
            return ChargeResult {
                success: false,
                http_status: 0,
                request_payload: serde_json::Value::Null,
                response_payload: serde_json::Value::Null,
                duration_ms: 0,
                error: Some(GatewayFault {
                    code: "MISSING_CONFIG".to_string(),
                    message: "ROBI charging configuration absent".to_string(),
                }),
            };
        };

        let url = format!("{}/api/renewSubscription", self.config.base_url);

        let started = Instant::now();
        let response = self.client.post(&url).json(&request_payload).send().await;
        let duration_ms = started.elapsed().as_millis() as u64;
        metrics::record_gateway_duration(self.operator().as_str(), duration_ms as f64 / 1000.0);

        match response {
            Ok(response) => {
                let http_status = response.status().as_u16();
                let body = response.text().await.unwrap_or_default();
                let response_payload: serde_json::Value =
                    serde_json::from_str(&body).unwrap_or_else(|_| json!({ "raw": body }));

                tracing::debug!(
                    status = http_status,
                    reference = %req.reference_code,
                    "ROBI charge response"
                );

                let success = is_charged(&response_payload);
                let error = (!success).then(|| GatewayFault {
                    code: "CHARGE_DECLINED".to_string(),
                    message: response_payload
                        .get("transactionOperationStatus")
                        .and_then(|v| v.as_str())
                        .map(|s| format!("transactionOperationStatus={}", s))
                        .unwrap_or_else(|| format!("ROBI returned HTTP {}", http_status)),
                });

                ChargeResult {
                    success,
                    http_status,
                    request_payload,
                    response_payload,
                    duration_ms,
                    error,
                }
            }
            Err(e) => {
                tracing::warn!(
                    reference = %req.reference_code,
                    error = %e,
                    "ROBI charge transport failure"
                );
                ChargeResult {
                    success: false,
                    http_status: 504,
                    request_payload,
                    response_payload: serde_json::Value::Null,
                    duration_ms,
                    error: Some(GatewayFault {
                        code: "GATEWAY_UNREACHABLE".to_string(),
                        message: e.to_string(),
                    }),
                }
            }
        }
    }
}
