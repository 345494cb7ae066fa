//! GP (Grameenphone) payment gateway client.
//!
//! Speaks the partner payment API: a nested `amountTransaction` body
//! POSTed with basic auth. HTTP 200 is the success signal.

use super::{subscription_period, ChargeRequest, ChargeResult, GatewayClient};
use crate::config::GpGatewayConfig;
use crate::error::AppError;
use crate::models::{GatewayFault, Operator};
use crate::services::metrics;
use async_trait::async_trait;
use reqwest::Client;
use secrecy::ExposeSecret;
use serde_json::json;
use std::time::{Duration, Instant};

/// Product codes charged under the Game purchase category.
const GAME_PRODUCT_CODES: [&str; 2] = ["XPGames", "GameApex"];

pub struct GpGatewayClient {
    client: Client,
    config: GpGatewayConfig,
}

impl GpGatewayClient {
    pub fn new(config: GpGatewayConfig) -> Result<Self, AppError> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| AppError::InternalError(anyhow::anyhow!(e)))?;
        Ok(Self { client, config })
    }

    fn transaction_url(&self, end_user_id: &str) -> String {
        format!(
            "{}/partner/payment/v1/{}/transactions/amount",
            self.config.base_url, end_user_id
        )
    }
}

/// The subscriber identity GP addresses transactions to.
fn end_user_id(req: &ChargeRequest) -> &str {
    req.payment_channel_reference
        .as_deref()
        .unwrap_or(&req.msisdn)
}

fn build_payload(req: &ChargeRequest) -> serde_json::Value {
    let mut meta = json!({
        "channel": "SelfWeb",
        "subscription_period": subscription_period(req.billing_cycle_days),
    });
    if GAME_PRODUCT_CODES.contains(&req.product_code.as_str()) {
        meta["purchaseCategoryCode"] = json!("Game");
    }

    json!({
        "amountTransaction": {
            "endUserId": end_user_id(req),
            "paymentAmount": {
                "chargingInformation": {
                    "amount": req.amount,
                    "currency": req.currency,
                    "description": req.description,
                },
                "chargingMetaData": meta,
            },
            "referenceCode": req.reference_code,
            "transactionOperationStatus": "Charged",
        }
    })
}

#[async_trait]
impl GatewayClient for GpGatewayClient {
    fn operator(&self) -> Operator {
        Operator::Gp
    }

    async fn charge(&self, req: &ChargeRequest) -> ChargeResult {
        let request_payload = build_payload(req);
        let url = self.transaction_url(end_user_id(req));

        let started = Instant::now();
        let response = self
            .client
            .post(&url)
            .basic_auth(
                &self.config.basic_auth_user,
                Some(self.config.basic_auth_pass.expose_secret()),
            )
            .json(&request_payload)
            .send()
            .await;
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
                    "GP charge response"
                );

                let success = http_status == 200;
                let error = (!success).then(|| GatewayFault {
                    code: http_status.to_string(),
                    message: format!("GP returned HTTP {}", http_status),
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
                    "GP charge transport failure"
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
