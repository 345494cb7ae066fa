//! Operator-specific charging configuration.
//!
//! The `charging_configurations.config` column is an opaque JSON record
//! whose shape depends on the payment channel. It is decoded into a
//! tagged variant here so the workers can dispatch on the operator
//! instead of poking at raw JSON.

use super::Operator;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GpConfig {
    pub keyword: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RobiConfig {
    pub api_key: String,
    pub username: String,
    pub on_behalf_of: String,
    pub purchase_category_code: String,
    pub channel: String,
    #[serde(rename = "subscriptionID")]
    pub subscription_id: String,
    #[serde(rename = "unSubURL")]
    pub unsub_url: String,
    pub contact_info: String,
}

#[derive(Debug, Clone)]
pub enum ChargingConfig {
    Gp(GpConfig),
    Robi(RobiConfig),
    Unknown,
}

impl ChargingConfig {
    /// Decode the raw config for the given operator. A missing or
    /// undecodable record is `Unknown`; callers decide whether that is a
    /// skip condition for the operator at hand.
    pub fn parse(operator: Operator, raw: Option<&serde_json::Value>) -> Self {
        let Some(value) = raw else {
            return ChargingConfig::Unknown;
        };
        match operator {
            Operator::Gp => serde_json::from_value::<GpConfig>(value.clone())
                .map(ChargingConfig::Gp)
                .unwrap_or(ChargingConfig::Unknown),
            Operator::Robi | Operator::RobiMife => {
                serde_json::from_value::<RobiConfig>(value.clone())
                    .map(ChargingConfig::Robi)
                    .unwrap_or(ChargingConfig::Unknown)
            }
        }
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, ChargingConfig::Unknown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_robi_config() {
        let raw = json!({
            "apiKey": "key-1",
            "username": "sp_user",
            "onBehalfOf": "MerchantX",
            "purchaseCategoryCode": "Service",
            "channel": "WAP",
            "subscriptionID": "sub-42",
            "unSubURL": "https://example.com/unsub",
            "contactInfo": "support@example.com"
        });
        match ChargingConfig::parse(Operator::Robi, Some(&raw)) {
            ChargingConfig::Robi(config) => {
                assert_eq!(config.api_key, "key-1");
                assert_eq!(config.subscription_id, "sub-42");
                assert_eq!(config.unsub_url, "https://example.com/unsub");
            }
            other => panic!("expected Robi config, got {:?}", other),
        }
    }

    #[test]
    fn missing_config_is_unknown() {
        assert!(ChargingConfig::parse(Operator::Robi, None).is_unknown());
    }

    #[test]
    fn malformed_robi_config_is_unknown() {
        let raw = json!({"apiKey": "only-a-key"});
        assert!(ChargingConfig::parse(Operator::Robi, Some(&raw)).is_unknown());
    }

    #[test]
    fn gp_config_tolerates_missing_keyword() {
        let raw = json!({});
        match ChargingConfig::parse(Operator::Gp, Some(&raw)) {
            ChargingConfig::Gp(config) => assert!(config.keyword.is_none()),
            other => panic!("expected Gp config, got {:?}", other),
        }
    }
}
