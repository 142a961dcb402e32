//! Klaviyo notification adapter.
//!
//! Sends metric events (e.g. "Order Shipped") keyed by customer email. The
//! payload builder is a pure function so the JSON shape is testable without
//! a network.

use crate::source::{NotificationSource, SourceError};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, StatusCode, Url};
use serde_json::{json, Value};
use std::fmt;
use tracing::info;

const KLAVIYO_API_BASE: &str = "https://a.klaviyo.com/";
const API_REVISION: &str = "2024-10-15";

#[derive(Clone)]
pub struct KlaviyoClient {
    http: Client,
    base_url: Url,
    api_key: String,
}

impl fmt::Debug for KlaviyoClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KlaviyoClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl KlaviyoClient {
    pub fn new(api_key: String, timeout: std::time::Duration) -> Self {
        let base_url = Url::parse(KLAVIYO_API_BASE).expect("valid default Klaviyo URL");
        Self::with_base_url(base_url, api_key, timeout)
    }

    pub fn with_base_url(base_url: Url, api_key: String, timeout: std::time::Duration) -> Self {
        let http = Client::builder()
            .user_agent("parcelscan/0.1")
            .timeout(timeout)
            .build()
            .expect("reqwest client");
        Self {
            http,
            base_url,
            api_key,
        }
    }
}

/// Build the event payload for the events endpoint.
pub fn build_event_payload(event_name: &str, customer_email: &str, properties: &Value) -> Value {
    json!({
        "data": {
            "type": "event",
            "attributes": {
                "profile": {
                    "data": {
                        "type": "profile",
                        "attributes": { "email": customer_email }
                    }
                },
                "metric": {
                    "data": {
                        "type": "metric",
                        "attributes": { "name": event_name }
                    }
                },
                "properties": properties,
                "time": Utc::now().to_rfc3339(),
            }
        }
    })
}

#[async_trait]
impl NotificationSource for KlaviyoClient {
    async fn send_event(
        &self,
        event_name: &str,
        customer_email: &str,
        properties: Value,
    ) -> Result<(), SourceError> {
        let url = self
            .base_url
            .join("api/events/")
            .map_err(|e| SourceError::Decode(e.to_string()))?;
        let payload = build_event_payload(event_name, customer_email, &properties);

        let res = self
            .http
            .post(url)
            .header("Authorization", format!("Klaviyo-API-Key {}", self.api_key))
            .header("revision", API_REVISION)
            .json(&payload)
            .send()
            .await
            .map_err(|e| SourceError::Network(e.to_string()))?;

        let status = res.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = res
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
                .unwrap_or(2);
            return Err(SourceError::RateLimited { retry_after_secs });
        }
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(SourceError::from_status(status.as_u16(), body));
        }

        info!(event_name, customer_email, "notification event sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_carries_profile_metric_and_properties() {
        let properties = json!({
            "order_number": "1001",
            "tracking_number": "1ZAC50886738062302",
            "carrier": "UPS"
        });
        let payload = build_event_payload("Order Shipped", "jane@example.com", &properties);

        assert_eq!(payload["data"]["type"], "event");
        assert_eq!(
            payload["data"]["attributes"]["profile"]["data"]["attributes"]["email"],
            "jane@example.com"
        );
        assert_eq!(
            payload["data"]["attributes"]["metric"]["data"]["attributes"]["name"],
            "Order Shipped"
        );
        assert_eq!(
            payload["data"]["attributes"]["properties"]["tracking_number"],
            "1ZAC50886738062302"
        );
        assert!(payload["data"]["attributes"]["time"].is_string());
    }
}
