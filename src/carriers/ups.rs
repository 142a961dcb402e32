//! UPS tracking adapter.
//!
//! OAuth 2.0 client-credentials flow with in-process token caching, then the
//! track details endpoint. Response parsing collapses UPS status types and
//! codes into the shared `TrackingState`.

use crate::model::{Carrier, TrackingState};
use crate::source::{CarrierTrackingSource, RateQuote, ShipmentSpec, SourceError, TrackingSnapshot};
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use serde_json::Value;
use std::fmt;
use tokio::sync::Mutex;
use tracing::debug;

const UPS_API_BASE: &str = "https://onlinetools.ups.com/";

#[derive(Debug, Clone, Default)]
struct CachedToken {
    access_token: String,
    expires_at: i64,
}

pub struct UpsClient {
    http: Client,
    base_url: Url,
    client_id: String,
    client_secret: String,
    token: Mutex<CachedToken>,
}

impl fmt::Debug for UpsClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpsClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

#[derive(Deserialize)]
struct TokenResp {
    access_token: String,
    /// Seconds, returned as a string by the UPS OAuth endpoint.
    expires_in: String,
}

impl UpsClient {
    pub fn new(client_id: String, client_secret: String, timeout: std::time::Duration) -> Self {
        let base_url = Url::parse(UPS_API_BASE).expect("valid default UPS URL");
        Self::with_base_url(base_url, client_id, client_secret, timeout)
    }

    pub fn with_base_url(
        base_url: Url,
        client_id: String,
        client_secret: String,
        timeout: std::time::Duration,
    ) -> Self {
        let http = Client::builder()
            .user_agent("parcelscan/0.1")
            .timeout(timeout)
            .build()
            .expect("reqwest client");
        Self {
            http,
            base_url,
            client_id,
            client_secret,
            token: Mutex::new(CachedToken::default()),
        }
    }

    /// Fetch (or reuse) an OAuth access token. Tokens are cached until one
    /// minute before their expiry.
    async fn access_token(&self) -> Result<String, SourceError> {
        let mut cached = self.token.lock().await;
        if !cached.access_token.is_empty() && Utc::now().timestamp() < cached.expires_at {
            return Ok(cached.access_token.clone());
        }

        let url = self
            .base_url
            .join("security/v1/oauth/token")
            .map_err(|e| SourceError::Decode(e.to_string()))?;
        let res = self
            .http
            .post(url)
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await
            .map_err(|e| SourceError::Network(e.to_string()))?;

        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(SourceError::from_status(status.as_u16(), body));
        }
        let token: TokenResp = res
            .json()
            .await
            .map_err(|e| SourceError::Decode(e.to_string()))?;
        let ttl: i64 = token.expires_in.parse().unwrap_or(3600);
        cached.access_token = token.access_token.clone();
        cached.expires_at = Utc::now().timestamp() + ttl - 60;
        Ok(token.access_token)
    }
}

#[async_trait]
impl CarrierTrackingSource for UpsClient {
    fn carrier(&self) -> Carrier {
        Carrier::Ups
    }

    async fn track(&self, tracking_number: &str) -> Result<TrackingSnapshot, SourceError> {
        let token = self.access_token().await?;
        let url = self
            .base_url
            .join(&format!("api/track/v1/details/{}", tracking_number))
            .map_err(|e| SourceError::Decode(e.to_string()))?;

        debug!(tracking_number, "querying UPS tracking");
        let res = self
            .http
            .get(url)
            .bearer_auth(&token)
            .header("transId", Utc::now().timestamp().to_string())
            .header("transactionSrc", "parcelscan")
            .send()
            .await
            .map_err(|e| SourceError::Network(e.to_string()))?;

        let status = res.status();
        if status == StatusCode::NOT_FOUND {
            // Unknown number is a result, not a failure.
            return Ok(TrackingSnapshot {
                status: TrackingState::Unknown,
                status_text: Some("Tracking number not found".into()),
                ..Default::default()
            });
        }
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(SourceError::from_status(status.as_u16(), body));
        }

        let body: Value = res
            .json()
            .await
            .map_err(|e| SourceError::Decode(e.to_string()))?;
        Ok(parse_track_response(&body))
    }

    async fn rate(&self, _shipment: &ShipmentSpec) -> Result<Vec<RateQuote>, SourceError> {
        // Rating lives on a separate UPS product; the scanner only tracks.
        Ok(Vec::new())
    }
}

/// Parse the track details payload into a snapshot.
pub fn parse_track_response(data: &Value) -> TrackingSnapshot {
    let package = &data["trackResponse"]["shipment"][0]["package"][0];

    let status_code = package["currentStatus"]["code"].as_str().unwrap_or("");
    let status_desc = package["currentStatus"]["description"]
        .as_str()
        .unwrap_or("Unknown");
    let status_type = package["currentStatus"]["type"].as_str().unwrap_or("");

    let status = map_status(status_type, status_code);

    let last_location = package["activity"][0]["location"]["address"]
        .as_object()
        .map(|addr| {
            [
                addr.get("city").and_then(Value::as_str).unwrap_or(""),
                addr.get("stateProvince").and_then(Value::as_str).unwrap_or(""),
                addr.get("countryCode").and_then(Value::as_str).unwrap_or(""),
            ]
            .iter()
            .filter(|s| !s.is_empty())
            .copied()
            .collect::<Vec<_>>()
            .join(", ")
        })
        .filter(|s| !s.is_empty());

    let estimated_delivery = package["deliveryDate"][0]["date"]
        .as_str()
        .or_else(|| package["deliveryDate"]["date"].as_str())
        .and_then(|d| NaiveDate::parse_from_str(d, "%Y%m%d").ok());

    TrackingSnapshot {
        status,
        status_text: Some(status_desc.to_string()),
        estimated_delivery,
        last_location,
        delivered: status == TrackingState::Delivered,
        raw_status_code: Some(status_code.to_string()),
    }
}

/// Collapse the UPS status type/code pair into the shared state.
///
/// The type field is authoritative when present. Code 012 ("Clearance in
/// Progress") is explicitly in-transit: it once shipped mismapped as
/// delivered and poisoned the cache.
pub fn map_status(status_type: &str, status_code: &str) -> TrackingState {
    match status_type {
        "D" => return TrackingState::Delivered,
        "I" | "P" => return TrackingState::InTransit,
        "M" => return TrackingState::LabelCreated,
        "X" => return TrackingState::Exception,
        _ => {}
    }
    match status_code {
        "011" | "KB" | "KM" => TrackingState::Delivered,
        "012" | "005" | "021" | "022" | "MP" | "J" | "W" | "A" | "AR" | "AF" | "OR" | "DP"
        | "OT" | "IT" => TrackingState::InTransit,
        "MV" | "NA" => TrackingState::LabelCreated,
        "RS" | "DJ" | "RD" => TrackingState::Exception,
        _ => TrackingState::Unknown,
    }
}
