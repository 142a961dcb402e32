//! Remote collaborator contracts.
//!
//! The core talks to the order platform, carrier tracking APIs and the
//! notification service exclusively through these traits; reqwest-backed
//! implementations live in their own modules and tests substitute
//! recording mocks.

use crate::model::{Carrier, TrackingState};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// Failure of a remote collaborator call.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("rate limited (retry after {retry_after_secs}s)")]
    RateLimited { retry_after_secs: u64 },
    #[error("server error {0}")]
    Server(u16),
    #[error("client error {0}: {1}")]
    Client(u16, String),
    #[error("network error: {0}")]
    Network(String),
    #[error("invalid response: {0}")]
    Decode(String),
}

impl SourceError {
    /// 429 and 5xx are transient; other 4xx mean the request itself is wrong
    /// and retrying would only repeat the mistake.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SourceError::RateLimited { .. } | SourceError::Server(_) | SourceError::Network(_)
        )
    }

    pub fn from_status(status: u16, body: String) -> SourceError {
        if status == 429 {
            SourceError::RateLimited { retry_after_secs: 2 }
        } else if (500..600).contains(&status) {
            SourceError::Server(status)
        } else {
            SourceError::Client(status, body)
        }
    }
}

/// Exponential backoff: `base * 2^attempt`, capped.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.saturating_mul(1u32 << attempt.min(10));
        exp.min(self.max_delay)
    }
}

/// Run `op`, retrying transient failures with exponential backoff.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T, SourceError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, SourceError>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt + 1 < policy.max_attempts => {
                let delay = match &err {
                    SourceError::RateLimited { retry_after_secs } => {
                        Duration::from_secs(*retry_after_secs).max(policy.delay_for(attempt))
                    }
                    _ => policy.delay_for(attempt),
                };
                warn!(?err, attempt, delay_ms = delay.as_millis() as u64, "remote call failed; retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Order as returned by the order platform, before it lands in the local
/// orders table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemoteOrder {
    pub platform_order_id: String,
    pub order_number: String,
    pub customer_name: Option<String>,
    pub customer_email: Option<String>,
    pub customer_phone: Option<String>,
    pub shipping_address: Option<String>,
    pub financial_status: Option<String>,
    pub fulfillment_status: Option<String>,
    pub tracking_number: Option<String>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub cancel_reason: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub line_items: Vec<RemoteLineItem>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemoteLineItem {
    pub platform_line_item_id: String,
    pub sku: Option<String>,
    pub title: Option<String>,
    pub variant_title: Option<String>,
    pub quantity: i64,
    pub price: Option<String>,
}

/// Source of authoritative order records.
#[async_trait]
pub trait OrderSource: Send + Sync {
    /// Find the order carrying `tracking_number` in a fulfillment, scanning
    /// orders created within the last `lookback_days`.
    async fn fetch_order_by_tracking(
        &self,
        tracking_number: &str,
        lookback_days: u32,
    ) -> Result<Option<RemoteOrder>, SourceError>;

    async fn fetch_order_by_number(&self, order_number: &str)
        -> Result<Option<RemoteOrder>, SourceError>;

    /// Orders updated since `since`, for incremental sync.
    async fn list_updated_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<RemoteOrder>, SourceError>;
}

/// One carrier status lookup result.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrackingSnapshot {
    pub status: TrackingState,
    pub status_text: Option<String>,
    pub estimated_delivery: Option<NaiveDate>,
    pub last_location: Option<String>,
    pub delivered: bool,
    pub raw_status_code: Option<String>,
}

/// Minimal shipment description for rate quoting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShipmentSpec {
    pub destination_postal_code: String,
    pub destination_country: String,
    pub weight_grams: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateQuote {
    pub carrier: Carrier,
    pub service_code: String,
    pub service_name: String,
    pub total_price: String,
    pub currency: String,
}

/// Per-carrier tracking/rating API.
#[async_trait]
pub trait CarrierTrackingSource: Send + Sync {
    fn carrier(&self) -> Carrier;

    async fn track(&self, tracking_number: &str) -> Result<TrackingSnapshot, SourceError>;

    async fn rate(&self, shipment: &ShipmentSpec) -> Result<Vec<RateQuote>, SourceError>;
}

/// Customer notification service.
#[async_trait]
pub trait NotificationSource: Send + Sync {
    /// Send `event_name` for `customer_email` with the given properties.
    async fn send_event(
        &self,
        event_name: &str,
        customer_email: &str,
        properties: serde_json::Value,
    ) -> Result<(), SourceError>;
}
