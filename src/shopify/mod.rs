//! Order platform client (Shopify admin REST API).
//!
//! Implements `OrderSource` with cursor-based pagination. Transient failures
//! surface as retryable `SourceError`s; the retry policy is applied by the
//! callers (resolver, orders sync) so every remote path backs off the same
//! way.

use crate::source::{OrderSource, RemoteLineItem, RemoteOrder, SourceError};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::{Client, StatusCode, Url};
use std::fmt;

use crate::shopify::model::{OrdersResp, PlatformOrder};

pub mod model;

const API_VERSION: &str = "2024-01";
const PAGE_LIMIT: u32 = 250;

#[derive(Clone)]
pub struct ShopifyClient {
    http: Client,
    base_url: Url,
    access_token: String,
}

impl fmt::Debug for ShopifyClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShopifyClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl ShopifyClient {
    pub fn new(shop_url: &str, access_token: String, timeout: std::time::Duration) -> Self {
        let base_url = Url::parse(&format!(
            "https://{}/admin/api/{}/",
            shop_url.trim_end_matches('/'),
            API_VERSION
        ))
        .expect("valid shop URL");
        Self::with_base_url(base_url, access_token, timeout)
    }

    pub fn with_base_url(base_url: Url, access_token: String, timeout: std::time::Duration) -> Self {
        let http = Client::builder()
            .user_agent("parcelscan/0.1")
            .timeout(timeout)
            .build()
            .expect("reqwest client");
        Self {
            http,
            base_url,
            access_token,
        }
    }

    /// One GET against the orders endpoint. Returns the parsed page plus the
    /// cursor for the next page, if any.
    async fn fetch_orders_page(
        &self,
        params: &[(String, String)],
    ) -> Result<(OrdersResp, Option<String>), SourceError> {
        let url = self
            .base_url
            .join("orders.json")
            .map_err(|e| SourceError::Decode(e.to_string()))?;
        let res = self
            .http
            .get(url)
            .header("X-Shopify-Access-Token", &self.access_token)
            .query(params)
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

        let next = res
            .headers()
            .get("Link")
            .and_then(|v| v.to_str().ok())
            .and_then(extract_next_page_token);
        let page: OrdersResp = res
            .json()
            .await
            .map_err(|e| SourceError::Decode(e.to_string()))?;
        Ok((page, next))
    }

    /// Drain every page for the given initial query.
    async fn fetch_all_orders(
        &self,
        initial_params: Vec<(String, String)>,
    ) -> Result<Vec<PlatformOrder>, SourceError> {
        let mut orders = Vec::new();
        let mut params = initial_params;
        loop {
            let (page, next) = self.fetch_orders_page(&params).await?;
            if page.orders.is_empty() {
                break;
            }
            orders.extend(page.orders);
            match next {
                Some(token) => {
                    params = vec![
                        ("limit".into(), PAGE_LIMIT.to_string()),
                        ("page_info".into(), token),
                    ];
                }
                None => break,
            }
        }
        Ok(orders)
    }
}

/// Extract the `page_info` cursor from a Link response header.
pub fn extract_next_page_token(link_header: &str) -> Option<String> {
    static NEXT_LINK: Lazy<Regex> =
        Lazy::new(|| Regex::new(r#"<([^>]+)>;\s*rel="next""#).expect("valid link regex"));
    static PAGE_INFO: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"page_info=([^&>]+)").expect("valid page_info regex"));

    let next_url = NEXT_LINK.captures(link_header)?.get(1)?.as_str();
    Some(PAGE_INFO.captures(next_url)?.get(1)?.as_str().to_string())
}

/// Map a platform order onto the source-agnostic record.
pub fn map_order(order: &PlatformOrder) -> RemoteOrder {
    let order_number = {
        let name = order.name.replace('#', "").trim().to_string();
        if name.is_empty() {
            order.order_number.map(|n| n.to_string()).unwrap_or_default()
        } else {
            name
        }
    };

    let customer_name = customer_name(order);
    let customer_email = order
        .email
        .clone()
        .filter(|e| !e.is_empty())
        .or_else(|| order.customer.as_ref().and_then(|c| c.email.clone()));
    let customer_phone = order
        .phone
        .clone()
        .filter(|p| !p.is_empty())
        .or_else(|| order.customer.as_ref().and_then(|c| c.phone.clone()));

    let tracking_number = order
        .fulfillments
        .iter()
        .find_map(|f| f.tracking_number.clone().filter(|t| !t.is_empty()))
        .or_else(|| {
            order
                .fulfillments
                .iter()
                .flat_map(|f| f.tracking_numbers.iter())
                .find(|t| !t.is_empty())
                .cloned()
        });

    let shipping_address = order
        .shipping_address
        .as_ref()
        .and_then(|a| serde_json::to_string(a).ok());

    RemoteOrder {
        platform_order_id: order.id.to_string(),
        order_number,
        customer_name,
        customer_email,
        customer_phone,
        shipping_address,
        financial_status: order.financial_status.clone(),
        fulfillment_status: order.fulfillment_status.clone(),
        tracking_number,
        cancelled_at: order.cancelled_at,
        cancel_reason: order.cancel_reason.clone(),
        created_at: order.created_at,
        updated_at: order.updated_at,
        line_items: order
            .line_items
            .iter()
            .map(|li| RemoteLineItem {
                platform_line_item_id: li.id.to_string(),
                sku: li.sku.clone(),
                title: li.title.clone(),
                variant_title: li.variant_title.clone(),
                quantity: li.quantity,
                price: li.price.clone(),
            })
            .collect(),
    }
}

/// Customer name, trying shipping address, then billing, then the customer
/// object.
fn customer_name(order: &PlatformOrder) -> Option<String> {
    for addr in [order.shipping_address.as_ref(), order.billing_address.as_ref()]
        .into_iter()
        .flatten()
    {
        if let Some(name) = addr.name.clone().filter(|n| !n.trim().is_empty()) {
            return Some(name);
        }
        let joined = format!(
            "{} {}",
            addr.first_name.clone().unwrap_or_default(),
            addr.last_name.clone().unwrap_or_default()
        )
        .trim()
        .to_string();
        if !joined.is_empty() {
            return Some(joined);
        }
    }
    if let Some(c) = &order.customer {
        let joined = format!(
            "{} {}",
            c.first_name.clone().unwrap_or_default(),
            c.last_name.clone().unwrap_or_default()
        )
        .trim()
        .to_string();
        if !joined.is_empty() {
            return Some(joined);
        }
    }
    None
}

#[async_trait]
impl OrderSource for ShopifyClient {
    async fn fetch_order_by_tracking(
        &self,
        tracking_number: &str,
        lookback_days: u32,
    ) -> Result<Option<RemoteOrder>, SourceError> {
        let created_at_min = Utc::now() - Duration::days(lookback_days as i64);
        let params = vec![
            ("fulfillment_status".into(), "shipped".into()),
            ("status".into(), "any".into()),
            ("limit".into(), PAGE_LIMIT.to_string()),
            ("created_at_min".into(), created_at_min.to_rfc3339()),
        ];
        let orders = self.fetch_all_orders(params).await?;
        Ok(orders
            .iter()
            .find(|order| {
                order.fulfillments.iter().any(|f| {
                    f.tracking_number.as_deref() == Some(tracking_number)
                        || f.tracking_numbers.iter().any(|t| t == tracking_number)
                })
            })
            .map(map_order))
    }

    async fn fetch_order_by_number(
        &self,
        order_number: &str,
    ) -> Result<Option<RemoteOrder>, SourceError> {
        let name = format!("#{}", order_number.trim_start_matches('#'));
        let params = vec![
            ("name".into(), name),
            ("status".into(), "any".into()),
            ("limit".into(), "10".into()),
        ];
        let (page, _) = self.fetch_orders_page(&params).await?;
        Ok(page.orders.first().map(map_order))
    }

    async fn list_updated_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<RemoteOrder>, SourceError> {
        let params = vec![
            ("status".into(), "any".into()),
            ("limit".into(), PAGE_LIMIT.to_string()),
            ("updated_at_min".into(), since.to_rfc3339()),
        ];
        let orders = self.fetch_all_orders(params).await?;
        Ok(orders.iter().map(map_order).collect())
    }
}
