//! Wire models for the order platform's admin REST API.

use chrono::{DateTime, Utc};
use serde::Deserialize;

#[derive(Deserialize, Debug)]
pub struct OrdersResp {
    #[serde(default)]
    pub orders: Vec<PlatformOrder>,
}

#[derive(Deserialize, Debug, Default)]
pub struct PlatformOrder {
    pub id: i64,
    #[serde(default)]
    pub name: String,
    pub order_number: Option<i64>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub financial_status: Option<String>,
    pub fulfillment_status: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub cancel_reason: Option<String>,
    pub customer: Option<PlatformCustomer>,
    pub shipping_address: Option<PlatformAddress>,
    pub billing_address: Option<PlatformAddress>,
    #[serde(default)]
    pub fulfillments: Vec<PlatformFulfillment>,
    #[serde(default)]
    pub line_items: Vec<PlatformLineItem>,
}

#[derive(Deserialize, Debug, Default)]
pub struct PlatformCustomer {
    pub email: Option<String>,
    pub phone: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
}

#[derive(Deserialize, Debug, Default, serde::Serialize)]
pub struct PlatformAddress {
    pub name: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub address1: Option<String>,
    pub address2: Option<String>,
    pub city: Option<String>,
    pub province: Option<String>,
    pub zip: Option<String>,
    pub country: Option<String>,
}

#[derive(Deserialize, Debug, Default)]
pub struct PlatformFulfillment {
    pub tracking_number: Option<String>,
    #[serde(default)]
    pub tracking_numbers: Vec<String>,
}

#[derive(Deserialize, Debug, Default)]
pub struct PlatformLineItem {
    pub id: i64,
    pub sku: Option<String>,
    pub title: Option<String>,
    pub variant_title: Option<String>,
    #[serde(default = "one")]
    pub quantity: i64,
    pub price: Option<String>,
}

fn one() -> i64 {
    1
}
