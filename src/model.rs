use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Shipping carriers the scanner knows how to recognize.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Carrier {
    Ups,
    CanadaPost,
    Purolator,
    Dhl,
    Fedex,
    Usps,
    Unknown,
}

impl Carrier {
    /// Display name matching what operators see on labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            Carrier::Ups => "UPS",
            Carrier::CanadaPost => "Canada Post",
            Carrier::Purolator => "Purolator",
            Carrier::Dhl => "DHL",
            Carrier::Fedex => "FedEx",
            Carrier::Usps => "USPS",
            Carrier::Unknown => "Unknown",
        }
    }

    /// Machine code used in config keys and carrier API adapters.
    pub fn code(&self) -> &'static str {
        match self {
            Carrier::Ups => "ups",
            Carrier::CanadaPost => "canada_post",
            Carrier::Purolator => "purolator",
            Carrier::Dhl => "dhl",
            Carrier::Fedex => "fedex",
            Carrier::Usps => "usps",
            Carrier::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Carrier {
        match s.trim().to_ascii_lowercase().replace(['_', '-'], " ").as_str() {
            "ups" => Carrier::Ups,
            "canada post" | "canadapost" => Carrier::CanadaPost,
            "purolator" => Carrier::Purolator,
            "dhl" | "dhl express" => Carrier::Dhl,
            "fedex" => Carrier::Fedex,
            "usps" => Carrier::Usps,
            _ => Carrier::Unknown,
        }
    }
}

/// Lifecycle of a fulfillment batch. Transitions are monotonic:
/// in_progress -> recorded -> notified. A batch never moves backwards.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum BatchStatus {
    InProgress,
    Recorded,
    Notified,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::InProgress => "in_progress",
            BatchStatus::Recorded => "recorded",
            BatchStatus::Notified => "notified",
        }
    }

    pub fn parse(s: &str) -> Option<BatchStatus> {
        match s {
            "in_progress" => Some(BatchStatus::InProgress),
            "recorded" => Some(BatchStatus::Recorded),
            "notified" => Some(BatchStatus::Notified),
            _ => None,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            BatchStatus::InProgress => 0,
            BatchStatus::Recorded => 1,
            BatchStatus::Notified => 2,
        }
    }

    /// Whether moving from `self` to `next` respects the monotonic lifecycle.
    pub fn can_advance_to(&self, next: BatchStatus) -> bool {
        next.rank() >= self.rank()
    }
}

/// Per-scan processing state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ScanStatus {
    /// Recorded, order lookup still running in the background.
    Pending,
    /// Order details attached.
    Complete,
    /// Lookup finished without finding an order; scan is kept.
    NotFound,
    /// Replaced by split rows during a concatenation backfill.
    Split,
}

impl ScanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanStatus::Pending => "pending",
            ScanStatus::Complete => "complete",
            ScanStatus::NotFound => "not_found",
            ScanStatus::Split => "split",
        }
    }

    pub fn parse(s: &str) -> Option<ScanStatus> {
        match s {
            "pending" => Some(ScanStatus::Pending),
            "complete" => Some(ScanStatus::Complete),
            "not_found" => Some(ScanStatus::NotFound),
            "split" => Some(ScanStatus::Split),
            _ => None,
        }
    }
}

/// Simplified carrier tracking state shared by every adapter.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum TrackingState {
    LabelCreated,
    InTransit,
    Delivered,
    Exception,
    #[default]
    Unknown,
}

impl TrackingState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackingState::LabelCreated => "label_created",
            TrackingState::InTransit => "in_transit",
            TrackingState::Delivered => "delivered",
            TrackingState::Exception => "exception",
            TrackingState::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> TrackingState {
        match s {
            "label_created" => TrackingState::LabelCreated,
            "in_transit" => TrackingState::InTransit,
            "delivered" => TrackingState::Delivered,
            "exception" => TrackingState::Exception,
            _ => TrackingState::Unknown,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub id: i64,
    pub name: Option<String>,
    pub carrier: Carrier,
    pub status: BatchStatus,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub notified_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scan {
    pub id: i64,
    pub batch_id: i64,
    pub raw_code: String,
    pub tracking_number: String,
    pub carrier: Carrier,
    pub order_number: Option<String>,
    pub order_id: Option<String>,
    pub customer_name: Option<String>,
    pub customer_email: Option<String>,
    pub status: ScanStatus,
    pub po_box_conflict: bool,
    pub scanned_at: DateTime<Utc>,
}

/// Locally cached order record, synced from the order platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRecord {
    pub id: i64,
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
    pub platform_updated_at: Option<DateTime<Utc>>,
}

/// Memoized carrier tracking lookup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingEntry {
    pub tracking_number: String,
    pub carrier: Carrier,
    pub status: TrackingState,
    pub status_text: Option<String>,
    pub estimated_delivery: Option<NaiveDate>,
    pub last_location: Option<String>,
    pub is_delivered: bool,
    pub raw_status_code: Option<String>,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub id: i64,
    pub batch_id: i64,
    pub order_number: String,
    pub customer_email: Option<String>,
    pub tracking_number: Option<String>,
    pub success: bool,
    pub error_message: Option<String>,
    pub notified_at: DateTime<Utc>,
}

/// Snapshot of an order at cancellation time. Kept separately from the
/// orders table so it survives if the source order is purged upstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelledOrder {
    pub order_number: String,
    pub customer_name: Option<String>,
    pub customer_email: Option<String>,
    pub reason: Option<String>,
    pub refunded: bool,
    pub restocked: bool,
    pub cancelled_at: DateTime<Utc>,
}
