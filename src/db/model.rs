//! Narrow view models used by repositories.
//!
//! Keep these structs focused on the data returned by queries. Business
//! logic should live in higher layers.

/// Scan slice used by the notification dispatcher: one row per distinct
/// order in a batch.
#[derive(Debug, Clone)]
pub struct NotifiableScan {
    pub scan_id: i64,
    pub order_number: String,
    pub order_id: Option<String>,
    pub customer_name: Option<String>,
    pub customer_email: Option<String>,
    pub tracking_number: String,
}

/// Aggregate ledger counts for a batch.
#[derive(Debug, Clone, Copy, Default)]
pub struct NotificationSummary {
    pub sent: i64,
    pub failed: i64,
}
