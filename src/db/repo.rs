use super::model::{NotifiableScan, NotificationSummary};
use crate::model::{
    Batch, BatchStatus, CancelledOrder, Carrier, NotificationRecord, OrderRecord, Scan,
    ScanStatus, TrackingEntry, TrackingState,
};
use crate::source::{RemoteOrder, TrackingSnapshot};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::instrument;

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized).await?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;").execute(&pool).await?;
    sqlx::query("PRAGMA synchronous=FULL;").execute(&pool).await?;
    sqlx::query("PRAGMA foreign_keys=ON;").execute(&pool).await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the
/// parent directory exists. Leaves in-memory URLs untouched.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") {
        return url.to_string();
    }
    if url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = if let Some(rest) = path_part.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            format!("{}/{}", home.trim_end_matches('/'), rest)
        } else {
            path_part.to_string()
        }
    } else {
        path_part.to_string()
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = String::from("sqlite://");
    rebuilt.push_str(&expanded_path);
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

// ── Batches ─────────────────────────────────────────────────────────────

#[instrument(skip_all)]
pub async fn create_batch(
    pool: &Pool,
    name: Option<&str>,
    carrier: Carrier,
    notes: Option<&str>,
) -> Result<i64> {
    let rec = sqlx::query(
        "INSERT INTO batches (name, carrier, status, notes, created_at) VALUES (?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(name)
    .bind(carrier.as_str())
    .bind(BatchStatus::InProgress.as_str())
    .bind(notes)
    .bind(Utc::now())
    .fetch_one(pool)
    .await?;
    Ok(rec.get("id"))
}

#[instrument(skip_all)]
pub async fn get_batch(pool: &Pool, batch_id: i64) -> Result<Batch> {
    let row = sqlx::query("SELECT * FROM batches WHERE id = ?")
        .bind(batch_id)
        .fetch_optional(pool)
        .await?;
    let Some(row) = row else {
        return Err(anyhow!("batch {} not found", batch_id));
    };
    batch_from_row(&row)
}

/// Advance a batch along its lifecycle. Rejects backwards transitions:
/// a batch never reverts from `notified` to `recorded`.
#[instrument(skip_all)]
pub async fn advance_batch_status(pool: &Pool, batch_id: i64, next: BatchStatus) -> Result<()> {
    let mut tx = pool.begin().await?;
    let current: Option<String> = sqlx::query_scalar("SELECT status FROM batches WHERE id = ?")
        .bind(batch_id)
        .fetch_optional(&mut *tx)
        .await?;
    let Some(current) = current else {
        return Err(anyhow!("batch {} not found", batch_id));
    };
    let current = BatchStatus::parse(&current)
        .ok_or_else(|| anyhow!("batch {} has unknown status {}", batch_id, current))?;
    if !current.can_advance_to(next) {
        return Err(anyhow!(
            "batch {} cannot move from {} to {}",
            batch_id,
            current.as_str(),
            next.as_str()
        ));
    }
    match next {
        BatchStatus::Recorded => {
            sqlx::query("UPDATE batches SET status = ?, finished_at = COALESCE(finished_at, ?) WHERE id = ?")
                .bind(next.as_str())
                .bind(Utc::now())
                .bind(batch_id)
                .execute(&mut *tx)
                .await?;
        }
        BatchStatus::Notified => {
            sqlx::query("UPDATE batches SET status = ?, notified_at = COALESCE(notified_at, ?) WHERE id = ?")
                .bind(next.as_str())
                .bind(Utc::now())
                .bind(batch_id)
                .execute(&mut *tx)
                .await?;
        }
        BatchStatus::InProgress => {}
    }
    tx.commit().await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn save_batch_notes(pool: &Pool, batch_id: i64, notes: &str) -> Result<()> {
    sqlx::query("UPDATE batches SET notes = ? WHERE id = ?")
        .bind(notes)
        .bind(batch_id)
        .execute(pool)
        .await
        .context("failed to save batch notes")?;
    Ok(())
}

fn batch_from_row(row: &SqliteRow) -> Result<Batch> {
    let status_str: String = row.get("status");
    let status = BatchStatus::parse(&status_str)
        .ok_or_else(|| anyhow!("unknown batch status {}", status_str))?;
    Ok(Batch {
        id: row.get("id"),
        name: row.try_get("name").ok(),
        carrier: Carrier::parse(row.get::<String, _>("carrier").as_str()),
        status,
        notes: row.try_get("notes").ok(),
        created_at: row.get("created_at"),
        finished_at: row.try_get("finished_at").ok(),
        notified_at: row.try_get("notified_at").ok(),
    })
}

// ── Scans ───────────────────────────────────────────────────────────────

#[instrument(skip_all)]
pub async fn insert_scan(
    pool: &Pool,
    batch_id: i64,
    raw_code: &str,
    tracking_number: &str,
    carrier: Carrier,
) -> Result<i64> {
    let rec = sqlx::query(
        "INSERT INTO scans (batch_id, raw_code, tracking_number, carrier, status, scanned_at) \
         VALUES (?, ?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(batch_id)
    .bind(raw_code)
    .bind(tracking_number)
    .bind(carrier.as_str())
    .bind(ScanStatus::Pending.as_str())
    .bind(Utc::now())
    .fetch_one(pool)
    .await?;
    Ok(rec.get("id"))
}

pub async fn get_scan(pool: &Pool, scan_id: i64) -> Result<Scan> {
    let row = sqlx::query("SELECT * FROM scans WHERE id = ?")
        .bind(scan_id)
        .fetch_optional(pool)
        .await?;
    let Some(row) = row else {
        return Err(anyhow!("scan {} not found", scan_id));
    };
    scan_from_row(&row)
}

/// Latest scan of `tracking_number` inside any open batch. Scans that only
/// exist in closed batches do not count as duplicates (re-shipment case).
#[instrument(skip_all)]
pub async fn find_scan_in_open_batches(
    pool: &Pool,
    tracking_number: &str,
) -> Result<Option<Scan>> {
    let row = sqlx::query(
        "SELECT s.* FROM scans s \
         JOIN batches b ON b.id = s.batch_id \
         WHERE s.tracking_number = ? AND b.status = 'in_progress' AND s.status != 'split' \
         ORDER BY datetime(s.scanned_at) DESC LIMIT 1",
    )
    .bind(tracking_number)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(scan_from_row).transpose()
}

/// Latest known order number attached to any scan of `tracking_number`.
pub async fn last_order_number_for_tracking(
    pool: &Pool,
    tracking_number: &str,
) -> Result<Option<String>> {
    let order: Option<Option<String>> = sqlx::query_scalar(
        "SELECT order_number FROM scans WHERE tracking_number = ? \
         ORDER BY datetime(scanned_at) DESC LIMIT 1",
    )
    .bind(tracking_number)
    .fetch_optional(pool)
    .await?;
    Ok(order.flatten().filter(|s| !s.trim().is_empty()))
}

/// Attach (or clear) order context on a scan after background resolution.
#[instrument(skip_all)]
pub async fn backfill_scan_order(
    pool: &Pool,
    scan_id: i64,
    carrier: Carrier,
    order_number: Option<&str>,
    order_id: Option<&str>,
    customer_name: Option<&str>,
    customer_email: Option<&str>,
    status: ScanStatus,
    po_box_conflict: bool,
) -> Result<()> {
    sqlx::query(
        "UPDATE scans SET carrier = ?, order_number = ?, order_id = ?, customer_name = ?, \
         customer_email = ?, status = ?, po_box_conflict = ? WHERE id = ?",
    )
    .bind(carrier.as_str())
    .bind(order_number)
    .bind(order_id)
    .bind(customer_name)
    .bind(customer_email)
    .bind(status.as_str())
    .bind(po_box_conflict)
    .bind(scan_id)
    .execute(pool)
    .await
    .context("failed to backfill scan order details")?;
    Ok(())
}

pub async fn set_scan_email(pool: &Pool, scan_id: i64, email: &str) -> Result<()> {
    sqlx::query("UPDATE scans SET customer_email = ? WHERE id = ?")
        .bind(email)
        .bind(scan_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn list_batch_scans(pool: &Pool, batch_id: i64) -> Result<Vec<Scan>> {
    let rows = sqlx::query("SELECT * FROM scans WHERE batch_id = ? ORDER BY id")
        .bind(batch_id)
        .fetch_all(pool)
        .await?;
    rows.iter().map(scan_from_row).collect()
}

/// One row per distinct order in the batch, for notification dispatch.
/// Scans without a resolved order are excluded.
#[instrument(skip_all)]
pub async fn notifiable_scans(pool: &Pool, batch_id: i64) -> Result<Vec<NotifiableScan>> {
    let rows = sqlx::query(
        "SELECT MIN(id) AS scan_id, order_number, order_id, customer_name, customer_email, \
                MIN(tracking_number) AS tracking_number \
         FROM scans \
         WHERE batch_id = ? AND status != 'split' \
           AND order_number IS NOT NULL AND TRIM(order_number) != '' \
         GROUP BY order_number",
    )
    .bind(batch_id)
    .fetch_all(pool)
    .await?;
    Ok(rows
        .into_iter()
        .map(|row| NotifiableScan {
            scan_id: row.get("scan_id"),
            order_number: row.get("order_number"),
            order_id: row.try_get::<Option<String>, _>("order_id").ok().flatten(),
            customer_name: row.try_get::<Option<String>, _>("customer_name").ok().flatten(),
            customer_email: row
                .try_get::<Option<String>, _>("customer_email")
                .ok()
                .flatten()
                .filter(|s| !s.trim().is_empty()),
            tracking_number: row.get("tracking_number"),
        })
        .collect())
}

/// Scans whose tracking number has a concatenation-shaped length and has
/// not already been split.
pub async fn concatenation_shaped_scans(pool: &Pool) -> Result<Vec<Scan>> {
    let rows = sqlx::query(
        "SELECT * FROM scans \
         WHERE LENGTH(tracking_number) IN (36, 32, 24) AND status != 'split' \
         ORDER BY datetime(scanned_at) DESC",
    )
    .fetch_all(pool)
    .await?;
    rows.iter().map(scan_from_row).collect()
}

/// Insert one half of a split scan, preserving the original's batch and
/// scan time.
pub async fn insert_split_scan(
    pool: &Pool,
    original: &Scan,
    tracking_number: &str,
    carrier: Carrier,
) -> Result<i64> {
    let rec = sqlx::query(
        "INSERT INTO scans (batch_id, raw_code, tracking_number, carrier, status, scanned_at) \
         VALUES (?, ?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(original.batch_id)
    .bind(original.raw_code.as_str())
    .bind(tracking_number)
    .bind(carrier.as_str())
    .bind(ScanStatus::Pending.as_str())
    .bind(original.scanned_at)
    .fetch_one(pool)
    .await?;
    Ok(rec.get("id"))
}

pub async fn mark_scan_split(pool: &Pool, scan_id: i64) -> Result<()> {
    sqlx::query("UPDATE scans SET status = ? WHERE id = ?")
        .bind(ScanStatus::Split.as_str())
        .bind(scan_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Completed scans missing a customer email, for the email backfill.
pub async fn scans_missing_email(pool: &Pool, limit: i64) -> Result<Vec<Scan>> {
    let rows = sqlx::query(
        "SELECT * FROM scans \
         WHERE status = 'complete' AND (customer_email IS NULL OR TRIM(customer_email) = '') \
           AND order_number IS NOT NULL AND TRIM(order_number) != '' \
         ORDER BY datetime(scanned_at) DESC LIMIT ?",
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;
    rows.iter().map(scan_from_row).collect()
}

fn scan_from_row(row: &SqliteRow) -> Result<Scan> {
    let status_str: String = row.get("status");
    let status = ScanStatus::parse(&status_str)
        .ok_or_else(|| anyhow!("unknown scan status {}", status_str))?;
    Ok(Scan {
        id: row.get("id"),
        batch_id: row.get("batch_id"),
        raw_code: row.get("raw_code"),
        tracking_number: row.get("tracking_number"),
        carrier: Carrier::parse(row.get::<String, _>("carrier").as_str()),
        order_number: row.try_get::<Option<String>, _>("order_number").ok().flatten(),
        order_id: row.try_get::<Option<String>, _>("order_id").ok().flatten(),
        customer_name: row.try_get::<Option<String>, _>("customer_name").ok().flatten(),
        customer_email: row.try_get::<Option<String>, _>("customer_email").ok().flatten(),
        status,
        po_box_conflict: row.get("po_box_conflict"),
        scanned_at: row.get("scanned_at"),
    })
}

// ── Orders ──────────────────────────────────────────────────────────────

/// Insert or update an order from platform data, replacing its line items.
#[instrument(skip_all)]
pub async fn upsert_order(pool: &Pool, order: &RemoteOrder) -> Result<i64> {
    let mut tx = pool.begin().await?;
    let rec = sqlx::query(
        "INSERT INTO orders (platform_order_id, order_number, customer_name, customer_email, \
             customer_phone, shipping_address, financial_status, fulfillment_status, \
             tracking_number, cancelled_at, cancel_reason, platform_created_at, \
             platform_updated_at, synced_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT(platform_order_id) DO UPDATE SET \
             order_number = excluded.order_number, \
             customer_name = excluded.customer_name, \
             customer_email = excluded.customer_email, \
             customer_phone = excluded.customer_phone, \
             shipping_address = excluded.shipping_address, \
             financial_status = excluded.financial_status, \
             fulfillment_status = excluded.fulfillment_status, \
             tracking_number = excluded.tracking_number, \
             cancelled_at = excluded.cancelled_at, \
             cancel_reason = excluded.cancel_reason, \
             platform_created_at = excluded.platform_created_at, \
             platform_updated_at = excluded.platform_updated_at, \
             synced_at = excluded.synced_at \
         RETURNING id",
    )
    .bind(order.platform_order_id.as_str())
    .bind(order.order_number.as_str())
    .bind(order.customer_name.as_deref())
    .bind(order.customer_email.as_deref())
    .bind(order.customer_phone.as_deref())
    .bind(order.shipping_address.as_deref())
    .bind(order.financial_status.as_deref())
    .bind(order.fulfillment_status.as_deref())
    .bind(order.tracking_number.as_deref())
    .bind(order.cancelled_at)
    .bind(order.cancel_reason.as_deref())
    .bind(order.created_at)
    .bind(order.updated_at)
    .bind(Utc::now())
    .fetch_one(&mut *tx)
    .await?;
    let order_id: i64 = rec.get("id");

    // Line items are replaced wholesale; partial diffs are not worth it.
    sqlx::query("DELETE FROM order_line_items WHERE order_id = ?")
        .bind(order_id)
        .execute(&mut *tx)
        .await?;
    for item in &order.line_items {
        sqlx::query(
            "INSERT INTO order_line_items (order_id, platform_line_item_id, sku, title, \
                 variant_title, quantity, price) VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(order_id)
        .bind(item.platform_line_item_id.as_str())
        .bind(item.sku.as_deref())
        .bind(item.title.as_deref())
        .bind(item.variant_title.as_deref())
        .bind(item.quantity)
        .bind(item.price.as_deref())
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(order_id)
}

pub async fn order_by_tracking(pool: &Pool, tracking_number: &str) -> Result<Option<OrderRecord>> {
    let row = sqlx::query("SELECT * FROM orders WHERE tracking_number = ? LIMIT 1")
        .bind(tracking_number)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(order_from_row).transpose()
}

pub async fn order_by_number(pool: &Pool, order_number: &str) -> Result<Option<OrderRecord>> {
    let row = sqlx::query(
        "SELECT * FROM orders WHERE order_number = ? \
         ORDER BY datetime(platform_updated_at) DESC LIMIT 1",
    )
    .bind(order_number)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(order_from_row).transpose()
}

/// Case-insensitive containment match on a cleaned token, most recently
/// updated first. Used by the resolver's fuzzy fallback.
#[instrument(skip_all)]
pub async fn fuzzy_order_candidates(
    pool: &Pool,
    token: &str,
    limit: i64,
) -> Result<Vec<OrderRecord>> {
    let pattern = format!("%{}%", token);
    let rows = sqlx::query(
        "SELECT * FROM orders \
         WHERE order_number LIKE ? OR tracking_number LIKE ? \
         ORDER BY datetime(platform_updated_at) DESC LIMIT ?",
    )
    .bind(&pattern)
    .bind(&pattern)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    rows.iter().map(order_from_row).collect()
}

/// Mark the order carrying `tracking_number` as scanned.
pub async fn mark_order_scanned(pool: &Pool, tracking_number: &str) -> Result<()> {
    sqlx::query("UPDATE orders SET scanned_at = ? WHERE tracking_number = ?")
        .bind(Utc::now())
        .bind(tracking_number)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn line_items_for_order(
    pool: &Pool,
    order_id: i64,
) -> Result<Vec<(Option<String>, Option<String>, i64)>> {
    let rows = sqlx::query(
        "SELECT title, sku, quantity FROM order_line_items WHERE order_id = ? ORDER BY id",
    )
    .bind(order_id)
    .fetch_all(pool)
    .await?;
    Ok(rows
        .into_iter()
        .map(|row| {
            (
                row.try_get::<Option<String>, _>("title").ok().flatten(),
                row.try_get::<Option<String>, _>("sku").ok().flatten(),
                row.get::<i64, _>("quantity"),
            )
        })
        .collect())
}

fn order_from_row(row: &SqliteRow) -> Result<OrderRecord> {
    Ok(OrderRecord {
        id: row.get("id"),
        platform_order_id: row.get("platform_order_id"),
        order_number: row.get("order_number"),
        customer_name: row.try_get::<Option<String>, _>("customer_name").ok().flatten(),
        customer_email: row.try_get::<Option<String>, _>("customer_email").ok().flatten(),
        customer_phone: row.try_get::<Option<String>, _>("customer_phone").ok().flatten(),
        shipping_address: row.try_get::<Option<String>, _>("shipping_address").ok().flatten(),
        financial_status: row.try_get::<Option<String>, _>("financial_status").ok().flatten(),
        fulfillment_status: row.try_get::<Option<String>, _>("fulfillment_status").ok().flatten(),
        tracking_number: row.try_get::<Option<String>, _>("tracking_number").ok().flatten(),
        cancelled_at: row.try_get("cancelled_at").ok(),
        cancel_reason: row.try_get::<Option<String>, _>("cancel_reason").ok().flatten(),
        platform_updated_at: row.try_get("platform_updated_at").ok(),
    })
}

// ── Tracking status cache ───────────────────────────────────────────────

pub async fn tracking_entry(pool: &Pool, tracking_number: &str) -> Result<Option<TrackingEntry>> {
    let row = sqlx::query("SELECT * FROM tracking_status_cache WHERE tracking_number = ?")
        .bind(tracking_number)
        .fetch_optional(pool)
        .await?;
    row.map(|row| {
        Ok(TrackingEntry {
            tracking_number: row.get("tracking_number"),
            carrier: Carrier::parse(row.get::<String, _>("carrier").as_str()),
            status: TrackingState::parse(row.get::<String, _>("status").as_str()),
            status_text: row.try_get::<Option<String>, _>("status_text").ok().flatten(),
            estimated_delivery: row.try_get("estimated_delivery").ok(),
            last_location: row.try_get::<Option<String>, _>("last_location").ok().flatten(),
            is_delivered: row.get("is_delivered"),
            raw_status_code: row.try_get::<Option<String>, _>("raw_status_code").ok().flatten(),
            fetched_at: row.get("fetched_at"),
        })
    })
    .transpose()
}

/// Write a fresh carrier snapshot. Entries are overwritten in place, never
/// deleted: freshness comes from `fetched_at`.
#[instrument(skip_all)]
pub async fn upsert_tracking_entry(
    pool: &Pool,
    tracking_number: &str,
    carrier: Carrier,
    snapshot: &TrackingSnapshot,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO tracking_status_cache \
             (tracking_number, carrier, status, status_text, estimated_delivery, last_location, \
              is_delivered, raw_status_code, fetched_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT(tracking_number) DO UPDATE SET \
             carrier = excluded.carrier, \
             status = excluded.status, \
             status_text = excluded.status_text, \
             estimated_delivery = excluded.estimated_delivery, \
             last_location = excluded.last_location, \
             is_delivered = excluded.is_delivered, \
             raw_status_code = excluded.raw_status_code, \
             fetched_at = excluded.fetched_at",
    )
    .bind(tracking_number)
    .bind(carrier.as_str())
    .bind(snapshot.status.as_str())
    .bind(snapshot.status_text.as_deref())
    .bind(snapshot.estimated_delivery)
    .bind(snapshot.last_location.as_deref())
    .bind(snapshot.delivered)
    .bind(snapshot.raw_status_code.as_deref())
    .bind(Utc::now())
    .execute(pool)
    .await
    .context("failed to upsert tracking cache entry")?;
    Ok(())
}

/// Candidate tracking numbers for one refresh cycle: scanned within the
/// activity window, not delivered, cache entry missing or older than the
/// TTL. Never-fetched numbers come first, then oldest-fetched.
#[instrument(skip_all)]
pub async fn refresh_candidates(
    pool: &Pool,
    carrier: Carrier,
    activity_window_days: i64,
    ttl_minutes: i64,
    cap: i64,
) -> Result<Vec<String>> {
    let rows: Vec<String> = sqlx::query_scalar(
        "SELECT DISTINCT s.tracking_number FROM scans s \
         LEFT JOIN tracking_status_cache tc ON tc.tracking_number = s.tracking_number \
         WHERE s.carrier = ? AND s.status != 'split' \
           AND datetime(s.scanned_at) >= datetime('now', '-' || ? || ' days') \
           AND (tc.is_delivered IS NULL OR tc.is_delivered = 0) \
           AND (tc.fetched_at IS NULL OR datetime(tc.fetched_at) < datetime('now', '-' || ? || ' minutes')) \
         ORDER BY tc.fetched_at IS NOT NULL, datetime(tc.fetched_at) ASC \
         LIMIT ?",
    )
    .bind(carrier.as_str())
    .bind(activity_window_days)
    .bind(ttl_minutes)
    .bind(cap)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

// ── Notification ledger ─────────────────────────────────────────────────

pub async fn notification_for(
    pool: &Pool,
    order_number: &str,
    batch_id: i64,
) -> Result<Option<NotificationRecord>> {
    let row = sqlx::query("SELECT * FROM notifications WHERE order_number = ? AND batch_id = ?")
        .bind(order_number)
        .bind(batch_id)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|row| NotificationRecord {
        id: row.get("id"),
        batch_id: row.get("batch_id"),
        order_number: row.get("order_number"),
        customer_email: row.try_get::<Option<String>, _>("customer_email").ok().flatten(),
        tracking_number: row.try_get::<Option<String>, _>("tracking_number").ok().flatten(),
        success: row.get("success"),
        error_message: row.try_get::<Option<String>, _>("error_message").ok().flatten(),
        notified_at: row.get("notified_at"),
    }))
}

/// Record a notification attempt. The (order, batch) key holds exactly one
/// row; a successful row is never downgraded by a later failure.
#[instrument(skip_all)]
pub async fn record_notification(
    pool: &Pool,
    batch_id: i64,
    order_number: &str,
    customer_email: Option<&str>,
    tracking_number: Option<&str>,
    success: bool,
    error_message: Option<&str>,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO notifications \
             (batch_id, order_number, customer_email, tracking_number, success, error_message, notified_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT(order_number, batch_id) DO UPDATE SET \
             customer_email = excluded.customer_email, \
             tracking_number = excluded.tracking_number, \
             success = MAX(success, excluded.success), \
             error_message = CASE WHEN success = 1 THEN error_message \
                                  ELSE excluded.error_message END, \
             notified_at = excluded.notified_at",
    )
    .bind(batch_id)
    .bind(order_number)
    .bind(customer_email)
    .bind(tracking_number)
    .bind(success)
    .bind(error_message)
    .bind(Utc::now())
    .execute(pool)
    .await
    .context("failed to record notification")?;
    Ok(())
}

pub async fn notification_summary(pool: &Pool, batch_id: i64) -> Result<NotificationSummary> {
    let row = sqlx::query(
        "SELECT COALESCE(SUM(success), 0) AS sent, \
                COALESCE(SUM(CASE WHEN success = 0 THEN 1 ELSE 0 END), 0) AS failed \
         FROM notifications WHERE batch_id = ?",
    )
    .bind(batch_id)
    .fetch_one(pool)
    .await?;
    Ok(NotificationSummary {
        sent: row.get("sent"),
        failed: row.get("failed"),
    })
}

// ── Cancelled orders ────────────────────────────────────────────────────

/// Snapshot an order into the cancelled table. Reads customer info from the
/// local orders table when available so the snapshot survives source purges.
#[instrument(skip_all)]
pub async fn cancel_order(
    pool: &Pool,
    order_number: &str,
    reason: Option<&str>,
    refunded: bool,
    restocked: bool,
) -> Result<()> {
    let order = order_by_number(pool, order_number).await?;
    sqlx::query(
        "INSERT INTO cancelled_orders \
             (order_number, customer_name, customer_email, reason, refunded, restocked, cancelled_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT(order_number) DO UPDATE SET \
             reason = excluded.reason, \
             refunded = excluded.refunded, \
             restocked = excluded.restocked",
    )
    .bind(order_number)
    .bind(order.as_ref().and_then(|o| o.customer_name.as_deref()))
    .bind(order.as_ref().and_then(|o| o.customer_email.as_deref()))
    .bind(reason)
    .bind(refunded)
    .bind(restocked)
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn cancelled_order(pool: &Pool, order_number: &str) -> Result<Option<CancelledOrder>> {
    let row = sqlx::query("SELECT * FROM cancelled_orders WHERE order_number = ?")
        .bind(order_number)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|row| CancelledOrder {
        order_number: row.get("order_number"),
        customer_name: row.try_get::<Option<String>, _>("customer_name").ok().flatten(),
        customer_email: row.try_get::<Option<String>, _>("customer_email").ok().flatten(),
        reason: row.try_get::<Option<String>, _>("reason").ok().flatten(),
        refunded: row.get("refunded"),
        restocked: row.get("restocked"),
        cancelled_at: row.get("cancelled_at"),
    }))
}

pub async fn uncancel_order(pool: &Pool, order_number: &str) -> Result<bool> {
    let result = sqlx::query("DELETE FROM cancelled_orders WHERE order_number = ?")
        .bind(order_number)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

// ── Order sync status ───────────────────────────────────────────────────

pub async fn last_sync_time(pool: &Pool) -> Result<Option<DateTime<Utc>>> {
    let at: Option<Option<DateTime<Utc>>> = sqlx::query_scalar(
        "SELECT last_sync_at FROM order_sync_status WHERE sync_type = 'platform_orders'",
    )
    .fetch_optional(pool)
    .await?;
    Ok(at.flatten())
}

#[instrument(skip_all)]
pub async fn set_sync_running(pool: &Pool) -> Result<()> {
    sqlx::query(
        "UPDATE order_sync_status SET status = 'running', error_message = NULL, updated_at = ? \
         WHERE sync_type = 'platform_orders'",
    )
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn set_sync_completed(pool: &Pool, count: i64) -> Result<()> {
    sqlx::query(
        "UPDATE order_sync_status SET status = 'idle', last_sync_at = ?, last_sync_count = ?, \
             error_message = NULL, updated_at = ? \
         WHERE sync_type = 'platform_orders'",
    )
    .bind(Utc::now())
    .bind(count)
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn set_sync_error(pool: &Pool, error: &str) -> Result<()> {
    sqlx::query(
        "UPDATE order_sync_status SET status = 'error', error_message = ?, updated_at = ? \
         WHERE sync_type = 'platform_orders'",
    )
    .bind(error)
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup_pool() -> Pool {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn batch_lifecycle_is_monotonic() {
        let pool = setup_pool().await;
        let bid = create_batch(&pool, Some("Morning run"), Carrier::Ups, None)
            .await
            .unwrap();

        let batch = get_batch(&pool, bid).await.unwrap();
        assert_eq!(batch.status, BatchStatus::InProgress);

        advance_batch_status(&pool, bid, BatchStatus::Recorded).await.unwrap();
        advance_batch_status(&pool, bid, BatchStatus::Notified).await.unwrap();

        // No reverting from notified.
        let err = advance_batch_status(&pool, bid, BatchStatus::Recorded).await;
        assert!(err.is_err());
        let batch = get_batch(&pool, bid).await.unwrap();
        assert_eq!(batch.status, BatchStatus::Notified);
        assert!(batch.notified_at.is_some());
    }

    #[tokio::test]
    async fn duplicate_lookup_only_sees_open_batches() {
        let pool = setup_pool().await;
        let b1 = create_batch(&pool, None, Carrier::Ups, None).await.unwrap();
        insert_scan(&pool, b1, "1Z999AA10123456784", "1Z999AA10123456784", Carrier::Ups)
            .await
            .unwrap();

        let hit = find_scan_in_open_batches(&pool, "1Z999AA10123456784")
            .await
            .unwrap();
        assert!(hit.is_some());

        advance_batch_status(&pool, b1, BatchStatus::Recorded).await.unwrap();
        let hit = find_scan_in_open_batches(&pool, "1Z999AA10123456784")
            .await
            .unwrap();
        assert!(hit.is_none());
    }

    #[tokio::test]
    async fn notification_ledger_never_downgrades_success() {
        let pool = setup_pool().await;
        let bid = create_batch(&pool, None, Carrier::Ups, None).await.unwrap();

        record_notification(&pool, bid, "1001", Some("a@b.c"), Some("1Z1"), true, None)
            .await
            .unwrap();
        record_notification(&pool, bid, "1001", Some("a@b.c"), Some("1Z1"), false, Some("boom"))
            .await
            .unwrap();

        let rec = notification_for(&pool, "1001", bid).await.unwrap().unwrap();
        assert!(rec.success);
        assert!(rec.error_message.is_none());

        let summary = notification_summary(&pool, bid).await.unwrap();
        assert_eq!(summary.sent, 1);
        assert_eq!(summary.failed, 0);
    }

    #[tokio::test]
    async fn order_upsert_replaces_line_items() {
        let pool = setup_pool().await;
        let mut order = RemoteOrder {
            platform_order_id: "555".into(),
            order_number: "1001".into(),
            customer_email: Some("a@b.c".into()),
            line_items: vec![crate::source::RemoteLineItem {
                platform_line_item_id: "li-1".into(),
                title: Some("Planner".into()),
                quantity: 1,
                ..Default::default()
            }],
            ..Default::default()
        };
        let id1 = upsert_order(&pool, &order).await.unwrap();

        order.line_items = vec![
            crate::source::RemoteLineItem {
                platform_line_item_id: "li-2".into(),
                title: Some("Notebook".into()),
                quantity: 2,
                ..Default::default()
            },
        ];
        let id2 = upsert_order(&pool, &order).await.unwrap();
        assert_eq!(id1, id2);

        let items = line_items_for_order(&pool, id1).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].0.as_deref(), Some("Notebook"));
        assert_eq!(items[0].2, 2);
    }

    #[tokio::test]
    async fn refresh_candidates_respects_cap_and_ttl() {
        let pool = setup_pool().await;
        let bid = create_batch(&pool, None, Carrier::Ups, None).await.unwrap();
        for i in 0..5 {
            let tn = format!("1ZAC5088673806230{}", i);
            insert_scan(&pool, bid, &tn, &tn, Carrier::Ups).await.unwrap();
        }

        // All five are cache misses.
        let candidates = refresh_candidates(&pool, Carrier::Ups, 30, 120, 3).await.unwrap();
        assert_eq!(candidates.len(), 3);

        // Fresh cache entry removes a candidate.
        let snapshot = TrackingSnapshot {
            status: TrackingState::InTransit,
            ..Default::default()
        };
        upsert_tracking_entry(&pool, "1ZAC50886738062300", Carrier::Ups, &snapshot)
            .await
            .unwrap();
        let candidates = refresh_candidates(&pool, Carrier::Ups, 30, 120, 10).await.unwrap();
        assert_eq!(candidates.len(), 4);
        assert!(!candidates.contains(&"1ZAC50886738062300".to_string()));

        // Backdate it past the TTL: eligible again, and ordered first after
        // the never-fetched ones.
        sqlx::query(
            "UPDATE tracking_status_cache SET fetched_at = datetime('now', '-3 hours') \
             WHERE tracking_number = '1ZAC50886738062300'",
        )
        .execute(&pool)
        .await
        .unwrap();
        let candidates = refresh_candidates(&pool, Carrier::Ups, 30, 120, 10).await.unwrap();
        assert_eq!(candidates.len(), 5);

        // Delivered entries stop refreshing.
        let delivered = TrackingSnapshot {
            status: TrackingState::Delivered,
            delivered: true,
            ..Default::default()
        };
        upsert_tracking_entry(&pool, "1ZAC50886738062301", Carrier::Ups, &delivered)
            .await
            .unwrap();
        let candidates = refresh_candidates(&pool, Carrier::Ups, 30, 120, 10).await.unwrap();
        assert_eq!(candidates.len(), 4);
    }

    #[tokio::test]
    async fn cancelled_order_snapshot_round_trip() {
        let pool = setup_pool().await;
        let order = RemoteOrder {
            platform_order_id: "9".into(),
            order_number: "2002".into(),
            customer_name: Some("Sam Doe".into()),
            customer_email: Some("sam@example.com".into()),
            ..Default::default()
        };
        upsert_order(&pool, &order).await.unwrap();

        cancel_order(&pool, "2002", Some("customer request"), true, false)
            .await
            .unwrap();
        let snap = cancelled_order(&pool, "2002").await.unwrap().unwrap();
        assert_eq!(snap.customer_email.as_deref(), Some("sam@example.com"));
        assert!(snap.refunded);

        assert!(uncancel_order(&pool, "2002").await.unwrap());
        assert!(cancelled_order(&pool, "2002").await.unwrap().is_none());
    }
}
