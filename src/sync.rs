//! Background synchronization and backfills.
//!
//! Incremental orders sync from the platform, plus two repair passes over
//! recorded scans: splitting concatenated tracking numbers and filling in
//! missing customer emails.

use crate::classify;
use crate::db::{self, Pool};
use crate::resolver::OrderResolver;
use crate::source::{with_retry, OrderSource, RetryPolicy};
use anyhow::Result;
use chrono::{Duration, Utc};
use std::sync::Arc;
use tracing::{info, instrument, warn};

const FIRST_SYNC_DAYS: i64 = 30;
const FULL_SYNC_DAYS: i64 = 90;
const EMAIL_BACKFILL_LIMIT: i64 = 200;

pub struct OrdersSync {
    pool: Pool,
    source: Arc<dyn OrderSource>,
    retry: RetryPolicy,
}

impl OrdersSync {
    pub fn new(pool: Pool, source: Arc<dyn OrderSource>, retry: RetryPolicy) -> Self {
        Self { pool, source, retry }
    }

    /// Pull orders updated since the last sync and upsert them locally.
    ///
    /// `full` ignores the cursor and re-syncs the last 90 days; the first
    /// ever sync covers 30. The sync-status row tracks the cursor and the
    /// last error so the next incremental run resumes correctly.
    #[instrument(skip(self))]
    pub async fn sync_orders(&self, full: bool) -> Result<i64> {
        let since = if full {
            Utc::now() - Duration::days(FULL_SYNC_DAYS)
        } else {
            match db::last_sync_time(&self.pool).await? {
                Some(at) => at,
                None => Utc::now() - Duration::days(FIRST_SYNC_DAYS),
            }
        };

        db::set_sync_running(&self.pool).await?;
        let orders = match with_retry(&self.retry, || self.source.list_updated_since(since)).await {
            Ok(orders) => orders,
            Err(err) => {
                db::set_sync_error(&self.pool, &err.to_string()).await?;
                return Err(err.into());
            }
        };

        let mut synced = 0i64;
        for order in &orders {
            match db::upsert_order(&self.pool, order).await {
                Ok(_) => synced += 1,
                Err(err) => {
                    warn!(?err, order_number = %order.order_number, "order upsert failed");
                }
            }
            // Platform-side cancellations feed the local snapshot table.
            if order.cancelled_at.is_some() {
                db::cancel_order(
                    &self.pool,
                    &order.order_number,
                    order.cancel_reason.as_deref(),
                    false,
                    false,
                )
                .await?;
            }
        }

        db::set_sync_completed(&self.pool, synced).await?;
        info!(synced, full, "orders sync complete");
        Ok(synced)
    }
}

/// Re-run the classifier over recorded scans with concatenation-shaped
/// tracking numbers and replace each with one row per split token. The
/// original row is kept, marked `split`, so the pass is idempotent.
#[instrument(skip(pool))]
pub async fn backfill_split_scans(pool: &Pool) -> Result<usize> {
    let candidates = db::concatenation_shaped_scans(pool).await?;
    let mut created = 0usize;
    for scan in &candidates {
        let tokens = classify::classify(&scan.tracking_number);
        if tokens.len() <= 1 {
            continue;
        }
        info!(
            scan_id = scan.id,
            tracking = %scan.tracking_number,
            parts = tokens.len(),
            "splitting concatenated scan"
        );
        for token in &tokens {
            db::insert_split_scan(pool, scan, &token.number, token.carrier).await?;
            created += 1;
        }
        db::mark_scan_split(pool, scan.id).await?;
    }
    if created > 0 {
        info!(created, "split-tracking backfill complete");
    }
    Ok(created)
}

/// Fill missing customer emails on completed scans from the orders table
/// (and, through the resolver, the remote source).
#[instrument(skip(pool, resolver))]
pub async fn backfill_missing_emails(pool: &Pool, resolver: &OrderResolver) -> Result<usize> {
    let scans = db::scans_missing_email(pool, EMAIL_BACKFILL_LIMIT).await?;
    let mut filled = 0usize;
    for scan in &scans {
        let Some(order_number) = scan.order_number.as_deref() else {
            continue;
        };
        match resolver.customer_email(order_number).await {
            Ok(Some(email)) if !email.trim().is_empty() => {
                db::set_scan_email(pool, scan.id, &email).await?;
                filled += 1;
            }
            Ok(_) => {}
            Err(err) => {
                warn!(?err, order_number, "email backfill lookup failed");
            }
        }
    }
    if filled > 0 {
        info!(filled, "email backfill complete");
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Carrier;
    use crate::source::{RemoteOrder, SourceError};
    use async_trait::async_trait;
    use chrono::DateTime;
    use std::sync::Mutex;

    struct FixedSource {
        orders: Mutex<Vec<RemoteOrder>>,
    }

    #[async_trait]
    impl OrderSource for FixedSource {
        async fn fetch_order_by_tracking(
            &self,
            _tracking_number: &str,
            _lookback_days: u32,
        ) -> Result<Option<RemoteOrder>, SourceError> {
            Ok(None)
        }

        async fn fetch_order_by_number(
            &self,
            order_number: &str,
        ) -> Result<Option<RemoteOrder>, SourceError> {
            Ok(self
                .orders
                .lock()
                .unwrap()
                .iter()
                .find(|o| o.order_number == order_number)
                .cloned())
        }

        async fn list_updated_since(
            &self,
            _since: DateTime<Utc>,
        ) -> Result<Vec<RemoteOrder>, SourceError> {
            Ok(self.orders.lock().unwrap().clone())
        }
    }

    async fn setup_pool() -> Pool {
        let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn sync_upserts_orders_and_moves_cursor() {
        let pool = setup_pool().await;
        let source = Arc::new(FixedSource {
            orders: Mutex::new(vec![
                RemoteOrder {
                    platform_order_id: "1".into(),
                    order_number: "1001".into(),
                    ..Default::default()
                },
                RemoteOrder {
                    platform_order_id: "2".into(),
                    order_number: "1002".into(),
                    cancelled_at: Some(Utc::now()),
                    cancel_reason: Some("customer".into()),
                    ..Default::default()
                },
            ]),
        });

        let sync = OrdersSync::new(pool.clone(), source, RetryPolicy::default());
        assert!(db::last_sync_time(&pool).await.unwrap().is_none());

        let count = sync.sync_orders(false).await.unwrap();
        assert_eq!(count, 2);
        assert!(db::last_sync_time(&pool).await.unwrap().is_some());

        // The cancelled order landed in the snapshot table.
        let snap = db::cancelled_order(&pool, "1002").await.unwrap();
        assert!(snap.is_some());
        assert!(db::cancelled_order(&pool, "1001").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn split_backfill_replaces_concatenated_scan() {
        let pool = setup_pool().await;
        let bid = db::create_batch(&pool, None, Carrier::Ups, None).await.unwrap();
        let concat = "1ZAC508867380623021ZAC50882034286504";
        db::insert_scan(&pool, bid, concat, concat, Carrier::Ups).await.unwrap();

        let created = backfill_split_scans(&pool).await.unwrap();
        assert_eq!(created, 2);

        let scans = db::list_batch_scans(&pool, bid).await.unwrap();
        assert_eq!(scans.len(), 3);
        let split: Vec<_> = scans
            .iter()
            .filter(|s| s.status == crate::model::ScanStatus::Pending)
            .collect();
        assert_eq!(split.len(), 2);
        assert!(split.iter().any(|s| s.tracking_number == "1ZAC50886738062302"));
        assert!(split.iter().any(|s| s.tracking_number == "1ZAC50882034286504"));

        // Idempotent: re-running finds nothing new.
        let created = backfill_split_scans(&pool).await.unwrap();
        assert_eq!(created, 0);
    }

    #[tokio::test]
    async fn email_backfill_fills_from_orders() {
        let pool = setup_pool().await;
        let bid = db::create_batch(&pool, None, Carrier::Ups, None).await.unwrap();
        let sid = db::insert_scan(&pool, bid, "1Z1", "1Z1", Carrier::Ups).await.unwrap();
        db::backfill_scan_order(
            &pool,
            sid,
            Carrier::Ups,
            Some("1001"),
            None,
            Some("Jane"),
            None,
            crate::model::ScanStatus::Complete,
            false,
        )
        .await
        .unwrap();

        db::upsert_order(
            &pool,
            &RemoteOrder {
                platform_order_id: "1".into(),
                order_number: "1001".into(),
                customer_email: Some("jane@example.com".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let source = Arc::new(FixedSource { orders: Mutex::new(vec![]) });
        let resolver = OrderResolver::new(pool.clone(), source, Default::default());

        let filled = backfill_missing_emails(&pool, &resolver).await.unwrap();
        assert_eq!(filled, 1);
        let scan = db::get_scan(&pool, sid).await.unwrap();
        assert_eq!(scan.customer_email.as_deref(), Some("jane@example.com"));
    }
}
