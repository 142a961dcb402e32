//! Scan ingestion.
//!
//! A raw barcode swipe goes through classification, the cancelled-order
//! check and the duplicate guard before being recorded; order details are
//! attached by a background task so scanning never waits on remote APIs.
//!
//! Duplicate checking and the insert run under a per-batch lock: two
//! near-simultaneous swipes of the same label cannot both pass the guard.

use crate::address;
use crate::classify;
use crate::db::{self, Pool};
use crate::model::{Carrier, Scan, ScanStatus};
use crate::resolver::{OrderResolver, Resolution, ResolveError};
use anyhow::Result;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

/// Result of ingesting one classified token.
#[derive(Debug, Clone)]
pub enum ScanOutcome {
    /// Recorded; order lookup continues in the background.
    Recorded { scan: Scan },
    /// Already scanned into an open batch; not recorded again.
    Duplicate { tracking_number: String, existing: Scan },
    /// The resolved order was cancelled; not recorded.
    CancelledOrder { order_number: String, reason: Option<String> },
}

#[derive(Clone)]
pub struct ScanIntake {
    pool: Pool,
    resolver: Arc<OrderResolver>,
    /// Per-batch ingest locks, created on first use.
    batch_locks: Arc<StdMutex<HashMap<i64, Arc<Mutex<()>>>>>,
}

impl ScanIntake {
    pub fn new(pool: Pool, resolver: Arc<OrderResolver>) -> Self {
        Self {
            pool,
            resolver,
            batch_locks: Arc::new(StdMutex::new(HashMap::new())),
        }
    }

    /// Ingest a raw scan into a batch. Returns one outcome per classified
    /// token (concatenated swipes yield several).
    #[instrument(skip(self))]
    pub async fn ingest(&self, batch_id: i64, raw: &str) -> Result<Vec<ScanOutcome>> {
        let batch = db::get_batch(&self.pool, batch_id).await?;
        let tokens = classify::classify(raw);
        if tokens.len() > 1 {
            info!(raw, count = tokens.len(), "concatenated scan split");
        }

        let lock = {
            let mut locks = self.batch_locks.lock().expect("batch lock registry poisoned");
            locks.entry(batch_id).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
        };
        let _guard = lock.lock().await;

        let mut outcomes = Vec::with_capacity(tokens.len());
        for token in tokens {
            // Unknown-format labels fall back to the batch's carrier: the
            // operator picked it for a reason.
            let carrier = if token.carrier == Carrier::Unknown {
                batch.carrier
            } else {
                token.carrier
            };
            outcomes.push(self.ingest_token(batch_id, raw, &token.number, carrier).await?);
        }
        Ok(outcomes)
    }

    async fn ingest_token(
        &self,
        batch_id: i64,
        raw: &str,
        tracking_number: &str,
        carrier: Carrier,
    ) -> Result<ScanOutcome> {
        // Cancelled order check comes first: a do-not-ship parcel must stop
        // the operator even if it was never scanned before.
        if let Some(order_number) = db::last_order_number_for_tracking(&self.pool, tracking_number).await? {
            if let Some(cancelled) = db::cancelled_order(&self.pool, &order_number).await? {
                warn!(tracking_number, order_number, "scan of cancelled order rejected");
                return Ok(ScanOutcome::CancelledOrder {
                    order_number,
                    reason: cancelled.reason,
                });
            }
        }

        // Duplicate guard: only open batches count; a closed batch means a
        // legitimate re-shipment or return.
        if let Some(existing) = db::find_scan_in_open_batches(&self.pool, tracking_number).await? {
            info!(
                tracking_number,
                existing_batch = existing.batch_id,
                "duplicate scan flagged"
            );
            return Ok(ScanOutcome::Duplicate {
                tracking_number: tracking_number.to_string(),
                existing,
            });
        }

        let scan_id = db::insert_scan(&self.pool, batch_id, raw, tracking_number, carrier).await?;
        let scan = db::get_scan(&self.pool, scan_id).await?;

        // Order details are filled in off the scan path.
        let this = self.clone();
        let tn = tracking_number.to_string();
        tokio::spawn(async move {
            if let Err(err) = this.backfill_order(scan_id, &tn).await {
                warn!(?err, scan_id, "order backfill failed");
            }
        });

        Ok(ScanOutcome::Recorded { scan })
    }

    /// Resolve the order for a recorded scan and attach its details. Always
    /// leaves the scan in a terminal status: a failed lookup records the
    /// scan with no order linkage rather than dropping it.
    pub async fn backfill_order(&self, scan_id: i64, tracking_number: &str) -> Result<()> {
        let scan = db::get_scan(&self.pool, scan_id).await?;

        let resolution = match self.resolver.resolve(tracking_number).await {
            Ok(resolution) => resolution,
            Err(ResolveError::Db(err)) => return Err(err),
            Err(err) => {
                warn!(?err, tracking_number, "order resolution failed");
                Resolution::NotFound
            }
        };

        match resolution.order() {
            Some(order) => {
                // Carrier from the resolved order wins over shape detection
                // when the two disagree and the order names one.
                let po_box_conflict = order
                    .shipping_address
                    .as_deref()
                    .map(|addr| !address::is_deliverable(addr, scan.carrier))
                    .unwrap_or(false);
                if po_box_conflict {
                    warn!(
                        tracking_number,
                        order_number = %order.order_number,
                        "{}",
                        address::po_box_conflict_message(scan.carrier)
                    );
                }
                db::backfill_scan_order(
                    &self.pool,
                    scan_id,
                    scan.carrier,
                    Some(&order.order_number),
                    Some(&order.platform_order_id),
                    order.customer_name.as_deref(),
                    order.customer_email.as_deref(),
                    ScanStatus::Complete,
                    po_box_conflict,
                )
                .await?;
                db::mark_order_scanned(&self.pool, tracking_number).await?;
            }
            None => {
                db::backfill_scan_order(
                    &self.pool,
                    scan_id,
                    scan.carrier,
                    None,
                    None,
                    None,
                    None,
                    ScanStatus::NotFound,
                    false,
                )
                .await?;
            }
        }
        Ok(())
    }
}
