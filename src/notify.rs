//! Customer notification dispatch.
//!
//! Sends one "Order Shipped" event per distinct order in a batch, at most
//! once per (order, batch) pair. The persisted ledger is the source of
//! truth; the in-memory progress map is a disposable view for polling.

use crate::db::{self, NotifiableScan, Pool};
use crate::model::BatchStatus;
use crate::resolver::OrderResolver;
use crate::source::NotificationSource;
use anyhow::Result;
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// Outcome of one order's notification within a dispatch run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyOutcome {
    Sent,
    AlreadyNotified,
    Failed,
}

/// Poll-able progress of a dispatch task.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct DispatchProgress {
    pub sent: u32,
    pub skipped: u32,
    pub failed: u32,
    pub total: u32,
    pub done: bool,
}

impl DispatchProgress {
    pub fn percent(&self) -> u32 {
        if self.total == 0 {
            return 100;
        }
        (self.sent + self.skipped + self.failed) * 100 / self.total
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    pool: Pool,
    notifier: Arc<dyn NotificationSource>,
    resolver: Arc<OrderResolver>,
    progress: Arc<Mutex<HashMap<Uuid, DispatchProgress>>>,
}

impl Dispatcher {
    pub fn new(
        pool: Pool,
        notifier: Arc<dyn NotificationSource>,
        resolver: Arc<OrderResolver>,
    ) -> Self {
        Self {
            pool,
            notifier,
            resolver,
            progress: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Start an asynchronous dispatch for a batch and return its task id.
    ///
    /// The caller is not blocked; once started, a dispatch always runs over
    /// the whole batch. The batch moves to `notified` only after the task
    /// finishes, partial failures included.
    pub fn dispatch(&self, batch_id: i64) -> Uuid {
        let task_id = Uuid::new_v4();
        self.progress
            .lock()
            .expect("progress map poisoned")
            .insert(task_id, DispatchProgress::default());

        let this = self.clone();
        tokio::spawn(async move {
            if let Err(err) = this.run_dispatch(task_id, batch_id).await {
                error!(?err, batch_id, "notification dispatch failed");
            }
            if let Ok(mut map) = this.progress.lock() {
                if let Some(p) = map.get_mut(&task_id) {
                    p.done = true;
                }
            }
        });
        task_id
    }

    /// Current progress for a dispatch task, if the task is known.
    pub fn progress(&self, task_id: Uuid) -> Option<DispatchProgress> {
        self.progress
            .lock()
            .expect("progress map poisoned")
            .get(&task_id)
            .copied()
    }

    #[instrument(skip(self))]
    async fn run_dispatch(&self, task_id: Uuid, batch_id: i64) -> Result<()> {
        let batch = db::get_batch(&self.pool, batch_id).await?;
        if batch.status == BatchStatus::InProgress {
            anyhow::bail!("batch {} must be recorded before notifying", batch_id);
        }
        let scans = db::notifiable_scans(&self.pool, batch_id).await?;
        self.update_progress(task_id, |p| p.total = scans.len() as u32);
        info!(batch_id, count = scans.len(), "dispatching notifications");

        for scan in &scans {
            let outcome = self
                .notify_one(batch_id, batch.carrier.as_str(), scan)
                .await;
            self.update_progress(task_id, |p| match outcome {
                NotifyOutcome::Sent => p.sent += 1,
                NotifyOutcome::AlreadyNotified => p.skipped += 1,
                NotifyOutcome::Failed => p.failed += 1,
            });
        }

        // Completion, not success, closes the batch: failures are in the
        // ledger for the operator to review.
        db::advance_batch_status(&self.pool, batch_id, BatchStatus::Notified).await?;

        let summary = db::notification_summary(&self.pool, batch_id).await?;
        info!(
            batch_id,
            sent = summary.sent,
            failed = summary.failed,
            "notification dispatch complete"
        );
        Ok(())
    }

    /// Notify a single order, honoring the (order, batch) ledger.
    async fn notify_one(
        &self,
        batch_id: i64,
        carrier: &str,
        scan: &NotifiableScan,
    ) -> NotifyOutcome {
        // Ledger pre-check: a prior successful send wins over everything.
        match db::notification_for(&self.pool, &scan.order_number, batch_id).await {
            Ok(Some(rec)) if rec.success => return NotifyOutcome::AlreadyNotified,
            Ok(_) => {}
            Err(err) => {
                warn!(?err, order = %scan.order_number, "ledger lookup failed");
                return NotifyOutcome::Failed;
            }
        }

        // Backfill a missing email from the order source before giving up.
        let email = match &scan.customer_email {
            Some(email) => Some(email.clone()),
            None => match self.resolver.customer_email(&scan.order_number).await {
                Ok(found) => {
                    if let Some(email) = &found {
                        let _ = db::set_scan_email(&self.pool, scan.scan_id, email).await;
                    }
                    found
                }
                Err(err) => {
                    warn!(?err, order = %scan.order_number, "email backfill failed");
                    None
                }
            },
        };
        let Some(email) = email.filter(|e| !e.trim().is_empty()) else {
            let _ = db::record_notification(
                &self.pool,
                batch_id,
                &scan.order_number,
                None,
                Some(&scan.tracking_number),
                false,
                Some("no customer email"),
            )
            .await;
            return NotifyOutcome::Failed;
        };

        let properties = json!({
            "order_number": scan.order_number,
            "tracking_number": scan.tracking_number,
            "carrier": carrier,
            "customer_name": scan.customer_name,
            "batch_id": batch_id,
        });

        let send_result = self
            .notifier
            .send_event("Order Shipped", &email, properties)
            .await;

        let (success, error_message) = match &send_result {
            Ok(()) => (true, None),
            Err(err) => {
                warn!(?err, order = %scan.order_number, "notification send failed");
                (false, Some(err.to_string()))
            }
        };
        if let Err(err) = db::record_notification(
            &self.pool,
            batch_id,
            &scan.order_number,
            Some(&email),
            Some(&scan.tracking_number),
            success,
            error_message.as_deref(),
        )
        .await
        {
            error!(?err, order = %scan.order_number, "failed to write ledger row");
            return NotifyOutcome::Failed;
        }

        if success {
            NotifyOutcome::Sent
        } else {
            NotifyOutcome::Failed
        }
    }

    fn update_progress(&self, task_id: Uuid, f: impl FnOnce(&mut DispatchProgress)) {
        if let Ok(mut map) = self.progress.lock() {
            if let Some(p) = map.get_mut(&task_id) {
                f(p);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_handles_empty_batch() {
        let p = DispatchProgress::default();
        assert_eq!(p.percent(), 100);

        let p = DispatchProgress {
            sent: 1,
            skipped: 1,
            failed: 0,
            total: 4,
            done: false,
        };
        assert_eq!(p.percent(), 50);
    }
}
