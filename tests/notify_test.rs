//! Notification dispatch: at-most-once per (order, batch), partial-failure
//! semantics and batch lifecycle.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parcelscan::db;
use parcelscan::model::{BatchStatus, Carrier, ScanStatus};
use parcelscan::notify::Dispatcher;
use parcelscan::resolver::{OrderResolver, ResolverConfig};
use parcelscan::source::{NotificationSource, OrderSource, RemoteOrder, SourceError};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

async fn setup_pool() -> sqlx::SqlitePool {
    // One connection: an in-memory database exists per connection, and the
    // dispatch task must see the same data as the test body.
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

#[derive(Debug, Clone)]
struct SentEvent {
    event_name: String,
    email: String,
    order_number: String,
}

/// Notification mock recording every send; responses pop from a queue,
/// defaulting to success.
#[derive(Default)]
struct RecordingNotifier {
    responses: Mutex<VecDeque<Result<(), SourceError>>>,
    sent: Mutex<Vec<SentEvent>>,
}

impl RecordingNotifier {
    fn with_responses(responses: Vec<Result<(), SourceError>>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(VecDeque::from(responses)),
            ..Default::default()
        })
    }

    fn sent(&self) -> Vec<SentEvent> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl NotificationSource for RecordingNotifier {
    async fn send_event(
        &self,
        event_name: &str,
        customer_email: &str,
        properties: serde_json::Value,
    ) -> Result<(), SourceError> {
        self.sent.lock().unwrap().push(SentEvent {
            event_name: event_name.to_string(),
            email: customer_email.to_string(),
            order_number: properties["order_number"].as_str().unwrap_or("").to_string(),
        });
        self.responses.lock().unwrap().pop_front().unwrap_or(Ok(()))
    }
}

#[derive(Default)]
struct EmptyOrders {
    orders: Mutex<Vec<RemoteOrder>>,
}

#[async_trait]
impl OrderSource for EmptyOrders {
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
        Ok(Vec::new())
    }
}

fn dispatcher_with(
    pool: &sqlx::SqlitePool,
    notifier: Arc<RecordingNotifier>,
    orders: Arc<EmptyOrders>,
) -> Dispatcher {
    let resolver = Arc::new(OrderResolver::new(
        pool.clone(),
        orders,
        ResolverConfig::default(),
    ));
    Dispatcher::new(pool.clone(), notifier, resolver)
}

/// A recorded batch with `n` completed scans, one order each.
async fn seed_batch(pool: &sqlx::SqlitePool, n: usize) -> i64 {
    let batch = db::create_batch(pool, None, Carrier::Ups, None).await.unwrap();
    for i in 0..n {
        let tn = format!("1ZAC508867380623{:02}", i);
        let sid = db::insert_scan(pool, batch, &tn, &tn, Carrier::Ups).await.unwrap();
        db::backfill_scan_order(
            pool,
            sid,
            Carrier::Ups,
            Some(&format!("10{:02}", i)),
            None,
            Some("Jane Doe"),
            Some(&format!("c{}@example.com", i)),
            ScanStatus::Complete,
            false,
        )
        .await
        .unwrap();
    }
    db::advance_batch_status(pool, batch, BatchStatus::Recorded)
        .await
        .unwrap();
    batch
}

async fn wait_done(dispatcher: &Dispatcher, task_id: uuid::Uuid) -> parcelscan::notify::DispatchProgress {
    for _ in 0..500 {
        if let Some(p) = dispatcher.progress(task_id) {
            if p.done {
                return p;
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("dispatch did not finish in time");
}

#[tokio::test]
async fn dispatch_sends_once_per_order_and_marks_batch() {
    let pool = setup_pool().await;
    let batch = seed_batch(&pool, 3).await;
    let notifier = RecordingNotifier::with_responses(vec![]);
    let dispatcher = dispatcher_with(&pool, notifier.clone(), Arc::new(EmptyOrders::default()));

    let task = dispatcher.dispatch(batch);
    let progress = wait_done(&dispatcher, task).await;
    assert_eq!(progress.total, 3);
    assert_eq!(progress.sent, 3);
    assert_eq!(progress.failed, 0);
    assert_eq!(progress.percent(), 100);

    let sent = notifier.sent();
    assert_eq!(sent.len(), 3);
    assert!(sent.iter().all(|e| e.event_name == "Order Shipped"));

    let batch_row = db::get_batch(&pool, batch).await.unwrap();
    assert_eq!(batch_row.status, BatchStatus::Notified);
    assert!(batch_row.notified_at.is_some());

    let summary = db::notification_summary(&pool, batch).await.unwrap();
    assert_eq!(summary.sent, 3);
}

#[tokio::test]
async fn second_dispatch_skips_everything() {
    let pool = setup_pool().await;
    let batch = seed_batch(&pool, 2).await;
    let notifier = RecordingNotifier::with_responses(vec![]);
    let dispatcher = dispatcher_with(&pool, notifier.clone(), Arc::new(EmptyOrders::default()));

    let first = dispatcher.dispatch(batch);
    wait_done(&dispatcher, first).await;
    assert_eq!(notifier.sent().len(), 2);

    let second = dispatcher.dispatch(batch);
    let progress = wait_done(&dispatcher, second).await;
    assert_eq!(progress.skipped, 2);
    assert_eq!(progress.sent, 0);

    // No second send for any (order, batch) pair.
    assert_eq!(notifier.sent().len(), 2);
    let summary = db::notification_summary(&pool, batch).await.unwrap();
    assert_eq!(summary.sent, 2);
}

#[tokio::test]
async fn partial_failure_completes_batch_and_is_retryable() {
    let pool = setup_pool().await;
    let batch = seed_batch(&pool, 3).await;
    // Second order fails on the first run.
    let notifier = RecordingNotifier::with_responses(vec![
        Ok(()),
        Err(SourceError::Server(502)),
        Ok(()),
    ]);
    let dispatcher = dispatcher_with(&pool, notifier.clone(), Arc::new(EmptyOrders::default()));

    let task = dispatcher.dispatch(batch);
    let progress = wait_done(&dispatcher, task).await;
    assert_eq!(progress.sent, 2);
    assert_eq!(progress.failed, 1);

    // One failure never blocks the batch.
    let batch_row = db::get_batch(&pool, batch).await.unwrap();
    assert_eq!(batch_row.status, BatchStatus::Notified);

    let summary = db::notification_summary(&pool, batch).await.unwrap();
    assert_eq!(summary.sent, 2);
    assert_eq!(summary.failed, 1);

    // Re-dispatch: only the failed order is retried, and succeeds.
    let retry = dispatcher.dispatch(batch);
    let progress = wait_done(&dispatcher, retry).await;
    assert_eq!(progress.skipped, 2);
    assert_eq!(progress.sent, 1);

    let summary = db::notification_summary(&pool, batch).await.unwrap();
    assert_eq!(summary.sent, 3);
    assert_eq!(summary.failed, 0);
    assert_eq!(notifier.sent().len(), 4);
}

#[tokio::test]
async fn missing_email_is_backfilled_from_order_source() {
    let pool = setup_pool().await;
    let batch = db::create_batch(&pool, None, Carrier::Ups, None).await.unwrap();
    let sid = db::insert_scan(&pool, batch, "1Z77", "1Z77", Carrier::Ups).await.unwrap();
    db::backfill_scan_order(
        &pool,
        sid,
        Carrier::Ups,
        Some("2001"),
        None,
        Some("No Email"),
        None,
        ScanStatus::Complete,
        false,
    )
    .await
    .unwrap();
    db::advance_batch_status(&pool, batch, BatchStatus::Recorded)
        .await
        .unwrap();

    let orders = Arc::new(EmptyOrders::default());
    orders.orders.lock().unwrap().push(RemoteOrder {
        platform_order_id: "9001".into(),
        order_number: "2001".into(),
        customer_email: Some("found@example.com".into()),
        ..Default::default()
    });

    let notifier = RecordingNotifier::with_responses(vec![]);
    let dispatcher = dispatcher_with(&pool, notifier.clone(), orders);

    let task = dispatcher.dispatch(batch);
    let progress = wait_done(&dispatcher, task).await;
    assert_eq!(progress.sent, 1);

    let sent = notifier.sent();
    assert_eq!(sent[0].email, "found@example.com");
    assert_eq!(sent[0].order_number, "2001");
}

#[tokio::test]
async fn unresolvable_email_lands_in_ledger_as_failure() {
    let pool = setup_pool().await;
    let batch = db::create_batch(&pool, None, Carrier::Ups, None).await.unwrap();
    let sid = db::insert_scan(&pool, batch, "1Z88", "1Z88", Carrier::Ups).await.unwrap();
    db::backfill_scan_order(
        &pool,
        sid,
        Carrier::Ups,
        Some("2002"),
        None,
        None,
        None,
        ScanStatus::Complete,
        false,
    )
    .await
    .unwrap();
    db::advance_batch_status(&pool, batch, BatchStatus::Recorded)
        .await
        .unwrap();

    let notifier = RecordingNotifier::with_responses(vec![]);
    let dispatcher = dispatcher_with(&pool, notifier.clone(), Arc::new(EmptyOrders::default()));

    let task = dispatcher.dispatch(batch);
    let progress = wait_done(&dispatcher, task).await;
    assert_eq!(progress.failed, 1);
    assert!(notifier.sent().is_empty());

    let rec = db::notification_for(&pool, "2002", batch).await.unwrap().unwrap();
    assert!(!rec.success);
    assert_eq!(rec.error_message.as_deref(), Some("no customer email"));
}

#[tokio::test]
async fn in_progress_batch_is_not_dispatched() {
    let pool = setup_pool().await;
    let batch = db::create_batch(&pool, None, Carrier::Ups, None).await.unwrap();

    let notifier = RecordingNotifier::with_responses(vec![]);
    let dispatcher = dispatcher_with(&pool, notifier.clone(), Arc::new(EmptyOrders::default()));

    let task = dispatcher.dispatch(batch);
    wait_done(&dispatcher, task).await;

    assert!(notifier.sent().is_empty());
    let batch_row = db::get_batch(&pool, batch).await.unwrap();
    assert_eq!(batch_row.status, BatchStatus::InProgress);
}
