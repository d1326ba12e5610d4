//! End-to-end behavior of the write-behind backup path: direct write,
//! buffering on failure, drain-driven re-delivery, and the attempt cap.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use tokio::sync::Mutex;

use intake_worker_lib::backup::{
    BackupSyncer, RetrySyncQueue, SyncError, SyncRecord, SyncRetryConfig, SyncTarget,
};
use intake_worker_lib::db::open_in_memory;
use intake_worker_lib::provider::ExtractedRecord;

struct ScriptedTarget {
    outcomes: StdMutex<VecDeque<Result<(), SyncError>>>,
    delivered: StdMutex<Vec<serde_json::Value>>,
}

impl ScriptedTarget {
    fn new(outcomes: Vec<Result<(), SyncError>>) -> Self {
        Self {
            outcomes: StdMutex::new(outcomes.into()),
            delivered: StdMutex::new(Vec::new()),
        }
    }

    fn delivered(&self) -> Vec<serde_json::Value> {
        self.delivered.lock().unwrap().clone()
    }
}

impl SyncTarget for ScriptedTarget {
    fn sync_record<'a>(
        &'a self,
        record: &'a serde_json::Value,
    ) -> BoxFuture<'a, Result<(), SyncError>> {
        let outcome = self
            .outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(()));
        if outcome.is_ok() {
            self.delivered.lock().unwrap().push(record.clone());
        }
        Box::pin(async move { outcome })
    }
}

fn sync_record(item_id: &str) -> SyncRecord {
    let mut extracted = ExtractedRecord {
        document_kind: Some("invoice".to_string()),
        ..ExtractedRecord::default()
    };
    extracted
        .fields
        .insert("vendor".to_string(), "ACME".to_string());
    SyncRecord {
        item_id: item_id.to_string(),
        file_name: format!("{item_id}.png"),
        extracted,
        completed_at: Utc::now(),
    }
}

fn harness(
    outcomes: Vec<Result<(), SyncError>>,
    max_attempts: i32,
) -> (BackupSyncer, Arc<ScriptedTarget>, Arc<RetrySyncQueue>) {
    let conn = open_in_memory().expect("failed to open in-memory store");
    let retry = Arc::new(RetrySyncQueue::new(
        Arc::new(Mutex::new(conn)),
        SyncRetryConfig {
            base_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            max_attempts,
            drain_interval: Duration::from_millis(10),
        },
    ));
    let target = Arc::new(ScriptedTarget::new(outcomes));
    let syncer = BackupSyncer::new(
        Arc::clone(&target) as Arc<dyn SyncTarget>,
        Arc::clone(&retry),
    );
    (syncer, target, retry)
}

#[tokio::test]
async fn successful_write_through_leaves_nothing_buffered() {
    let (syncer, target, retry) = harness(vec![Ok(())], 3);

    syncer
        .write_through(&sync_record("item-1"))
        .await
        .expect("write-through should not surface sync failures");

    assert_eq!(retry.len().await.unwrap(), 0);
    let delivered = target.delivered();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0]["item_id"], "item-1");
    assert_eq!(delivered[0]["extracted"]["fields"]["vendor"], "ACME");
}

#[tokio::test]
async fn failed_write_is_buffered_then_delivered_by_drain() {
    let (syncer, target, retry) = harness(vec![Err(SyncError::Network("down".into())), Ok(())], 3);

    syncer
        .write_through(&sync_record("item-1"))
        .await
        .expect("write-through should buffer, not fail");
    assert_eq!(retry.len().await.unwrap(), 1);
    assert!(target.delivered().is_empty());

    let summary = retry
        .drain_once(target.as_ref())
        .await
        .expect("drain should not hit storage errors");
    assert_eq!(summary.succeeded, 1);
    assert_eq!(retry.len().await.unwrap(), 0);
    assert_eq!(target.delivered().len(), 1);
}

#[tokio::test]
async fn record_is_surfaced_as_permanent_after_third_failed_attempt() {
    // Direct write plus two drain attempts, all failing: three attempts total.
    let (syncer, target, retry) = harness(
        vec![
            Err(SyncError::Network("down".into())),
            Err(SyncError::Network("down".into())),
            Err(SyncError::Http {
                status: 503,
                message: "maintenance".into(),
            }),
        ],
        3,
    );
    let mut failures = retry.subscribe_failures();

    syncer
        .write_through(&sync_record("item-1"))
        .await
        .expect("write-through should buffer, not fail");

    let summary = retry.drain_once(target.as_ref()).await.unwrap();
    assert_eq!(summary.rescheduled, 1);

    let summary = retry.drain_once(target.as_ref()).await.unwrap();
    assert_eq!(summary.permanently_failed, 1);
    assert_eq!(retry.len().await.unwrap(), 0);

    let failure = failures.try_recv().expect("permanent failure should be surfaced");
    assert_eq!(failure.attempts, 3);
    assert_eq!(failure.record["item_id"], "item-1");
    assert!(failure.error.contains("503") || failure.error.contains("maintenance"));

    // Nothing left to drain: the record is gone, not retried forever.
    let summary = retry.drain_once(target.as_ref()).await.unwrap();
    assert_eq!(summary.attempted, 0);
}

#[tokio::test]
async fn background_drainer_delivers_buffered_records() {
    let (syncer, target, retry) = harness(vec![Err(SyncError::Network("blip".into())), Ok(())], 3);

    syncer
        .write_through(&sync_record("item-1"))
        .await
        .expect("write-through should buffer, not fail");

    let cancel = tokio_util::sync::CancellationToken::new();
    let drainer = tokio::spawn(Arc::clone(&retry).run_drainer(
        Arc::clone(&target) as Arc<dyn SyncTarget>,
        cancel.clone(),
    ));

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while retry.len().await.unwrap() > 0 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "drainer did not deliver the buffered record in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert_eq!(target.delivered().len(), 1);
    cancel.cancel();
    drainer.await.expect("drainer task panicked");
}
