//! Durable retry queue for backup writes that failed their direct attempt.
//!
//! Entries back off exponentially and are dropped with a surfaced failure
//! event once the attempt cap is reached, so the buffer can never grow
//! unboundedly on a dead target.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::db::{to_millis, DbConnection, StorageError};

use super::durable;
use super::{SyncError, SyncTarget};

const FAILURE_CHANNEL_CAPACITY: usize = 64;

/// Backoff and cap policy for buffered backup writes.
#[derive(Debug, Clone)]
pub struct SyncRetryConfig {
    /// Base delay; attempt `n` waits `base * 2^n`, capped at `max_backoff`.
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// Total delivery attempts per record, counting the direct write.
    pub max_attempts: i32,
    /// How often the background drainer scans for due entries.
    pub drain_interval: Duration,
}

impl Default for SyncRetryConfig {
    fn default() -> Self {
        Self {
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            max_attempts: 3,
            drain_interval: Duration::from_secs(5),
        }
    }
}

/// A record that exhausted its delivery attempts and was dropped.
#[derive(Debug, Clone)]
pub struct SyncFailure {
    pub record: serde_json::Value,
    pub attempts: i32,
    pub error: String,
}

/// Outcome of one drain pass, for logging and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DrainSummary {
    pub attempted: usize,
    pub succeeded: usize,
    pub rescheduled: usize,
    pub permanently_failed: usize,
}

fn backoff_delay(config: &SyncRetryConfig, attempts: i32) -> Duration {
    // Clamp the exponent so the shift cannot overflow; anything past 20
    // doublings is beyond any sane max_backoff anyway.
    let exp = attempts.clamp(0, 20) as u32;
    config
        .base_backoff
        .checked_mul(1u32 << exp)
        .unwrap_or(config.max_backoff)
        .min(config.max_backoff)
}

/// Durable buffer of backup writes awaiting re-delivery.
pub struct RetrySyncQueue {
    conn: Arc<Mutex<DbConnection>>,
    config: SyncRetryConfig,
    failures: broadcast::Sender<SyncFailure>,
}

impl RetrySyncQueue {
    pub fn new(conn: Arc<Mutex<DbConnection>>, config: SyncRetryConfig) -> Self {
        let (failures, _) = broadcast::channel(FAILURE_CHANNEL_CAPACITY);
        Self {
            conn,
            config,
            failures,
        }
    }

    pub fn config(&self) -> &SyncRetryConfig {
        &self.config
    }

    /// Subscribes to permanent-failure notifications.
    pub fn subscribe_failures(&self) -> broadcast::Receiver<SyncFailure> {
        self.failures.subscribe()
    }

    /// Number of buffered entries, due or not.
    pub async fn len(&self) -> Result<i64, StorageError> {
        let mut conn = self.conn.lock().await;
        durable::count_entries(&mut conn).await
    }

    /// Buffers a record whose direct write just failed.
    ///
    /// The direct write counts as attempt one. Returns the entry id, or
    /// `None` when the attempt cap is already spent and the failure was
    /// surfaced instead of buffered.
    pub async fn push_failed(
        &self,
        record: serde_json::Value,
        error: &SyncError,
    ) -> Result<Option<i64>, StorageError> {
        let attempts = 1;
        if attempts >= self.config.max_attempts {
            self.emit_permanent_failure(record, attempts, &error.to_string());
            return Ok(None);
        }

        let next_attempt_at =
            to_millis(Utc::now()) + backoff_delay(&self.config, attempts).as_millis() as i64;
        let record_json = serde_json::to_string(&record)?;

        let mut conn = self.conn.lock().await;
        let entry_id = durable::insert_entry(
            &mut conn,
            &record_json,
            attempts,
            next_attempt_at,
            &error.to_string(),
        )
        .await?;

        debug!(
            event = "sync_retry_buffered",
            entry_id,
            attempts,
            "buffered failed backup write for retry"
        );
        Ok(Some(entry_id))
    }

    /// Attempts re-delivery of every due entry exactly once.
    ///
    /// Entries are independent: one failure reschedules that entry alone and
    /// the pass continues. Only storage trouble aborts the pass.
    pub async fn drain_once(&self, target: &dyn SyncTarget) -> Result<DrainSummary, StorageError> {
        let now_ms = to_millis(Utc::now());
        let due = {
            let mut conn = self.conn.lock().await;
            durable::list_due(&mut conn, now_ms).await?
        };

        let mut summary = DrainSummary {
            attempted: due.len(),
            ..DrainSummary::default()
        };

        for entry in due {
            let record: serde_json::Value = match serde_json::from_str(&entry.record_json) {
                Ok(value) => value,
                Err(err) => {
                    // Unparseable entries can never deliver; drop them rather
                    // than retrying forever.
                    error!(
                        event = "sync_retry_entry_corrupt",
                        entry_id = entry.entry_id,
                        error = %err,
                        "dropping unparseable retry entry"
                    );
                    let mut conn = self.conn.lock().await;
                    durable::delete_entry(&mut conn, entry.entry_id).await?;
                    summary.permanently_failed += 1;
                    continue;
                }
            };

            match target.sync_record(&record).await {
                Ok(()) => {
                    let mut conn = self.conn.lock().await;
                    durable::delete_entry(&mut conn, entry.entry_id).await?;
                    summary.succeeded += 1;
                    debug!(
                        event = "sync_retry_delivered",
                        entry_id = entry.entry_id,
                        attempts = entry.attempts + 1,
                        "re-delivered buffered backup write"
                    );
                }
                Err(err) => {
                    let attempts = entry.attempts + 1;
                    if attempts >= self.config.max_attempts {
                        {
                            let mut conn = self.conn.lock().await;
                            durable::delete_entry(&mut conn, entry.entry_id).await?;
                        }
                        self.emit_permanent_failure(record, attempts, &err.to_string());
                        summary.permanently_failed += 1;
                    } else {
                        let next_attempt_at =
                            now_ms + backoff_delay(&self.config, attempts).as_millis() as i64;
                        let mut conn = self.conn.lock().await;
                        durable::update_entry(
                            &mut conn,
                            entry.entry_id,
                            attempts,
                            next_attempt_at,
                            &err.to_string(),
                        )
                        .await?;
                        summary.rescheduled += 1;
                        warn!(
                            event = "sync_retry_rescheduled",
                            entry_id = entry.entry_id,
                            attempts,
                            error = %err,
                            "backup re-delivery failed; backing off"
                        );
                    }
                }
            }
        }

        Ok(summary)
    }

    fn emit_permanent_failure(&self, record: serde_json::Value, attempts: i32, error: &str) {
        error!(
            event = "sync_retry_exhausted",
            attempts,
            error,
            "backup write permanently failed after exhausting attempts"
        );
        // Send only fails when nobody is subscribed, which is fine.
        let _ = self.failures.send(SyncFailure {
            record,
            attempts,
            error: error.to_string(),
        });
    }

    /// Background loop draining due entries until cancelled.
    pub async fn run_drainer(self: Arc<Self>, target: Arc<dyn SyncTarget>, cancel: CancellationToken) {
        info!(event = "sync_drainer_started", "backup retry drainer running");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(event = "sync_drainer_stopped", "backup retry drainer shut down");
                    break;
                }
                _ = tokio::time::sleep(self.config.drain_interval) => {
                    match self.drain_once(target.as_ref()).await {
                        Ok(summary) if summary.attempted > 0 => {
                            debug!(
                                event = "sync_drain_pass",
                                attempted = summary.attempted,
                                succeeded = summary.succeeded,
                                rescheduled = summary.rescheduled,
                                permanently_failed = summary.permanently_failed,
                                "drained due backup retry entries"
                            );
                        }
                        Ok(_) => {}
                        Err(err) => {
                            error!(
                                event = "sync_drain_storage_error",
                                error = %err,
                                "storage error during backup retry drain"
                            );
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    use futures::future::BoxFuture;
    use serde_json::json;

    use crate::db::open_in_memory;

    use super::*;

    /// Target that replays a scripted sequence of outcomes.
    struct ScriptedTarget {
        outcomes: StdMutex<VecDeque<Result<(), SyncError>>>,
        calls: std::sync::atomic::AtomicUsize,
    }

    impl ScriptedTarget {
        fn new(outcomes: Vec<Result<(), SyncError>>) -> Self {
            Self {
                outcomes: StdMutex::new(outcomes.into()),
                calls: std::sync::atomic::AtomicUsize::new(0),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(std::sync::atomic::Ordering::SeqCst)
        }
    }

    impl SyncTarget for ScriptedTarget {
        fn sync_record<'a>(
            &'a self,
            _record: &'a serde_json::Value,
        ) -> BoxFuture<'a, Result<(), SyncError>> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            let outcome = self
                .outcomes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(()));
            Box::pin(async move { outcome })
        }
    }

    fn immediate_config(max_attempts: i32) -> SyncRetryConfig {
        SyncRetryConfig {
            base_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            max_attempts,
            drain_interval: Duration::from_millis(10),
        }
    }

    async fn test_queue(config: SyncRetryConfig) -> RetrySyncQueue {
        let conn = open_in_memory().expect("failed to open in-memory store");
        RetrySyncQueue::new(Arc::new(Mutex::new(conn)), config)
    }

    fn network_error() -> SyncError {
        SyncError::Network("connection refused".to_string())
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let config = SyncRetryConfig {
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            ..SyncRetryConfig::default()
        };
        assert_eq!(backoff_delay(&config, 1), Duration::from_secs(2));
        assert_eq!(backoff_delay(&config, 2), Duration::from_secs(4));
        assert_eq!(backoff_delay(&config, 5), Duration::from_secs(32));
        assert_eq!(backoff_delay(&config, 6), Duration::from_secs(60));
        assert_eq!(backoff_delay(&config, 20), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn buffered_entry_delivers_on_drain() {
        let queue = test_queue(immediate_config(3)).await;
        let entry_id = queue
            .push_failed(json!({"item_id": "a"}), &network_error())
            .await
            .unwrap();
        assert!(entry_id.is_some());
        assert_eq!(queue.len().await.unwrap(), 1);

        let target = ScriptedTarget::new(vec![Ok(())]);
        let summary = queue.drain_once(&target).await.unwrap();

        assert_eq!(summary.attempted, 1);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(queue.len().await.unwrap(), 0);
        assert_eq!(target.calls(), 1);
    }

    #[tokio::test]
    async fn entry_is_dropped_and_surfaced_after_attempt_cap() {
        let queue = test_queue(immediate_config(3)).await;
        let mut failures = queue.subscribe_failures();
        queue
            .push_failed(json!({"item_id": "a"}), &network_error())
            .await
            .unwrap();

        // Attempt two: rescheduled, still buffered.
        let target = ScriptedTarget::new(vec![Err(network_error()), Err(network_error())]);
        let summary = queue.drain_once(&target).await.unwrap();
        assert_eq!(summary.rescheduled, 1);
        assert_eq!(summary.permanently_failed, 0);
        assert_eq!(queue.len().await.unwrap(), 1);

        // Attempt three hits the cap: dropped and surfaced.
        let summary = queue.drain_once(&target).await.unwrap();
        assert_eq!(summary.rescheduled, 0);
        assert_eq!(summary.permanently_failed, 1);
        assert_eq!(queue.len().await.unwrap(), 0);

        let failure = failures.try_recv().unwrap();
        assert_eq!(failure.attempts, 3);
        assert_eq!(failure.record, json!({"item_id": "a"}));
        assert!(failure.error.contains("connection refused"));

        // A fourth attempt never happens.
        let summary = queue.drain_once(&target).await.unwrap();
        assert_eq!(summary.attempted, 0);
        assert_eq!(target.calls(), 2);
    }

    #[tokio::test]
    async fn one_failing_entry_does_not_block_the_rest() {
        let queue = test_queue(immediate_config(5)).await;
        queue
            .push_failed(json!({"item_id": "a"}), &network_error())
            .await
            .unwrap();
        queue
            .push_failed(json!({"item_id": "b"}), &network_error())
            .await
            .unwrap();

        let target = ScriptedTarget::new(vec![Err(network_error()), Ok(())]);
        let summary = queue.drain_once(&target).await.unwrap();

        assert_eq!(summary.attempted, 2);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.rescheduled, 1);
        assert_eq!(queue.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn cap_of_one_fails_immediately_without_buffering() {
        let queue = test_queue(immediate_config(1)).await;
        let mut failures = queue.subscribe_failures();

        let entry_id = queue
            .push_failed(json!({"item_id": "a"}), &network_error())
            .await
            .unwrap();

        assert!(entry_id.is_none());
        assert_eq!(queue.len().await.unwrap(), 0);
        let failure = failures.try_recv().unwrap();
        assert_eq!(failure.attempts, 1);
    }

    #[tokio::test]
    async fn entry_not_due_yet_is_skipped() {
        let config = SyncRetryConfig {
            base_backoff: Duration::from_secs(3600),
            max_backoff: Duration::from_secs(3600),
            max_attempts: 3,
            drain_interval: Duration::from_secs(5),
        };
        let queue = test_queue(config).await;
        queue
            .push_failed(json!({"item_id": "a"}), &network_error())
            .await
            .unwrap();

        let target = ScriptedTarget::new(vec![Ok(())]);
        let summary = queue.drain_once(&target).await.unwrap();

        assert_eq!(summary.attempted, 0);
        assert_eq!(target.calls(), 0);
        assert_eq!(queue.len().await.unwrap(), 1);
    }
}
