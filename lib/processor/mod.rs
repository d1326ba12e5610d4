//! Background extraction loop.
//!
//! One item at a time: claim the oldest pending item, run the active provider
//! against it with a deadline, record the outcome, repeat. When the queue is
//! empty the loop parks on a wake channel with a poll-interval fallback that
//! also absorbs items enqueued by other processes.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backup::{BackupSyncer, SyncRecord};
use crate::provider::{ExtractRequest, ExtractionError, ExtractionErrorKind, ProviderHandle};
use crate::queue::{QueueError, QueueItem, QueueStore};

#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Fallback poll cadence while idle; wakes from the queue preempt it.
    pub poll_interval: Duration,
    /// Deadline for a single provider call.
    pub extract_timeout: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            extract_timeout: Duration::from_secs(45),
        }
    }
}

pub struct ExtractionProcessor {
    store: Arc<QueueStore>,
    provider: Arc<ProviderHandle>,
    syncer: Option<Arc<BackupSyncer>>,
    config: ProcessorConfig,
    wake: flume::Receiver<()>,
    cancel: CancellationToken,
}

impl ExtractionProcessor {
    pub fn new(
        store: Arc<QueueStore>,
        provider: Arc<ProviderHandle>,
        syncer: Option<Arc<BackupSyncer>>,
        config: ProcessorConfig,
        wake: flume::Receiver<()>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            provider,
            syncer,
            config,
            wake,
            cancel,
        }
    }

    /// Runs the processor until cancelled.
    ///
    /// The recovery pass must succeed before any new work is claimed;
    /// storage errors there are retried rather than skipped, since skipping
    /// would strand interrupted items in `processing` forever.
    pub async fn run(self) {
        info!(event = "processor_started", "extraction processor running");

        loop {
            match self.store.recover_interrupted().await {
                Ok(_) => break,
                Err(err) => {
                    error!(
                        event = "recovery_pass_failed",
                        error = %err,
                        "startup recovery pass failed; retrying"
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => return,
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
            }
        }

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            match self.store.dequeue_next().await {
                Some(item) => self.process_one(item).await,
                None => {
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = self.wake.recv_async() => {}
                        _ = tokio::time::sleep(self.config.poll_interval) => {
                            if let Err(err) = self.store.absorb_external().await {
                                error!(
                                    event = "absorb_external_failed",
                                    error = %err,
                                    "failed to scan for externally enqueued items"
                                );
                            }
                        }
                    }
                }
            }
        }

        info!(event = "processor_stopped", "extraction processor shut down");
    }

    /// Claims one item, extracts, and records the outcome.
    ///
    /// A `NotFound` at any step means the item was removed mid-flight; the
    /// extraction result (if any) is discarded silently. Failed extractions
    /// are terminal for the item; re-submission is the caller's decision.
    async fn process_one(&self, item: QueueItem) {
        if let Err(err) = self.store.mark_processing(&item.id).await {
            match err {
                QueueError::NotFound(_) => {
                    debug!(
                        event = "item_gone_before_claim",
                        item_id = %item.id,
                        "item removed before it could be claimed"
                    );
                }
                QueueError::Storage(storage_err) => {
                    error!(
                        event = "claim_failed",
                        item_id = %item.id,
                        error = %storage_err,
                        "storage error while claiming pending item; pausing"
                    );
                    self.pause_one_tick().await;
                }
                other => {
                    error!(
                        event = "claim_failed",
                        item_id = %item.id,
                        error = %other,
                        "failed to claim pending item"
                    );
                }
            }
            return;
        }

        let provider = self.provider.active();
        info!(
            event = "extraction_started",
            item_id = %item.id,
            file_name = %item.file_name,
            provider = provider.name(),
            "running extraction"
        );

        let request = ExtractRequest {
            file_name: &item.file_name,
            mime_type: &item.mime_type,
            payload: &item.payload,
        };
        let outcome = match tokio::time::timeout(
            self.config.extract_timeout,
            provider.extract(request),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ExtractionError::new(
                ExtractionErrorKind::Timeout,
                format!(
                    "extraction did not finish within {:?}",
                    self.config.extract_timeout
                ),
            )),
        };

        match outcome {
            Ok(record) => {
                let id = item.id.clone();
                let recorded = self
                    .record_with_retry(&item, || {
                        let id = id.clone();
                        let record = record.clone();
                        async move { self.store.mark_completed(&id, record).await }
                    })
                    .await;
                if !recorded {
                    return;
                }

                info!(
                    event = "extraction_completed",
                    item_id = %item.id,
                    file_name = %item.file_name,
                    "extraction completed"
                );
                if let Some(syncer) = &self.syncer {
                    let sync_record = SyncRecord {
                        item_id: item.id.clone(),
                        file_name: item.file_name.clone(),
                        extracted: record,
                        completed_at: Utc::now(),
                    };
                    if let Err(err) = syncer.write_through(&sync_record).await {
                        error!(
                            event = "backup_buffering_failed",
                            item_id = %item.id,
                            error = %err,
                            "could not buffer backup write after direct attempt failed"
                        );
                    }
                }
            }
            Err(extraction_err) => {
                warn!(
                    event = "extraction_failed",
                    item_id = %item.id,
                    file_name = %item.file_name,
                    kind = extraction_err.kind.as_str(),
                    error = %extraction_err,
                    "extraction failed; item marked failed"
                );
                let message = extraction_err.to_string();
                let id = item.id.clone();
                self.record_with_retry(&item, || {
                    let id = id.clone();
                    let message = message.clone();
                    async move { self.store.mark_failed(&id, message).await }
                })
                .await;
            }
        }
    }

    /// Records a terminal outcome, pausing and retrying on storage errors.
    ///
    /// An item left in `processing` blocks the whole single-flight queue, so
    /// a transient storage failure here must not abandon the transition.
    /// Returns false when the outcome could not or need not be recorded.
    async fn record_with_retry<F, Fut>(&self, item: &QueueItem, mark: F) -> bool
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<(), QueueError>>,
    {
        loop {
            match mark().await {
                Ok(()) => return true,
                Err(QueueError::NotFound(_)) => {
                    debug!(
                        event = "result_discarded",
                        item_id = %item.id,
                        "item removed mid-extraction; result discarded"
                    );
                    return false;
                }
                Err(QueueError::Storage(err)) => {
                    error!(
                        event = "outcome_record_failed",
                        item_id = %item.id,
                        error = %err,
                        "storage error while recording extraction outcome; pausing"
                    );
                    if !self.pause_one_tick().await {
                        return false;
                    }
                }
                Err(err) => {
                    error!(
                        event = "outcome_record_failed",
                        item_id = %item.id,
                        error = %err,
                        "refusing invalid transition while recording outcome"
                    );
                    return false;
                }
            }
        }
    }

    /// Sleeps one poll interval; returns false if cancelled meanwhile.
    async fn pause_one_tick(&self) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(self.config.poll_interval) => true,
        }
    }
}
