use std::collections::HashMap;

use chrono::Utc;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::db::{to_millis, DbConnection, StorageError};
use crate::provider::ExtractedRecord;

use super::durable;
use super::types::{
    EnqueueError, ItemStatus, NewSubmission, QueueCounts, QueueError, QueueEvent, QueueItem,
};

const EVENT_CHANNEL_CAPACITY: usize = 256;

struct StoreInner {
    conn: DbConnection,
    items: HashMap<String, QueueItem>,
    next_seq: i64,
}

/// In-memory mirror of the durable queue table; owns all state transitions.
///
/// The durable store is the source of truth and every mutation is
/// write-through: persist first, then update memory, so a persistence
/// failure leaves the in-memory view unchanged and visible to the caller.
/// One async mutex guards both halves so they can never interleave
/// inconsistently.
pub struct QueueStore {
    inner: Mutex<StoreInner>,
    events: broadcast::Sender<QueueEvent>,
    wake: flume::Sender<()>,
}

impl QueueStore {
    /// Hydrates the mirror from the durable store.
    pub async fn open(
        mut conn: DbConnection,
        wake: flume::Sender<()>,
    ) -> Result<Self, StorageError> {
        let rows = durable::list_items(&mut conn).await?;
        let next_seq = durable::max_seq(&mut conn).await?.saturating_add(1);

        let mut items = HashMap::with_capacity(rows.len());
        for item in rows {
            items.insert(item.id.clone(), item);
        }

        info!(
            event = "queue_store_hydrated",
            item_count = items.len(),
            "loaded queue items from durable store"
        );

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            inner: Mutex::new(StoreInner {
                conn,
                items,
                next_seq,
            }),
            events,
            wake,
        })
    }

    /// Subscribes to queue change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: QueueEvent) {
        // No subscribers is a normal state, not an error.
        let _ = self.events.send(event);
    }

    fn wake_processor(&self) {
        let _ = self.wake.send(());
    }

    /// Converts each raw input into a `pending` item, persists it, and
    /// returns the assigned ids.
    ///
    /// Atomic per item, not per batch: if one input fails to persist, the
    /// returned `EnqueueError` reports the ids that did make it.
    pub async fn enqueue_many(
        &self,
        inputs: Vec<NewSubmission>,
    ) -> Result<Vec<String>, EnqueueError> {
        let mut inner = self.inner.lock().await;
        let mut persisted = Vec::with_capacity(inputs.len());

        for input in inputs {
            let seq = inner.next_seq;
            let item = QueueItem {
                id: Uuid::new_v4().to_string(),
                seq,
                file_name: input.file_name,
                mime_type: input.mime_type,
                payload: input.payload,
                status: ItemStatus::Pending,
                result: None,
                error: None,
                enqueued_at: Utc::now(),
                started_at: None,
            };

            if let Err(source) = durable::insert_item(&mut inner.conn, &item).await {
                drop(inner);
                if !persisted.is_empty() {
                    self.wake_processor();
                }
                return Err(EnqueueError {
                    persisted,
                    failed_input: item.file_name,
                    source,
                });
            }

            inner.next_seq = seq.saturating_add(1);
            persisted.push(item.id.clone());
            self.emit(QueueEvent::Enqueued {
                id: item.id.clone(),
            });
            inner.items.insert(item.id.clone(), item);
        }

        drop(inner);
        self.wake_processor();
        Ok(persisted)
    }

    /// Returns the oldest `pending` item without mutating it.
    ///
    /// Claiming is a separate explicit step (`mark_processing`) performed by
    /// the background processor.
    pub async fn dequeue_next(&self) -> Option<QueueItem> {
        let inner = self.inner.lock().await;
        inner
            .items
            .values()
            .filter(|item| item.status == ItemStatus::Pending)
            .min_by_key(|item| (item.enqueued_at, item.seq))
            .cloned()
    }

    /// Claims one `pending` item for extraction.
    ///
    /// Enforces the single-flight invariant: the claim is refused while any
    /// other item is `processing`.
    pub async fn mark_processing(&self, id: &str) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().await;

        if let Some(active) = inner
            .items
            .values()
            .find(|item| item.status == ItemStatus::Processing)
        {
            return Err(QueueError::AlreadyProcessing {
                active_id: active.id.clone(),
            });
        }

        let current = match inner.items.get(id) {
            Some(item) => item.status,
            None => return Err(QueueError::NotFound(id.to_string())),
        };
        if current != ItemStatus::Pending {
            return Err(QueueError::InvalidTransition {
                id: id.to_string(),
                from: current,
                attempted: ItemStatus::Processing,
            });
        }

        let started_at = Utc::now();
        let affected = durable::update_status(
            &mut inner.conn,
            id,
            ItemStatus::Processing,
            None,
            None,
            Some(to_millis(started_at)),
        )
        .await?;
        if affected == 0 {
            inner.items.remove(id);
            return Err(QueueError::NotFound(id.to_string()));
        }

        if let Some(item) = inner.items.get_mut(id) {
            item.status = ItemStatus::Processing;
            item.started_at = Some(started_at);
        }
        self.emit(QueueEvent::StatusChanged {
            id: id.to_string(),
            status: ItemStatus::Processing,
        });
        Ok(())
    }

    /// Records a successful extraction result.
    pub async fn mark_completed(
        &self,
        id: &str,
        result: ExtractedRecord,
    ) -> Result<(), QueueError> {
        let result_json = serde_json::to_string(&result).map_err(StorageError::from)?;
        self.finish(id, ItemStatus::Completed, Some(result), Some(result_json), None)
            .await
    }

    /// Records an extraction failure.
    ///
    /// Failed items are never automatically re-enqueued; re-submission is an
    /// explicit caller decision.
    pub async fn mark_failed(&self, id: &str, error: String) -> Result<(), QueueError> {
        self.finish(id, ItemStatus::Failed, None, None, Some(error)).await
    }

    async fn finish(
        &self,
        id: &str,
        status: ItemStatus,
        result: Option<ExtractedRecord>,
        result_json: Option<String>,
        error: Option<String>,
    ) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().await;

        let current = match inner.items.get(id) {
            Some(item) => item.status,
            None => return Err(QueueError::NotFound(id.to_string())),
        };
        if current != ItemStatus::Processing {
            return Err(QueueError::InvalidTransition {
                id: id.to_string(),
                from: current,
                attempted: status,
            });
        }

        let started_at_ms = inner
            .items
            .get(id)
            .and_then(|item| item.started_at)
            .map(to_millis);
        let affected = durable::update_status(
            &mut inner.conn,
            id,
            status,
            result_json.as_deref(),
            error.as_deref(),
            started_at_ms,
        )
        .await?;
        if affected == 0 {
            inner.items.remove(id);
            return Err(QueueError::NotFound(id.to_string()));
        }

        if let Some(item) = inner.items.get_mut(id) {
            item.status = status;
            item.result = result;
            item.error = error;
        }
        self.emit(QueueEvent::StatusChanged {
            id: id.to_string(),
            status,
        });
        Ok(())
    }

    /// Removes one item from both the durable store and the mirror.
    pub async fn remove(&self, id: &str) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().await;

        let existed_durable = durable::delete_item(&mut inner.conn, id).await?;
        let existed_memory = inner.items.remove(id).is_some();

        if !existed_durable && !existed_memory {
            return Err(QueueError::NotFound(id.to_string()));
        }

        self.emit(QueueEvent::Removed { id: id.to_string() });
        Ok(())
    }

    /// Removes every `completed` item; returns how many were removed.
    pub async fn clear_completed(&self) -> Result<usize, QueueError> {
        let mut inner = self.inner.lock().await;

        let removed = durable::delete_by_status(&mut inner.conn, ItemStatus::Completed).await?;
        inner
            .items
            .retain(|_, item| item.status != ItemStatus::Completed);

        self.emit(QueueEvent::Cleared { removed });
        Ok(removed)
    }

    /// Removes every item regardless of status.
    ///
    /// An extraction already in flight is allowed to finish; its result is
    /// discarded when the processor finds the item gone.
    pub async fn clear_all(&self) -> Result<usize, QueueError> {
        let mut inner = self.inner.lock().await;

        let removed = durable::delete_all(&mut inner.conn).await?;
        inner.items.clear();

        self.emit(QueueEvent::Cleared { removed });
        Ok(removed)
    }

    /// Reads one item by id.
    pub async fn get(&self, id: &str) -> Result<QueueItem, QueueError> {
        let inner = self.inner.lock().await;
        inner
            .items
            .get(id)
            .cloned()
            .ok_or_else(|| QueueError::NotFound(id.to_string()))
    }

    /// Lists every item in FIFO enqueue order.
    pub async fn list(&self) -> Vec<QueueItem> {
        let inner = self.inner.lock().await;
        let mut items: Vec<QueueItem> = inner.items.values().cloned().collect();
        items.sort_by_key(|item| (item.enqueued_at, item.seq));
        items
    }

    /// Computes derived per-status counts from the mirror.
    pub async fn counts(&self) -> QueueCounts {
        let inner = self.inner.lock().await;
        let mut counts = QueueCounts::default();
        for item in inner.items.values() {
            counts.total += 1;
            match item.status {
                ItemStatus::Pending => counts.pending += 1,
                ItemStatus::Processing => counts.processing += 1,
                ItemStatus::Completed => counts.completed += 1,
                ItemStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }

    /// Cold-start recovery pass: forces every `processing` item back to
    /// `pending` with `started_at` cleared, durable store first.
    ///
    /// Must run before any new processing begins; interrupted work is redone,
    /// never assumed lost or assumed complete.
    pub async fn recover_interrupted(&self) -> Result<usize, QueueError> {
        let mut inner = self.inner.lock().await;

        let requeued = durable::requeue_processing(&mut inner.conn).await?;

        let mut recovered_ids = Vec::new();
        for item in inner.items.values_mut() {
            if item.status == ItemStatus::Processing {
                item.status = ItemStatus::Pending;
                item.started_at = None;
                recovered_ids.push(item.id.clone());
            }
        }
        drop(inner);

        if requeued > 0 {
            warn!(
                event = "interrupted_items_requeued",
                requeued,
                "found items stuck in processing from a prior run; requeued as pending"
            );
        }
        for id in recovered_ids {
            self.emit(QueueEvent::StatusChanged {
                id,
                status: ItemStatus::Pending,
            });
        }
        if requeued > 0 {
            self.wake_processor();
        }

        Ok(requeued)
    }

    /// Folds in items persisted by another process (for example the enqueue
    /// CLI) that the mirror has not seen yet.
    pub async fn absorb_external(&self) -> Result<usize, QueueError> {
        let mut inner = self.inner.lock().await;

        let rows = durable::list_items(&mut inner.conn).await?;
        let max_seq = rows.iter().map(|item| item.seq).max().unwrap_or(0);

        let mut absorbed = Vec::new();
        for item in rows {
            if !inner.items.contains_key(&item.id) {
                absorbed.push(item.id.clone());
                inner.items.insert(item.id.clone(), item);
            }
        }
        if max_seq >= inner.next_seq {
            inner.next_seq = max_seq.saturating_add(1);
        }
        drop(inner);

        if !absorbed.is_empty() {
            debug!(
                event = "external_items_absorbed",
                count = absorbed.len(),
                "picked up queue items enqueued outside this process"
            );
        }
        let count = absorbed.len();
        for id in absorbed {
            self.emit(QueueEvent::Enqueued { id });
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_in_memory;
    use std::collections::BTreeMap;

    async fn test_store() -> (QueueStore, flume::Receiver<()>) {
        let conn = open_in_memory().expect("failed to open in-memory store");
        let (wake, wake_rx) = flume::unbounded();
        let store = QueueStore::open(conn, wake)
            .await
            .expect("failed to open queue store");
        (store, wake_rx)
    }

    fn submission(name: &str) -> NewSubmission {
        NewSubmission {
            file_name: name.to_string(),
            mime_type: "image/png".to_string(),
            payload: vec![0x89, 0x50, 0x4e, 0x47],
        }
    }

    fn record() -> ExtractedRecord {
        let mut fields = BTreeMap::new();
        fields.insert("vendor".to_string(), "ACME".to_string());
        ExtractedRecord {
            document_kind: Some("receipt".to_string()),
            fields,
            confidence: Some(0.95),
        }
    }

    #[tokio::test]
    async fn enqueue_assigns_ids_and_lists_fifo() {
        let (store, _wake) = test_store().await;
        let ids = store
            .enqueue_many(vec![submission("a.png"), submission("b.png"), submission("c.png")])
            .await
            .expect("enqueue failed");
        assert_eq!(ids.len(), 3);

        let listed = store.list().await;
        let names: Vec<&str> = listed.iter().map(|item| item.file_name.as_str()).collect();
        assert_eq!(names, vec!["a.png", "b.png", "c.png"]);
        for window in listed.windows(2) {
            assert!(window[0].enqueued_at <= window[1].enqueued_at);
        }
    }

    #[tokio::test]
    async fn dequeue_next_returns_oldest_pending_without_claiming() {
        let (store, _wake) = test_store().await;
        let ids = store
            .enqueue_many(vec![submission("a.png"), submission("b.png")])
            .await
            .expect("enqueue failed");

        let next = store.dequeue_next().await.expect("expected a pending item");
        assert_eq!(next.id, ids[0]);
        assert_eq!(next.status, ItemStatus::Pending);

        // Not claimed: asking again yields the same item.
        let again = store.dequeue_next().await.expect("expected a pending item");
        assert_eq!(again.id, ids[0]);
    }

    #[tokio::test]
    async fn single_flight_refuses_second_claim() {
        let (store, _wake) = test_store().await;
        let ids = store
            .enqueue_many(vec![submission("a.png"), submission("b.png")])
            .await
            .expect("enqueue failed");

        store.mark_processing(&ids[0]).await.expect("claim failed");
        let err = store
            .mark_processing(&ids[1])
            .await
            .expect_err("second claim should be refused");
        assert!(matches!(err, QueueError::AlreadyProcessing { .. }));

        let counts = store.counts().await;
        assert_eq!(counts.processing, 1);
    }

    #[tokio::test]
    async fn completing_an_unclaimed_item_is_an_invalid_transition() {
        let (store, _wake) = test_store().await;
        let ids = store
            .enqueue_many(vec![submission("a.png")])
            .await
            .expect("enqueue failed");

        let err = store
            .mark_completed(&ids[0], record())
            .await
            .expect_err("completing a pending item should fail");
        assert!(matches!(err, QueueError::InvalidTransition { .. }));

        // Status unchanged.
        let item = store.get(&ids[0]).await.expect("item should exist");
        assert_eq!(item.status, ItemStatus::Pending);
        assert!(item.result.is_none());
    }

    #[tokio::test]
    async fn failing_a_completed_item_is_an_invalid_transition() {
        let (store, _wake) = test_store().await;
        let ids = store
            .enqueue_many(vec![submission("a.png")])
            .await
            .expect("enqueue failed");

        store.mark_processing(&ids[0]).await.expect("claim failed");
        store
            .mark_completed(&ids[0], record())
            .await
            .expect("completion failed");

        let err = store
            .mark_failed(&ids[0], "late error".to_string())
            .await
            .expect_err("failing a completed item should be rejected");
        assert!(matches!(err, QueueError::InvalidTransition { .. }));

        let item = store.get(&ids[0]).await.expect("item should exist");
        assert_eq!(item.status, ItemStatus::Completed);
        assert!(item.result.is_some());
        assert!(item.error.is_none());
    }

    #[tokio::test]
    async fn full_lifecycle_sets_result_iff_completed() {
        let (store, _wake) = test_store().await;
        let ids = store
            .enqueue_many(vec![submission("a.png")])
            .await
            .expect("enqueue failed");
        let id = &ids[0];

        store.mark_processing(id).await.expect("claim failed");
        let mid = store.get(id).await.expect("item should exist");
        assert_eq!(mid.status, ItemStatus::Processing);
        assert!(mid.started_at.is_some());

        store
            .mark_completed(id, record())
            .await
            .expect("completion failed");
        let done = store.get(id).await.expect("item should exist");
        assert_eq!(done.status, ItemStatus::Completed);
        assert_eq!(done.result, Some(record()));
        assert!(done.error.is_none());
    }

    #[tokio::test]
    async fn remove_deletes_from_both_stores() {
        let (store, _wake) = test_store().await;
        let ids = store
            .enqueue_many(vec![submission("a.png")])
            .await
            .expect("enqueue failed");

        store.remove(&ids[0]).await.expect("remove failed");

        let err = store.get(&ids[0]).await.expect_err("item should be gone");
        assert!(matches!(err, QueueError::NotFound(_)));

        // Gone durably too: a fresh mirror over the same connection is empty.
        assert!(store.list().await.is_empty());
        let err = store
            .remove(&ids[0])
            .await
            .expect_err("second remove should report not found");
        assert!(matches!(err, QueueError::NotFound(_)));
    }

    #[tokio::test]
    async fn clear_completed_keeps_other_statuses() {
        let (store, _wake) = test_store().await;
        let ids = store
            .enqueue_many(vec![submission("a.png"), submission("b.png"), submission("c.png")])
            .await
            .expect("enqueue failed");

        store.mark_processing(&ids[0]).await.expect("claim failed");
        store
            .mark_completed(&ids[0], record())
            .await
            .expect("completion failed");
        store.mark_processing(&ids[1]).await.expect("claim failed");
        store
            .mark_failed(&ids[1], "model exploded".to_string())
            .await
            .expect("failure mark failed");

        let removed = store.clear_completed().await.expect("clear failed");
        assert_eq!(removed, 1);

        let counts = store.counts().await;
        assert_eq!(counts.completed, 0);
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.pending, 1);
        assert_eq!(counts.total, 2);
    }

    #[tokio::test]
    async fn recovery_requeues_processing_items() {
        let (store, _wake) = test_store().await;
        let ids = store
            .enqueue_many(vec![submission("a.png")])
            .await
            .expect("enqueue failed");
        store.mark_processing(&ids[0]).await.expect("claim failed");

        let requeued = store
            .recover_interrupted()
            .await
            .expect("recovery pass failed");
        assert_eq!(requeued, 1);

        let item = store.get(&ids[0]).await.expect("item should exist");
        assert_eq!(item.status, ItemStatus::Pending);
        assert!(item.started_at.is_none());
    }

    #[tokio::test]
    async fn events_report_enqueue_and_transitions() {
        let (store, _wake) = test_store().await;
        let mut events = store.subscribe();

        let ids = store
            .enqueue_many(vec![submission("a.png")])
            .await
            .expect("enqueue failed");
        store.mark_processing(&ids[0]).await.expect("claim failed");

        match events.recv().await.expect("expected enqueue event") {
            QueueEvent::Enqueued { id } => assert_eq!(id, ids[0]),
            other => panic!("unexpected event: {other:?}"),
        }
        match events.recv().await.expect("expected status event") {
            QueueEvent::StatusChanged { id, status } => {
                assert_eq!(id, ids[0]);
                assert_eq!(status, ItemStatus::Processing);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn partial_enqueue_failure_reports_persisted_ids_and_failing_input() {
        use diesel::sql_query;
        use diesel_async::RunQueryDsl;

        let mut conn = open_in_memory().expect("failed to open in-memory store");
        // Reject one specific file name at the durable layer, mid-batch.
        sql_query(
            "CREATE TRIGGER reject_poison BEFORE INSERT ON queue_items \
             WHEN NEW.file_name = 'poison.png' \
             BEGIN SELECT RAISE(ABORT, 'poison row rejected'); END",
        )
        .execute(&mut conn)
        .await
        .expect("failed to install trigger");

        let (wake, _wake_rx) = flume::unbounded();
        let store = QueueStore::open(conn, wake)
            .await
            .expect("failed to open queue store");

        let err = store
            .enqueue_many(vec![
                submission("a.png"),
                submission("poison.png"),
                submission("c.png"),
            ])
            .await
            .expect_err("poisoned batch should fail partway");

        assert_eq!(err.persisted.len(), 1);
        assert_eq!(err.failed_input, "poison.png");
        assert!(matches!(err.source, StorageError::Database(_)));

        // Exactly the items persisted before the failure are in the queue.
        let listed = store.list().await;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].file_name, "a.png");
        assert_eq!(listed[0].id, err.persisted[0]);
    }
}
