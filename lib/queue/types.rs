use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::db::StorageError;
use crate::provider::ExtractedRecord;

/// Durable lifecycle states for one queue item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl ItemStatus {
    pub fn as_db_str(self) -> &'static str {
        match self {
            ItemStatus::Pending => "pending",
            ItemStatus::Processing => "processing",
            ItemStatus::Completed => "completed",
            ItemStatus::Failed => "failed",
        }
    }

    pub fn from_db_str(value: &str) -> Result<Self, StorageError> {
        match value {
            "pending" => Ok(ItemStatus::Pending),
            "processing" => Ok(ItemStatus::Processing),
            "completed" => Ok(ItemStatus::Completed),
            "failed" => Ok(ItemStatus::Failed),
            other => Err(StorageError::InvalidValue(format!(
                "invalid queue item status: {other}"
            ))),
        }
    }
}

impl std::fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_db_str())
    }
}

/// One submitted input awaiting or having completed extraction.
///
/// `id`, `file_name`, `mime_type`, `payload`, and `enqueued_at` are immutable
/// for the item's lifetime; `result` is present iff `Completed` and `error`
/// iff `Failed`. `seq` is an internal monotonic tiebreaker so FIFO order is
/// stable when several items share an enqueue millisecond.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueItem {
    pub id: String,
    pub seq: i64,
    pub file_name: String,
    pub mime_type: String,
    pub payload: Vec<u8>,
    pub status: ItemStatus,
    pub result: Option<ExtractedRecord>,
    pub error: Option<String>,
    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
}

/// One raw input handed to `enqueue_many`.
#[derive(Debug, Clone)]
pub struct NewSubmission {
    pub file_name: String,
    pub mime_type: String,
    pub payload: Vec<u8>,
}

/// Derived per-status counts over the current queue contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueCounts {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub total: usize,
}

/// Change notification emitted by the queue store.
///
/// Consumers (a UI layer, a poller) subscribe explicitly; the engine itself
/// has no knowledge of who listens.
#[derive(Debug, Clone)]
pub enum QueueEvent {
    Enqueued { id: String },
    StatusChanged { id: String, status: ItemStatus },
    Removed { id: String },
    Cleared { removed: usize },
}

/// Error type for queue store operations.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("queue item not found: {0}")]
    NotFound(String),

    /// Invariant violation: a status transition outside the state machine.
    /// Treated as a bug signal by callers and never mutates queue state.
    #[error("invalid transition for item {id}: {from} -> {attempted}")]
    InvalidTransition {
        id: String,
        from: ItemStatus,
        attempted: ItemStatus,
    },

    #[error("item {active_id} is already processing; the queue is single-flight")]
    AlreadyProcessing { active_id: String },
}

/// Partial-success report from `enqueue_many`.
///
/// Enqueueing is atomic per item, not per batch: `persisted` lists the ids
/// that made it to the durable store before `failed_input` did not.
#[derive(Debug, Error)]
#[error(
    "enqueue failed on input '{failed_input}' after {} persisted item(s): {source}",
    persisted.len()
)]
pub struct EnqueueError {
    pub persisted: Vec<String>,
    pub failed_input: String,
    #[source]
    pub source: StorageError,
}
