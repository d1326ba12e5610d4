//! Write-behind synchronization of completed records to an external backup
//! target, with a durable retry queue for failed writes.

pub mod durable;
mod retry;

pub use retry::{DrainSummary, RetrySyncQueue, SyncFailure, SyncRetryConfig};

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::db::StorageError;
use crate::provider::ExtractedRecord;

/// Failure writing one record to the external backup target.
///
/// Sync failures are transient by assumption; they drive the retry queue's
/// backoff and only become permanent after the attempt cap.
#[derive(Debug, Clone, Error)]
pub enum SyncError {
    #[error("network error while writing to backup target: {0}")]
    Network(String),
    #[error("backup target rejected the write (HTTP {status}): {message}")]
    Http { status: u16, message: String },
}

/// One completed extraction, as mirrored to the backup target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRecord {
    pub item_id: String,
    pub file_name: String,
    pub extracted: ExtractedRecord,
    pub completed_at: DateTime<Utc>,
}

/// Writes one record to the external backup store.
///
/// This trait exists so retry behavior can be unit-tested against scripted
/// failures without a live target.
pub trait SyncTarget: Send + Sync {
    fn sync_record<'a>(
        &'a self,
        record: &'a serde_json::Value,
    ) -> BoxFuture<'a, Result<(), SyncError>>;
}

/// HTTP-backed backup target used by the production runtime.
pub struct HttpSyncTarget {
    client: reqwest::Client,
    endpoint: String,
    token: Option<String>,
}

impl HttpSyncTarget {
    pub fn new(
        endpoint: String,
        token: Option<String>,
        timeout: std::time::Duration,
    ) -> Result<Self, SyncError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| SyncError::Network(err.to_string()))?;

        Ok(Self {
            client,
            endpoint,
            token,
        })
    }
}

impl SyncTarget for HttpSyncTarget {
    fn sync_record<'a>(
        &'a self,
        record: &'a serde_json::Value,
    ) -> BoxFuture<'a, Result<(), SyncError>> {
        Box::pin(async move {
            let mut request = self.client.post(&self.endpoint).json(record);
            if let Some(token) = &self.token {
                request = request.bearer_auth(token);
            }

            let response = request
                .send()
                .await
                .map_err(|err| SyncError::Network(err.to_string()))?;

            let status = response.status();
            if !status.is_success() {
                let message = response.text().await.unwrap_or_default();
                return Err(SyncError::Http {
                    status: status.as_u16(),
                    message,
                });
            }

            Ok(())
        })
    }
}

/// Write-behind path to the backup target.
///
/// One direct attempt per record; a failed write becomes a durable retry
/// entry instead of blocking the caller. This mirrors the extraction queue's
/// structure but with automatic retries, which extraction deliberately does
/// not get.
pub struct BackupSyncer {
    target: Arc<dyn SyncTarget>,
    retry: Arc<RetrySyncQueue>,
}

impl BackupSyncer {
    pub fn new(target: Arc<dyn SyncTarget>, retry: Arc<RetrySyncQueue>) -> Self {
        Self { target, retry }
    }

    /// Attempts one write to the backup target, buffering a retry entry on
    /// failure.
    ///
    /// Only storage trouble while buffering is surfaced; a plain sync failure
    /// is the retry queue's job from here on.
    pub async fn write_through(&self, record: &SyncRecord) -> Result<(), StorageError> {
        let value = serde_json::to_value(record)?;

        match self.target.sync_record(&value).await {
            Ok(()) => {
                debug!(
                    event = "backup_record_synced",
                    item_id = %record.item_id,
                    "wrote completed record to backup target"
                );
                Ok(())
            }
            Err(err) => {
                warn!(
                    event = "backup_write_failed",
                    item_id = %record.item_id,
                    error = %err,
                    "backup write failed; buffering for retry"
                );
                self.retry.push_failed(value, &err).await?;
                Ok(())
            }
        }
    }
}
