//! Top-level wiring: opens the durable store, resolves the active provider,
//! and runs the background processor and backup drainer under one
//! cancellation token.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::backup::{BackupSyncer, HttpSyncTarget, RetrySyncQueue, SyncFailure, SyncTarget};
use crate::config::Config;
use crate::db::{open_database, settings, DbConnection, StorageError};
use crate::processor::ExtractionProcessor;
use crate::provider::{
    ExtractionProvider, LocalModelProvider, ProviderConfigError, ProviderHandle,
    RemoteModelProvider,
};
use crate::queue::{
    EnqueueError, NewSubmission, QueueCounts, QueueError, QueueEvent, QueueItem, QueueStore,
};

/// Settings keys for the persisted provider selection. Persisted values win
/// over environment bootstrap values.
pub const SETTING_USE_REMOTE: &str = "provider.use_remote";
pub const SETTING_REMOTE_ENDPOINT: &str = "provider.endpoint";
pub const SETTING_REMOTE_CREDENTIAL: &str = "provider.credential";

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Provider(#[from] ProviderConfigError),
    #[error("backup target misconfigured: {0}")]
    Backup(String),
}

/// The assembled worker runtime.
///
/// Owns the queue store, the swappable provider handle, and the background
/// tasks. Dropping the service without `shutdown` leaves tasks running until
/// the runtime itself stops; orderly exits should call `shutdown`.
pub struct IntakeService {
    store: Arc<QueueStore>,
    provider: Arc<ProviderHandle>,
    aux_conn: Arc<Mutex<DbConnection>>,
    retry: Option<Arc<RetrySyncQueue>>,
    config: Config,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl IntakeService {
    /// Builds and starts the full runtime from configuration.
    pub async fn init(config: Config) -> Result<Self, ServiceError> {
        Self::init_inner(config, None).await
    }

    /// As `init`, but with a caller-supplied extraction provider.
    ///
    /// Used by tests to drive the runtime with deterministic providers; the
    /// persisted provider selection is ignored.
    pub async fn init_with_provider(
        config: Config,
        provider: Arc<dyn ExtractionProvider>,
    ) -> Result<Self, ServiceError> {
        Self::init_inner(config, Some(provider)).await
    }

    async fn init_inner(
        config: Config,
        provider_override: Option<Arc<dyn ExtractionProvider>>,
    ) -> Result<Self, ServiceError> {
        let queue_conn = open_database(&config.database_path)?;
        // Second connection for settings and the retry buffer, so slow queue
        // writes never serialize against them.
        let aux_conn = Arc::new(Mutex::new(open_database(&config.database_path)?));

        let (wake_tx, wake_rx) = flume::unbounded();
        let store = Arc::new(QueueStore::open(queue_conn, wake_tx).await?);

        let provider = match provider_override {
            Some(provider) => Arc::new(ProviderHandle::new(provider)),
            None => Arc::new(resolve_provider(&config, &aux_conn).await?),
        };

        let cancel = CancellationToken::new();
        let mut tasks = Vec::new();

        let backup_endpoint = config
            .backup_endpoint
            .clone()
            .filter(|endpoint| !endpoint.trim().is_empty());
        let (syncer, retry) = if let Some(endpoint) = backup_endpoint {
            let target: Arc<dyn SyncTarget> = Arc::new(
                HttpSyncTarget::new(endpoint, config.backup_token.clone(), config.backup_timeout)
                    .map_err(|err| ServiceError::Backup(err.to_string()))?,
            );
            let retry = Arc::new(RetrySyncQueue::new(
                Arc::clone(&aux_conn),
                config.sync_retry.clone(),
            ));
            let syncer = Arc::new(BackupSyncer::new(Arc::clone(&target), Arc::clone(&retry)));

            tasks.push(tokio::spawn(
                Arc::clone(&retry).run_drainer(target, cancel.child_token()),
            ));
            (Some(syncer), Some(retry))
        } else {
            (None, None)
        };

        let processor = ExtractionProcessor::new(
            Arc::clone(&store),
            Arc::clone(&provider),
            syncer,
            config.processor.clone(),
            wake_rx,
            cancel.child_token(),
        );
        tasks.push(tokio::spawn(processor.run()));

        info!(
            event = "service_started",
            database_path = %config.database_path,
            provider = provider.active().name(),
            backup_enabled = config.backup_enabled(),
            "intake worker service running"
        );

        Ok(Self {
            store,
            provider,
            aux_conn,
            retry,
            config,
            cancel,
            tasks,
        })
    }

    pub fn store(&self) -> Arc<QueueStore> {
        Arc::clone(&self.store)
    }

    pub fn active_provider_name(&self) -> &'static str {
        self.provider.active().name()
    }

    pub async fn enqueue(&self, inputs: Vec<NewSubmission>) -> Result<Vec<String>, EnqueueError> {
        self.store.enqueue_many(inputs).await
    }

    pub async fn list_queue(&self) -> Vec<QueueItem> {
        self.store.list().await
    }

    pub async fn counts(&self) -> QueueCounts {
        self.store.counts().await
    }

    pub async fn get_item(&self, id: &str) -> Result<QueueItem, QueueError> {
        self.store.get(id).await
    }

    pub async fn remove(&self, id: &str) -> Result<(), QueueError> {
        self.store.remove(id).await
    }

    pub async fn clear_completed(&self) -> Result<usize, QueueError> {
        self.store.clear_completed().await
    }

    pub async fn clear_all(&self) -> Result<usize, QueueError> {
        self.store.clear_all().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.store.subscribe()
    }

    /// Permanent backup-failure notifications, when a backup target is
    /// configured.
    pub fn subscribe_sync_failures(&self) -> Option<broadcast::Receiver<SyncFailure>> {
        self.retry.as_ref().map(|retry| retry.subscribe_failures())
    }

    /// Switches the active extraction provider and persists the selection.
    ///
    /// Switching to remote is validated up front: a missing endpoint or
    /// credential rejects the switch and leaves the current provider active.
    /// The new provider takes effect from the next extraction; an in-flight
    /// extraction finishes on the provider it started with.
    pub async fn set_provider(&self, use_remote: bool) -> Result<&'static str, ServiceError> {
        let next: Arc<dyn ExtractionProvider> = if use_remote {
            let (endpoint, credential) = self.resolved_remote_settings().await?;
            Arc::new(RemoteModelProvider::new(
                endpoint.unwrap_or_default(),
                credential.unwrap_or_default(),
                self.config.processor.extract_timeout,
            )?)
        } else {
            Arc::new(LocalModelProvider::new(self.config.local_runner.clone()))
        };

        {
            let mut conn = self.aux_conn.lock().await;
            settings::put_setting(
                &mut conn,
                SETTING_USE_REMOTE,
                if use_remote { "true" } else { "false" },
            )
            .await?;
        }

        let name = next.name();
        self.provider.swap(next);
        info!(
            event = "provider_switched",
            provider = name,
            "active extraction provider changed"
        );
        Ok(name)
    }

    /// Persists remote endpoint and credential for future `set_provider`
    /// calls and restarts.
    pub async fn configure_remote(
        &self,
        endpoint: &str,
        credential: &str,
    ) -> Result<(), ServiceError> {
        let mut conn = self.aux_conn.lock().await;
        settings::put_setting(&mut conn, SETTING_REMOTE_ENDPOINT, endpoint).await?;
        settings::put_setting(&mut conn, SETTING_REMOTE_CREDENTIAL, credential).await?;
        Ok(())
    }

    async fn resolved_remote_settings(
        &self,
    ) -> Result<(Option<String>, Option<String>), StorageError> {
        let mut conn = self.aux_conn.lock().await;
        let endpoint = settings::get_setting(&mut conn, SETTING_REMOTE_ENDPOINT)
            .await?
            .or_else(|| self.config.remote_endpoint.clone());
        let credential = settings::get_setting(&mut conn, SETTING_REMOTE_CREDENTIAL)
            .await?
            .or_else(|| self.config.remote_credential.clone());
        Ok((endpoint, credential))
    }

    /// Stops the background tasks and waits for them to exit.
    pub async fn shutdown(mut self) {
        info!(event = "service_stopping", "shutting down intake worker service");
        self.cancel.cancel();
        for task in self.tasks.drain(..) {
            if let Err(err) = task.await {
                warn!(
                    event = "service_task_join_failed",
                    error = %err,
                    "background task did not exit cleanly"
                );
            }
        }
        info!(event = "service_stopped", "intake worker service shut down");
    }
}

/// Resolves the bootstrap provider from persisted settings, falling back to
/// the environment configuration.
///
/// A persisted remote selection that cannot be satisfied (endpoint or
/// credential missing) is deferred rather than fatal: the service starts on
/// the local provider and the selection can be completed later through
/// `configure_remote` and `set_provider`.
async fn resolve_provider(
    config: &Config,
    aux_conn: &Arc<Mutex<DbConnection>>,
) -> Result<ProviderHandle, ServiceError> {
    let (use_remote, endpoint, credential) = {
        let mut conn = aux_conn.lock().await;
        let use_remote = match settings::get_setting(&mut conn, SETTING_USE_REMOTE).await? {
            Some(value) => value == "true",
            None => config.use_remote,
        };
        let endpoint = settings::get_setting(&mut conn, SETTING_REMOTE_ENDPOINT)
            .await?
            .or_else(|| config.remote_endpoint.clone());
        let credential = settings::get_setting(&mut conn, SETTING_REMOTE_CREDENTIAL)
            .await?
            .or_else(|| config.remote_credential.clone());
        (use_remote, endpoint, credential)
    };

    if use_remote {
        match RemoteModelProvider::new(
            endpoint.unwrap_or_default(),
            credential.unwrap_or_default(),
            config.processor.extract_timeout,
        ) {
            Ok(remote) => return Ok(ProviderHandle::new(Arc::new(remote))),
            Err(err) => {
                warn!(
                    event = "remote_selection_deferred",
                    error = %err,
                    "remote provider selected but not fully configured; starting on local"
                );
            }
        }
    }

    Ok(ProviderHandle::new(Arc::new(LocalModelProvider::new(
        config.local_runner.clone(),
    ))))
}
