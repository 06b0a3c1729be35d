use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::artifacts::fetcher::Fetcher;
use crate::artifacts::storage::ArtifactStorage;
use crate::artifacts::types::{
    ArtifactDescription, ArtifactFilter, ArtifactInfo, ArtifactSortKey, ArtifactStatus,
};
use crate::config::StorageConfig;
use crate::error::{Result, WelesError, WorkerError};
use crate::pagination::{paginate, Page, Paginator, Sorter};
use crate::status::{
    status_channel, Lifecycle, StatusChange, StatusReceiver, StatusReporter, StatusSender,
};
use crate::{ArtifactId, JobId};

struct ArtifactEntry {
    info: ArtifactInfo,
    /// Channel of the caller that pushed the artifact, until it is terminal.
    subscriber: Option<StatusSender<ArtifactStatus>>,
    /// Cancels the download pipeline, until it is terminal.
    cancel: Option<CancellationToken>,
}

#[derive(Default)]
struct ArtifactTable {
    last_id: ArtifactId,
    artifacts: BTreeMap<ArtifactId, ArtifactEntry>,
    by_path: HashMap<PathBuf, ArtifactId>,
    owners: HashSet<JobId>,
}

impl ArtifactTable {
    fn check_owner(&self, desc: &ArtifactDescription) -> Result<()> {
        if desc.alias.trim().is_empty() {
            return Err(WelesError::InvalidDescription("alias is empty".to_string()));
        }
        if !self.owners.contains(&desc.job_id) {
            return Err(WelesError::InvalidDescription(format!(
                "job {} does not exist",
                desc.job_id
            )));
        }
        Ok(())
    }

    fn insert(
        &mut self,
        storage: &ArtifactStorage,
        description: ArtifactDescription,
        status: ArtifactStatus,
        subscriber: Option<StatusSender<ArtifactStatus>>,
        cancel: Option<CancellationToken>,
    ) -> ArtifactInfo {
        self.last_id += 1;
        let id = self.last_id;
        let info = ArtifactInfo {
            id,
            path: storage.path_for(id, &description),
            description,
            status,
            timestamp: Utc::now(),
        };
        self.by_path.insert(info.path.clone(), id);
        self.artifacts.insert(
            id,
            ArtifactEntry {
                info: info.clone(),
                subscriber,
                cancel,
            },
        );
        info
    }

    /// Apply a pipeline status change. Returns the subscriber to forward the
    /// change to, if the change was accepted.
    fn apply(&mut self, change: &StatusChange<ArtifactStatus>) -> Option<StatusSender<ArtifactStatus>> {
        let Some(entry) = self.artifacts.get_mut(&change.id) else {
            tracing::warn!(artifact_id = change.id, "Status change for unknown artifact");
            return None;
        };

        let current = entry.info.status;
        if !current.can_transition_to(change.status) {
            tracing::warn!(
                artifact_id = change.id,
                from = %current,
                to = %change.status,
                "Rejected artifact status transition"
            );
            return None;
        }

        entry.info.status = change.status;
        entry.info.timestamp = change.at.max(entry.info.timestamp);
        tracing::debug!(
            artifact_id = change.id,
            status = %change.status,
            info = %change.info,
            "Artifact status updated"
        );

        if change.status.is_terminal() {
            entry.cancel = None;
            entry.subscriber.take()
        } else {
            entry.subscriber.clone()
        }
    }
}

/// Registry of artifacts and runner of their download pipelines.
///
/// Pipelines never touch the table: they report over an internal status
/// channel consumed by a single event loop, which applies each change and
/// forwards it to the channel the artifact was pushed with.
pub struct ArtifactManager {
    table: Arc<Mutex<ArtifactTable>>,
    storage: ArtifactStorage,
    fetcher: Arc<dyn Fetcher>,
    downloads: Arc<Semaphore>,
    events_tx: StatusSender<ArtifactStatus>,
}

impl ArtifactManager {
    /// Create the registry and spawn its event loop, which runs until
    /// `shutdown` is cancelled.
    pub fn start(
        config: &StorageConfig,
        fetcher: Arc<dyn Fetcher>,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        let (events_tx, events_rx) = status_channel();
        let manager = Arc::new(Self {
            table: Arc::new(Mutex::new(ArtifactTable::default())),
            storage: ArtifactStorage::new(config.root.clone()),
            fetcher,
            downloads: Arc::new(Semaphore::new(config.max_concurrent_downloads.max(1))),
            events_tx,
        });

        let table = manager.table.clone();
        tokio::spawn(async move {
            Self::event_loop(table, events_rx, shutdown).await;
        });

        manager
    }

    pub fn storage(&self) -> &ArtifactStorage {
        &self.storage
    }

    /// Allow artifacts to reference `job_id`.
    pub async fn register_owner(&self, job_id: JobId) {
        self.table.lock().await.owners.insert(job_id);
    }

    /// Register content that is already local. The artifact is READY at once;
    /// the caller writes the content to the returned path.
    pub async fn create_artifact(&self, desc: ArtifactDescription) -> Result<PathBuf> {
        let info = {
            let mut table = self.table.lock().await;
            table.check_owner(&desc)?;
            table.insert(&self.storage, desc, ArtifactStatus::Ready, None, None)
        };
        self.storage.prepare(&info.path).await?;

        tracing::debug!(
            artifact_id = info.id,
            job_id = info.description.job_id,
            path = %info.path.display(),
            "Artifact created"
        );
        Ok(info.path)
    }

    /// Register an artifact to be fetched from its URI and start the download
    /// pipeline. Returns the path the content will be stored at.
    ///
    /// `status_tx` receives PENDING right away, then DOWNLOADING and a
    /// terminal READY or FAILED. A push canceled while still queued for a
    /// download slot goes from PENDING straight to FAILED.
    pub async fn push_artifact(
        &self,
        desc: ArtifactDescription,
        status_tx: StatusSender<ArtifactStatus>,
    ) -> Result<PathBuf> {
        if desc.uri.trim().is_empty() {
            return Err(WelesError::InvalidDescription(format!(
                "artifact {} has no URI",
                desc.alias
            )));
        }

        let cancel = CancellationToken::new();
        let info = {
            let mut table = self.table.lock().await;
            table.check_owner(&desc)?;
            table.insert(
                &self.storage,
                desc,
                ArtifactStatus::Pending,
                Some(status_tx.clone()),
                Some(cancel.clone()),
            )
        };

        let _ = status_tx.send(StatusChange {
            id: info.id,
            status: ArtifactStatus::Pending,
            info: "queued for download".to_string(),
            at: info.timestamp,
        });

        tracing::info!(
            artifact_id = info.id,
            job_id = info.description.job_id,
            uri = %info.description.uri,
            "Artifact pushed"
        );

        tokio::spawn(Self::download(
            info.id,
            info.description.uri.clone(),
            info.path.clone(),
            self.storage.clone(),
            self.fetcher.clone(),
            self.downloads.clone(),
            cancel,
            self.events_tx.clone(),
        ));

        Ok(info.path)
    }

    pub async fn get_artifact_info(&self, path: &Path) -> Result<ArtifactInfo> {
        let table = self.table.lock().await;
        table
            .by_path
            .get(path)
            .and_then(|id| table.artifacts.get(id))
            .map(|entry| entry.info.clone())
            .ok_or_else(|| WelesError::ArtifactNotFound(path.display().to_string()))
    }

    pub async fn list_artifacts(
        &self,
        filter: &ArtifactFilter,
        sorter: &Sorter<ArtifactSortKey>,
        paginator: &Paginator,
    ) -> Result<Page<ArtifactInfo>> {
        let table = self.table.lock().await;
        paginate(
            table.artifacts.values().map(|entry| &entry.info),
            filter,
            sorter,
            paginator,
        )
    }

    /// Cancel every in-flight download of `job_id`. Each canceled pipeline
    /// ends with a FAILED event. Returns the number of pipelines signalled.
    pub async fn cancel_pushes(&self, job_id: JobId) -> usize {
        let table = self.table.lock().await;
        let mut canceled = 0;
        for entry in table.artifacts.values() {
            if entry.info.description.job_id != job_id {
                continue;
            }
            if let Some(cancel) = &entry.cancel {
                cancel.cancel();
                canceled += 1;
            }
        }
        if canceled > 0 {
            tracing::info!(job_id, canceled, "Canceled artifact downloads");
        }
        canceled
    }

    async fn event_loop(
        table: Arc<Mutex<ArtifactTable>>,
        mut events_rx: StatusReceiver<ArtifactStatus>,
        shutdown: CancellationToken,
    ) {
        loop {
            let change = tokio::select! {
                change = events_rx.recv() => match change {
                    Some(change) => change,
                    None => break,
                },
                _ = shutdown.cancelled() => break,
            };

            let subscriber = table.lock().await.apply(&change);
            if let Some(tx) = subscriber {
                // The subscriber may have gone away; the table is still current.
                let _ = tx.send(change);
            }
        }
        tracing::debug!("Artifact event loop stopped");
    }

    #[allow(clippy::too_many_arguments)]
    async fn download(
        id: ArtifactId,
        uri: String,
        path: PathBuf,
        storage: ArtifactStorage,
        fetcher: Arc<dyn Fetcher>,
        downloads: Arc<Semaphore>,
        cancel: CancellationToken,
        events_tx: StatusSender<ArtifactStatus>,
    ) {
        let mut reporter = StatusReporter::new(id, events_tx);

        let _permit = tokio::select! {
            permit = downloads.acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => {
                    reporter.report(ArtifactStatus::Failed, "download pool closed");
                    return;
                }
            },
            _ = cancel.cancelled() => {
                reporter.report(ArtifactStatus::Failed, WorkerError::Canceled.to_string());
                return;
            }
        };

        reporter.report(ArtifactStatus::Downloading, format!("fetching {}", uri));

        let dest = path.clone();
        let mut fetch = tokio::spawn(async move {
            storage.prepare(&dest).await?;
            let bytes = fetcher.fetch(&uri, &dest).await?;
            Ok::<_, WorkerError>(bytes)
        });

        let outcome = tokio::select! {
            joined = &mut fetch => joined.map_err(WorkerError::from).and_then(|r| r),
            _ = cancel.cancelled() => {
                fetch.abort();
                Err(WorkerError::Canceled)
            }
        };

        match outcome {
            Ok(bytes) => {
                tracing::info!(artifact_id = id, bytes, "Artifact downloaded");
                reporter.report(ArtifactStatus::Ready, format!("downloaded {} bytes", bytes));
            }
            Err(e) => {
                tracing::warn!(artifact_id = id, error = %e, "Artifact download failed");
                if let Err(rm) = tokio::fs::remove_file(&path).await {
                    if rm.kind() != std::io::ErrorKind::NotFound {
                        tracing::debug!(artifact_id = id, error = %rm, "Failed to remove partial download");
                    }
                }
                reporter.report(ArtifactStatus::Failed, e.to_string());
            }
        }
    }
}
