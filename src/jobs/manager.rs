use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::artifacts::{ArtifactDescription, ArtifactManager, ArtifactStatus, ArtifactType};
use crate::broker::ResourceBroker;
use crate::dryad::{DispatchSpec, Dryad, DryadJobManager, DryadJobStatus};
use crate::error::{Result, WelesError, WorkerError};
use crate::jobs::job::{JobFilter, JobInfo, JobSortKey, JobStatus};
use crate::jobs::table::JobTable;
use crate::pagination::{paginate, Page, Paginator, Sorter};
use crate::spec::{check_syntax, JobConfig, SpecParser};
use crate::status::{status_channel, Lifecycle, StatusChange, StatusReceiver, StatusSender};
use crate::JobId;

const CHANGES_CAPACITY: usize = 1024;

/// Alias of the stored specification artifact
pub const SPEC_ALIAS: &str = "job.yaml";
/// Alias of the result log created at dispatch
pub const RESULTS_ALIAS: &str = "results.log";

enum JobEvent {
    Created { job_id: JobId, spec: Arc<[u8]> },
    Parsed {
        job_id: JobId,
        result: std::result::Result<JobConfig, WorkerError>,
    },
    Acquired { job_id: JobId, result: Result<Dryad> },
    CancelRequested(JobId),
    Abort { job_id: JobId, reason: String },
}

/// Registry of jobs and driver of their lifecycle.
///
/// A job moves NEW -> PARSING -> DOWNLOADING -> WAITING -> RUNNING and ends
/// COMPLETED, FAILED or CANCELED. One aggregator task owns every status
/// write: it consumes internal events plus the status channels of the
/// artifact registry and the dispatcher, so job state never races with the
/// work it depends on.
pub struct JobManager {
    table: Arc<Mutex<JobTable>>,
    artifacts: Arc<ArtifactManager>,
    events_tx: mpsc::UnboundedSender<JobEvent>,
    changes_tx: broadcast::Sender<StatusChange<JobStatus>>,
}

impl JobManager {
    /// Create the registry and spawn its aggregator, which runs until
    /// `shutdown` is cancelled.
    pub fn start(
        max_jobs: usize,
        artifacts: Arc<ArtifactManager>,
        dispatcher: Arc<DryadJobManager>,
        broker: Arc<dyn ResourceBroker>,
        parser: Arc<dyn SpecParser>,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        let table = Arc::new(Mutex::new(JobTable::with_capacity(max_jobs)));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (changes_tx, _) = broadcast::channel(CHANGES_CAPACITY);
        let (artifact_tx, artifact_rx) = status_channel();
        let (dryad_tx, dryad_rx) = status_channel();

        let aggregator = Aggregator {
            table: table.clone(),
            artifacts: artifacts.clone(),
            dispatcher,
            broker,
            parser,
            events_tx: events_tx.clone(),
            artifact_tx,
            dryad_tx,
            changes_tx: changes_tx.clone(),
        };
        tokio::spawn(aggregator.run(events_rx, artifact_rx, dryad_rx, shutdown));

        Arc::new(Self {
            table,
            artifacts,
            events_tx,
            changes_tx,
        })
    }

    /// Register a job from raw specification bytes and start processing it.
    ///
    /// Only syntax is checked here; a specification that is well-formed
    /// but invalid is accepted and the job later ends FAILED.
    pub async fn create_job(&self, spec: &[u8]) -> Result<JobId> {
        check_syntax(spec)?;

        let job = {
            let mut table = self.table.lock().await;
            if table.is_full() {
                return Err(WelesError::RegistryFull(table.capacity()));
            }
            table.create()
        };
        let job_id = job.job_id;
        let _ = self.changes_tx.send(StatusChange {
            id: job_id,
            status: JobStatus::New,
            info: job.info,
            at: job.created,
        });
        self.artifacts.register_owner(job_id).await;

        match self.store_spec(job_id, spec).await {
            Ok(()) => self.send(JobEvent::Created {
                job_id,
                spec: Arc::from(spec),
            })?,
            Err(e) => {
                tracing::warn!(job_id, error = %e, "Failed to store job specification");
                self.send(JobEvent::Abort {
                    job_id,
                    reason: format!("storing specification failed: {}", e),
                })?;
            }
        }

        tracing::info!(job_id, "Job created");
        Ok(job_id)
    }

    /// Request cancellation. The job becomes CANCELED once every download
    /// and dispatch it started has stopped.
    pub async fn cancel_job(&self, job_id: JobId) -> Result<()> {
        {
            let mut table = self.table.lock().await;
            let entry = table
                .get_mut(job_id)
                .ok_or(WelesError::JobNotFound(job_id))?;
            if entry.info.status.is_terminal() {
                return Err(WelesError::AlreadyTerminal(job_id));
            }
            if entry.cancel_requested {
                return Ok(());
            }
            entry.cancel_requested = true;
        }

        self.send(JobEvent::CancelRequested(job_id))?;
        tracing::info!(job_id, "Job cancellation requested");
        Ok(())
    }

    pub async fn list_jobs(
        &self,
        filter: &JobFilter,
        sorter: &Sorter<JobSortKey>,
        paginator: &Paginator,
    ) -> Result<Page<JobInfo>> {
        let table = self.table.lock().await;
        paginate(table.infos(), filter, sorter, paginator)
    }

    pub async fn job(&self, job_id: JobId) -> Result<JobInfo> {
        self.table
            .lock()
            .await
            .get(job_id)
            .map(|entry| entry.info.clone())
            .ok_or(WelesError::JobNotFound(job_id))
    }

    /// Records for `ids` in the given order, or every job when `ids` is
    /// empty.
    pub async fn jobs(&self, ids: &[JobId]) -> Result<Vec<JobInfo>> {
        let table = self.table.lock().await;
        if ids.is_empty() {
            return Ok(table.infos().cloned().collect());
        }
        ids.iter()
            .map(|&id| {
                table
                    .get(id)
                    .map(|entry| entry.info.clone())
                    .ok_or(WelesError::JobNotFound(id))
            })
            .collect()
    }

    /// Stream of every applied job status change.
    pub fn subscribe(&self) -> broadcast::Receiver<StatusChange<JobStatus>> {
        self.changes_tx.subscribe()
    }

    async fn store_spec(&self, job_id: JobId, spec: &[u8]) -> Result<()> {
        let desc = ArtifactDescription::new(
            job_id,
            ArtifactType::Yaml,
            SPEC_ALIAS,
            format!("job://{}/{}", job_id, SPEC_ALIAS),
        );
        let path = self.artifacts.create_artifact(desc).await?;
        tokio::fs::write(&path, spec).await?;
        let info = self.artifacts.get_artifact_info(&path).await?;
        self.table.lock().await.link_artifact(job_id, info.id);
        Ok(())
    }

    fn send(&self, event: JobEvent) -> Result<()> {
        self.events_tx
            .send(event)
            .map_err(|_| WelesError::Internal("job registry is shut down".to_string()))
    }
}

/// The single writer of job status.
struct Aggregator {
    table: Arc<Mutex<JobTable>>,
    artifacts: Arc<ArtifactManager>,
    dispatcher: Arc<DryadJobManager>,
    broker: Arc<dyn ResourceBroker>,
    parser: Arc<dyn SpecParser>,
    events_tx: mpsc::UnboundedSender<JobEvent>,
    artifact_tx: StatusSender<ArtifactStatus>,
    dryad_tx: StatusSender<DryadJobStatus>,
    changes_tx: broadcast::Sender<StatusChange<JobStatus>>,
}

impl Aggregator {
    async fn run(
        self,
        mut events_rx: mpsc::UnboundedReceiver<JobEvent>,
        mut artifact_rx: StatusReceiver<ArtifactStatus>,
        mut dryad_rx: StatusReceiver<DryadJobStatus>,
        shutdown: CancellationToken,
    ) {
        tracing::debug!("Job aggregator started");
        loop {
            tokio::select! {
                Some(event) = events_rx.recv() => self.handle_event(event).await,
                Some(change) = artifact_rx.recv() => self.on_artifact(change).await,
                Some(change) = dryad_rx.recv() => self.on_dispatch(change).await,
                _ = shutdown.cancelled() => {
                    tracing::info!("Job aggregator shutting down");
                    break;
                }
            }
        }
    }

    async fn handle_event(&self, event: JobEvent) {
        match event {
            JobEvent::Created { job_id, spec } => self.on_created(job_id, spec).await,
            JobEvent::Parsed { job_id, result } => self.on_parsed(job_id, result).await,
            JobEvent::Acquired { job_id, result } => self.on_acquired(job_id, result).await,
            JobEvent::CancelRequested(job_id) => self.on_cancel_requested(job_id).await,
            JobEvent::Abort { job_id, reason } => self.fail(job_id, reason).await,
        }
    }

    async fn on_created(&self, job_id: JobId, spec: Arc<[u8]>) {
        let parsing = {
            let mut table = self.table.lock().await;
            let Some(entry) = table.get_mut(job_id) else {
                return;
            };
            if entry.info.status.is_terminal() {
                return;
            }
            entry.parsing = !entry.cancel_requested;
            entry.parsing
        };
        if !parsing {
            self.finish_cancel_if_idle(job_id).await;
            return;
        }

        self.set_status(job_id, JobStatus::Parsing, "parsing specification")
            .await;

        let parser = self.parser.clone();
        let events_tx = self.events_tx.clone();
        tokio::spawn(async move {
            let result = tokio::task::spawn_blocking(move || parser.parse(&spec))
                .await
                .map_err(WorkerError::from)
                .and_then(|r| r);
            let _ = events_tx.send(JobEvent::Parsed { job_id, result });
        });
    }

    async fn on_parsed(
        &self,
        job_id: JobId,
        result: std::result::Result<JobConfig, WorkerError>,
    ) {
        let next = {
            let mut table = self.table.lock().await;
            let Some(entry) = table.get_mut(job_id) else {
                return;
            };
            entry.parsing = false;
            if entry.info.status.is_terminal() {
                return;
            }
            if entry.cancel_requested {
                None
            } else {
                Some(result.map(|config| {
                    entry.info.name = config.job_name.clone();
                    let config = Arc::new(config);
                    entry.config = Some(config.clone());
                    config
                }))
            }
        };

        match next {
            None => self.finish_cancel_if_idle(job_id).await,
            Some(Err(e)) => {
                tracing::warn!(job_id, error = %e, "Job specification rejected");
                self.fail(job_id, e.to_string()).await;
            }
            Some(Ok(config)) => self.download_images(job_id, config).await,
        }
    }

    async fn download_images(&self, job_id: JobId, config: Arc<JobConfig>) {
        if config.images.is_empty() {
            self.await_dryad(job_id, config).await;
            return;
        }

        self.set_status(
            job_id,
            JobStatus::Downloading,
            format!("downloading {} images", config.images.len()),
        )
        .await;

        for image in &config.images {
            let desc =
                ArtifactDescription::new(job_id, ArtifactType::Image, &image.alias, &image.uri);
            let pushed = match self
                .artifacts
                .push_artifact(desc, self.artifact_tx.clone())
                .await
            {
                Ok(path) => self.artifacts.get_artifact_info(&path).await,
                Err(e) => Err(e),
            };

            match pushed {
                Ok(artifact) => {
                    let mut table = self.table.lock().await;
                    table.link_artifact(job_id, artifact.id);
                    if let Some(entry) = table.get_mut(job_id) {
                        entry.pending_images.insert(artifact.id);
                        entry.active_pushes.insert(artifact.id);
                    }
                }
                Err(e) => {
                    self.fail(job_id, format!("image {}: {}", image.alias, e))
                        .await;
                    return;
                }
            }
        }
    }

    async fn await_dryad(&self, job_id: JobId, config: Arc<JobConfig>) {
        let cancel = CancellationToken::new();
        if let Some(entry) = self.table.lock().await.get_mut(job_id) {
            entry.acquiring = true;
            entry.acquire_cancel = Some(cancel.clone());
        }
        self.set_status(job_id, JobStatus::Waiting, "waiting for a dryad")
            .await;

        let broker = self.broker.clone();
        let events_tx = self.events_tx.clone();
        tokio::spawn(async move {
            let capabilities = config.capabilities.clone();
            let mut acquire =
                tokio::spawn(async move { broker.acquire(job_id, &capabilities).await });
            let result = tokio::select! {
                joined = &mut acquire => joined
                    .unwrap_or_else(|e| Err(WelesError::Internal(format!("broker task: {}", e)))),
                _ = cancel.cancelled() => {
                    acquire.abort();
                    // A lease granted just before the abort is handed back for release.
                    match acquire.await {
                        Ok(Ok(dryad)) => Ok(dryad),
                        _ => Err(WelesError::ResourceUnavailable("acquisition canceled".to_string())),
                    }
                }
            };
            let _ = events_tx.send(JobEvent::Acquired { job_id, result });
        });
    }

    async fn on_artifact(&self, change: StatusChange<ArtifactStatus>) {
        enum Next {
            Nothing,
            FinishCancel(JobId),
            Fail(JobId, String),
            AwaitDryad(JobId, Arc<JobConfig>),
        }

        let next = {
            let mut table = self.table.lock().await;
            let Some(job_id) = table.owner_of(change.id) else {
                return;
            };
            let Some(entry) = table.get_mut(job_id) else {
                return;
            };
            if change.status.is_terminal() {
                entry.active_pushes.remove(&change.id);
            }

            if entry.info.status.is_terminal() {
                Next::Nothing
            } else if entry.cancel_requested {
                Next::FinishCancel(job_id)
            } else {
                match change.status {
                    ArtifactStatus::Failed => Next::Fail(
                        job_id,
                        format!("image artifact {} failed: {}", change.id, change.info),
                    ),
                    ArtifactStatus::Ready => {
                        entry.pending_images.remove(&change.id);
                        match &entry.config {
                            Some(config)
                                if entry.pending_images.is_empty()
                                    && entry.info.status == JobStatus::Downloading =>
                            {
                                Next::AwaitDryad(job_id, config.clone())
                            }
                            _ => Next::Nothing,
                        }
                    }
                    ArtifactStatus::Pending | ArtifactStatus::Downloading => Next::Nothing,
                }
            }
        };

        match next {
            Next::Nothing => {}
            Next::FinishCancel(job_id) => self.finish_cancel_if_idle(job_id).await,
            Next::Fail(job_id, reason) => self.fail(job_id, reason).await,
            Next::AwaitDryad(job_id, config) => self.await_dryad(job_id, config).await,
        }
    }

    async fn on_acquired(&self, job_id: JobId, result: Result<Dryad>) {
        let proceed = {
            let mut table = self.table.lock().await;
            match table.get_mut(job_id) {
                Some(entry) => {
                    entry.acquiring = false;
                    entry.acquire_cancel = None;
                    if entry.info.status.is_terminal() || entry.cancel_requested {
                        None
                    } else {
                        entry.config.clone()
                    }
                }
                None => None,
            }
        };

        let Some(config) = proceed else {
            if let Ok(dryad) = result {
                self.broker.release(&dryad).await;
            }
            self.finish_cancel_if_idle(job_id).await;
            return;
        };

        match result {
            Ok(dryad) => self.dispatch(job_id, dryad, config).await,
            Err(e) => self.fail(job_id, e.to_string()).await,
        }
    }

    async fn dispatch(&self, job_id: JobId, dryad: Dryad, config: Arc<JobConfig>) {
        let desc = ArtifactDescription::new(
            job_id,
            ArtifactType::Result,
            RESULTS_ALIAS,
            format!("dryad://{}/{}", dryad.addr, RESULTS_ALIAS),
        );
        let log_path = match self.artifacts.create_artifact(desc).await {
            Ok(path) => {
                if let Ok(artifact) = self.artifacts.get_artifact_info(&path).await {
                    self.table.lock().await.link_artifact(job_id, artifact.id);
                }
                Some(path)
            }
            Err(e) => {
                tracing::warn!(job_id, error = %e, "Failed to create result log");
                None
            }
        };

        let spec = DispatchSpec { config, log_path };
        match self
            .dispatcher
            .create(job_id, dryad.clone(), spec, self.dryad_tx.clone())
            .await
        {
            Ok(()) => {
                if let Some(entry) = self.table.lock().await.get_mut(job_id) {
                    entry.dryad = Some(dryad);
                    entry.dispatched = true;
                }
            }
            Err(e) => {
                self.broker.release(&dryad).await;
                self.fail(job_id, format!("dispatch failed: {}", e)).await;
            }
        }
    }

    async fn on_dispatch(&self, change: StatusChange<DryadJobStatus>) {
        let job_id = change.id;
        let (next, leased, canceling) = {
            let mut table = self.table.lock().await;
            let Some(entry) = table.get_mut(job_id) else {
                return;
            };
            let mut leased = None;
            if change.status.is_terminal() {
                entry.dispatched = false;
                leased = entry.dryad.take();
            }

            let next = match change.status {
                DryadJobStatus::Waiting => None,
                DryadJobStatus::Running => Some(JobStatus::Running),
                DryadJobStatus::Completed => Some(JobStatus::Completed),
                DryadJobStatus::Failed => Some(JobStatus::Failed),
                DryadJobStatus::Canceled => Some(JobStatus::Canceled),
            };
            let active = !entry.info.status.is_terminal();
            (next.filter(|_| active), leased, active && entry.cancel_requested)
        };

        if let Some(dryad) = leased {
            self.broker.release(&dryad).await;
        }

        // Once cancellation is accepted the dispatch outcome only acknowledges it.
        if canceling {
            self.finish_cancel_if_idle(job_id).await;
        } else if let Some(status) = next {
            self.set_status(job_id, status, change.info).await;
        }
    }

    async fn on_cancel_requested(&self, job_id: JobId) {
        let dispatched = {
            let table = self.table.lock().await;
            match table.get(job_id) {
                Some(entry) if !entry.info.status.is_terminal() => {
                    if let Some(cancel) = &entry.acquire_cancel {
                        cancel.cancel();
                    }
                    entry.dispatched
                }
                _ => return,
            }
        };

        self.artifacts.cancel_pushes(job_id).await;
        if dispatched {
            if let Err(e) = self.dispatcher.cancel(job_id).await {
                tracing::debug!(job_id, error = %e, "Dispatch already finishing");
            }
        }
        self.finish_cancel_if_idle(job_id).await;
    }

    /// Move a cancel-requested job to CANCELED once nothing it started is
    /// still running.
    async fn finish_cancel_if_idle(&self, job_id: JobId) {
        let ready = match self.table.lock().await.get(job_id) {
            Some(entry) => {
                entry.cancel_requested
                    && !entry.info.status.is_terminal()
                    && !entry.has_active_dependents()
            }
            None => false,
        };
        if ready {
            self.set_status(job_id, JobStatus::Canceled, "canceled by user")
                .await;
        }
    }

    /// Fail the job and stop everything it started. The dryad is released
    /// when the dispatch acknowledges.
    async fn fail(&self, job_id: JobId, reason: String) {
        let dispatched = {
            let table = self.table.lock().await;
            match table.get(job_id) {
                Some(entry) if !entry.info.status.is_terminal() => {
                    if let Some(cancel) = &entry.acquire_cancel {
                        cancel.cancel();
                    }
                    entry.dispatched
                }
                _ => return,
            }
        };

        tracing::warn!(job_id, reason = %reason, "Job failed");
        self.set_status(job_id, JobStatus::Failed, reason).await;
        self.artifacts.cancel_pushes(job_id).await;
        if dispatched {
            let _ = self.dispatcher.cancel(job_id).await;
        }
    }

    async fn set_status(&self, job_id: JobId, status: JobStatus, info: impl Into<String>) {
        let change = self
            .table
            .lock()
            .await
            .set_status(job_id, status, info.into());
        if let Some(change) = change {
            if status.is_terminal() {
                tracing::info!(job_id, status = %status, info = %change.info, "Job finished");
            } else {
                tracing::debug!(job_id, status = %status, "Job status updated");
            }
            let _ = self.changes_tx.send(change);
        }
    }
}
