use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::DispatcherConfig;
use crate::dryad::runner::{DryadRunner, RunSummary};
use crate::dryad::types::{Dryad, DryadJobFilter, DryadJobInfo, DryadJobStatus};
use crate::error::{Result, WelesError, WorkerError};
use crate::spec::JobConfig;
use crate::status::{Lifecycle, StatusReporter, StatusSender};
use crate::JobId;

/// What a dispatch needs besides the dryad.
#[derive(Debug, Clone)]
pub struct DispatchSpec {
    pub config: Arc<JobConfig>,
    /// File the runner appends test output to
    pub log_path: Option<PathBuf>,
}

struct DispatchEntry {
    info: DryadJobInfo,
    cancel: CancellationToken,
    finished_at: Option<Instant>,
}

type DispatchTable = Arc<RwLock<HashMap<JobId, DispatchEntry>>>;

/// Runs jobs on leased dryads, one task per dispatch.
///
/// Each dispatch goes WAITING -> RUNNING -> COMPLETED | FAILED, or CANCELED
/// from either non-terminal state. Its task is the only writer of its record
/// and reports every transition over the status channel given to
/// [`create`](DryadJobManager::create), ending with exactly one terminal
/// event. Finished records stay visible until reaped.
pub struct DryadJobManager {
    dispatches: DispatchTable,
    runner: Arc<dyn DryadRunner>,
    config: DispatcherConfig,
}

impl DryadJobManager {
    pub fn new(config: DispatcherConfig, runner: Arc<dyn DryadRunner>) -> Self {
        Self {
            dispatches: Arc::new(RwLock::new(HashMap::new())),
            runner,
            config,
        }
    }

    /// Start running `job_id` on `dryad`. Returns once the dispatch task is
    /// spawned.
    pub async fn create(
        &self,
        job_id: JobId,
        dryad: Dryad,
        spec: DispatchSpec,
        status_tx: StatusSender<DryadJobStatus>,
    ) -> Result<()> {
        let cancel = CancellationToken::new();
        {
            let mut dispatches = self.dispatches.write().await;
            if let Some(existing) = dispatches.get(&job_id) {
                if !existing.info.status.is_terminal() {
                    return Err(WelesError::AlreadyRunning(job_id));
                }
            }
            if let Some(busy) = dispatches
                .values()
                .find(|e| !e.info.status.is_terminal() && e.info.dryad.addr == dryad.addr)
            {
                return Err(WelesError::ResourceUnavailable(format!(
                    "dryad {} is busy with job {}",
                    dryad, busy.info.job_id
                )));
            }

            let now = Utc::now();
            dispatches.insert(
                job_id,
                DispatchEntry {
                    info: DryadJobInfo {
                        job_id,
                        dryad: dryad.clone(),
                        status: DryadJobStatus::Waiting,
                        info: "dispatch accepted".to_string(),
                        created: now,
                        updated: now,
                    },
                    cancel: cancel.clone(),
                    finished_at: None,
                },
            );
        }

        let timeout = spec
            .config
            .job_timeout()
            .unwrap_or(self.config.default_timeout);
        tracing::info!(job_id, dryad = %dryad, timeout_secs = timeout.as_secs(), "Dispatch started");

        tokio::spawn(Self::dispatch(
            job_id,
            dryad,
            spec,
            timeout,
            self.runner.clone(),
            self.dispatches.clone(),
            cancel,
            status_tx,
        ));
        Ok(())
    }

    /// Request cooperative termination. The dispatch acknowledges with a
    /// terminal event on its status channel.
    pub async fn cancel(&self, job_id: JobId) -> Result<()> {
        let dispatches = self.dispatches.read().await;
        let entry = dispatches
            .get(&job_id)
            .ok_or(WelesError::DispatchNotFound(job_id))?;
        if entry.info.status.is_terminal() {
            return Err(WelesError::AlreadyTerminal(job_id));
        }
        entry.cancel.cancel();
        tracing::info!(job_id, "Dispatch cancellation requested");
        Ok(())
    }

    pub async fn get(&self, job_id: JobId) -> Result<DryadJobInfo> {
        self.dispatches
            .read()
            .await
            .get(&job_id)
            .map(|entry| entry.info.clone())
            .ok_or(WelesError::DispatchNotFound(job_id))
    }

    /// Dispatch records matching `filter`, ordered by job ID.
    pub async fn list(&self, filter: &DryadJobFilter) -> Vec<DryadJobInfo> {
        let dispatches = self.dispatches.read().await;
        let mut infos: Vec<DryadJobInfo> = dispatches
            .values()
            .filter(|entry| filter.matches(&entry.info))
            .map(|entry| entry.info.clone())
            .collect();
        infos.sort_by_key(|info| info.job_id);
        infos
    }

    /// Drop finished records older than the configured reap interval. Returns
    /// the number of records removed.
    pub async fn reap_finished(&self) -> usize {
        let reap_after = self.config.reap_after;
        let mut dispatches = self.dispatches.write().await;
        let before = dispatches.len();
        dispatches.retain(|_, entry| match entry.finished_at {
            Some(at) => at.elapsed() < reap_after,
            None => true,
        });
        let reaped = before - dispatches.len();
        if reaped > 0 {
            tracing::debug!(reaped, "Reaped finished dispatches");
        }
        reaped
    }

    #[allow(clippy::too_many_arguments)]
    async fn dispatch(
        job_id: JobId,
        dryad: Dryad,
        spec: DispatchSpec,
        timeout: Duration,
        runner: Arc<dyn DryadRunner>,
        dispatches: DispatchTable,
        cancel: CancellationToken,
        status_tx: StatusSender<DryadJobStatus>,
    ) {
        let mut reporter = StatusReporter::new(job_id, status_tx);
        let deadline = Instant::now()
            .checked_add(timeout)
            .unwrap_or_else(|| Instant::now() + Duration::from_secs(86_400 * 365));

        Self::transition(
            &dispatches,
            &mut reporter,
            DryadJobStatus::Waiting,
            format!("preparing {}", dryad),
        )
        .await;

        let outcome = Self::run_phases(
            job_id,
            &dryad,
            &spec,
            &runner,
            &dispatches,
            &mut reporter,
            &cancel,
            deadline,
            timeout,
        )
        .await;

        let (status, info) = match outcome {
            Ok(summary) => (
                DryadJobStatus::Completed,
                format!("{} test cases passed", summary.passed),
            ),
            Err(WorkerError::Canceled) => (DryadJobStatus::Canceled, "canceled".to_string()),
            Err(e) => {
                tracing::warn!(job_id, dryad = %dryad, error = %e, "Dispatch failed");
                (DryadJobStatus::Failed, e.to_string())
            }
        };
        tracing::info!(job_id, dryad = %dryad, status = %status, "Dispatch finished");
        Self::transition(&dispatches, &mut reporter, status, info).await;
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_phases(
        job_id: JobId,
        dryad: &Dryad,
        spec: &DispatchSpec,
        runner: &Arc<dyn DryadRunner>,
        dispatches: &DispatchTable,
        reporter: &mut StatusReporter<DryadJobStatus>,
        cancel: &CancellationToken,
        deadline: Instant,
        timeout: Duration,
    ) -> std::result::Result<RunSummary, WorkerError> {
        let prepare = {
            let runner = runner.clone();
            let dryad = dryad.clone();
            let config = spec.config.clone();
            tokio::spawn(async move { runner.prepare(job_id, &dryad, &config).await })
        };
        Self::supervise(prepare, cancel, deadline, timeout).await?;

        Self::transition(
            dispatches,
            reporter,
            DryadJobStatus::Running,
            "running tests".to_string(),
        )
        .await;

        let execute = {
            let runner = runner.clone();
            let dryad = dryad.clone();
            let config = spec.config.clone();
            let log_path = spec.log_path.clone();
            tokio::spawn(async move {
                runner
                    .execute(job_id, &dryad, &config, log_path.as_deref())
                    .await
            })
        };
        Self::supervise(execute, cancel, deadline, timeout).await
    }

    /// Wait for a runner phase, containing panics and enforcing cancellation
    /// and the dispatch deadline.
    async fn supervise<T>(
        mut handle: JoinHandle<std::result::Result<T, WorkerError>>,
        cancel: &CancellationToken,
        deadline: Instant,
        timeout: Duration,
    ) -> std::result::Result<T, WorkerError> {
        tokio::select! {
            joined = &mut handle => joined.map_err(WorkerError::from).and_then(|r| r),
            _ = cancel.cancelled() => {
                handle.abort();
                Err(WorkerError::Canceled)
            }
            _ = tokio::time::sleep_until(deadline) => {
                handle.abort();
                Err(WorkerError::Timeout(timeout))
            }
        }
    }

    async fn transition(
        dispatches: &DispatchTable,
        reporter: &mut StatusReporter<DryadJobStatus>,
        status: DryadJobStatus,
        info: String,
    ) {
        {
            let mut dispatches = dispatches.write().await;
            if let Some(entry) = dispatches.get_mut(&reporter.id()) {
                entry.info.status = status;
                entry.info.info = info.clone();
                entry.info.updated = Utc::now().max(entry.info.updated);
                if status.is_terminal() {
                    entry.finished_at = Some(Instant::now());
                }
            }
        }
        tracing::debug!(job_id = reporter.id(), status = %status, info = %info, "Dispatch status updated");
        reporter.report(status, info);
    }
}
