use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::dryad::Dryad;
use crate::jobs::job::{JobInfo, JobStatus};
use crate::spec::JobConfig;
use crate::status::StatusChange;
use crate::{ArtifactId, JobId};

/// A job record plus the bookkeeping of its in-flight dependents.
#[derive(Debug, Clone)]
pub(crate) struct JobEntry {
    pub info: JobInfo,
    pub config: Option<Arc<JobConfig>>,
    /// Dryad leased for this job, until released
    pub dryad: Option<Dryad>,
    /// Image artifacts not READY yet
    pub pending_images: HashSet<ArtifactId>,
    /// Pushed artifacts without a terminal status yet
    pub active_pushes: HashSet<ArtifactId>,
    pub parsing: bool,
    pub acquiring: bool,
    /// Stops a pending dryad acquisition
    pub acquire_cancel: Option<CancellationToken>,
    pub dispatched: bool,
    pub cancel_requested: bool,
}

impl JobEntry {
    fn new(info: JobInfo) -> Self {
        Self {
            info,
            config: None,
            dryad: None,
            pending_images: HashSet::new(),
            active_pushes: HashSet::new(),
            parsing: false,
            acquiring: false,
            acquire_cancel: None,
            dispatched: false,
            cancel_requested: false,
        }
    }

    pub fn has_active_dependents(&self) -> bool {
        self.parsing || self.acquiring || self.dispatched || !self.active_pushes.is_empty()
    }
}

/// Job records keyed by ID, in creation order.
#[derive(Debug)]
pub(crate) struct JobTable {
    last_id: JobId,
    jobs: BTreeMap<JobId, JobEntry>,
    artifact_owners: HashMap<ArtifactId, JobId>,
    max_jobs: usize,
}

impl JobTable {
    pub fn with_capacity(max_jobs: usize) -> Self {
        Self {
            last_id: 0,
            jobs: BTreeMap::new(),
            artifact_owners: HashMap::new(),
            max_jobs,
        }
    }

    pub fn capacity(&self) -> usize {
        self.max_jobs
    }

    pub fn is_full(&self) -> bool {
        self.jobs.len() >= self.max_jobs
    }

    /// Allocate the next job ID and store a NEW record for it.
    pub fn create(&mut self) -> JobInfo {
        self.last_id += 1;
        let info = JobInfo::new(self.last_id);
        self.jobs.insert(info.job_id, JobEntry::new(info.clone()));
        info
    }

    pub fn get(&self, id: JobId) -> Option<&JobEntry> {
        self.jobs.get(&id)
    }

    pub fn get_mut(&mut self, id: JobId) -> Option<&mut JobEntry> {
        self.jobs.get_mut(&id)
    }

    pub fn infos(&self) -> impl Iterator<Item = &JobInfo> {
        self.jobs.values().map(|entry| &entry.info)
    }

    pub fn link_artifact(&mut self, job_id: JobId, artifact_id: ArtifactId) {
        if let Some(entry) = self.jobs.get_mut(&job_id) {
            entry.info.artifacts.push(artifact_id);
            self.artifact_owners.insert(artifact_id, job_id);
        }
    }

    pub fn owner_of(&self, artifact_id: ArtifactId) -> Option<JobId> {
        self.artifact_owners.get(&artifact_id).copied()
    }

    /// Move a job to `status` if the lifecycle allows it. Returns the applied
    /// change.
    pub fn set_status(
        &mut self,
        id: JobId,
        status: JobStatus,
        info: String,
    ) -> Option<StatusChange<JobStatus>> {
        let entry = self.jobs.get_mut(&id)?;
        let current = entry.info.status;
        if !current.can_transition_to(status) {
            tracing::warn!(job_id = id, from = %current, to = %status, "Rejected job status transition");
            return None;
        }

        // Keep `updated` non-decreasing even if the wall clock steps back.
        let now = Utc::now().max(entry.info.updated);
        entry.info.status = status;
        entry.info.updated = now;
        entry.info.info = info.clone();

        Some(StatusChange {
            id,
            status,
            info,
            at: now,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_strictly_increasing() {
        let mut table = JobTable::with_capacity(10);
        let a = table.create().job_id;
        let b = table.create().job_id;
        let c = table.create().job_id;
        assert!(a < b && b < c);
    }

    #[test]
    fn capacity_is_enforced_by_is_full() {
        let mut table = JobTable::with_capacity(2);
        table.create();
        assert!(!table.is_full());
        table.create();
        assert!(table.is_full());
    }

    #[test]
    fn set_status_moves_forward_only() {
        let mut table = JobTable::with_capacity(10);
        let id = table.create().job_id;

        assert!(table.set_status(id, JobStatus::Parsing, "p".into()).is_some());
        assert!(table.set_status(id, JobStatus::New, "back".into()).is_none());
        assert!(table.set_status(id, JobStatus::Running, "skip ahead".into()).is_some());
        assert!(table.set_status(id, JobStatus::Completed, "done".into()).is_some());
        assert!(table.set_status(id, JobStatus::Canceled, "late".into()).is_none());

        let entry = table.get(id).unwrap();
        assert_eq!(entry.info.status, JobStatus::Completed);
        assert_eq!(entry.info.info, "done");
        assert!(entry.info.updated >= entry.info.created);
    }

    #[test]
    fn artifacts_are_linked_to_owner() {
        let mut table = JobTable::with_capacity(10);
        let id = table.create().job_id;
        table.link_artifact(id, 7);
        table.link_artifact(99, 8);

        assert_eq!(table.owner_of(7), Some(id));
        assert_eq!(table.owner_of(8), None);
        assert_eq!(table.get(id).unwrap().info.artifacts, vec![7]);
    }

    #[test]
    fn unknown_job_status_update_is_ignored() {
        let mut table = JobTable::with_capacity(10);
        assert!(table.set_status(5, JobStatus::Parsing, String::new()).is_none());
    }
}
