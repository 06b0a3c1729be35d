use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::pagination::{Filter, Record, SortKey};
use crate::status::Lifecycle;
use crate::{ArtifactId, JobId};

/// Job status. Declaration order is the forward-only lifecycle order, which
/// is also the order used when sorting by status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    New,
    Parsing,
    Downloading,
    Waiting,
    Running,
    Completed,
    Failed,
    Canceled,
}

impl JobStatus {
    /// Transitions only move forward and never leave a terminal state.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        !self.is_terminal() && next > self
    }
}

impl Lifecycle for JobStatus {
    fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Canceled
        )
    }

    fn abandoned() -> Self {
        JobStatus::Failed
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::New => write!(f, "NEW"),
            JobStatus::Parsing => write!(f, "PARSING"),
            JobStatus::Downloading => write!(f, "DOWNLOADING"),
            JobStatus::Waiting => write!(f, "WAITING"),
            JobStatus::Running => write!(f, "RUNNING"),
            JobStatus::Completed => write!(f, "COMPLETED"),
            JobStatus::Failed => write!(f, "FAILED"),
            JobStatus::Canceled => write!(f, "CANCELED"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobInfo {
    pub job_id: JobId,
    /// Job name from the parsed specification, empty until parsed.
    pub name: String,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub status: JobStatus,
    /// Message attached to the last status change.
    pub info: String,
    pub artifacts: Vec<ArtifactId>,
}

impl JobInfo {
    pub fn new(job_id: JobId) -> Self {
        let now = Utc::now();
        Self {
            job_id,
            name: String::new(),
            created: now,
            updated: now,
            status: JobStatus::New,
            info: String::new(),
            artifacts: Vec::new(),
        }
    }
}

impl Record for JobInfo {
    fn id(&self) -> u64 {
        self.job_id
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobSortKey {
    #[default]
    Id,
    CreatedDate,
    UpdatedDate,
    Status,
}

impl SortKey<JobInfo> for JobSortKey {
    fn compare(self, a: &JobInfo, b: &JobInfo) -> Ordering {
        match self {
            JobSortKey::Id => a.job_id.cmp(&b.job_id),
            JobSortKey::CreatedDate => a.created.cmp(&b.created),
            JobSortKey::UpdatedDate => a.updated.cmp(&b.updated),
            JobSortKey::Status => a.status.cmp(&b.status),
        }
    }
}

/// Field-level conditions; empty lists and unset bounds match everything.
/// Date bounds are inclusive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFilter {
    #[serde(default)]
    pub job_ids: Vec<JobId>,
    #[serde(default)]
    pub names: Vec<String>,
    #[serde(default)]
    pub statuses: Vec<JobStatus>,
    #[serde(default)]
    pub created_after: Option<DateTime<Utc>>,
    #[serde(default)]
    pub created_before: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_after: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_before: Option<DateTime<Utc>>,
    /// Substring of the status message
    #[serde(default)]
    pub info: Option<String>,
}

impl Filter<JobInfo> for JobFilter {
    fn matches(&self, job: &JobInfo) -> bool {
        (self.job_ids.is_empty() || self.job_ids.contains(&job.job_id))
            && (self.names.is_empty() || self.names.contains(&job.name))
            && (self.statuses.is_empty() || self.statuses.contains(&job.status))
            && self.created_after.map_or(true, |t| job.created >= t)
            && self.created_before.map_or(true, |t| job.created <= t)
            && self.updated_after.map_or(true, |t| job.updated >= t)
            && self.updated_before.map_or(true, |t| job.updated <= t)
            && self
                .info
                .as_ref()
                .map_or(true, |needle| job.info.contains(needle.as_str()))
    }
}
