use std::cmp::Ordering;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::pagination::{Filter, Record, SortKey};
use crate::status::Lifecycle;
use crate::{ArtifactId, JobId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ArtifactType {
    Image,
    Result,
    Test,
    Yaml,
}

impl ArtifactType {
    /// Directory name used in the storage layout.
    pub fn dir_name(self) -> &'static str {
        match self {
            ArtifactType::Image => "image",
            ArtifactType::Result => "result",
            ArtifactType::Test => "test",
            ArtifactType::Yaml => "yaml",
        }
    }
}

impl fmt::Display for ArtifactType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArtifactType::Image => write!(f, "IMAGE"),
            ArtifactType::Result => write!(f, "RESULT"),
            ArtifactType::Test => write!(f, "TEST"),
            ArtifactType::Yaml => write!(f, "YAML"),
        }
    }
}

/// Artifact status. Declaration order is the lifecycle order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ArtifactStatus {
    Pending,
    Downloading,
    Ready,
    Failed,
}

impl ArtifactStatus {
    /// PENDING to FAILED skips DOWNLOADING; it only happens to a push
    /// canceled before its download started.
    pub fn can_transition_to(self, next: ArtifactStatus) -> bool {
        use ArtifactStatus::*;
        matches!(
            (self, next),
            (Pending, Downloading) | (Pending, Failed) | (Downloading, Ready) | (Downloading, Failed)
        )
    }
}

impl Lifecycle for ArtifactStatus {
    fn is_terminal(self) -> bool {
        matches!(self, ArtifactStatus::Ready | ArtifactStatus::Failed)
    }

    fn abandoned() -> Self {
        ArtifactStatus::Failed
    }
}

impl fmt::Display for ArtifactStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArtifactStatus::Pending => write!(f, "PENDING"),
            ArtifactStatus::Downloading => write!(f, "DOWNLOADING"),
            ArtifactStatus::Ready => write!(f, "READY"),
            ArtifactStatus::Failed => write!(f, "FAILED"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactDescription {
    pub alias: String,
    pub job_id: JobId,
    #[serde(rename = "type")]
    pub artifact_type: ArtifactType,
    pub uri: String,
}

impl ArtifactDescription {
    pub fn new(
        job_id: JobId,
        artifact_type: ArtifactType,
        alias: impl Into<String>,
        uri: impl Into<String>,
    ) -> Self {
        Self {
            alias: alias.into(),
            job_id,
            artifact_type,
            uri: uri.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactInfo {
    pub id: ArtifactId,
    pub description: ArtifactDescription,
    pub path: PathBuf,
    pub status: ArtifactStatus,
    /// Time of the last status change.
    pub timestamp: DateTime<Utc>,
}

impl Record for ArtifactInfo {
    fn id(&self) -> u64 {
        self.id
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactSortKey {
    #[default]
    Id,
    Timestamp,
    Status,
    Type,
}

impl SortKey<ArtifactInfo> for ArtifactSortKey {
    fn compare(self, a: &ArtifactInfo, b: &ArtifactInfo) -> Ordering {
        match self {
            ArtifactSortKey::Id => a.id.cmp(&b.id),
            ArtifactSortKey::Timestamp => a.timestamp.cmp(&b.timestamp),
            ArtifactSortKey::Status => a.status.cmp(&b.status),
            ArtifactSortKey::Type => a.description.artifact_type.cmp(&b.description.artifact_type),
        }
    }
}

/// Field-level conditions; an empty list matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactFilter {
    #[serde(default)]
    pub job_ids: Vec<JobId>,
    #[serde(default)]
    pub types: Vec<ArtifactType>,
    #[serde(default)]
    pub statuses: Vec<ArtifactStatus>,
    #[serde(default)]
    pub aliases: Vec<String>,
}

impl Filter<ArtifactInfo> for ArtifactFilter {
    fn matches(&self, artifact: &ArtifactInfo) -> bool {
        let desc = &artifact.description;
        (self.job_ids.is_empty() || self.job_ids.contains(&desc.job_id))
            && (self.types.is_empty() || self.types.contains(&desc.artifact_type))
            && (self.statuses.is_empty() || self.statuses.contains(&artifact.status))
            && (self.aliases.is_empty() || self.aliases.iter().any(|a| *a == desc.alias))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn artifact_transitions_only_move_forward() {
        use ArtifactStatus::*;
        assert!(Pending.can_transition_to(Downloading));
        assert!(Downloading.can_transition_to(Ready));
        assert!(Downloading.can_transition_to(Failed));
        assert!(Pending.can_transition_to(Failed));
        assert!(!Pending.can_transition_to(Ready));
        assert!(!Ready.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Downloading));
        assert!(!Downloading.can_transition_to(Pending));
    }

    #[test]
    fn filter_combines_fields() {
        let info = ArtifactInfo {
            id: 1,
            description: ArtifactDescription::new(4, ArtifactType::Image, "boot", "file:///x"),
            path: PathBuf::from("/tmp/x"),
            status: ArtifactStatus::Ready,
            timestamp: Utc::now(),
        };

        assert!(ArtifactFilter::default().matches(&info));
        let by_job = ArtifactFilter {
            job_ids: vec![4],
            types: vec![ArtifactType::Image],
            ..Default::default()
        };
        assert!(by_job.matches(&info));
        let wrong_status = ArtifactFilter {
            statuses: vec![ArtifactStatus::Failed],
            ..Default::default()
        };
        assert!(!wrong_status.matches(&info));
    }
}
