use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::status::Lifecycle;
use crate::JobId;

/// Access handle for a leased dryad.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dryad {
    /// `host:port` of the dryad's ssh endpoint
    pub addr: String,
    pub username: String,
    /// Identity file used to log in
    #[serde(default)]
    pub key_path: Option<PathBuf>,
}

impl Dryad {
    pub fn new(addr: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            username: username.into(),
            key_path: None,
        }
    }

    pub fn with_key(mut self, key_path: impl Into<PathBuf>) -> Self {
        self.key_path = Some(key_path.into());
        self
    }

    /// Host and port, with port 22 when the address has none.
    pub fn host_port(&self) -> (&str, u16) {
        match self.addr.rsplit_once(':') {
            Some((host, port)) => match port.parse() {
                Ok(port) => (host, port),
                Err(_) => (self.addr.as_str(), 22),
            },
            None => (self.addr.as_str(), 22),
        }
    }
}

impl fmt::Display for Dryad {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.username, self.addr)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DryadJobStatus {
    Waiting,
    Running,
    Completed,
    Failed,
    Canceled,
}

impl Lifecycle for DryadJobStatus {
    fn is_terminal(self) -> bool {
        matches!(
            self,
            DryadJobStatus::Completed | DryadJobStatus::Failed | DryadJobStatus::Canceled
        )
    }

    fn abandoned() -> Self {
        DryadJobStatus::Failed
    }
}

impl fmt::Display for DryadJobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DryadJobStatus::Waiting => write!(f, "WAITING"),
            DryadJobStatus::Running => write!(f, "RUNNING"),
            DryadJobStatus::Completed => write!(f, "COMPLETED"),
            DryadJobStatus::Failed => write!(f, "FAILED"),
            DryadJobStatus::Canceled => write!(f, "CANCELED"),
        }
    }
}

/// Runtime record of one dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DryadJobInfo {
    pub job_id: JobId,
    pub dryad: Dryad,
    pub status: DryadJobStatus,
    /// Last reported message
    pub info: String,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DryadJobFilter {
    #[serde(default)]
    pub job_ids: Vec<JobId>,
    #[serde(default)]
    pub statuses: Vec<DryadJobStatus>,
    /// Dryad addresses
    #[serde(default)]
    pub dryads: Vec<String>,
}

impl DryadJobFilter {
    pub fn matches(&self, info: &DryadJobInfo) -> bool {
        (self.job_ids.is_empty() || self.job_ids.contains(&info.job_id))
            && (self.statuses.is_empty() || self.statuses.contains(&info.status))
            && (self.dryads.is_empty() || self.dryads.contains(&info.dryad.addr))
    }
}
