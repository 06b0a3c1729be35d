//! Job specification documents.
//!
//! [`check_syntax`] is the cheap synchronous gate applied when a job is
//! created. Full parsing and validation happen later through a
//! [`SpecParser`], and their failures fail the job instead of the call.

use std::collections::{BTreeSet, HashSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, WelesError, WorkerError};

/// Dryad constraints a job needs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    #[serde(default)]
    pub device_type: Option<String>,
    #[serde(default)]
    pub labels: BTreeSet<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timeouts {
    /// Limit for the whole dispatch, in seconds.
    #[serde(default)]
    pub job: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSpec {
    pub uri: String,
    pub alias: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCase {
    pub name: String,
    pub commands: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobConfig {
    pub job_name: String,
    #[serde(flatten)]
    pub capabilities: Capabilities,
    #[serde(default)]
    pub timeouts: Timeouts,
    #[serde(default)]
    pub images: Vec<ImageSpec>,
    #[serde(default)]
    pub tests: Vec<TestCase>,
}

impl JobConfig {
    pub fn job_timeout(&self) -> Option<Duration> {
        self.timeouts.job.map(Duration::from_secs)
    }

    pub fn validate(&self) -> std::result::Result<(), WorkerError> {
        if self.job_name.trim().is_empty() {
            return Err(WorkerError::Parse("job_name is empty".to_string()));
        }
        if self.tests.is_empty() {
            return Err(WorkerError::Parse("no test cases".to_string()));
        }
        if let Some(test) = self.tests.iter().find(|t| t.commands.is_empty()) {
            return Err(WorkerError::Parse(format!(
                "test case {} has no commands",
                test.name
            )));
        }
        let mut aliases = HashSet::new();
        for image in &self.images {
            if !aliases.insert(image.alias.as_str()) {
                return Err(WorkerError::Parse(format!(
                    "duplicate image alias {}",
                    image.alias
                )));
            }
        }
        Ok(())
    }
}

/// Turns raw specification bytes into a validated [`JobConfig`].
pub trait SpecParser: Send + Sync + 'static {
    fn parse(&self, spec: &[u8]) -> std::result::Result<JobConfig, WorkerError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct YamlSpecParser;

impl SpecParser for YamlSpecParser {
    fn parse(&self, spec: &[u8]) -> std::result::Result<JobConfig, WorkerError> {
        let config: JobConfig =
            serde_yaml::from_slice(spec).map_err(|e| WorkerError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}

/// Reject input that is not a YAML mapping.
pub fn check_syntax(spec: &[u8]) -> Result<()> {
    let text = std::str::from_utf8(spec)
        .map_err(|e| WelesError::MalformedSpec(format!("not UTF-8: {}", e)))?;
    let value: serde_yaml::Value =
        serde_yaml::from_str(text).map_err(|e| WelesError::MalformedSpec(e.to_string()))?;
    if !value.is_mapping() {
        return Err(WelesError::MalformedSpec(
            "top level must be a mapping".to_string(),
        ));
    }
    Ok(())
}
