use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use crate::dryad::Dryad;

/// Where artifacts live and how many may download at once.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Root directory of the artifact storage layout
    pub root: PathBuf,
    /// Upper bound on concurrently running artifact fetches
    pub max_concurrent_downloads: usize,
    /// Per-request timeout for HTTP fetches, in seconds
    pub download_timeout_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: std::env::temp_dir().join("weles-lite").join("artifacts"),
            max_concurrent_downloads: 4,
            download_timeout_secs: 300,
        }
    }
}

impl StorageConfig {
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Timeout applied to dispatches whose job sets none
    pub default_timeout: Duration,
    /// Finished dispatch records older than this are reaped
    pub reap_after: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(3600),
            reap_after: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunnerTransport {
    /// Run test commands on this host through the shell
    #[default]
    Local,
    /// Run test commands on the dryad over ssh
    Ssh,
}

/// Configuration for the command-based dryad runner.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub transport: RunnerTransport,
    /// ssh `ConnectTimeout`, in seconds
    pub connect_timeout_secs: u64,
    /// Shell used for local execution
    pub shell: String,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            transport: RunnerTransport::Local,
            connect_timeout_secs: 10,
            shell: "sh".to_string(),
        }
    }
}

/// A dryad in the static pool, with what it can offer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DryadSlot {
    pub dryad: Dryad,
    pub device_type: String,
    pub labels: BTreeSet<String>,
}

impl DryadSlot {
    pub fn new(dryad: Dryad, device_type: impl Into<String>) -> Self {
        Self {
            dryad,
            device_type: device_type.into(),
            labels: BTreeSet::new(),
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.labels.insert(label.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// How long an acquire waits for a matching dryad to be released
    pub acquire_timeout: Duration,
    pub dryads: Vec<DryadSlot>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            acquire_timeout: Duration::from_secs(300),
            dryads: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Maximum number of job records the registry holds
    pub max_jobs: usize,
    pub storage: StorageConfig,
    pub dispatcher: DispatcherConfig,
    pub runner: RunnerConfig,
    pub broker: BrokerConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            max_jobs: 10_000,
            storage: StorageConfig::default(),
            dispatcher: DispatcherConfig::default(),
            runner: RunnerConfig::default(),
            broker: BrokerConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn new(storage_root: impl Into<PathBuf>) -> Self {
        Self {
            storage: StorageConfig::with_root(storage_root),
            ..Default::default()
        }
    }

    pub fn with_dryad(mut self, slot: DryadSlot) -> Self {
        self.broker.dryads.push(slot);
        self
    }
}
