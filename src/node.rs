use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::artifacts::{ArtifactManager, Fetcher, UriFetcher};
use crate::broker::{DryadPool, ResourceBroker};
use crate::config::NodeConfig;
use crate::dryad::{CommandRunner, DryadJobManager, DryadRunner};
use crate::jobs::JobManager;
use crate::spec::{SpecParser, YamlSpecParser};

/// Shortest pause between housekeeping passes
const MIN_HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(1);

/// Main node that wires all components together
pub struct Node {
    pub config: NodeConfig,
    pub artifacts: Arc<ArtifactManager>,
    pub dispatcher: Arc<DryadJobManager>,
    pub broker: Arc<dyn ResourceBroker>,
    pub jobs: Arc<JobManager>,
    shutdown: CancellationToken,
}

impl Node {
    /// Start a node with the default collaborators: HTTP/file fetcher,
    /// command runner, static dryad pool and YAML parser.
    pub fn start(config: NodeConfig, shutdown: CancellationToken) -> Self {
        let fetcher = Arc::new(UriFetcher::new(Duration::from_secs(
            config.storage.download_timeout_secs,
        )));
        let runner = Arc::new(CommandRunner::new(config.runner.clone()));
        let broker = Arc::new(DryadPool::new(&config.broker));
        Self::with_components(
            config,
            fetcher,
            runner,
            broker,
            Arc::new(YamlSpecParser),
            shutdown,
        )
    }

    /// Start a node around caller-provided collaborators.
    ///
    /// Spawns the artifact and job event loops plus a housekeeping loop that
    /// reaps finished dispatches. All of them stop when `shutdown` fires.
    pub fn with_components(
        config: NodeConfig,
        fetcher: Arc<dyn Fetcher>,
        runner: Arc<dyn DryadRunner>,
        broker: Arc<dyn ResourceBroker>,
        parser: Arc<dyn SpecParser>,
        shutdown: CancellationToken,
    ) -> Self {
        let artifacts = ArtifactManager::start(&config.storage, fetcher, shutdown.clone());
        let dispatcher = Arc::new(DryadJobManager::new(config.dispatcher.clone(), runner));
        let jobs = JobManager::start(
            config.max_jobs,
            artifacts.clone(),
            dispatcher.clone(),
            broker.clone(),
            parser,
            shutdown.clone(),
        );

        let interval = (config.dispatcher.reap_after / 2).max(MIN_HOUSEKEEPING_INTERVAL);
        tokio::spawn(Self::housekeeping_loop(
            dispatcher.clone(),
            interval,
            shutdown.clone(),
        ));

        tracing::info!(
            storage = %config.storage.root.display(),
            dryads = config.broker.dryads.len(),
            max_jobs = config.max_jobs,
            "Node started"
        );

        Self {
            config,
            artifacts,
            dispatcher,
            broker,
            jobs,
            shutdown,
        }
    }

    /// Stop the event loops. Jobs still in flight keep their last status.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    async fn housekeeping_loop(
        dispatcher: Arc<DryadJobManager>,
        interval: Duration,
        shutdown: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    dispatcher.reap_finished().await;
                }
                _ = shutdown.cancelled() => {
                    tracing::debug!("Housekeeping loop stopped");
                    break;
                }
            }
        }
    }
}
