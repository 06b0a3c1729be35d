use std::collections::BTreeSet;
use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use serde::Serialize;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use weles_lite::artifacts::{ArtifactFilter, ArtifactInfo, ArtifactSortKey};
use weles_lite::config::{DryadSlot, NodeConfig, RunnerTransport};
use weles_lite::dryad::Dryad;
use weles_lite::jobs::{JobInfo, JobStatus};
use weles_lite::node::Node;
use weles_lite::pagination::{Paginator, Sorter};
use weles_lite::shutdown::install_shutdown_handler;
use weles_lite::spec::{check_syntax, SpecParser, YamlSpecParser};
use weles_lite::status::Lifecycle;
use weles_lite::JobId;

#[derive(Parser, Debug)]
#[command(name = "weles-lite")]
#[command(version)]
#[command(about = "Run test jobs on leased dryads and track their artifacts")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start a node, run the given job specifications and wait for them
    Run(RunArgs),

    /// Validate job specifications without running them
    Check {
        /// Specification files (YAML)
        #[arg(required = true)]
        specs: Vec<PathBuf>,
    },
}

// =============================================================================
// Run Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct RunArgs {
    /// Artifact storage root (default: a directory under the system temp dir)
    #[arg(long)]
    storage: Option<PathBuf>,

    /// Dryad to add to the pool, format: "addr,user,device_type[,key_path]"
    /// Example: "10.0.0.2:22,root,rpi4,/home/me/.ssh/id_ed25519"
    #[arg(long = "dryad")]
    dryads: Vec<String>,

    /// How test commands reach the dryad
    #[arg(long, default_value = "local")]
    transport: Transport,

    /// Maximum concurrent artifact downloads
    #[arg(long, default_value = "4")]
    max_downloads: usize,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,

    /// Specification files (YAML)
    #[arg(required = true)]
    specs: Vec<PathBuf>,
}

#[derive(Debug, Clone, ValueEnum)]
enum Transport {
    Local,
    Ssh,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct RunOutput {
    jobs: Vec<JobInfo>,
    artifacts: Vec<ArtifactInfo>,
    rejected: Vec<RejectedSpec>,
}

#[derive(Serialize)]
struct RejectedSpec {
    path: PathBuf,
    error: String,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn parse_dryad(value: &str) -> Option<DryadSlot> {
    let parts: Vec<&str> = value.split(',').map(str::trim).collect();
    let (addr, user, device_type, key) = match parts.as_slice() {
        [addr, user, device_type] => (*addr, *user, *device_type, None),
        [addr, user, device_type, key] => (*addr, *user, *device_type, Some(*key)),
        _ => {
            tracing::warn!(dryad = value, "Invalid dryad format, expected addr,user,device_type[,key_path]");
            return None;
        }
    };
    if addr.is_empty() || user.is_empty() || device_type.is_empty() {
        tracing::warn!(dryad = value, "Dryad address, user and device type must be set");
        return None;
    }

    let mut dryad = Dryad::new(addr, user);
    if let Some(key) = key.filter(|k| !k.is_empty()) {
        dryad = dryad.with_key(key);
    }
    Some(DryadSlot::new(dryad, device_type))
}

fn build_config(args: &RunArgs) -> NodeConfig {
    let mut config = match &args.storage {
        Some(root) => NodeConfig::new(root),
        None => NodeConfig::default(),
    };
    config.storage.max_concurrent_downloads = args.max_downloads.max(1);
    config.runner.transport = match args.transport {
        Transport::Local => RunnerTransport::Local,
        Transport::Ssh => RunnerTransport::Ssh,
    };
    for slot in args.dryads.iter().filter_map(|d| parse_dryad(d)) {
        config = config.with_dryad(slot);
    }
    config
}

fn print_change(job_id: JobId, status: JobStatus, info: &str) {
    if info.is_empty() {
        println!("job {:<6} {}", job_id, status);
    } else {
        println!("job {:<6} {:<12} {}", job_id, status, info);
    }
}

// =============================================================================
// Command Handlers
// =============================================================================

async fn run_jobs(args: RunArgs) -> Result<bool, Box<dyn std::error::Error>> {
    let config = build_config(&args);
    tracing::info!(
        storage = %config.storage.root.display(),
        dryads = ?config.broker.dryads.iter().map(|s| s.dryad.to_string()).collect::<Vec<_>>(),
        transport = ?config.runner.transport,
        "Starting weles-lite node"
    );

    let interrupt = install_shutdown_handler();
    let node_shutdown = CancellationToken::new();
    let node = Node::start(config, node_shutdown.clone());
    let mut changes = BroadcastStream::new(node.jobs.subscribe());
    let table = matches!(args.output, OutputFormat::Table);

    let mut submitted = Vec::new();
    let mut rejected = Vec::new();
    for path in &args.specs {
        let created = match tokio::fs::read(path).await {
            Ok(spec) => node.jobs.create_job(&spec).await,
            Err(e) => Err(e.into()),
        };
        match created {
            Ok(job_id) => {
                if table {
                    println!("Submitted {} as job {}", path.display(), job_id);
                }
                submitted.push(job_id);
            }
            Err(e) => {
                eprintln!("Error: {}: {}", path.display(), e);
                rejected.push(RejectedSpec {
                    path: path.clone(),
                    error: e.to_string(),
                });
            }
        }
    }

    let mut pending: BTreeSet<JobId> = submitted.iter().copied().collect();
    let mut canceling = false;
    while !pending.is_empty() {
        tokio::select! {
            change = changes.next() => match change {
                Some(Ok(change)) if pending.contains(&change.id) => {
                    if table {
                        print_change(change.id, change.status, &change.info);
                    }
                    if change.status.is_terminal() {
                        pending.remove(&change.id);
                    }
                }
                Some(Ok(_)) => {}
                Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => {
                    tracing::warn!(skipped, "Status stream lagged, refreshing job states");
                    let ids: Vec<JobId> = pending.iter().copied().collect();
                    for job in node.jobs.jobs(&ids).await? {
                        if job.status.is_terminal() {
                            pending.remove(&job.job_id);
                        }
                    }
                }
                None => break,
            },
            _ = interrupt.cancelled(), if !canceling => {
                canceling = true;
                eprintln!("Interrupted, canceling {} outstanding jobs...", pending.len());
                for &job_id in &pending {
                    if let Err(e) = node.jobs.cancel_job(job_id).await {
                        tracing::debug!(job_id, error = %e, "Job not canceled");
                    }
                }
            }
        }
    }

    let jobs = node.jobs.jobs(&submitted).await?;
    let filter = ArtifactFilter {
        job_ids: submitted.clone(),
        ..Default::default()
    };
    let artifacts = node
        .artifacts
        .list_artifacts(
            &filter,
            &Sorter::ascending(ArtifactSortKey::Id),
            &Paginator::default(),
        )
        .await?
        .records;
    node.shutdown();

    let succeeded =
        rejected.is_empty() && jobs.iter().all(|job| job.status == JobStatus::Completed);

    match args.output {
        OutputFormat::Json => {
            let output = RunOutput {
                jobs,
                artifacts,
                rejected,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            println!();
            if jobs.is_empty() {
                println!("No jobs ran.");
            } else {
                println!("{:<8} {:<20} {:<12} INFO", "JOB ID", "NAME", "STATUS");
                println!("{}", "-".repeat(78));
                for job in &jobs {
                    let name = if job.name.is_empty() { "-" } else { job.name.as_str() };
                    println!(
                        "{:<8} {:<20} {:<12} {}",
                        job.job_id, name, job.status, job.info
                    );
                }
            }

            if !artifacts.is_empty() {
                println!();
                println!(
                    "{:<8} {:<8} {:<8} {:<12} PATH",
                    "ID", "JOB ID", "TYPE", "STATUS"
                );
                println!("{}", "-".repeat(78));
                for artifact in &artifacts {
                    println!(
                        "{:<8} {:<8} {:<8} {:<12} {}",
                        artifact.id,
                        artifact.description.job_id,
                        artifact.description.artifact_type,
                        artifact.status,
                        artifact.path.display()
                    );
                }
            }
        }
    }

    Ok(succeeded)
}

async fn check_specs(specs: Vec<PathBuf>) -> Result<bool, Box<dyn std::error::Error>> {
    let parser = YamlSpecParser;
    let mut all_valid = true;

    for path in specs {
        let spec = tokio::fs::read(&path).await?;
        let result = check_syntax(&spec)
            .map_err(|e| e.to_string())
            .and_then(|()| parser.parse(&spec).map_err(|e| e.to_string()));
        match result {
            Ok(config) => println!(
                "OK    {} (job {:?}, {} images, {} test cases)",
                path.display(),
                config.job_name,
                config.images.len(),
                config.tests.len()
            ),
            Err(e) => {
                all_valid = false;
                println!("FAIL  {}: {}", path.display(), e);
            }
        }
    }

    Ok(all_valid)
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let succeeded = match args.command {
        Commands::Run(run_args) => run_jobs(run_args).await?,
        Commands::Check { specs } => check_specs(specs).await?,
    };

    if !succeeded {
        std::process::exit(1);
    }
    Ok(())
}
