use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::config::{RunnerConfig, RunnerTransport};
use crate::dryad::types::Dryad;
use crate::error::WorkerError;
use crate::spec::JobConfig;
use crate::JobId;

/// Test counts of a finished run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub passed: usize,
    pub failed: usize,
}

/// Capability to execute a job's test procedure on a dryad.
///
/// The dispatcher calls [`prepare`](DryadRunner::prepare) while the dispatch
/// is WAITING and [`execute`](DryadRunner::execute) once it is RUNNING. Both
/// may be aborted at any await point on cancellation or timeout.
#[async_trait]
pub trait DryadRunner: Send + Sync + 'static {
    async fn prepare(&self, job_id: JobId, dryad: &Dryad, config: &JobConfig)
        -> Result<(), WorkerError>;

    async fn execute(
        &self,
        job_id: JobId,
        dryad: &Dryad,
        config: &JobConfig,
        log_path: Option<&Path>,
    ) -> Result<RunSummary, WorkerError>;
}

/// Result of one test command
#[derive(Debug)]
pub struct CommandOutcome {
    pub command: String,
    pub success: bool,
    pub exit_code: Option<i32>,
    pub output: Option<String>,
    pub error: Option<String>,
}

/// Runs test commands through the shell, locally or on the dryad over ssh.
#[derive(Debug, Clone, Default)]
pub struct CommandRunner {
    config: RunnerConfig,
}

impl CommandRunner {
    pub fn new(config: RunnerConfig) -> Self {
        Self { config }
    }

    fn build_command(&self, dryad: &Dryad, command: &str) -> Command {
        let mut cmd = match self.config.transport {
            RunnerTransport::Local => {
                let mut cmd = Command::new(&self.config.shell);
                cmd.arg("-c").arg(command);
                cmd
            }
            RunnerTransport::Ssh => {
                let (host, port) = dryad.host_port();
                let mut args = vec![
                    "-p".to_string(),
                    port.to_string(),
                    "-o".to_string(),
                    "BatchMode=yes".to_string(),
                    "-o".to_string(),
                    format!("ConnectTimeout={}", self.config.connect_timeout_secs),
                    "-o".to_string(),
                    "StrictHostKeyChecking=accept-new".to_string(),
                ];
                if let Some(ref key) = dryad.key_path {
                    args.push("-i".to_string());
                    args.push(key.display().to_string());
                }
                args.push(format!("{}@{}", dryad.username, host));
                args.push("--".to_string());
                args.push(command.to_string());

                let mut cmd = Command::new("ssh");
                cmd.args(&args);
                cmd
            }
        };
        // Aborting the dispatch drops the child, which must not outlive it.
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    /// Run a single command against the dryad
    pub async fn run_command(&self, job_id: JobId, dryad: &Dryad, command: &str) -> CommandOutcome {
        tracing::debug!(job_id, dryad = %dryad, command, "Running test command");
        let result = self.build_command(dryad, command).output().await;
        Self::process_output(job_id, command, result)
    }

    fn process_output(
        job_id: JobId,
        command: &str,
        result: Result<std::process::Output, std::io::Error>,
    ) -> CommandOutcome {
        match result {
            Ok(output) => {
                let stdout = String::from_utf8_lossy(&output.stdout).to_string();
                let stderr = String::from_utf8_lossy(&output.stderr).to_string();
                let exit_code = output.status.code();
                let success = output.status.success();

                let error = if success {
                    None
                } else if stderr.is_empty() {
                    Some(format!("Exit code: {:?}", exit_code))
                } else {
                    Some(stderr)
                };

                tracing::debug!(job_id, command, success, exit_code = ?exit_code, "Test command finished");

                CommandOutcome {
                    command: command.to_string(),
                    success,
                    exit_code,
                    output: if stdout.is_empty() { None } else { Some(stdout) },
                    error,
                }
            }
            Err(e) => {
                tracing::warn!(job_id, command, error = %e, "Test command could not be started");
                CommandOutcome {
                    command: command.to_string(),
                    success: false,
                    exit_code: None,
                    output: None,
                    error: Some(e.to_string()),
                }
            }
        }
    }
}

async fn append_log(log: &mut Option<File>, text: &str) -> Result<(), WorkerError> {
    if let Some(file) = log.as_mut() {
        file.write_all(text.as_bytes()).await?;
    }
    Ok(())
}

#[async_trait]
impl DryadRunner for CommandRunner {
    async fn prepare(
        &self,
        job_id: JobId,
        dryad: &Dryad,
        _config: &JobConfig,
    ) -> Result<(), WorkerError> {
        if self.config.transport == RunnerTransport::Local {
            return Ok(());
        }

        let outcome = self.run_command(job_id, dryad, "true").await;
        if outcome.success {
            Ok(())
        } else {
            Err(WorkerError::CommandFailed {
                command: format!("ssh {}", dryad),
                reason: outcome.error.unwrap_or_default(),
            })
        }
    }

    async fn execute(
        &self,
        job_id: JobId,
        dryad: &Dryad,
        config: &JobConfig,
        log_path: Option<&Path>,
    ) -> Result<RunSummary, WorkerError> {
        let mut log = match log_path {
            Some(path) => Some(
                tokio::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .await?,
            ),
            None => None,
        };

        let mut summary = RunSummary::default();
        for test in &config.tests {
            append_log(&mut log, &format!("=== {} ===\n", test.name)).await?;

            let mut passed = true;
            for command in &test.commands {
                let outcome = self.run_command(job_id, dryad, command).await;
                append_log(&mut log, &format!("$ {}\n", outcome.command)).await?;
                if let Some(ref output) = outcome.output {
                    append_log(&mut log, output).await?;
                }
                if let Some(ref error) = outcome.error {
                    append_log(&mut log, error).await?;
                }
                if !outcome.success {
                    passed = false;
                    break;
                }
            }

            let verdict = if passed { "PASS" } else { "FAIL" };
            append_log(&mut log, &format!("--- {}: {}\n", test.name, verdict)).await?;
            if passed {
                summary.passed += 1;
            } else {
                summary.failed += 1;
            }
        }

        if let Some(mut file) = log {
            file.flush().await?;
        }

        tracing::info!(job_id, passed = summary.passed, failed = summary.failed, "Test run finished");

        if summary.failed > 0 {
            Err(WorkerError::TestsFailed {
                failed: summary.failed,
                total: summary.passed + summary.failed,
            })
        } else {
            Ok(summary)
        }
    }
}
