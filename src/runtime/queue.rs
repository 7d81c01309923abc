//! Remote batch queue submission
//!
//! A [`RemoteQueue`] accepts a rendered command plus a resource request and
//! returns an opaque handle; polling the handle yields a [`RemoteStatus`].
//! [`CommandQueue`] drives a command-line scheduler (SLURM by default) and
//! [`wait_for_job`] is the per-job polling loop run by scheduler workers.

use crate::config::QueueCommands;
use crate::error::ExecutionError;
use crate::runtime::executor::{STDERR_LOG, STDOUT_LOG};
use crate::runtime::invocation::{shell_quote, Command};
use crate::workflow::{placeholder, ResourceRequest};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Opaque identifier of a submitted job
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubmissionHandle(pub String);

impl fmt::Display for SubmissionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What the queue reports about a job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteStatus {
    Pending,
    Running,
    Succeeded,
    /// Terminal failure with the queue's state text
    Failed(String),
    /// The queue no longer knows the job and gave no terminal state
    Lost,
}

/// One job handed to a remote queue
#[derive(Debug, Clone)]
pub struct RemoteJob {
    /// Instance key, used as the job name
    pub name: String,
    pub command: Command,
    pub resources: ResourceRequest,
    /// Run-level default queue; `resources.queue` overrides it
    pub queue: Option<String>,
}

impl RemoteJob {
    /// Shell line run on the compute node, logs redirected like local runs
    pub fn script(&self) -> String {
        format!("{} > {} 2> {}", self.command.to_shell(), STDOUT_LOG, STDERR_LOG)
    }

    fn queue_name(&self) -> Option<&str> {
        self.resources.queue.as_deref().or(self.queue.as_deref())
    }
}

/// Pluggable remote submission backend
#[async_trait]
pub trait RemoteQueue: Send + Sync {
    async fn submit(&self, job: &RemoteJob) -> Result<SubmissionHandle, ExecutionError>;

    async fn poll(&self, handle: &SubmissionHandle) -> Result<RemoteStatus, ExecutionError>;

    /// Best-effort revocation of a submitted job
    async fn cancel(&self, handle: &SubmissionHandle) -> Result<(), ExecutionError>;
}

/// Polling behaviour for submitted jobs
#[derive(Debug, Clone, Copy)]
pub struct PollPolicy {
    pub interval: Duration,
    /// Consecutive `Lost` polls tolerated before the job counts as lost
    pub lost_retries: u32,
}

/// Poll a submitted job until it reaches a terminal state
///
/// Cancelling the token revokes the job and returns `Cancelled`.
pub async fn wait_for_job(
    queue: &dyn RemoteQueue,
    handle: &SubmissionHandle,
    policy: PollPolicy,
    cancel: &CancellationToken,
) -> Result<(), ExecutionError> {
    let mut lost_polls = 0u32;
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::warn!("🛑 Revoking remote job {}", handle);
                if let Err(e) = queue.cancel(handle).await {
                    tracing::warn!("⚠️ Failed to revoke remote job {}: {}", handle, e);
                }
                return Err(ExecutionError::Cancelled);
            }
            _ = tokio::time::sleep(policy.interval) => {}
        }

        let status = match queue.poll(handle).await {
            Ok(status) => status,
            Err(e) => {
                tracing::warn!("⚠️ Status poll for {} failed: {}", handle, e);
                RemoteStatus::Lost
            }
        };

        match status {
            RemoteStatus::Pending | RemoteStatus::Running => lost_polls = 0,
            RemoteStatus::Succeeded => return Ok(()),
            RemoteStatus::Failed(state) => {
                return Err(ExecutionError::RemoteFailed {
                    handle: handle.to_string(),
                    state,
                })
            }
            RemoteStatus::Lost => {
                lost_polls += 1;
                tracing::debug!("❓ Remote job {} unknown to the queue ({} polls)", handle, lost_polls);
                if lost_polls >= policy.lost_retries.max(1) {
                    return Err(ExecutionError::Lost {
                        handle: handle.to_string(),
                        polls: lost_polls,
                    });
                }
            }
        }
    }
}

/// Remote queue driven by external submit/status/cancel commands
#[derive(Debug, Clone)]
pub struct CommandQueue {
    commands: QueueCommands,
}

impl CommandQueue {
    /// Queue driven by the given command templates
    pub fn new(commands: QueueCommands) -> Self {
        Self { commands }
    }

    async fn run(&self, argv: &[String]) -> Result<std::process::Output, ExecutionError> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| ExecutionError::Submission("empty queue command".to_string()))?;
        tokio::process::Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ExecutionError::Spawn {
                program: program.clone(),
                message: e.to_string(),
            })
    }

    /// First non-empty stdout line of a status command, if any
    async fn query(&self, template: &[String], handle: &SubmissionHandle) -> Result<Option<String>, ExecutionError> {
        if template.is_empty() {
            return Ok(None);
        }
        let values = HashMap::from([("handle", handle.0.clone())]);
        let output = self.run(&render_argv(template, &values)).await?;
        if !output.status.success() {
            // finished jobs make squeue exit non-zero
            return Ok(None);
        }
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .map(String::from))
    }
}

#[async_trait]
impl RemoteQueue for CommandQueue {
    async fn submit(&self, job: &RemoteJob) -> Result<SubmissionHandle, ExecutionError> {
        let mut values = HashMap::from([
            ("name", job.name.clone()),
            ("cwd", job.command.cwd.display().to_string()),
            ("command", job.script()),
        ]);
        if let Some(queue) = job.queue_name() {
            values.insert("queue", queue.to_string());
        }
        if let Some(cpus) = job.resources.cpus {
            values.insert("cpus", cpus.to_string());
        }
        if let Some(memory) = &job.resources.memory {
            values.insert("memory", memory.clone());
        }
        if let Some(walltime) = &job.resources.walltime {
            values.insert("walltime", walltime.clone());
        }

        tokio::fs::create_dir_all(&job.command.cwd).await?;
        let argv = render_argv(&self.commands.submit, &values);
        tracing::debug!("📤 Submitting {}: {}", job.name, argv.iter().map(|a| shell_quote(a)).collect::<Vec<_>>().join(" "));

        let output = self.run(&argv).await?;
        if !output.status.success() {
            return Err(ExecutionError::Submission(format!(
                "submit command exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        parse_handle(&String::from_utf8_lossy(&output.stdout))
            .ok_or_else(|| ExecutionError::Submission("submit command printed no job id".to_string()))
    }

    async fn poll(&self, handle: &SubmissionHandle) -> Result<RemoteStatus, ExecutionError> {
        let state = match self.query(&self.commands.status, handle).await? {
            Some(state) => Some(state),
            None => self.query(&self.commands.status_fallback, handle).await?,
        };
        Ok(state.map_or(RemoteStatus::Lost, |s| map_state(&s)))
    }

    async fn cancel(&self, handle: &SubmissionHandle) -> Result<(), ExecutionError> {
        let values = HashMap::from([("handle", handle.0.clone())]);
        let output = self.run(&render_argv(&self.commands.cancel, &values)).await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(ExecutionError::Submission(format!(
                "cancel command exited with {}",
                output.status
            )))
        }
    }
}

/// Render a command template; arguments naming an unset value are dropped
fn render_argv(template: &[String], values: &HashMap<&str, String>) -> Vec<String> {
    template
        .iter()
        .filter_map(|arg| match placeholder::render(arg, |name| values.get(name).cloned()) {
            Ok(rendered) => Some(rendered),
            Err(name) => {
                tracing::debug!("Dropping queue argument '{}': no value for '{}'", arg, name);
                None
            }
        })
        .collect()
}

/// Job id from submit output, e.g. `12345` or `12345;cluster`
fn parse_handle(stdout: &str) -> Option<SubmissionHandle> {
    let line = stdout.lines().map(str::trim).find(|l| !l.is_empty())?;
    let id = line.split(';').next()?.trim();
    // sbatch without --parsable prints "Submitted batch job <id>"
    let id = id.rsplit(' ').next()?;
    (!id.is_empty()).then(|| SubmissionHandle(id.to_string()))
}

/// Map scheduler state text to a status
pub fn map_state(raw: &str) -> RemoteStatus {
    let state = raw
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .trim_end_matches('+')
        .to_ascii_uppercase();
    match state.as_str() {
        "" => RemoteStatus::Lost,
        "PENDING" | "CONFIGURING" | "REQUEUED" | "REQUEUE_HOLD" | "RESV_DEL_HOLD" | "SUSPENDED" => {
            RemoteStatus::Pending
        }
        "RUNNING" | "COMPLETING" | "STAGE_OUT" | "SIGNALING" | "RESIZING" => RemoteStatus::Running,
        "COMPLETED" => RemoteStatus::Succeeded,
        "FAILED" | "CANCELLED" | "TIMEOUT" | "NODE_FAIL" | "OUT_OF_MEMORY" | "BOOT_FAIL" | "DEADLINE"
        | "PREEMPTED" | "REVOKED" | "SPECIAL_EXIT" => RemoteStatus::Failed(state),
        other => {
            tracing::warn!("⚠️ Unrecognized queue state '{}', treating as running", other);
            RemoteStatus::Running
        }
    }
}
