//! Local process execution
//!
//! Runs one rendered command as a child process inside its node directory,
//! capturing stdout and stderr to `stdout.log` / `stderr.log`. The child is
//! killed when the run is cancelled or the worker future is dropped.

use crate::error::ExecutionError;
use crate::runtime::invocation::Command;
use std::path::Path;
use std::process::Stdio;
use tokio_util::sync::CancellationToken;

/// Captured standard output, inside the node directory
pub const STDOUT_LOG: &str = "stdout.log";
/// Captured standard error, inside the node directory
pub const STDERR_LOG: &str = "stderr.log";

/// Lines of `stderr.log` attached to a non-zero exit error
const STDERR_TAIL_LINES: usize = 20;

/// Executes commands as local child processes
#[derive(Debug, Clone, Default)]
pub struct LocalExecutor;

impl LocalExecutor {
    pub fn new() -> Self {
        Self
    }

    /// Run a command to completion
    ///
    /// Succeeds only on exit status zero; output checks are the caller's.
    pub async fn execute(&self, key: &str, command: &Command, cancel: &CancellationToken) -> Result<(), ExecutionError> {
        tracing::info!("🚀 Starting {}: {}", key, command.to_shell());
        let start_time = std::time::Instant::now();

        tokio::fs::create_dir_all(&command.cwd).await?;
        let stdout = std::fs::File::create(command.cwd.join(STDOUT_LOG))?;
        let stderr = std::fs::File::create(command.cwd.join(STDERR_LOG))?;

        let mut child = tokio::process::Command::new(&command.program)
            .args(&command.args)
            .current_dir(&command.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ExecutionError::Spawn {
                program: command.program.clone(),
                message: e.to_string(),
            })?;

        let status = tokio::select! {
            status = child.wait() => status?,
            _ = cancel.cancelled() => {
                tracing::warn!("🛑 Killing {} (run cancelled)", key);
                let _ = child.start_kill();
                let _ = child.wait().await;
                return Err(ExecutionError::Cancelled);
            }
        };

        let elapsed = start_time.elapsed();
        match status.code() {
            Some(0) => {
                tracing::info!("✅ {} exited cleanly in {:?}", key, elapsed);
                Ok(())
            }
            Some(code) => {
                let stderr_tail = stderr_tail(&command.cwd).await;
                tracing::error!("❌ {} exited with status {} after {:?}", key, code, elapsed);
                Err(ExecutionError::NonZeroExit {
                    program: command.program.clone(),
                    code,
                    stderr_tail,
                })
            }
            None => {
                tracing::error!("❌ {} was terminated by a signal after {:?}", key, elapsed);
                Err(ExecutionError::Terminated {
                    program: command.program.clone(),
                })
            }
        }
    }
}

/// Last lines of a node's `stderr.log`, joined with ` | `
pub async fn stderr_tail(node_dir: &Path) -> String {
    let Ok(raw) = tokio::fs::read_to_string(node_dir.join(STDERR_LOG)).await else {
        return String::new();
    };
    let lines: Vec<&str> = raw.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    lines[start..].join(" | ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(dir: &Path, script: &str) -> Command {
        Command {
            program: "sh".into(),
            args: vec!["-c".into(), script.into()],
            cwd: dir.to_path_buf(),
        }
    }

    #[tokio::test]
    async fn test_successful_run_captures_logs() {
        let dir = tempfile::tempdir().unwrap();
        let node_dir = dir.path().join("s1").join("recon");
        let command = sh(&node_dir, "echo hello; echo warn >&2; echo out > result.txt");

        LocalExecutor::new()
            .execute("recon[s1]", &command, &CancellationToken::new())
            .await
            .unwrap();

        let stdout = tokio::fs::read_to_string(node_dir.join(STDOUT_LOG)).await.unwrap();
        assert_eq!(stdout, "hello\n");
        assert!(node_dir.join("result.txt").exists());
        assert_eq!(stderr_tail(&node_dir).await, "warn");
    }

    #[tokio::test]
    async fn test_non_zero_exit_reports_stderr_tail() {
        let dir = tempfile::tempdir().unwrap();
        let command = sh(dir.path(), "echo 'ERROR: no T1 image' >&2; exit 3");

        let err = LocalExecutor::new()
            .execute("recon[s2]", &command, &CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            ExecutionError::NonZeroExit { code, stderr_tail, .. } => {
                assert_eq!(code, 3);
                assert_eq!(stderr_tail, "ERROR: no T1 image");
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_program_is_a_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let command = Command {
            program: "definitely-not-a-real-tool".into(),
            args: Vec::new(),
            cwd: dir.path().to_path_buf(),
        };
        let err = LocalExecutor::new()
            .execute("x", &command, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_cancellation_kills_the_child() {
        let dir = tempfile::tempdir().unwrap();
        let command = sh(dir.path(), "sleep 30");
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let err = LocalExecutor::new().execute("slow", &command, &cancel).await.unwrap_err();
        assert!(matches!(err, ExecutionError::Cancelled));
        assert!(started.elapsed() < std::time::Duration::from_secs(10));
    }
}
