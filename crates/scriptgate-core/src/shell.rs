//! OS command passthrough with a hard wall-clock bound.

use std::process::Stdio;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use scriptgate_config::ShellConfig;

use crate::error::GatewayError;

#[derive(Debug, thiserror::Error)]
pub enum ShellError {
    #[error("failed to run command: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("command timed out after {0:?}")]
    Timeout(Duration),
}

impl From<ShellError> for GatewayError {
    fn from(err: ShellError) -> Self {
        match err {
            ShellError::Timeout(limit) => GatewayError::Timeout(limit),
            spawn @ ShellError::Spawn(_) => GatewayError::runtime(spawn.to_string()),
        }
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShellOutcome {
    pub stdout: String,
    pub stderr: String,
    /// Process exit code; -1 when terminated by a signal.
    pub exit_code: i32,
}

/// Runs command lines through the platform shell.
#[derive(Debug, Clone)]
pub struct ShellRunner {
    default_timeout: Duration,
    max_timeout: Duration,
}

impl ShellRunner {
    pub fn new(default_timeout: Duration, max_timeout: Duration) -> Self {
        Self {
            default_timeout,
            max_timeout: max_timeout.max(default_timeout),
        }
    }

    pub fn from_config(config: &ShellConfig) -> Self {
        Self::new(
            Duration::from_secs(config.default_timeout_secs),
            Duration::from_secs(config.max_timeout_secs),
        )
    }

    /// The bound applied to a call: the requested one clamped to the
    /// configured maximum, or the default.
    pub fn effective_timeout(&self, requested: Option<Duration>) -> Duration {
        requested.map_or(self.default_timeout, |t| t.min(self.max_timeout))
    }

    /// Run `command` to completion or until the bound elapses. A timed-out
    /// child is killed.
    pub async fn run(&self, command: &str, timeout: Option<Duration>) -> Result<ShellOutcome, ShellError> {
        let limit = self.effective_timeout(timeout);
        let start = Instant::now();

        let child = shell_command(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let output = match tokio::time::timeout(limit, child.wait_with_output()).await {
            Ok(waited) => waited?,
            Err(_) => {
                tracing::warn!(timeout_secs = limit.as_secs_f64(), "shell command timed out");
                return Err(ShellError::Timeout(limit));
            }
        };

        let outcome = ShellOutcome {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(-1),
        };
        tracing::debug!(
            exit_code = outcome.exit_code,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "shell command finished"
        );
        Ok(outcome)
    }
}

#[cfg(windows)]
fn shell_command(command: &str) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new("cmd");
    cmd.arg("/C").arg(command);
    cmd
}

#[cfg(not(windows))]
fn shell_command(command: &str) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new("sh");
    cmd.arg("-c").arg(command);
    cmd
}
