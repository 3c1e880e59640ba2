//! Running installer commands.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

/// Result of a finished command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, or -1 if the process was killed by a signal.
    pub exit_code: i32,
    /// Combined stdout and stderr.
    pub output: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("Failed to run {path}: {reason}")]
    Spawn { path: PathBuf, reason: String },
}

/// Executes external commands on behalf of install actions.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `path` with `args` in an environment containing exactly `env`.
    async fn run_command(
        &self,
        path: &Path,
        args: &[String],
        env: &BTreeMap<String, String>,
    ) -> Result<CommandOutput, CommandError>;
}

/// Runs commands as child processes of the current process.
#[derive(Debug, Clone, Default)]
pub struct TaskCommandRunner;

impl TaskCommandRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for TaskCommandRunner {
    async fn run_command(
        &self,
        path: &Path,
        args: &[String],
        env: &BTreeMap<String, String>,
    ) -> Result<CommandOutput, CommandError> {
        debug!(path = %path.display(), ?args, "Running command");

        let output = Command::new(path)
            .args(args)
            .env_clear()
            .envs(env)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| CommandError::Spawn {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        let exit_code = output.status.code().unwrap_or(-1);

        debug!(path = %path.display(), exit_code, "Command finished");
        Ok(CommandOutput {
            exit_code,
            output: text,
        })
    }
}
