//! Mock command runner for testing.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::command::{CommandError, CommandOutput, CommandRunner};

/// A recorded command for test assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCommand {
    pub path: PathBuf,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

impl RecordedCommand {
    /// Installer phase, i.e. the second argument.
    pub fn phase(&self) -> Option<&str> {
        self.args.get(1).map(String::as_str)
    }

    /// Value of `KS_PRODUCT_ID` in the command's environment.
    pub fn product_id(&self) -> Option<&str> {
        self.env.get("KS_PRODUCT_ID").map(String::as_str)
    }
}

/// Mock implementation of the CommandRunner trait.
///
/// Commands succeed unless an exit code is configured for their installer
/// phase or product. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MockCommandRunner {
    /// Recorded commands, in order.
    commands: Arc<RwLock<Vec<RecordedCommand>>>,
    /// Exit codes by installer phase.
    phase_codes: Arc<RwLock<HashMap<String, i32>>>,
    /// Exit codes by product id, applied to the `install` phase.
    product_codes: Arc<RwLock<HashMap<String, i32>>>,
    /// If set, the next command fails to spawn with this reason.
    next_error: Arc<RwLock<Option<String>>>,
}

impl MockCommandRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Exit with `code` whenever the installer phase is `phase`.
    pub async fn set_exit_code_for_phase(&self, phase: &str, code: i32) {
        self.phase_codes.write().await.insert(phase.to_string(), code);
    }

    /// Exit with `code` from the `install` phase of `product_id`.
    pub async fn set_exit_code_for_product(&self, product_id: &str, code: i32) {
        self.product_codes
            .write()
            .await
            .insert(product_id.to_string(), code);
    }

    /// Make the next command fail to spawn.
    pub async fn fail_next(&self, reason: &str) {
        *self.next_error.write().await = Some(reason.to_string());
    }

    /// Get all recorded commands.
    pub async fn recorded_commands(&self) -> Vec<RecordedCommand> {
        self.commands.read().await.clone()
    }

    /// Products whose `install` phase ran, in order.
    pub async fn installed_products(&self) -> Vec<String> {
        self.commands
            .read()
            .await
            .iter()
            .filter(|c| c.phase() == Some("install"))
            .filter_map(|c| c.product_id().map(str::to_string))
            .collect()
    }
}

#[async_trait]
impl CommandRunner for MockCommandRunner {
    async fn run_command(
        &self,
        path: &Path,
        args: &[String],
        env: &BTreeMap<String, String>,
    ) -> Result<CommandOutput, CommandError> {
        let command = RecordedCommand {
            path: path.to_path_buf(),
            args: args.to_vec(),
            env: env.clone(),
        };
        self.commands.write().await.push(command.clone());

        if let Some(reason) = self.next_error.write().await.take() {
            return Err(CommandError::Spawn {
                path: path.to_path_buf(),
                reason,
            });
        }

        let mut exit_code = 0;
        if let Some(phase) = command.phase() {
            if let Some(code) = self.phase_codes.read().await.get(phase) {
                exit_code = *code;
            }
            if let (Some(product_id), "install") = (command.product_id(), phase) {
                if let Some(code) = self.product_codes.read().await.get(product_id) {
                    exit_code = *code;
                }
            }
        }

        Ok(CommandOutput {
            exit_code,
            output: String::new(),
        })
    }
}
