//! Stage runtime adapters
//!
//! Each adapter is a thin shell over external tools (git, the build
//! toolchain, the infrastructure tool, test runners). Failures surface as
//! `StageExecutionError` and are never retried here.

pub mod build;
pub mod checkout;
pub mod deploy;
pub mod test_stage;

pub use build::BuildStage;
pub use checkout::checkout;
pub use deploy::{EnvironmentDeployStage, StackOutput, StackResult};
pub use test_stage::{CommandResult, TestRunSummary, TestStage};

use crate::core::error::StageExecutionError;
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

/// Default per-command timeout (one hour; infrastructure deploys are slow)
pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 3600;

/// Structured record every stage emits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    pub success: bool,
    pub data: StageData,
    /// RFC 3339, UTC
    pub timestamp: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageData {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl StageResult {
    fn new(success: bool, message: impl Into<String>) -> Self {
        Self {
            success,
            data: StageData {
                message: message.into(),
                artifact_path: None,
                details: None,
            },
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    }

    pub fn success(message: impl Into<String>) -> Self {
        Self::new(true, message)
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self::new(false, message)
    }

    pub fn with_artifact_path(mut self, path: impl Into<String>) -> Self {
        self.data.artifact_path = Some(path.into());
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.data.details = Some(details);
        self
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Extract a named field for downstream wiring
    ///
    /// A bare name is looked up in `data`, then at the top level. A dotted
    /// path (`data.details.stacks`) is walked from the root. Strings come
    /// back unquoted, anything else as JSON.
    pub fn field(&self, name: &str) -> Option<String> {
        let root = serde_json::to_value(self).ok()?;
        let value = if name.contains('.') {
            name.split('.')
                .try_fold(&root, |value, segment| value.get(segment))?
        } else {
            root.get("data")
                .and_then(|data| data.get(name))
                .or_else(|| root.get(name))?
        };
        Some(match value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }
}

/// Output of one shell command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Why a command produced no exit code
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RunError {
    #[error("failed to spawn: {0}")]
    Spawn(String),

    #[error("timed out after {0} seconds")]
    Timeout(u64),
}

impl RunError {
    pub fn into_stage_error(self, stage: &str, command: &str) -> StageExecutionError {
        match self {
            RunError::Spawn(reason) => StageExecutionError::Spawn {
                stage: stage.to_string(),
                command: command.to_string(),
                reason,
            },
            RunError::Timeout(secs) => StageExecutionError::Timeout {
                stage: stage.to_string(),
                command: command.to_string(),
                secs,
            },
        }
    }
}

/// Trait for command execution - allows stages to run against a fake
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `command` through a shell in `dir`
    async fn run(
        &self,
        command: &str,
        dir: &Path,
        env: &[(String, String)],
    ) -> Result<CommandOutput, RunError>;
}

/// Runs commands with `bash -c`
#[derive(Debug, Clone)]
pub struct ShellRunner {
    shell: String,
    timeout_secs: u64,
}

impl Default for ShellRunner {
    fn default() -> Self {
        Self::new(DEFAULT_COMMAND_TIMEOUT_SECS)
    }
}

impl ShellRunner {
    pub fn new(timeout_secs: u64) -> Self {
        Self {
            shell: "bash".to_string(),
            timeout_secs,
        }
    }

    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }
}

#[async_trait]
impl CommandRunner for ShellRunner {
    async fn run(
        &self,
        command: &str,
        dir: &Path,
        env: &[(String, String)],
    ) -> Result<CommandOutput, RunError> {
        debug!("Running `{}` in {}", command, dir.display());
        let started = Instant::now();

        let result = timeout(
            Duration::from_secs(self.timeout_secs),
            Command::new(&self.shell)
                .arg("-c")
                .arg(command)
                .current_dir(dir)
                .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| RunError::Timeout(self.timeout_secs))?;

        let output = result.map_err(|e| RunError::Spawn(e.to_string()))?;

        Ok(CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            duration: started.elapsed(),
        })
    }
}

/// Run a command and turn a non-zero exit into a stage error
pub(crate) async fn run_checked<R: CommandRunner + ?Sized>(
    runner: &R,
    stage: &str,
    command: &str,
    dir: &Path,
    env: &[(String, String)],
) -> Result<CommandOutput, StageExecutionError> {
    let output = runner
        .run(command, dir, env)
        .await
        .map_err(|e| e.into_stage_error(stage, command))?;
    if !output.success() {
        return Err(StageExecutionError::CommandFailed {
            stage: stage.to_string(),
            command: command.to_string(),
            exit_code: output.exit_code,
        });
    }
    Ok(output)
}

/// Last `max_lines` lines of command output, for error messages and details
pub(crate) fn tail(text: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = text.trim_end().lines().collect();
    let start = lines.len().saturating_sub(max_lines);
    lines[start..].join("\n")
}
