//! Post-deploy test stage

use crate::core::error::StageExecutionError;
use crate::core::graph::test_stage_name;
use crate::runtime::{tail, CommandRunner, StageResult};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::PathBuf;
use tracing::{info, warn};

/// Lines of output kept per command
const OUTPUT_TAIL_LINES: usize = 40;

/// Result of one test command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    pub command: String,
    pub success: bool,
    /// `None` when the command never produced an exit code
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    pub output: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestRunSummary {
    pub environment: String,
    pub results: Vec<CommandResult>,
}

impl TestRunSummary {
    pub fn failed(&self) -> usize {
        self.results.iter().filter(|r| !r.success).count()
    }

    pub fn passed(&self) -> usize {
        self.results.len() - self.failed()
    }

    pub fn all_passed(&self) -> bool {
        self.failed() == 0
    }
}

pub struct TestStage<R> {
    runner: R,
    environment: String,
    commands: Vec<String>,
    workspace: PathBuf,
    stack_outputs: Option<String>,
}

impl<R: CommandRunner> TestStage<R> {
    pub fn new(
        runner: R,
        environment: impl Into<String>,
        commands: Vec<String>,
        workspace: impl Into<PathBuf>,
    ) -> Self {
        Self {
            runner,
            environment: environment.into(),
            commands,
            workspace: workspace.into(),
            stack_outputs: None,
        }
    }

    /// Outputs of the preceding deploy, exposed to commands as `STACK_OUTPUTS`
    pub fn with_stack_outputs(mut self, outputs: impl Into<String>) -> Self {
        self.stack_outputs = Some(outputs.into());
        self
    }

    /// Run every command, continuing past failures
    pub async fn run_all(&self) -> TestRunSummary {
        let mut env = vec![("ENVIRONMENT".to_string(), self.environment.clone())];
        if let Some(outputs) = &self.stack_outputs {
            env.push(("STACK_OUTPUTS".to_string(), outputs.clone()));
        }

        let mut results = Vec::with_capacity(self.commands.len());
        for (index, command) in self.commands.iter().enumerate() {
            info!("[{}/{}] {}", index + 1, self.commands.len(), command);
            let result = match self.runner.run(command, &self.workspace, &env).await {
                Ok(output) => {
                    let text = format!("{}{}", output.stdout, output.stderr);
                    CommandResult {
                        command: command.clone(),
                        success: output.success(),
                        exit_code: Some(output.exit_code),
                        duration_ms: output.duration.as_millis() as u64,
                        output: tail(&text, OUTPUT_TAIL_LINES),
                    }
                }
                Err(e) => CommandResult {
                    command: command.clone(),
                    success: false,
                    exit_code: None,
                    duration_ms: 0,
                    output: e.to_string(),
                },
            };
            if !result.success {
                warn!("Test command failed: {}", command);
            }
            results.push(result);
        }

        TestRunSummary {
            environment: self.environment.clone(),
            results,
        }
    }

    /// Run the tests; any failed command fails the stage
    pub async fn run(&self) -> Result<StageResult> {
        let summary = self.run_all().await;
        info!(
            "{}: {} passed, {} failed",
            self.environment,
            summary.passed(),
            summary.failed()
        );

        if !summary.all_passed() {
            return Err(StageExecutionError::TestsFailed {
                stage: test_stage_name(&self.environment),
                failed: summary.failed(),
                total: summary.results.len(),
            }
            .into());
        }

        Ok(StageResult::success(format!(
            "All {} test command(s) passed in {}",
            summary.results.len(),
            self.environment
        ))
        .with_details(json!(summary)))
    }
}
