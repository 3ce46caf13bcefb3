//! Environment deploy stage: synth, deploy and capture outputs per stack

use crate::compiler::script::{shell_quote, STACK_OUTPUTS_FILE};
use crate::core::config::{EnvironmentSpec, StackSpec};
use crate::core::error::StageExecutionError;
use crate::core::graph::deploy_stage_name;
use crate::persistence::artifacts::collect_files;
use crate::runtime::build::ARTIFACTS_DIR;
use crate::runtime::{run_checked, tail, CommandOutput, CommandRunner, StageResult};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// One captured stack output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackOutput {
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub export_name: Option<String>,
}

/// Outcome of deploying one stack
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackResult {
    pub stack_name: String,
    pub success: bool,
    pub outputs: BTreeMap<String, StackOutput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Raw entry of `describe-stacks ... --query 'Stacks[0].Outputs'`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawOutput {
    output_key: String,
    output_value: String,
    description: Option<String>,
    export_name: Option<String>,
}

/// Parse captured outputs; `null` or empty text means none
pub fn parse_stack_outputs(raw: &str) -> Result<BTreeMap<String, StackOutput>> {
    let raw = raw.trim();
    if raw.is_empty() || raw == "null" {
        return Ok(BTreeMap::new());
    }
    let entries: Vec<RawOutput> =
        serde_json::from_str(raw).context("Stack outputs are not a JSON array")?;
    Ok(entries
        .into_iter()
        .map(|entry| {
            (
                entry.output_key,
                StackOutput {
                    value: entry.output_value,
                    description: entry.description,
                    export_name: entry.export_name,
                },
            )
        })
        .collect())
}

/// Deploys every stack of one environment in declared order
pub struct EnvironmentDeployStage<R> {
    runner: R,
    environment: EnvironmentSpec,
    workspace: PathBuf,
    outputs_file: PathBuf,
    artifact_path: Option<String>,
}

impl<R: CommandRunner> EnvironmentDeployStage<R> {
    pub fn new(runner: R, environment: EnvironmentSpec, workspace: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            environment,
            workspace: workspace.into(),
            outputs_file: PathBuf::from(STACK_OUTPUTS_FILE),
            artifact_path: None,
        }
    }

    /// Where the consolidated outputs JSON is written
    pub fn with_outputs_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.outputs_file = path.into();
        self
    }

    /// Build artifacts to fetch before deploying
    pub fn with_artifact_path(mut self, path: impl Into<String>) -> Self {
        self.artifact_path = Some(path.into());
        self
    }

    fn stage_name(&self) -> String {
        deploy_stage_name(&self.environment.name)
    }


    fn stack_dir(&self, stack: &StackSpec) -> PathBuf {
        if stack.path == "." {
            self.workspace.clone()
        } else {
            self.workspace.join(&stack.path)
        }
    }

    async fn step(
        &self,
        stack: &StackSpec,
        command: &str,
        dir: &Path,
        env: &[(String, String)],
    ) -> Result<CommandOutput, String> {
        let output = self
            .runner
            .run(command, dir, env)
            .await
            .map_err(|e| format!("`{}`: {}", command, e))?;
        if !output.success() {
            let detail = tail(&output.stderr, 20);
            warn!("Stack {}: `{}` exited with code {}", stack.name, command, output.exit_code);
            return Err(if detail.is_empty() {
                format!("`{}` exited with code {}", command, output.exit_code)
            } else {
                format!("`{}` exited with code {}: {}", command, output.exit_code, detail)
            });
        }
        Ok(output)
    }

    async fn deploy_stack(&self, stack: &StackSpec, env: &[(String, String)]) -> StackResult {
        let dir = self.stack_dir(stack);
        let quoted = shell_quote(&stack.name);
        let mut result = StackResult {
            stack_name: stack.name.clone(),
            success: false,
            outputs: BTreeMap::new(),
            error: None,
        };

        let mut commands = Vec::new();
        if dir.join("package.json").exists() {
            commands.push("npm install".to_string());
        }
        commands.push(format!("npx cdk synth {}", quoted));
        commands.push(format!("npx cdk deploy {} --require-approval never", quoted));

        for command in &commands {
            info!("[{}] {}", stack.name, command);
            if let Err(reason) = self.step(stack, command, &dir, env).await {
                result.error = Some(reason);
                return result;
            }
        }

        let capture = format!(
            "aws cloudformation describe-stacks --stack-name {} --region {} --query 'Stacks[0].Outputs' --output json",
            quoted,
            shell_quote(&self.environment.region)
        );
        match self.step(stack, &capture, &dir, env).await {
            Ok(output) => match parse_stack_outputs(&output.stdout) {
                Ok(outputs) => result.outputs = outputs,
                Err(e) => warn!("Could not parse outputs of {}: {}", stack.name, e),
            },
            Err(reason) => warn!("Could not capture outputs of {}: {}", stack.name, reason),
        }

        result.success = true;
        result
    }

    /// Deploy stacks in order, stopping after the first failure
    ///
    /// The returned list ends with the failed stack, if any.
    pub async fn deploy_stacks(&self) -> Result<Vec<StackResult>, StageExecutionError> {
        let env = self.environment.location_env();
        let mut results = Vec::new();
        for stack in &self.environment.stacks {
            info!("Deploying stack {} to {}", stack.name, self.environment.name);
            let result = self.deploy_stack(stack, &env).await;
            let failed = !result.success;
            results.push(result);
            if failed {
                break;
            }
        }
        Ok(results)
    }

    /// Put the build artifacts into `artifacts/` of the workspace
    ///
    /// `s3://` locations are synced; a local directory (as written by a
    /// filesystem artifact store) is copied. Anything else is skipped.
    pub async fn fetch_artifacts(&self) -> Result<()> {
        let Some(path) = self.artifact_path.as_deref() else {
            return Ok(());
        };
        let target = self.workspace.join(ARTIFACTS_DIR);

        if path.starts_with("s3://") {
            let env = self.environment.location_env();
            let sync = format!("aws s3 sync {} {}/", shell_quote(path), ARTIFACTS_DIR);
            run_checked(&self.runner, &self.stage_name(), &sync, &self.workspace, &env).await?;
            return Ok(());
        }

        let source = Path::new(path);
        if !source.is_dir() {
            warn!("No artifacts fetched from {}", path);
            return Ok(());
        }
        let mut names = Vec::new();
        collect_files(source, "", &mut names)?;
        for name in &names {
            let destination = target.join(name);
            if let Some(parent) = destination.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
            }
            tokio::fs::copy(source.join(name), &destination)
                .await
                .with_context(|| format!("Failed to copy artifact: {}", name))?;
        }
        info!("Copied {} artifact(s) from {}", names.len(), path);
        Ok(())
    }

    /// Deploy the environment and write the consolidated outputs file
    pub async fn run(&self) -> Result<StageResult> {
        self.fetch_artifacts().await?;
        let results = self.deploy_stacks().await?;

        if let Some(failed) = results.iter().find(|r| !r.success) {
            return Err(StageExecutionError::StackFailed {
                stage: self.stage_name(),
                stack: failed.stack_name.clone(),
                reason: failed.error.clone().unwrap_or_default(),
            }
            .into());
        }

        let consolidated: BTreeMap<&str, &BTreeMap<String, StackOutput>> = results
            .iter()
            .map(|r| (r.stack_name.as_str(), &r.outputs))
            .collect();
        let contents = serde_json::to_string_pretty(&consolidated)?;
        if let Some(parent) = self.outputs_file.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
        tokio::fs::write(&self.outputs_file, contents)
            .await
            .with_context(|| format!("Failed to write {}", self.outputs_file.display()))?;

        info!(
            "Deployed {} stack(s) to {}",
            results.len(),
            self.environment.name
        );
        Ok(StageResult::success(format!(
            "Deployed {} stack(s) to {}",
            results.len(),
            self.environment.name
        ))
        .with_details(json!({
            "environment": self.environment.name,
            "outputsFile": self.outputs_file.display().to_string(),
            "stacks": results,
        })))
    }
}
