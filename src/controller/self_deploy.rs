//! Runtime of the `self-deploy` stage
//!
//! Checks out the triggering commit, deploys the pipeline's own
//! infrastructure, then recompiles the description found in that checkout
//! and publishes the resulting graph. The two sub-steps are reported
//! separately and neither undoes the other.

use crate::compiler::{compile_in, ImageSet};
use crate::controller::{Controller, PublishResult, WorkflowEngine};
use crate::core::config::{ConfigParser, PipelineConfig};
use crate::core::identity::ResourceNameSet;
use crate::core::secrets;
use crate::persistence::GraphHistory;
use crate::runtime::{checkout, tail, CommandRunner};
use anyhow::{Context, Result};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

pub const DEFAULT_CONFIG_FILE: &str = "shipgraph.yaml";
pub const DEFAULT_INFRA_DIR: &str = "pipeline-infra";

#[derive(Debug, Clone)]
pub struct SelfDeployOptions {
    pub repo_url: String,
    pub commit_id: String,
    /// Checkout directory
    pub workspace: PathBuf,
    /// Description file, relative to the checkout
    pub config_file: PathBuf,
    /// Schema override, relative to the checkout
    pub schema_file: Option<PathBuf>,
    /// Pipeline infrastructure project, relative to the checkout
    pub infra_dir: PathBuf,
    /// Stack to deploy; all stacks when unset
    pub infra_stack: Option<String>,
    pub images: ImageSet,
    /// Keep going to the graph publish when the infrastructure sub-step fails
    pub continue_on_error: bool,
}

impl SelfDeployOptions {
    pub fn new(
        repo_url: impl Into<String>,
        commit_id: impl Into<String>,
        workspace: impl Into<PathBuf>,
    ) -> Self {
        Self {
            repo_url: repo_url.into(),
            commit_id: commit_id.into(),
            workspace: workspace.into(),
            config_file: PathBuf::from(DEFAULT_CONFIG_FILE),
            schema_file: None,
            infra_dir: PathBuf::from(DEFAULT_INFRA_DIR),
            infra_stack: None,
            images: ImageSet::default(),
            continue_on_error: true,
        }
    }
}

/// Outcome of one self-deploy sub-step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubStepOutcome {
    Succeeded,
    Failed(String),
    Skipped(String),
}

impl SubStepOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, SubStepOutcome::Failed(_))
    }
}

impl fmt::Display for SubStepOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubStepOutcome::Succeeded => write!(f, "succeeded"),
            SubStepOutcome::Failed(reason) => write!(f, "failed: {}", reason),
            SubStepOutcome::Skipped(reason) => write!(f, "skipped: {}", reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelfDeployReport {
    pub commit_id: String,
    pub infrastructure: SubStepOutcome,
    pub graph: SubStepOutcome,
    /// Present whenever a publish was attempted
    pub publish: Option<PublishResult>,
}

impl SelfDeployReport {
    pub fn succeeded(&self) -> bool {
        !self.infrastructure.is_failure() && !self.graph.is_failure()
    }
}

pub struct SelfDeployStage<R, E> {
    runner: R,
    controller: Controller<E>,
    names: ResourceNameSet,
    options: SelfDeployOptions,
}

impl<R: CommandRunner, E: WorkflowEngine> SelfDeployStage<R, E> {
    pub fn new(runner: R, engine: E, names: ResourceNameSet, options: SelfDeployOptions) -> Self {
        let controller = Controller::new(engine).with_commit(options.commit_id.clone());
        Self {
            runner,
            controller,
            names,
            options,
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.controller = self.controller.with_namespace(namespace);
        self
    }

    pub fn with_history(mut self, history: Arc<dyn GraphHistory>) -> Self {
        self.controller = self.controller.with_history(history);
        self
    }

    pub fn controller(&self) -> &Controller<E> {
        &self.controller
    }

    /// Run both sub-steps
    ///
    /// Checkout, description and compile errors abort the stage. Infrastructure
    /// and publish failures are reported, not returned.
    pub async fn run(&mut self) -> Result<SelfDeployReport> {
        let options = &self.options;
        checkout(
            &self.runner,
            &options.repo_url,
            &options.commit_id,
            &options.workspace,
        )
        .await?;

        let infrastructure = self.deploy_infrastructure().await;
        match &infrastructure {
            SubStepOutcome::Failed(reason) => warn!("Pipeline infrastructure failed: {}", reason),
            other => info!("Pipeline infrastructure {}", other),
        }

        if infrastructure.is_failure() && !self.options.continue_on_error {
            return Ok(SelfDeployReport {
                commit_id: self.options.commit_id.clone(),
                infrastructure,
                graph: SubStepOutcome::Skipped("infrastructure sub-step failed".to_string()),
                publish: None,
            });
        }

        let config = self.load_config()?;
        let graph = compile_in(
            &config,
            &self.names,
            &self.options.images,
            self.controller.namespace(),
        )?;
        info!(
            "Compiled {} stage(s) from commit {}",
            graph.stages.len(),
            self.options.commit_id
        );

        let result = self.controller.publish(&graph).await?;
        let graph_outcome = match &result {
            PublishResult::Published { .. } => SubStepOutcome::Succeeded,
            PublishResult::Unchanged { .. } => SubStepOutcome::Skipped("graph unchanged".to_string()),
            PublishResult::Failed { error, .. } => {
                SubStepOutcome::Failed(secrets::redact(&error.to_string()))
            }
        };

        Ok(SelfDeployReport {
            commit_id: self.options.commit_id.clone(),
            infrastructure,
            graph: graph_outcome,
            publish: Some(result),
        })
    }

    fn load_config(&self) -> Result<PipelineConfig> {
        let workspace = &self.options.workspace;
        let config_path = workspace.join(&self.options.config_file);
        let parser = match &self.options.schema_file {
            Some(schema) => ConfigParser::from_schema_file(workspace.join(schema))?,
            None => ConfigParser::new(),
        };
        parser
            .parse_file(&config_path)
            .with_context(|| format!("Invalid pipeline description at commit {}", self.options.commit_id))
    }

    async fn deploy_infrastructure(&self) -> SubStepOutcome {
        let dir = self.options.workspace.join(&self.options.infra_dir);
        if !dir.is_dir() {
            return SubStepOutcome::Skipped(format!(
                "no {} directory in checkout",
                self.options.infra_dir.display()
            ));
        }

        let target = self
            .options
            .infra_stack
            .as_deref()
            .map(crate::compiler::script::shell_quote)
            .unwrap_or_else(|| "--all".to_string());
        let env = vec![
            ("SHIPGRAPH_INSTANCE".to_string(), self.names.instance().to_string()),
            ("COMMIT_SHA".to_string(), self.options.commit_id.clone()),
        ];

        let mut commands = Vec::new();
        if dir.join("package.json").exists() {
            commands.push("npm install".to_string());
        }
        commands.push(format!("npx cdk synth {}", target));
        commands.push(format!("npx cdk deploy {} --require-approval never", target));

        for command in &commands {
            info!("[pipeline-infra] {}", command);
            match self.runner.run(command, &dir, &env).await {
                Ok(output) if output.success() => {}
                Ok(output) => {
                    return SubStepOutcome::Failed(secrets::redact(&format!(
                        "`{}` exited with code {}: {}",
                        command,
                        output.exit_code,
                        tail(&output.stderr, 10)
                    )))
                }
                Err(e) => return SubStepOutcome::Failed(format!("`{}`: {}", command, e)),
            }
        }
        SubStepOutcome::Succeeded
    }
}
