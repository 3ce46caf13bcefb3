//! CLI command definitions

use crate::compiler::{ImageSet, DEFAULT_BUILDER_IMAGE, DEFAULT_DEPLOYER_IMAGE};
use crate::compiler::template::DEFAULT_NAMESPACE;
use crate::core::identity::{
    derive_names_with, NameCategory, NameOverrides, PipelineIdentity, ResourceNameSet, DEFAULT_PREFIX,
};
use anyhow::Result;
use clap::{Args, Subcommand};
use std::path::PathBuf;

const DEFAULT_CONFIG: &str = "shipgraph.yaml";
const DEFAULT_EVENTS_NAMESPACE: &str = "argo-events";

/// Which pipeline instance to act for
#[derive(Debug, Args, Clone)]
pub struct IdentityArgs {
    /// Pipeline instance name
    #[arg(short, long, env = "SHIPGRAPH_INSTANCE")]
    pub instance: String,

    /// Prefix for every derived resource name
    #[arg(long, env = "SHIPGRAPH_PREFIX", default_value = DEFAULT_PREFIX)]
    pub prefix: String,

    /// Override one derived name (category=name, e.g. graph=team-pipeline)
    #[arg(
        long = "name",
        env = "SHIPGRAPH_NAMES",
        value_delimiter = ',',
        value_parser = parse_name_override
    )]
    pub names: Vec<(NameCategory, String)>,
}

impl IdentityArgs {
    pub fn identity(&self) -> Result<PipelineIdentity> {
        Ok(PipelineIdentity::new(&self.instance)?.with_prefix(&self.prefix)?)
    }

    pub fn resource_names(&self) -> Result<ResourceNameSet> {
        let overrides = self
            .names
            .iter()
            .fold(NameOverrides::new(), |overrides, (category, name)| {
                overrides.with(*category, name)
            });
        Ok(derive_names_with(&self.identity()?, &overrides)?)
    }
}

/// Container images the stages run in
#[derive(Debug, Args, Clone)]
pub struct ImageArgs {
    #[arg(long, env = "SHIPGRAPH_BUILDER_IMAGE", default_value = DEFAULT_BUILDER_IMAGE)]
    pub builder_image: String,

    #[arg(long, env = "SHIPGRAPH_DEPLOYER_IMAGE", default_value = DEFAULT_DEPLOYER_IMAGE)]
    pub deployer_image: String,
}

impl ImageArgs {
    pub fn image_set(&self) -> ImageSet {
        ImageSet {
            builder: self.builder_image.clone(),
            deployer: self.deployer_image.clone(),
        }
    }
}

/// How to reach the workflow engine
#[derive(Debug, Args, Clone)]
pub struct EngineArgs {
    /// Namespace the workflow engine runs in
    #[arg(long, env = "SHIPGRAPH_NAMESPACE", default_value = DEFAULT_NAMESPACE)]
    pub namespace: String,

    /// Path to kubectl
    #[arg(long, env = "SHIPGRAPH_KUBECTL", default_value = "kubectl")]
    pub kubectl: String,

    /// Timeout per kubectl call in seconds
    #[arg(long, default_value_t = 60)]
    pub kubectl_timeout: u64,

    /// Publish into an in-memory engine instead of the cluster
    #[arg(long)]
    pub dry_run: bool,

    /// Don't record the publish in history
    #[arg(long)]
    pub no_history: bool,
}

/// Run pre-flight checks
#[derive(Debug, Args, Clone)]
pub struct ValidateCommand {
    /// Path to the pipeline description
    #[arg(short, long, default_value = DEFAULT_CONFIG)]
    pub config: PathBuf,

    /// JSON schema to validate against instead of the bundled one
    #[arg(long)]
    pub schema: Option<PathBuf>,

    #[arg(long)]
    pub skip_credentials: bool,

    #[arg(long)]
    pub skip_context: bool,

    #[arg(long)]
    pub skip_tools: bool,

    /// Context key that must be present in cdk.json (repeatable)
    #[arg(long = "context-requirement")]
    pub context_requirements: Vec<String>,

    #[arg(long, default_value = "cdk.json")]
    pub cdk_json: PathBuf,

    /// Output the report as JSON
    #[arg(long)]
    pub json: bool,
}

/// Compile a description into a workflow template
#[derive(Debug, Args, Clone)]
pub struct CompileCommand {
    #[arg(short, long, default_value = DEFAULT_CONFIG)]
    pub config: PathBuf,

    #[arg(long)]
    pub schema: Option<PathBuf>,

    #[command(flatten)]
    pub identity: IdentityArgs,

    #[command(flatten)]
    pub images: ImageArgs,

    #[arg(long, env = "SHIPGRAPH_NAMESPACE", default_value = DEFAULT_NAMESPACE)]
    pub namespace: String,

    /// Write to a file instead of stdout
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Emit the stage graph as JSON instead of the template
    #[arg(long)]
    pub json: bool,
}

/// Compile and publish a graph
#[derive(Debug, Args, Clone)]
pub struct PublishCommand {
    #[arg(short, long, default_value = DEFAULT_CONFIG)]
    pub config: PathBuf,

    #[arg(long)]
    pub schema: Option<PathBuf>,

    #[command(flatten)]
    pub identity: IdentityArgs,

    #[command(flatten)]
    pub images: ImageArgs,

    #[command(flatten)]
    pub engine: EngineArgs,

    /// Commit the description was read from
    #[arg(long, env = "COMMIT_SHA")]
    pub commit: Option<String>,
}

/// Runtime of the self-deploy stage
#[derive(Debug, Args, Clone)]
pub struct SelfDeployCommand {
    #[arg(long, env = "COMMIT_SHA")]
    pub commit: String,

    #[arg(long, env = "REPO_URL")]
    pub repo_url: String,

    #[arg(long, env = "BRANCH")]
    pub branch: Option<String>,

    /// Checkout directory
    #[arg(long, env = "SHIPGRAPH_WORKSPACE", default_value = "/workspace")]
    pub workspace: PathBuf,

    /// Description file inside the checkout
    #[arg(long, default_value = DEFAULT_CONFIG)]
    pub config_file: PathBuf,

    /// Schema file inside the checkout
    #[arg(long)]
    pub schema_file: Option<PathBuf>,

    /// Pipeline infrastructure project inside the checkout
    #[arg(long, default_value = "pipeline-infra")]
    pub infra_dir: PathBuf,

    /// Infrastructure stack to deploy (all when unset)
    #[arg(long, env = "PIPELINE_STACK")]
    pub infra_stack: Option<String>,

    /// Publish the graph even if the infrastructure sub-step fails
    #[arg(long, env = "CONTINUE_ON_ERROR", default_value_t = true, action = clap::ArgAction::Set)]
    pub continue_on_error: bool,

    #[command(flatten)]
    pub identity: IdentityArgs,

    #[command(flatten)]
    pub images: ImageArgs,

    #[command(flatten)]
    pub engine: EngineArgs,
}

/// Show the resource names of an instance
#[derive(Debug, Args, Clone)]
pub struct NamesCommand {
    #[command(flatten)]
    pub identity: IdentityArgs,

    /// Show the teardown plan instead
    #[arg(long)]
    pub teardown: bool,

    /// Generate the webhook secret and print its Secret document
    #[arg(long, conflicts_with = "teardown")]
    pub webhook_secret: bool,

    /// Validate webhooks with an externally managed secret instead of generating one
    #[arg(long, conflicts_with_all = ["teardown", "webhook_secret"])]
    pub webhook_secret_ref: Option<String>,

    /// Namespace the webhook receiver runs in
    #[arg(long, env = "SHIPGRAPH_EVENTS_NAMESPACE", default_value = DEFAULT_EVENTS_NAMESPACE)]
    pub events_namespace: String,

    #[arg(long)]
    pub json: bool,
}

/// Check whether a webhook payload should start an execution
#[derive(Debug, Args, Clone)]
pub struct TriggerCommand {
    /// Payload JSON file ("-" for stdin)
    #[arg(short, long, default_value = "-")]
    pub payload: String,

    /// Branch that triggers executions
    #[arg(short, long, env = "TARGET_BRANCH", default_value = "main")]
    pub branch: String,

    #[arg(long)]
    pub json: bool,
}

/// Run one stage adapter
#[derive(Debug, Args, Clone)]
pub struct StageCommand {
    #[command(subcommand)]
    pub stage: StageKindCommand,
}

#[derive(Debug, Subcommand, Clone)]
pub enum StageKindCommand {
    /// Run build commands and store artifacts
    Build(BuildStageArgs),

    /// Deploy one environment's stacks
    Deploy(DeployStageArgs),

    /// Run one environment's tests
    Test(TestStageArgs),
}

#[derive(Debug, Args, Clone)]
pub struct StageArgs {
    #[arg(short, long, default_value = DEFAULT_CONFIG)]
    pub config: PathBuf,

    #[arg(long, env = "SHIPGRAPH_WORKSPACE", default_value = ".")]
    pub workspace: PathBuf,

    /// Timeout per command in seconds
    #[arg(long, default_value_t = crate::runtime::DEFAULT_COMMAND_TIMEOUT_SECS)]
    pub timeout: u64,
}

#[derive(Debug, Args, Clone)]
pub struct BuildStageArgs {
    #[command(flatten)]
    pub common: StageArgs,

    #[arg(long, env = "COMMIT_SHA")]
    pub commit: String,

    /// Artifact bucket name
    #[arg(long, env = "ARTIFACT_BUCKET")]
    pub bucket: String,

    /// Artifact store root (defaults under the local data directory)
    #[arg(long)]
    pub store: Option<PathBuf>,

    /// Also sync artifacts to s3://<bucket>/<commit>/ for deploy stages
    #[arg(long)]
    pub upload: bool,
}

#[derive(Debug, Args, Clone)]
pub struct DeployStageArgs {
    #[command(flatten)]
    pub common: StageArgs,

    #[arg(short, long, env = "ENVIRONMENT")]
    pub environment: String,

    #[arg(long, env = "ARTIFACT_PATH")]
    pub artifact_path: Option<String>,

    #[arg(long, default_value = crate::compiler::script::STACK_OUTPUTS_FILE)]
    pub outputs_file: PathBuf,
}

#[derive(Debug, Args, Clone)]
pub struct TestStageArgs {
    #[command(flatten)]
    pub common: StageArgs,

    #[arg(short, long, env = "ENVIRONMENT")]
    pub environment: String,

    #[arg(long, env = "STACK_OUTPUTS")]
    pub stack_outputs: Option<String>,
}

/// Show publish history
#[derive(Debug, Args, Clone)]
pub struct HistoryCommand {
    /// Graph name to filter by
    #[arg(short, long)]
    pub graph: Option<String>,

    /// Number of recent records to show
    #[arg(short, long, default_value_t = 10)]
    pub limit: usize,

    #[arg(long)]
    pub json: bool,
}

/// Parse category=name pairs
pub fn parse_name_override(s: &str) -> Result<(NameCategory, String), String> {
    let (category, name) = s
        .split_once('=')
        .ok_or_else(|| format!("Invalid category=name pair: {}", s))?;
    Ok((category.parse()?, name.to_string()))
}
