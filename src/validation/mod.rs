//! Pre-flight checks run before a pipeline is set up
//!
//! Every check appends to one report instead of stopping at the first
//! problem, except the description itself: nothing else can be checked
//! without it.

use crate::compiler::script::shell_quote;
use crate::core::config::{ConfigParser, PipelineConfig};
use crate::runtime::CommandRunner;
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const DEFAULT_CDK_JSON: &str = "cdk.json";

/// Which checks to run and where to find their inputs
#[derive(Debug, Clone)]
pub struct ValidationOptions {
    pub config_path: PathBuf,
    pub schema_path: Option<PathBuf>,
    pub skip_credentials: bool,
    pub skip_context: bool,
    pub skip_tools: bool,
    /// Keys that must be present in the infrastructure tool's context
    pub context_requirements: Vec<String>,
    pub cdk_json_path: PathBuf,
    /// Directory commands are run in
    pub workspace: PathBuf,
}

impl ValidationOptions {
    pub fn new(config_path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: config_path.into(),
            schema_path: None,
            skip_credentials: false,
            skip_context: false,
            skip_tools: false,
            context_requirements: Vec::new(),
            cdk_json_path: PathBuf::from(DEFAULT_CDK_JSON),
            workspace: PathBuf::from("."),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckCategory {
    Config,
    Credentials,
    Context,
    Tools,
}

impl fmt::Display for CheckCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CheckCategory::Config => "config",
            CheckCategory::Credentials => "credentials",
            CheckCategory::Context => "context",
            CheckCategory::Tools => "tools",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckFailure {
    pub category: CheckCategory,
    pub subject: String,
    pub reason: String,
}

impl fmt::Display for CheckFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}: {}", self.category, self.subject, self.reason)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ValidationReport {
    pub failures: Vec<CheckFailure>,
    /// Categories that actually ran
    pub checked: Vec<CheckCategory>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.failures.is_empty()
    }

    fn fail(&mut self, category: CheckCategory, subject: impl Into<String>, reason: impl Into<String>) {
        self.failures.push(CheckFailure {
            category,
            subject: subject.into(),
            reason: reason.into(),
        });
    }
}

pub struct Validator<R> {
    runner: R,
    options: ValidationOptions,
}

impl<R: CommandRunner> Validator<R> {
    pub fn new(runner: R, options: ValidationOptions) -> Self {
        Self { runner, options }
    }

    pub async fn run(&self) -> ValidationReport {
        let mut report = ValidationReport::default();

        report.checked.push(CheckCategory::Config);
        let config = match self.load_config() {
            Ok(config) => config,
            Err(e) => {
                report.fail(
                    CheckCategory::Config,
                    self.options.config_path.display().to_string(),
                    format!("{:#}", e),
                );
                return report;
            }
        };
        info!(
            "Description is valid ({} environment(s))",
            config.environments.len()
        );

        if !self.options.skip_credentials {
            report.checked.push(CheckCategory::Credentials);
            self.check_credentials(&config, &mut report).await;
        }
        if !self.options.skip_context {
            report.checked.push(CheckCategory::Context);
            self.check_context(&mut report);
        }
        if !self.options.skip_tools {
            report.checked.push(CheckCategory::Tools);
            check_tools(&config, &mut report);
        }
        report
    }

    fn load_config(&self) -> anyhow::Result<PipelineConfig> {
        let parser = match &self.options.schema_path {
            Some(path) => ConfigParser::from_schema_file(path)?,
            None => ConfigParser::new(),
        };
        parser.parse_file(&self.options.config_path)
    }

    async fn check_credentials(&self, config: &PipelineConfig, report: &mut ValidationReport) {
        for environment in &config.environments {
            let command = format!(
                "aws sts get-caller-identity --query Account --output text --region {}",
                shell_quote(&environment.region)
            );
            let env = vec![("AWS_REGION".to_string(), environment.region.clone())];
            debug!("Checking credentials for {}", environment.name);

            match self.runner.run(&command, &self.options.workspace, &env).await {
                Ok(output) if output.success() => {
                    let account = output.stdout.trim();
                    if account != environment.account {
                        report.fail(
                            CheckCategory::Credentials,
                            &environment.name,
                            format!(
                                "credentials belong to account {}, expected {}",
                                account, environment.account
                            ),
                        );
                    }
                }
                Ok(output) => report.fail(
                    CheckCategory::Credentials,
                    &environment.name,
                    format!(
                        "cannot resolve caller identity (exit {}): {}",
                        output.exit_code,
                        output.stderr.trim()
                    ),
                ),
                Err(e) => report.fail(CheckCategory::Credentials, &environment.name, e.to_string()),
            }
        }
    }

    fn check_context(&self, report: &mut ValidationReport) {
        if self.options.context_requirements.is_empty() {
            return;
        }
        let path = &self.options.cdk_json_path;
        match read_context(path) {
            Ok(context) => {
                for key in &self.options.context_requirements {
                    if context.get(key).is_none() {
                        report.fail(CheckCategory::Context, key, "missing from cdk.json context");
                    }
                }
            }
            Err(reason) => report.fail(CheckCategory::Context, path.display().to_string(), reason),
        }
    }
}

fn read_context(path: &Path) -> Result<serde_json::Map<String, serde_json::Value>, String> {
    let content = std::fs::read_to_string(path).map_err(|e| format!("cannot read: {}", e))?;
    let document: serde_json::Value =
        serde_json::from_str(&content).map_err(|e| format!("not valid JSON: {}", e))?;
    match document.get("context") {
        Some(serde_json::Value::Object(context)) => Ok(context.clone()),
        Some(_) => Err("\"context\" is not an object".to_string()),
        None => Ok(serde_json::Map::new()),
    }
}

/// Programs the build commands start with
pub fn required_tools(config: &PipelineConfig) -> BTreeSet<String> {
    config
        .build
        .commands
        .iter()
        .filter_map(|command| {
            command
                .split_whitespace()
                .find(|word| !word.contains('='))
                .map(str::to_string)
        })
        .collect()
}

fn check_tools(config: &PipelineConfig, report: &mut ValidationReport) {
    for tool in required_tools(config) {
        if let Err(e) = which::which(&tool) {
            report.fail(CheckCategory::Tools, &tool, format!("not found on PATH ({})", e));
        }
    }
}
