//! Stage graph domain model
//!
//! A `StageGraph` is the compiled, totally ordered list of stages plus their
//! parameter wiring. It is recomputed from scratch on every compile and never
//! patched.

use crate::core::config::PipelineConfig;
use crate::core::error::CompileError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet};

pub const BUILD_STAGE: &str = "build";
pub const SELF_DEPLOY_STAGE: &str = "self-deploy";
pub const DEPLOY_STAGE_PREFIX: &str = "deploy-";
pub const TEST_STAGE_PREFIX: &str = "test-";

/// Workflow-level parameters supplied by the trigger
pub const PARAM_COMMIT_SHA: &str = "commit-sha";
pub const PARAM_BRANCH: &str = "branch";
pub const PARAM_REPO_URL: &str = "repo-url";
pub const WORKFLOW_PARAMETERS: [&str; 3] = [PARAM_COMMIT_SHA, PARAM_BRANCH, PARAM_REPO_URL];

/// Stage outputs consumed downstream
pub const OUTPUT_ARTIFACT_PATH: &str = "artifact-path";
pub const OUTPUT_STACK_OUTPUTS: &str = "stack-outputs";

pub fn deploy_stage_name(environment: &str) -> String {
    format!("{DEPLOY_STAGE_PREFIX}{environment}")
}

pub fn test_stage_name(environment: &str) -> String {
    format!("{TEST_STAGE_PREFIX}{environment}")
}

/// What a stage does
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StageKind {
    Build,
    SelfDeploy,
    Deploy { environment: String },
    Test { environment: String },
}

/// Where an input parameter's value comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "from", rename_all = "snake_case")]
pub enum ParameterSource {
    /// Trigger-level parameter available to every stage
    Workflow { parameter: String },
    /// Output of an earlier stage
    Stage { stage: String, output: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputParameter {
    pub name: String,
    pub source: ParameterSource,
}

impl InputParameter {
    pub fn workflow(name: &str) -> Self {
        Self {
            name: name.to_string(),
            source: ParameterSource::Workflow {
                parameter: name.to_string(),
            },
        }
    }

    pub fn from_stage(name: &str, stage: &str, output: &str) -> Self {
        Self {
            name: name.to_string(),
            source: ParameterSource::Stage {
                stage: stage.to_string(),
                output: output.to_string(),
            },
        }
    }
}

/// A value the stage writes to a file for the engine to pick up
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputParameter {
    pub name: String,
    pub path: String,
}

/// Container image plus generated script
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagePayload {
    pub image: String,
    pub script: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    pub name: String,
    pub kind: StageKind,
    pub inputs: Vec<InputParameter>,
    pub output: Option<OutputParameter>,
    pub payload: StagePayload,
}

impl Stage {
    pub fn input(&self, name: &str) -> Option<&InputParameter> {
        self.inputs.iter().find(|p| p.name == name)
    }
}

/// Compiled, ordered stage graph for one pipeline instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageGraph {
    /// Template name on the engine
    pub name: String,
    /// Instance the graph belongs to
    pub instance: String,
    /// Credential binding the stages run as
    pub service_account: String,
    pub stages: Vec<Stage>,
}

impl StageGraph {
    pub fn stage(&self, name: &str) -> Option<&Stage> {
        self.stages.iter().find(|s| s.name == name)
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name.as_str()).collect()
    }

    pub fn deploy_stage_count(&self) -> usize {
        self.stages
            .iter()
            .filter(|s| matches!(s.kind, StageKind::Deploy { .. }))
            .count()
    }

    pub fn test_stage_count(&self) -> usize {
        self.stages
            .iter()
            .filter(|s| matches!(s.kind, StageKind::Test { .. }))
            .count()
    }

    /// SHA-256 over the canonical JSON encoding
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        let serialized = serde_json::to_vec(self).unwrap_or_default();
        hasher.update(serialized);
        format!("{:x}", hasher.finalize())
    }

    /// Structural invariants every publishable graph holds
    pub fn check_invariants(&self) -> Result<(), CompileError> {
        let graph_level = self.name.as_str();
        if self.stages.len() < 3 {
            return Err(CompileError::invariant(
                graph_level,
                format!("expected at least 3 stages, found {}", self.stages.len()),
            ));
        }
        if self.stages[0].kind != StageKind::Build || self.stages[0].name != BUILD_STAGE {
            return Err(CompileError::invariant(
                &self.stages[0].name,
                "first stage must be 'build'",
            ));
        }
        if self.stages[1].kind != StageKind::SelfDeploy || self.stages[1].name != SELF_DEPLOY_STAGE {
            return Err(CompileError::invariant(
                &self.stages[1].name,
                "second stage must be 'self-deploy'",
            ));
        }

        // Produced outputs so far, keyed by stage name
        let mut produced: HashMap<&str, Option<&str>> = HashMap::new();
        let mut seen_names: HashSet<&str> = HashSet::new();
        let mut previous_deploy: Option<&str> = None;

        for (index, stage) in self.stages.iter().enumerate() {
            if !seen_names.insert(stage.name.as_str()) {
                return Err(CompileError::invariant(&stage.name, "duplicate stage name"));
            }

            match &stage.kind {
                StageKind::Build | StageKind::SelfDeploy if index > 1 => {
                    return Err(CompileError::invariant(
                        &stage.name,
                        "build and self-deploy stages must lead the graph",
                    ));
                }
                StageKind::Deploy { environment } => {
                    if stage.name != deploy_stage_name(environment) {
                        return Err(CompileError::invariant(
                            &stage.name,
                            format!("deploy stage for '{environment}' is misnamed"),
                        ));
                    }
                    previous_deploy = Some(environment.as_str());
                }
                StageKind::Test { environment } => {
                    if stage.name != test_stage_name(environment) {
                        return Err(CompileError::invariant(
                            &stage.name,
                            format!("test stage for '{environment}' is misnamed"),
                        ));
                    }
                    let follows_own_deploy = self.stages[index - 1].kind
                        == StageKind::Deploy {
                            environment: environment.clone(),
                        };
                    if !follows_own_deploy || previous_deploy != Some(environment.as_str()) {
                        return Err(CompileError::invariant(
                            &stage.name,
                            "test stage must immediately follow its environment's deploy stage",
                        ));
                    }
                }
                _ => {}
            }

            let mut input_names = HashSet::new();
            for input in &stage.inputs {
                if !input_names.insert(input.name.as_str()) {
                    return Err(CompileError::invariant(
                        &stage.name,
                        format!("duplicate input parameter '{}'", input.name),
                    ));
                }
                match &input.source {
                    ParameterSource::Workflow { parameter } => {
                        if !WORKFLOW_PARAMETERS.contains(&parameter.as_str()) {
                            return Err(CompileError::invariant(
                                &stage.name,
                                format!("unknown workflow parameter '{parameter}'"),
                            ));
                        }
                    }
                    ParameterSource::Stage {
                        stage: upstream,
                        output,
                    } => match produced.get(upstream.as_str()) {
                        Some(Some(name)) if *name == output.as_str() => {}
                        Some(_) => {
                            return Err(CompileError::invariant(
                                &stage.name,
                                format!("stage '{upstream}' does not produce output '{output}'"),
                            ));
                        }
                        None => {
                            return Err(CompileError::invariant(
                                &stage.name,
                                format!(
                                    "input '{}' references '{upstream}', which does not run earlier",
                                    input.name
                                ),
                            ));
                        }
                    },
                }
            }

            produced.insert(
                stage.name.as_str(),
                stage.output.as_ref().map(|o| o.name.as_str()),
            );
        }

        Ok(())
    }

    /// Stage counts and environment order must match the config the graph came from
    pub fn check_shape(&self, config: &PipelineConfig) -> Result<(), CompileError> {
        let deploys: Vec<&str> = self
            .stages
            .iter()
            .filter_map(|s| match &s.kind {
                StageKind::Deploy { environment } => Some(environment.as_str()),
                _ => None,
            })
            .collect();
        let declared: Vec<&str> = config.environments.iter().map(|e| e.name.as_str()).collect();
        if deploys != declared {
            return Err(CompileError::invariant(
                &self.name,
                format!(
                    "deploy stages {:?} do not match declared environments {:?}",
                    deploys, declared
                ),
            ));
        }

        let expected_tests = config.tested_environment_count();
        if self.test_stage_count() != expected_tests {
            return Err(CompileError::invariant(
                &self.name,
                format!(
                    "expected {} test stage(s), found {}",
                    expected_tests,
                    self.test_stage_count()
                ),
            ));
        }

        Ok(())
    }
}
