//! Topology compiler: pipeline description to stage graph
//!
//! `compile` is a pure function. The same description, identity and image
//! set always produce a structurally identical graph with the same digest.

pub mod script;
pub mod template;

use crate::core::{
    config::{EnvironmentSpec, PipelineConfig},
    error::CompileError,
    graph::*,
    identity::{derive_names, PipelineIdentity, ResourceNameSet},
};
use script::{ScriptBuilder, ARTIFACT_PATH_FILE, STACK_OUTPUTS_DIR, STACK_OUTPUTS_FILE};
use template::DEFAULT_NAMESPACE;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

pub use template::{render, WorkflowTemplate};

pub const DEFAULT_BUILDER_IMAGE: &str = "shipgraph/builder:latest";
pub const DEFAULT_DEPLOYER_IMAGE: &str = "shipgraph/deployer:latest";

/// Container images the stages run in
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSet {
    pub builder: String,
    pub deployer: String,
}

impl Default for ImageSet {
    fn default() -> Self {
        Self {
            builder: DEFAULT_BUILDER_IMAGE.to_string(),
            deployer: DEFAULT_DEPLOYER_IMAGE.to_string(),
        }
    }
}

/// Compile a description using the identity's default resource names
pub fn compile(
    config: &PipelineConfig,
    identity: &PipelineIdentity,
    images: &ImageSet,
) -> Result<StageGraph, CompileError> {
    compile_with_names(config, &derive_names(identity), images)
}

/// Compile a description against an already derived name set
pub fn compile_with_names(
    config: &PipelineConfig,
    names: &ResourceNameSet,
    images: &ImageSet,
) -> Result<StageGraph, CompileError> {
    compile_in(config, names, images, DEFAULT_NAMESPACE)
}

/// Compile for a graph published into `namespace`
///
/// The self-deploy stage republishes into the same namespace under the same names.
pub fn compile_in(
    config: &PipelineConfig,
    names: &ResourceNameSet,
    images: &ImageSet,
    namespace: &str,
) -> Result<StageGraph, CompileError> {
    // Identifiers end up inside scripts; never compile an unchecked description
    config.validate()?;

    let mut stages = vec![
        build_stage(config, names, images),
        self_deploy_stage(names, images, namespace),
    ];
    for environment in &config.environments {
        stages.push(deploy_stage(environment, images));
        if environment.has_tests() {
            stages.push(test_stage(environment, images));
        }
    }

    let graph = StageGraph {
        name: names.graph().to_string(),
        instance: names.instance().to_string(),
        service_account: names.service_account().to_string(),
        stages,
    };

    graph.check_invariants()?;
    graph.check_shape(config)?;

    debug!(
        "Compiled graph {} with {} stage(s)",
        graph.name,
        graph.stages.len()
    );
    Ok(graph)
}

fn trigger_inputs() -> Vec<InputParameter> {
    vec![
        InputParameter::workflow(PARAM_COMMIT_SHA),
        InputParameter::workflow(PARAM_REPO_URL),
    ]
}

fn build_stage(config: &PipelineConfig, names: &ResourceNameSet, images: &ImageSet) -> Stage {
    let mut script = ScriptBuilder::new();
    script.checkout().echo("Executing build commands...");
    for command in &config.build.commands {
        script.command(command);
    }
    script
        .echo("Uploading artifacts...")
        .raw("ARTIFACT_PATH=\"s3://${ARTIFACT_BUCKET}/${COMMIT_SHA}/\"")
        .raw("if [ -d ./artifacts ]; then")
        .raw("  aws s3 sync ./artifacts \"$ARTIFACT_PATH\"")
        .raw("else")
        .raw("  echo 'No artifacts directory found, skipping upload'")
        .raw("fi")
        .raw(format!("printf '%s' \"$ARTIFACT_PATH\" > {ARTIFACT_PATH_FILE}"))
        .echo("Build stage complete");

    let mut env = BTreeMap::new();
    env.insert(
        "ARTIFACT_BUCKET".to_string(),
        names.artifact_bucket().to_string(),
    );

    Stage {
        name: BUILD_STAGE.to_string(),
        kind: StageKind::Build,
        inputs: trigger_inputs(),
        output: Some(OutputParameter {
            name: OUTPUT_ARTIFACT_PATH.to_string(),
            path: ARTIFACT_PATH_FILE.to_string(),
        }),
        payload: StagePayload {
            image: images.builder.clone(),
            script: script.build(),
            env,
        },
    }
}

fn self_deploy_stage(names: &ResourceNameSet, images: &ImageSet, namespace: &str) -> Stage {
    let mut inputs = trigger_inputs();
    inputs.push(InputParameter::workflow(PARAM_BRANCH));

    let mut script = ScriptBuilder::new();
    script.echo("Republishing pipeline graph...");

    // Everything `shipgraph self-deploy` needs to re-derive this exact name set
    let mut env = BTreeMap::new();
    env.insert("SHIPGRAPH_INSTANCE".to_string(), names.instance().to_string());
    env.insert("SHIPGRAPH_PREFIX".to_string(), names.prefix().to_string());
    env.insert("SHIPGRAPH_NAMESPACE".to_string(), namespace.to_string());
    let overrides = names.overrides();
    if !overrides.is_empty() {
        env.insert("SHIPGRAPH_NAMES".to_string(), overrides.to_arg_list());
    }
    env.insert("SHIPGRAPH_BUILDER_IMAGE".to_string(), images.builder.clone());
    env.insert("SHIPGRAPH_DEPLOYER_IMAGE".to_string(), images.deployer.clone());
    script.raw("exec shipgraph self-deploy");

    Stage {
        name: SELF_DEPLOY_STAGE.to_string(),
        kind: StageKind::SelfDeploy,
        inputs,
        output: None,
        payload: StagePayload {
            image: images.deployer.clone(),
            script: script.build(),
            env,
        },
    }
}

fn deploy_stage(environment: &EnvironmentSpec, images: &ImageSet) -> Stage {
    let mut inputs = trigger_inputs();
    inputs.push(InputParameter::from_stage(
        OUTPUT_ARTIFACT_PATH,
        BUILD_STAGE,
        OUTPUT_ARTIFACT_PATH,
    ));

    let mut script = ScriptBuilder::new();
    script
        .checkout()
        .echo("Downloading artifacts...")
        .raw("mkdir -p ./artifacts")
        .raw("aws s3 sync \"$ARTIFACT_PATH\" ./artifacts/ || echo 'No artifacts to download'")
        .raw(format!("mkdir -p {STACK_OUTPUTS_DIR}"))
        .echo(&format!(
            "Deploying {} stack(s) for environment: {}",
            environment.stacks.len(),
            environment.name
        ));
    for stack in &environment.stacks {
        script.stack_deployment(&stack.name, &stack.path, &environment.region);
    }
    let stack_names: Vec<&str> = environment.stacks.iter().map(|s| s.name.as_str()).collect();
    script
        .consolidate_outputs(&stack_names)
        .echo(&format!("Environment {} deployment complete", environment.name));

    Stage {
        name: deploy_stage_name(&environment.name),
        kind: StageKind::Deploy {
            environment: environment.name.clone(),
        },
        inputs,
        output: Some(OutputParameter {
            name: OUTPUT_STACK_OUTPUTS.to_string(),
            path: STACK_OUTPUTS_FILE.to_string(),
        }),
        payload: StagePayload {
            image: images.deployer.clone(),
            script: script.build(),
            env: location_env(environment),
        },
    }
}

fn test_stage(environment: &EnvironmentSpec, images: &ImageSet) -> Stage {
    let deploy_name = deploy_stage_name(&environment.name);
    let mut inputs = trigger_inputs();
    inputs.push(InputParameter::from_stage(
        OUTPUT_STACK_OUTPUTS,
        &deploy_name,
        OUTPUT_STACK_OUTPUTS,
    ));

    let mut script = ScriptBuilder::new();
    script
        .checkout()
        .raw(format!("printf '%s' \"$STACK_OUTPUTS\" > {STACK_OUTPUTS_FILE}"))
        .echo(&format!("Running tests for environment: {}", environment.name))
        .raw("failed=0");
    let commands = environment
        .tests
        .as_ref()
        .map(|t| t.commands.as_slice())
        .unwrap_or_default();
    for command in commands {
        script.counted_command(command, "failed");
    }
    script
        .raw("if [ \"$failed\" -gt 0 ]; then")
        .raw(format!(
            "  echo \"$failed of {} test command(s) failed\" >&2",
            commands.len()
        ))
        .raw("  exit 1")
        .raw("fi")
        .echo(&format!("Tests for {} passed", environment.name));

    Stage {
        name: test_stage_name(&environment.name),
        kind: StageKind::Test {
            environment: environment.name.clone(),
        },
        inputs,
        output: None,
        payload: StagePayload {
            image: images.deployer.clone(),
            script: script.build(),
            env: location_env(environment),
        },
    }
}

fn location_env(environment: &EnvironmentSpec) -> BTreeMap<String, String> {
    environment.location_env().into_iter().collect()
}
