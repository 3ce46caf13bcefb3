//! Test: Topology - stage order, counts, wiring and determinism

use crate::helpers::*;
use shipgraph::compiler::{compile, render, ImageSet};
use shipgraph::core::config::PipelineConfig;
use shipgraph::core::graph::{ParameterSource, StageKind};

/// One environment with stacks [A, B] and no tests gives three stages
#[test]
fn test_single_environment_has_three_stages() {
    let graph = compile_yaml(&single_environment_yaml(), "frontend");
    assert_stage_order(&graph, &["build", "self-deploy", "deploy-env1"]);

    let script = &graph.stage("deploy-env1").unwrap().payload.script;
    let synth_a = position(script, "npx cdk synth A");
    let deploy_a = position(script, "npx cdk deploy A --require-approval never");
    let capture_a = position(script, "describe-stacks --stack-name A ");
    let synth_b = position(script, "npx cdk synth B");
    let deploy_b = position(script, "npx cdk deploy B --require-approval never");
    let capture_b = position(script, "describe-stacks --stack-name B ");

    assert!(synth_a < deploy_a && deploy_a < capture_a);
    assert!(capture_a < synth_b, "stack B must start after stack A completes");
    assert!(synth_b < deploy_b && deploy_b < capture_b);
    assert!(script.starts_with("set -euo pipefail"));
}

/// env1 with tests, env2 without, gives five stages in declared order
#[test]
fn test_two_environments_have_five_stages() {
    let graph = compile_yaml(&two_environment_yaml(), "frontend");
    assert_stage_order(
        &graph,
        &["build", "self-deploy", "deploy-env1", "test-env1", "deploy-env2"],
    );
    assert_eq!(graph.deploy_stage_count(), 2);
    assert_eq!(graph.test_stage_count(), 1);
}

#[test]
fn test_stage_counts_follow_environments() {
    let yaml = config_yaml(
        &["make"],
        &[
            EnvFixture::new("dev", &["App"]).with_tests(&["make smoke"]),
            EnvFixture::new("qa", &["Db", "App"]).with_tests(&["make e2e", "make perf"]),
            EnvFixture::new("staging", &["App"]),
            EnvFixture::new("prod", &["Db", "App"]),
        ],
    );
    let config = PipelineConfig::from_yaml(&yaml).unwrap();
    let graph = compile(&config, &identity("platform"), &ImageSet::default()).unwrap();

    assert_eq!(graph.deploy_stage_count(), config.environments.len());
    assert_eq!(graph.test_stage_count(), config.tested_environment_count());
    assert_eq!(graph.stages.len(), 2 + 4 + 2);
    for stage in &graph.stages {
        if let StageKind::Test { environment } = &stage.kind {
            let index = graph.stage_names().iter().position(|n| *n == stage.name).unwrap();
            assert_eq!(graph.stages[index - 1].name, format!("deploy-{}", environment));
        }
    }
}

#[test]
fn test_compile_is_deterministic() {
    let yaml = two_environment_yaml();
    let first = compile_yaml(&yaml, "frontend");
    let second = compile_yaml(&yaml, "frontend");
    assert_eq!(first, second);
    assert_eq!(first.digest(), second.digest());
    assert_eq!(
        render(&first).to_yaml().unwrap(),
        render(&second).to_yaml().unwrap()
    );
}

#[test]
fn test_changed_description_changes_digest() {
    let before = compile_yaml(&single_environment_yaml(), "frontend");
    let after = compile_yaml(
        &config_yaml(&["npm ci", "npm run build"], &[EnvFixture::new("env1", &["B", "A"])]),
        "frontend",
    );
    assert_ne!(before.digest(), after.digest());
}

/// Every upstream reference points at an earlier stage
#[test]
fn test_wiring_is_forward_reference_free() {
    let graph = compile_yaml(&two_environment_yaml(), "frontend");
    let names = graph.stage_names();
    for (index, stage) in graph.stages.iter().enumerate() {
        for input in &stage.inputs {
            if let ParameterSource::Stage { stage: upstream, .. } = &input.source {
                let upstream_index = names.iter().position(|n| n == upstream).unwrap();
                assert!(upstream_index < index, "{} reads from later stage {}", stage.name, upstream);
            }
        }
    }

    let deploy = graph.stage("deploy-env1").unwrap();
    assert!(matches!(
        &deploy.input("artifact-path").unwrap().source,
        ParameterSource::Stage { stage, output } if stage == "build" && output == "artifact-path"
    ));
    let test = graph.stage("test-env1").unwrap();
    assert!(matches!(
        &test.input("stack-outputs").unwrap().source,
        ParameterSource::Stage { stage, .. } if stage == "deploy-env1"
    ));
    assert!(graph.stage("self-deploy").unwrap().inputs.iter().all(|i| matches!(i.source, ParameterSource::Workflow { .. })));
}

#[test]
fn test_rendered_template_wires_step_outputs() {
    let graph = compile_yaml(&two_environment_yaml(), "frontend");
    let template = render(&graph);

    assert_eq!(template.name(), "shipgraph-frontend");
    assert_eq!(template.spec.entrypoint, "main");
    assert_eq!(template.spec.service_account_name, "shipgraph-frontend-executor");
    assert_eq!(template.stage_names(), graph.stage_names());
    assert_eq!(template.graph_digest(), Some(graph.digest().as_str()));

    let main = template.spec.templates.iter().find(|t| t.name == "main").unwrap();
    let steps: Vec<_> = main.steps.as_ref().unwrap().iter().flatten().collect();
    let deploy = steps.iter().find(|s| s.name == "deploy-env1").unwrap();
    let artifact = deploy
        .arguments
        .parameters
        .iter()
        .find(|p| p.name == "artifact-path")
        .unwrap();
    assert_eq!(
        artifact.value.as_deref(),
        Some("{{steps.build.outputs.parameters.artifact-path}}")
    );

    let workflow_params: Vec<&str> = template
        .spec
        .arguments
        .parameters
        .iter()
        .map(|p| p.name.as_str())
        .collect();
    assert_eq!(workflow_params, vec!["commit-sha", "branch", "repo-url"]);

    let round_trip = shipgraph::compiler::WorkflowTemplate::from_yaml(&template.to_yaml().unwrap()).unwrap();
    assert_eq!(round_trip, template);
}

#[test]
fn test_quoted_paths_in_scripts() {
    let yaml = r#"
version: "1.0"
build:
  commands: ["make"]
environments:
  - name: dev
    region: us-east-1
    account: "123456789012"
    stacks:
      - name: App
        path: "infra/my app"
"#;
    let graph = compile_yaml(yaml, "frontend");
    let script = &graph.stage("deploy-dev").unwrap().payload.script;
    assert!(script.contains("cd 'infra/my app'"));
}
