//! Test: Stage runtime - adapters run the right tools and hand results downstream

use crate::helpers::*;
use shipgraph::controller::{
    Controller, InMemoryEngine, PublishResult, SelfDeployOptions, SelfDeployStage, SubStepOutcome,
    WorkflowEngine,
};
use shipgraph::core::config::PipelineConfig;
use shipgraph::core::error::StageExecutionError;
use shipgraph::core::identity::derive_names;
use shipgraph::runtime::{EnvironmentDeployStage, TestStage};
use tempfile::TempDir;

const COMMIT: &str = "5e6f7a8b9c0d1e2f3a4b5c6d7e8f9a0b1c2d3e4f";

const OUTPUTS_A: &str = r#"[
  {"OutputKey": "ApiUrl", "OutputValue": "https://api.example.com", "Description": "Public endpoint"}
]"#;

fn env1() -> shipgraph::core::config::EnvironmentSpec {
    PipelineConfig::from_yaml(&single_environment_yaml())
        .unwrap()
        .environment("env1")
        .cloned()
        .unwrap()
}

#[tokio::test]
async fn test_deploy_then_test_with_outputs() {
    let workspace = TempDir::new().unwrap();
    let outputs_file = workspace.path().join("out/stack-outputs.json");
    let runner = RecordingRunner::new()
        .respond("aws cloudformation describe-stacks --stack-name A ", 0, OUTPUTS_A)
        .respond("aws cloudformation describe-stacks --stack-name B ", 0, "null");

    let deploy = EnvironmentDeployStage::new(runner.clone(), env1(), workspace.path())
        .with_outputs_file(&outputs_file)
        .with_artifact_path("memory://abc/");
    let result = deploy.run().await.unwrap();
    assert!(result.success);

    let commands = runner.commands();
    // No s3 sync for a non-s3 artifact location, and stacks go in declared order
    assert!(commands.iter().all(|c| !c.starts_with("aws s3 sync")));
    let log = commands.join("\n");
    assert!(position(&log, "npx cdk deploy A") < position(&log, "npx cdk synth B"));
    for call in runner.calls() {
        assert_eq!(call.dir, workspace.path().join("infra"));
        assert_eq!(call.env_var("CDK_DEFAULT_ACCOUNT"), Some("123456789012"));
        assert_eq!(call.env_var("AWS_REGION"), Some("us-east-1"));
    }

    let written: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&outputs_file).unwrap()).unwrap();
    assert_eq!(written["A"]["ApiUrl"]["value"], "https://api.example.com");
    assert_eq!(written["B"], serde_json::json!({}));

    // The outputs file location travels downstream as a named field
    assert_eq!(
        result.field("data.details.outputsFile").unwrap(),
        outputs_file.display().to_string()
    );

    let tests = TestStage::new(
        runner.clone(),
        "env1",
        vec!["npm run test:smoke".to_string()],
        workspace.path(),
    )
    .with_stack_outputs(std::fs::read_to_string(&outputs_file).unwrap());
    let tested = tests.run().await.unwrap();
    assert!(tested.success);

    let smoke = runner
        .calls()
        .into_iter()
        .find(|c| c.command == "npm run test:smoke")
        .unwrap();
    assert_eq!(smoke.env_var("ENVIRONMENT"), Some("env1"));
    assert!(smoke.env_var("STACK_OUTPUTS").unwrap().contains("ApiUrl"));
}

#[tokio::test]
async fn test_failed_stack_halts_the_environment() {
    let workspace = TempDir::new().unwrap();
    let runner = RecordingRunner::new().respond("npx cdk deploy A", 1, "");
    let deploy = EnvironmentDeployStage::new(runner.clone(), env1(), workspace.path())
        .with_outputs_file(workspace.path().join("outputs.json"));

    let err = deploy.run().await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<StageExecutionError>(),
        Some(StageExecutionError::StackFailed { stack, .. }) if stack == "A"
    ));
    assert!(runner.commands().iter().all(|c| !c.contains(" B")));
    assert!(!workspace.path().join("outputs.json").exists());
}

#[tokio::test]
async fn test_failing_tests_fail_the_stage_after_running_all() {
    let workspace = TempDir::new().unwrap();
    let runner = RecordingRunner::new().respond("npm run test:unit", 1, "");
    let stage = TestStage::new(
        runner.clone(),
        "staging",
        vec![
            "npm run test:unit".to_string(),
            "npm run test:e2e".to_string(),
        ],
        workspace.path(),
    );

    let err = stage.run().await.unwrap_err();
    match err.downcast_ref::<StageExecutionError>() {
        Some(StageExecutionError::TestsFailed { stage, failed, total }) => {
            assert_eq!(stage, "test-staging");
            assert_eq!((*failed, *total), (1, 2));
        }
        other => panic!("expected a test failure, got {:?}", other),
    }
    assert_eq!(runner.commands().len(), 2);
}

fn checkout_with(config: &str, with_infra: bool) -> (TempDir, SelfDeployOptions) {
    let root = TempDir::new().unwrap();
    let repo = root.path().join("repo");
    std::fs::create_dir_all(&repo).unwrap();
    std::fs::write(repo.join("shipgraph.yaml"), config).unwrap();
    if with_infra {
        std::fs::create_dir_all(repo.join("pipeline-infra")).unwrap();
        std::fs::write(repo.join("pipeline-infra/package.json"), "{}").unwrap();
    }
    let options = SelfDeployOptions::new("https://github.com/acme/site.git", COMMIT, repo);
    (root, options)
}

#[tokio::test]
async fn test_self_deploy_republishes_without_touching_running_execution() {
    let names = derive_names(&identity("demo"));
    let engine = InMemoryEngine::new();

    // V1 is live and an execution of it is in flight
    let v1 = compile_yaml(&single_environment_yaml(), "demo");
    Controller::new(engine.clone()).publish(&v1).await.unwrap();
    let running = engine.submit_execution(&v1.name).await.unwrap();

    let (_root, options) = checkout_with(&two_environment_yaml(), true);
    let runner = RecordingRunner::new().respond("git rev-parse HEAD", 0, COMMIT);
    let mut stage = SelfDeployStage::new(runner.clone(), engine.clone(), names, options);
    let report = stage.run().await.unwrap();

    assert!(report.succeeded());
    assert_eq!(report.infrastructure, SubStepOutcome::Succeeded);
    assert_eq!(report.graph, SubStepOutcome::Succeeded);
    assert!(matches!(report.publish, Some(PublishResult::Published { .. })));

    let commands = runner.commands();
    assert!(commands[0].starts_with("git clone"));
    let infra: Vec<&String> = commands.iter().filter(|c| !c.starts_with("git ")).collect();
    assert_eq!(
        infra,
        vec![
            "npm install",
            "npx cdk synth --all",
            "npx cdk deploy --all --require-approval never"
        ]
    );

    let pinned = engine.execution_graph(running).await.unwrap();
    assert_eq!(pinned.graph_digest(), Some(v1.digest().as_str()));
    let live = engine.live_template(&v1.name).await.unwrap().unwrap();
    assert_eq!(live.document.stage_names().len(), 5);
}

#[tokio::test]
async fn test_infrastructure_failure_still_publishes_graph() {
    let (_root, options) = checkout_with(&single_environment_yaml(), true);
    let runner = RecordingRunner::new()
        .respond("git rev-parse HEAD", 0, COMMIT)
        .respond("npx cdk deploy", 1, "");
    let engine = InMemoryEngine::new();
    let mut stage = SelfDeployStage::new(runner, engine.clone(), derive_names(&identity("demo")), options);

    let report = stage.run().await.unwrap();
    assert!(report.infrastructure.is_failure());
    assert_eq!(report.graph, SubStepOutcome::Succeeded);
    assert!(!report.succeeded());
    assert_eq!(engine.apply_count().await, 1);
}

#[tokio::test]
async fn test_wrong_commit_aborts_self_deploy() {
    let (_root, options) = checkout_with(&single_environment_yaml(), false);
    let runner = RecordingRunner::new().respond("git rev-parse HEAD", 0, "ffffffff");
    let engine = InMemoryEngine::new();
    let mut stage = SelfDeployStage::new(runner, engine.clone(), derive_names(&identity("demo")), options);

    let err = stage.run().await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<StageExecutionError>(),
        Some(StageExecutionError::Checkout { .. })
    ));
    assert_eq!(engine.apply_count().await, 0);
}
