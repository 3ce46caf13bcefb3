//! Integration tests against real tools
//!
//! These tests need git, kubectl with the workflow engine's CRDs installed,
//! or AWS credentials. They are tagged with `#[ignore]` and should be run
//! explicitly with:
//!
//!     cargo test --test integration -- --ignored

use shipgraph::compiler::{compile_in, ImageSet};
use shipgraph::controller::{
    Controller, InMemoryEngine, KubectlEngine, PublishResult, SelfDeployOptions, SelfDeployStage,
    SubStepOutcome, WorkflowEngine,
};
use shipgraph::core::config::PipelineConfig;
use shipgraph::core::error::StageExecutionError;
use shipgraph::core::identity::{derive_names, PipelineIdentity};
use shipgraph::runtime::{checkout, CommandRunner, ShellRunner};
use shipgraph::validation::{ValidationOptions, Validator};
use std::path::Path;
use tempfile::TempDir;

const DESCRIPTION: &str = r#"
version: "1.0"
build:
  commands: ["echo building"]
environments:
  - name: dev
    region: us-east-1
    account: "123456789012"
    stacks:
      - name: App
        path: infra
"#;

async fn sh(runner: &ShellRunner, command: &str, dir: &Path) -> String {
    let output = runner.run(command, dir, &[]).await.expect("command runs");
    assert!(output.success(), "`{}` failed: {}", command, output.stderr);
    output.stdout.trim().to_string()
}

/// A local repository with one commit containing the description
async fn local_repo(runner: &ShellRunner) -> (TempDir, String) {
    let origin = TempDir::new().unwrap();
    std::fs::write(origin.path().join("shipgraph.yaml"), DESCRIPTION).unwrap();
    sh(runner, "git init -q", origin.path()).await;
    sh(
        runner,
        "git -c user.name=ci -c user.email=ci@example.com add . && git -c user.name=ci -c user.email=ci@example.com commit -qm init",
        origin.path(),
    )
    .await;
    let head = sh(runner, "git rev-parse HEAD", origin.path()).await;
    (origin, head)
}

#[tokio::test]
#[ignore] // Requires git
async fn test_checkout_pins_exact_commit() {
    let runner = ShellRunner::new(60);
    let (origin, head) = local_repo(&runner).await;
    let target = TempDir::new().unwrap();
    let dir = target.path().join("checkout");

    checkout(&runner, &origin.path().display().to_string(), &head, &dir)
        .await
        .expect("checkout succeeds");
    assert!(dir.join("shipgraph.yaml").exists());
    assert_eq!(sh(&runner, "git rev-parse HEAD", &dir).await, head);
}

#[tokio::test]
#[ignore] // Requires git
async fn test_checkout_of_unknown_commit_fails() {
    let runner = ShellRunner::new(60);
    let (origin, _) = local_repo(&runner).await;
    let target = TempDir::new().unwrap();

    let err = checkout(
        &runner,
        &origin.path().display().to_string(),
        "0000000000000000000000000000000000000000",
        &target.path().join("checkout"),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, StageExecutionError::Checkout { .. }));
}

#[tokio::test]
#[ignore] // Requires git
async fn test_self_deploy_from_local_repository() {
    let runner = ShellRunner::new(60);
    let (origin, head) = local_repo(&runner).await;
    let target = TempDir::new().unwrap();

    let options = SelfDeployOptions::new(
        origin.path().display().to_string(),
        head.clone(),
        target.path().join("checkout"),
    );
    let engine = InMemoryEngine::new();
    let names = derive_names(&PipelineIdentity::new("local").unwrap());
    let mut stage = SelfDeployStage::new(runner, engine.clone(), names.clone(), options);

    let report = stage.run().await.expect("self-deploy runs");
    assert!(matches!(report.infrastructure, SubStepOutcome::Skipped(_)));
    assert_eq!(report.graph, SubStepOutcome::Succeeded);
    assert_eq!(report.commit_id, head);
    assert!(engine.live_template(names.graph()).await.unwrap().is_some());
}

#[tokio::test]
#[ignore] // Requires kubectl and a cluster with the workflow engine installed
async fn test_kubectl_publish_and_republish() {
    let namespace = std::env::var("SHIPGRAPH_TEST_NAMESPACE").unwrap_or_else(|_| "argo".to_string());
    let engine = KubectlEngine::new("kubectl", namespace.clone(), 60);
    let identity = PipelineIdentity::new("itest").unwrap();
    let config = PipelineConfig::from_yaml(DESCRIPTION).unwrap();
    let names = derive_names(&identity);
    let graph = compile_in(&config, &names, &ImageSet::default(), &namespace).unwrap();

    let mut controller = Controller::new(engine).with_namespace(namespace);
    let first = controller.publish(&graph).await.unwrap();
    assert!(first.is_success(), "{:?}", first);

    let second = controller.publish(&graph).await.unwrap();
    assert!(matches!(second, PublishResult::Unchanged { .. }));

    assert!(controller.engine().delete_template(&graph.name).await.unwrap());
}

#[tokio::test]
#[ignore] // Requires AWS credentials for the described account
async fn test_validate_against_real_account() {
    let dir = TempDir::new().unwrap();
    let account = std::env::var("SHIPGRAPH_TEST_ACCOUNT").unwrap_or_else(|_| "123456789012".to_string());
    let path = dir.path().join("shipgraph.yaml");
    std::fs::write(&path, DESCRIPTION.replace("123456789012", &account)).unwrap();

    let mut options = ValidationOptions::new(&path);
    options.skip_context = true;
    options.skip_tools = true;
    options.workspace = dir.path().to_path_buf();
    let report = Validator::new(ShellRunner::new(60), options).run().await;
    assert!(report.is_ok(), "{:?}", report.failures);
}

#[tokio::test]
async fn test_shell_runner_reports_exit_code_and_env() {
    let runner = ShellRunner::new(10);
    let dir = TempDir::new().unwrap();
    let output = runner
        .run(
            "echo \"$GREETING\"; exit 3",
            dir.path(),
            &[("GREETING".to_string(), "hello".to_string())],
        )
        .await
        .unwrap();
    assert_eq!(output.exit_code, 3);
    assert_eq!(output.stdout.trim(), "hello");
}
