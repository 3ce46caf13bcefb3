//! Test: Execution pinning - a publish never changes a running execution

use crate::helpers::*;
use shipgraph::controller::{Controller, InMemoryEngine, PublishResult};

fn one_stack() -> String {
    config_yaml(&["npm ci"], &[EnvFixture::new("dev", &["App"])])
}

#[tokio::test]
async fn test_running_execution_keeps_its_topology() {
    let engine = InMemoryEngine::new();
    let mut controller = Controller::new(engine.clone());

    let v1 = compile_yaml(&one_stack(), "demo");
    let first = controller.publish(&v1).await.unwrap();
    assert!(matches!(first, PublishResult::Published { .. }));
    let v1_version = first.live_version().cloned().unwrap();

    let running = engine.submit_execution(&v1.name).await.unwrap();

    // The run adds a test stage and republishes while `running` is in flight
    let v2 = compile_yaml(
        &config_yaml(
            &["npm ci"],
            &[EnvFixture::new("dev", &["App"]).with_tests(&["npm test"])],
        ),
        "demo",
    );
    let second = controller.publish(&v2).await.unwrap();
    let v2_version = second.live_version().cloned().unwrap();
    assert_ne!(v1_version, v2_version);

    let pinned = engine.execution_graph(running).await.unwrap();
    assert_eq!(pinned.graph_digest(), Some(v1.digest().as_str()));
    assert_eq!(pinned.stage_names(), vec!["build", "self-deploy", "deploy-dev"]);
    assert_eq!(engine.execution_version(running).await.unwrap(), v1_version);

    // The next execution picks up the new topology
    let next = engine.submit_execution(&v2.name).await.unwrap();
    let fresh = engine.execution_graph(next).await.unwrap();
    assert_eq!(fresh.graph_digest(), Some(v2.digest().as_str()));
    assert_eq!(
        fresh.stage_names(),
        vec!["build", "self-deploy", "deploy-dev", "test-dev"]
    );
}

#[tokio::test]
async fn test_failed_publish_leaves_next_execution_on_old_graph() {
    let engine = InMemoryEngine::new();
    let mut controller = Controller::new(engine.clone());

    let v1 = compile_yaml(&one_stack(), "demo");
    controller.publish(&v1).await.unwrap();

    engine
        .fail_next_apply(shipgraph::PublishError::Transport {
            name: v1.name.clone(),
            reason: "connection refused".to_string(),
        })
        .await;
    let v2 = compile_yaml(&two_environment_yaml(), "demo");
    let result = controller.publish(&v2).await.unwrap();
    assert!(!result.is_success());

    let next = engine.submit_execution(&v1.name).await.unwrap();
    let graph = engine.execution_graph(next).await.unwrap();
    assert_eq!(graph.graph_digest(), Some(v1.digest().as_str()));
}

#[tokio::test]
async fn test_no_execution_without_a_live_graph() {
    let engine = InMemoryEngine::new();
    assert!(engine.submit_execution("shipgraph-ghost").await.is_none());
}
