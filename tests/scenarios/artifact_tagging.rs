//! Test: Artifact tagging - stored artifacts come back byte-identical with their commit

use crate::helpers::*;
use shipgraph::core::error::StageExecutionError;
use shipgraph::persistence::{
    artifact_key, ArtifactStore, ArtifactTag, InMemoryArtifactStore, LocalArtifactStore,
};
use shipgraph::runtime::build::METADATA_ARTIFACT;
use shipgraph::runtime::BuildStage;
use std::sync::Arc;
use tempfile::TempDir;

const COMMIT: &str = "3f2c1a9e8d7b";

fn binary_payload() -> Vec<u8> {
    (0..=255u8).cycle().take(4096).collect()
}

async fn assert_round_trip(store: &dyn ArtifactStore) {
    let tag = ArtifactTag::new(COMMIT);
    let contents = binary_payload();

    let key = store.put(&tag, "dist/app.zip", &contents).await.unwrap();
    assert_eq!(key, artifact_key(COMMIT, "dist/app.zip"));

    let stored = store.get(&key).await.unwrap().unwrap();
    assert_eq!(stored.contents, contents);
    assert_eq!(stored.tag, tag);
    assert_eq!(stored.tag.commit_id, COMMIT);

    assert!(store.get(&artifact_key(COMMIT, "missing.txt")).await.unwrap().is_none());
    assert!(store.list("other").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_in_memory_store_round_trip() {
    assert_round_trip(&InMemoryArtifactStore::new()).await;
}

#[tokio::test]
async fn test_local_store_round_trip() {
    let dir = TempDir::new().unwrap();
    let store = LocalArtifactStore::new(dir.path());
    assert_round_trip(&store).await;

    // A second handle on the same root sees the same artifact
    let reopened = LocalArtifactStore::new(dir.path());
    let stored = reopened
        .get(&artifact_key(COMMIT, "dist/app.zip"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.contents, binary_payload());
}

#[tokio::test]
async fn test_keys_cannot_escape_the_store() {
    let store = InMemoryArtifactStore::new();
    let tag = ArtifactTag::new(COMMIT);
    assert!(store.put(&tag, "../etc/passwd", b"x").await.is_err());
    assert!(store.put(&tag, "/abs", b"x").await.is_err());
    assert!(store.put(&ArtifactTag::new("a/b"), "f", b"x").await.is_err());
    assert!(store.get("no-separator").await.is_err());
}

#[tokio::test]
async fn test_build_stage_stores_tagged_artifacts() {
    let workspace = TempDir::new().unwrap();
    let artifacts = workspace.path().join("artifacts");
    std::fs::create_dir_all(artifacts.join("lambda")).unwrap();
    std::fs::write(artifacts.join("lambda/handler.zip"), binary_payload()).unwrap();
    std::fs::write(artifacts.join("index.html"), "<html></html>").unwrap();

    let runner = RecordingRunner::new();
    let store = Arc::new(InMemoryArtifactStore::new());
    let stage = BuildStage::new(
        runner.clone(),
        store.clone(),
        workspace.path(),
        vec!["npm ci".to_string(), "npm run build".to_string()],
    );

    let result = stage.run(COMMIT).await.unwrap();
    assert!(result.success);
    assert_eq!(result.field("artifactPath").unwrap(), store.location(COMMIT));

    assert_eq!(runner.commands(), vec!["npm ci", "npm run build"]);
    for call in runner.calls() {
        assert_eq!(call.dir, workspace.path());
        assert_eq!(call.env_var("COMMIT_SHA"), Some(COMMIT));
    }

    let keys = store.list(COMMIT).await.unwrap();
    assert!(keys.contains(&artifact_key(COMMIT, "index.html")));
    assert!(keys.contains(&artifact_key(COMMIT, "lambda/handler.zip")));
    assert!(keys.contains(&artifact_key(COMMIT, METADATA_ARTIFACT)));

    let handler = store
        .get(&artifact_key(COMMIT, "lambda/handler.zip"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(handler.contents, binary_payload());
    assert_eq!(handler.tag.commit_id, COMMIT);

    let metadata = store
        .get(&artifact_key(COMMIT, METADATA_ARTIFACT))
        .await
        .unwrap()
        .unwrap();
    let metadata: serde_json::Value = serde_json::from_slice(&metadata.contents).unwrap();
    assert_eq!(metadata["commit_id"], COMMIT);
    assert_eq!(metadata["artifacts"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_build_failure_stores_nothing() {
    let workspace = TempDir::new().unwrap();
    std::fs::create_dir_all(workspace.path().join("artifacts")).unwrap();
    std::fs::write(workspace.path().join("artifacts/stale.txt"), "old").unwrap();

    let runner = RecordingRunner::new().respond("npm run build", 2, "");
    let store = Arc::new(InMemoryArtifactStore::new());
    let stage = BuildStage::new(
        runner.clone(),
        store.clone(),
        workspace.path(),
        vec![
            "npm ci".to_string(),
            "npm run build".to_string(),
            "npm run package".to_string(),
        ],
    );

    let err = stage.run(COMMIT).await.unwrap_err();
    match err.downcast_ref::<StageExecutionError>() {
        Some(StageExecutionError::CommandFailed { exit_code, command, .. }) => {
            assert_eq!(*exit_code, 2);
            assert_eq!(command, "npm run build");
        }
        other => panic!("expected a command failure, got {:?}", other),
    }
    // The first failing command halts the stage
    assert_eq!(runner.commands(), vec!["npm ci", "npm run build"]);
    assert!(store.list(COMMIT).await.unwrap().is_empty());
}
