//! Build stage: run build commands, tag and store artifacts

use crate::compiler::script::shell_quote;
use crate::core::graph::BUILD_STAGE;
use crate::persistence::artifacts::collect_files;
use crate::persistence::{ArtifactStore, ArtifactTag};
use crate::runtime::{run_checked, CommandRunner, StageResult};
use anyhow::{bail, Context, Result};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// Directory inside the workspace whose files become artifacts
pub const ARTIFACTS_DIR: &str = "artifacts";

/// Artifact names under this directory belong to the build stage itself
pub const RESERVED_DIR: &str = ".shipgraph";

/// Name the build metadata is stored under
pub const METADATA_ARTIFACT: &str = ".shipgraph/build-metadata.json";

/// Remote location a bucket keeps one commit's artifacts under
pub fn s3_location(bucket: &str, commit_id: &str) -> String {
    format!("s3://{}/{}/", bucket, commit_id)
}

pub struct BuildStage<R> {
    runner: R,
    store: Arc<dyn ArtifactStore>,
    workspace: PathBuf,
    commands: Vec<String>,
    upload_bucket: Option<String>,
}

impl<R: CommandRunner> BuildStage<R> {
    pub fn new(
        runner: R,
        store: Arc<dyn ArtifactStore>,
        workspace: impl Into<PathBuf>,
        commands: Vec<String>,
    ) -> Self {
        Self {
            runner,
            store,
            workspace: workspace.into(),
            commands,
            upload_bucket: None,
        }
    }

    /// Also sync `artifacts/` to the bucket and report that location, which
    /// deploy stages running elsewhere can fetch from
    pub fn with_upload(mut self, bucket: impl Into<String>) -> Self {
        self.upload_bucket = Some(bucket.into());
        self
    }

    /// Run every build command in order, then store `artifacts/` tagged with the commit
    ///
    /// The first failing command halts the stage.
    pub async fn run(&self, commit_id: &str) -> Result<StageResult> {
        let env = vec![("COMMIT_SHA".to_string(), commit_id.to_string())];

        info!("Executing {} build command(s)", self.commands.len());
        for (index, command) in self.commands.iter().enumerate() {
            info!("[{}/{}] {}", index + 1, self.commands.len(), command);
            run_checked(&self.runner, BUILD_STAGE, command, &self.workspace, &env).await?;
        }

        let tag = ArtifactTag::new(commit_id);
        let artifacts_dir = self.workspace.join(ARTIFACTS_DIR);
        let mut names = Vec::new();
        collect_files(&artifacts_dir, "", &mut names)?;
        names.sort();
        if let Some(name) = names.iter().find(|n| n.starts_with(&format!("{}/", RESERVED_DIR))) {
            bail!(
                "Artifact {} uses the reserved directory {}/",
                name,
                RESERVED_DIR
            );
        }
        if names.is_empty() {
            warn!("No artifacts found in {}", artifacts_dir.display());
        }

        let mut keys = Vec::new();
        for name in &names {
            let path = artifacts_dir.join(name);
            let contents = tokio::fs::read(&path)
                .await
                .with_context(|| format!("Failed to read artifact: {}", path.display()))?;
            keys.push(self.store.put(&tag, name, &contents).await?);
        }

        let metadata = json!({
            "commit_id": tag.commit_id,
            "timestamp": tag.timestamp,
            "commands": self.commands,
            "artifacts": keys,
        });
        self.store
            .put(&tag, METADATA_ARTIFACT, serde_json::to_string_pretty(&metadata)?.as_bytes())
            .await?;

        let location = match &self.upload_bucket {
            Some(bucket) => {
                let remote = s3_location(bucket, commit_id);
                if artifacts_dir.is_dir() {
                    let sync = format!("aws s3 sync {} {}", ARTIFACTS_DIR, shell_quote(&remote));
                    run_checked(&self.runner, BUILD_STAGE, &sync, &self.workspace, &env).await?;
                }
                remote
            }
            None => self.store.location(commit_id),
        };
        info!("Stored {} artifact(s) at {}", keys.len(), location);

        Ok(StageResult::success(format!("Build completed for commit {}", commit_id))
            .with_artifact_path(location)
            .with_details(json!({
                "artifacts": keys,
                "commands": self.commands.len(),
            })))
    }
}
