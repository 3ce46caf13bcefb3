//! kubectl subprocess engine - talks to the cluster's workflow engine

use crate::compiler::template::WorkflowTemplate;
use crate::controller::{GraphVersion, LiveTemplate, WorkflowEngine};
use crate::core::error::PublishError;
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

const RESOURCE: &str = "workflowtemplate";
const RESOURCE_GROUP: &str = "workflowtemplates.argoproj.io";
const VERSION_JSONPATH: &str = "jsonpath={.metadata.resourceVersion}";

/// Stderr fragments that mean the cluster was never reached or refused us
const TRANSPORT_MARKERS: &[&str] = &[
    "Unable to connect",
    "connection refused",
    "i/o timeout",
    "Unauthorized",
    "forbidden",
    "no such host",
    "TLS handshake",
];

/// Captured result of one kubectl invocation
#[derive(Debug)]
struct KubectlOutput {
    success: bool,
    exit_code: i32,
    stdout: String,
    stderr: String,
}

/// Engine backed by `kubectl`
#[derive(Debug, Clone)]
pub struct KubectlEngine {
    /// Path to kubectl executable
    kubectl_path: String,

    /// Namespace the templates live in
    namespace: String,

    /// Timeout for each kubectl call in seconds
    timeout_secs: u64,
}

impl KubectlEngine {
    /// Create a new kubectl engine
    ///
    /// # Arguments
    /// * `kubectl_path` - Path to kubectl (e.g., "kubectl", "/usr/local/bin/kubectl")
    /// * `namespace` - Namespace of the workflow engine
    /// * `timeout_secs` - Timeout per call in seconds
    pub fn new(kubectl_path: impl Into<String>, namespace: impl Into<String>, timeout_secs: u64) -> Self {
        Self {
            kubectl_path: kubectl_path.into(),
            namespace: namespace.into(),
            timeout_secs,
        }
    }

    pub fn kubectl_path(&self) -> &str {
        &self.kubectl_path
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn run(
        &self,
        name: &str,
        args: &[&str],
        stdin: Option<String>,
    ) -> Result<KubectlOutput, PublishError> {
        debug!("Running {} {}", self.kubectl_path, args.join(" "));

        let transport = |reason: String| PublishError::Transport {
            name: name.to_string(),
            reason,
        };

        let mut child = Command::new(&self.kubectl_path)
            .args(args)
            .args(["--namespace", self.namespace.as_str()])
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| transport(format!("failed to spawn {}: {}", self.kubectl_path, e)))?;

        let run = async move {
            if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
                pipe.write_all(input.as_bytes()).await?;
                pipe.shutdown().await?;
            }
            child.wait_with_output().await
        };

        let output = timeout(Duration::from_secs(self.timeout_secs), run)
            .await
            .map_err(|_| transport(format!("kubectl timed out after {} seconds", self.timeout_secs)))?
            .map_err(|e| transport(format!("kubectl failed: {}", e)))?;

        Ok(KubectlOutput {
            success: output.status.success(),
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

/// Map a failed kubectl call onto the publish error taxonomy
fn classify_failure(name: &str, expected: Option<&GraphVersion>, output: &KubectlOutput) -> PublishError {
    let stderr = output.stderr.as_str();
    let reason = if stderr.is_empty() {
        format!("kubectl exited with code {}", output.exit_code)
    } else {
        stderr.to_string()
    };

    if stderr.contains("AlreadyExists") || stderr.contains("already exists") {
        return PublishError::Conflict {
            name: name.to_string(),
            expected: "none".to_string(),
            found: "existing template".to_string(),
        };
    }
    if stderr.contains("the object has been modified") || template_not_found(name, output) {
        return PublishError::Conflict {
            name: name.to_string(),
            expected: expected
                .map(|v| v.to_string())
                .unwrap_or_else(|| "none".to_string()),
            found: "a different version".to_string(),
        };
    }
    if TRANSPORT_MARKERS.iter().any(|marker| stderr.contains(marker)) {
        return PublishError::Transport {
            name: name.to_string(),
            reason,
        };
    }
    PublishError::Rejected {
        name: name.to_string(),
        reason,
    }
}

/// Whether kubectl reported that the named template itself is missing
///
/// A missing namespace or resource type also says "not found" but names
/// something else.
fn template_not_found(name: &str, output: &KubectlOutput) -> bool {
    let missing = format!("{} \"{}\" not found", RESOURCE_GROUP, name);
    output.stderr.contains("(NotFound)") && output.stderr.contains(&missing)
}

#[async_trait]
impl WorkflowEngine for KubectlEngine {
    async fn apply_template(
        &self,
        name: &str,
        document: &WorkflowTemplate,
        expected: Option<&GraphVersion>,
    ) -> Result<GraphVersion, PublishError> {
        if document.name() != name {
            return Err(PublishError::Rejected {
                name: name.to_string(),
                reason: format!("document is named '{}'", document.name()),
            });
        }

        // create refuses an existing object; replace honours resourceVersion
        let mut document = document.clone();
        document.metadata.namespace = self.namespace.clone();
        document.metadata.resource_version = expected.map(|v| v.to_string());
        let verb = if expected.is_some() { "replace" } else { "create" };

        let yaml = document.to_yaml().map_err(|e| PublishError::Rejected {
            name: name.to_string(),
            reason: e.to_string(),
        })?;

        let output = self
            .run(name, &[verb, "-f", "-", "-o", VERSION_JSONPATH], Some(yaml))
            .await?;

        if !output.success {
            let error = classify_failure(name, expected, &output);
            warn!("kubectl {} of {} failed (exit {})", verb, name, output.exit_code);
            return Err(error);
        }

        let version = output.stdout.trim();
        if version.is_empty() {
            return Err(PublishError::Transport {
                name: name.to_string(),
                reason: "kubectl did not report a resourceVersion".to_string(),
            });
        }
        Ok(GraphVersion::new(version))
    }

    async fn live_template(&self, name: &str) -> Result<Option<LiveTemplate>, PublishError> {
        let output = self
            .run(name, &["get", RESOURCE, name, "-o", "json"], None)
            .await?;

        if !output.success {
            if template_not_found(name, &output) {
                return Ok(None);
            }
            return Err(classify_failure(name, None, &output));
        }

        let document: WorkflowTemplate =
            serde_json::from_str(&output.stdout).map_err(|e| PublishError::Transport {
                name: name.to_string(),
                reason: format!("unreadable template from cluster: {}", e),
            })?;
        let version = document
            .metadata
            .resource_version
            .clone()
            .ok_or_else(|| PublishError::Transport {
                name: name.to_string(),
                reason: "live template has no resourceVersion".to_string(),
            })?;

        Ok(Some(LiveTemplate {
            version: GraphVersion::new(version),
            document,
        }))
    }

    async fn delete_template(&self, name: &str) -> Result<bool, PublishError> {
        let output = self
            .run(name, &["delete", RESOURCE, name, "--ignore-not-found", "-o", "name"], None)
            .await?;

        if !output.success {
            return Err(classify_failure(name, None, &output));
        }
        Ok(!output.stdout.trim().is_empty())
    }
}
