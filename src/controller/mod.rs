//! Self-modification controller
//!
//! Publishes compiled graphs to the workflow engine. The live template is the
//! only shared state written here, and it is only ever replaced whole, guarded
//! by the version observed at the start of the attempt. Executions that
//! already started keep the template they were created from; that pinning is
//! the engine's job and `InMemoryEngine` models it for tests.

pub mod kubectl;
pub mod memory;
pub mod self_deploy;

pub use kubectl::KubectlEngine;
pub use memory::{ExecutionId, InMemoryEngine};
pub use self_deploy::{SelfDeployOptions, SelfDeployReport, SelfDeployStage, SubStepOutcome};

use crate::compiler::template::{render_in, WorkflowTemplate, DEFAULT_NAMESPACE};
use crate::core::error::{CompileError, PublishError};
use crate::core::graph::StageGraph;
use crate::core::secrets;
use crate::persistence::{GraphHistory, PublishOutcome, PublishRecord};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Opaque version token the engine assigns to each accepted template
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GraphVersion(String);

impl GraphVersion {
    pub fn new(version: impl Into<String>) -> Self {
        Self(version.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GraphVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The template currently accepted by the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveTemplate {
    pub version: GraphVersion,
    pub document: WorkflowTemplate,
}

/// Trait for workflow engines - allows the controller to run against a fake
#[async_trait]
pub trait WorkflowEngine: Send + Sync {
    /// Replace the template named `name` as a whole
    ///
    /// `expected` is the version observed before the attempt; `None` means no
    /// template may exist yet. A mismatch is `PublishError::Conflict`.
    async fn apply_template(
        &self,
        name: &str,
        document: &WorkflowTemplate,
        expected: Option<&GraphVersion>,
    ) -> Result<GraphVersion, PublishError>;

    /// Read the live template, if any
    async fn live_template(&self, name: &str) -> Result<Option<LiveTemplate>, PublishError>;

    /// Remove the template. Returns false when nothing was there.
    async fn delete_template(&self, name: &str) -> Result<bool, PublishError>;
}

/// Result of one publish attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishResult {
    /// A new template is live
    Published { version: GraphVersion, digest: String },
    /// The live template already matches the graph
    Unchanged { version: GraphVersion },
    /// Nothing changed on the engine; `retained` is still authoritative
    Failed {
        error: PublishError,
        retained: Option<GraphVersion>,
    },
}

impl PublishResult {
    pub fn is_success(&self) -> bool {
        !matches!(self, PublishResult::Failed { .. })
    }

    /// The version live after the attempt
    pub fn live_version(&self) -> Option<&GraphVersion> {
        match self {
            PublishResult::Published { version, .. } => Some(version),
            PublishResult::Unchanged { version } => Some(version),
            PublishResult::Failed { retained, .. } => retained.as_ref(),
        }
    }

    fn outcome(&self) -> PublishOutcome {
        match self {
            PublishResult::Published { .. } => PublishOutcome::Published,
            PublishResult::Unchanged { .. } => PublishOutcome::Unchanged,
            PublishResult::Failed { .. } => PublishOutcome::Failed,
        }
    }
}

/// Per-instance publish state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerState {
    NoGraph,
    GraphLive(GraphVersion),
    /// The last attempt failed; `live` is whatever was live before it
    PublishFailed { live: Option<GraphVersion> },
}

/// Publishes graphs for one pipeline instance
pub struct Controller<E> {
    engine: E,
    namespace: String,
    state: ControllerState,
    history: Option<Arc<dyn GraphHistory>>,
    commit_id: Option<String>,
}

impl<E: WorkflowEngine> Controller<E> {
    pub fn new(engine: E) -> Self {
        Self {
            engine,
            namespace: DEFAULT_NAMESPACE.to_string(),
            state: ControllerState::NoGraph,
            history: None,
            commit_id: None,
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Record every attempt in `history`
    pub fn with_history(mut self, history: Arc<dyn GraphHistory>) -> Self {
        self.history = Some(history);
        self
    }

    /// Commit the published graphs are compiled from
    pub fn with_commit(mut self, commit_id: impl Into<String>) -> Self {
        self.commit_id = Some(commit_id.into());
        self
    }

    pub fn state(&self) -> &ControllerState {
        &self.state
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn live_version(&self) -> Option<GraphVersion> {
        match &self.state {
            ControllerState::NoGraph => None,
            ControllerState::GraphLive(version) => Some(version.clone()),
            ControllerState::PublishFailed { live } => live.clone(),
        }
    }

    /// Publish a graph as a single all-or-nothing replace
    ///
    /// Invariant violations abort before the engine is contacted. Engine
    /// failures are logged and returned as `PublishResult::Failed`; they are
    /// never retried here.
    pub async fn publish(&mut self, graph: &StageGraph) -> Result<PublishResult, CompileError> {
        graph.check_invariants()?;

        let name = graph.name.as_str();
        let digest = graph.digest();
        let document = render_in(graph, &self.namespace);

        info!("Publishing graph {} ({} stages)", name, graph.stages.len());

        let result = self.attempt(name, &document, &digest).await;

        match &result {
            PublishResult::Published { version, .. } => {
                info!("Graph {} is live at version {}", name, version);
                self.state = ControllerState::GraphLive(version.clone());
            }
            PublishResult::Unchanged { version } => {
                info!("Graph {} unchanged at version {}", name, version);
                self.state = ControllerState::GraphLive(version.clone());
            }
            PublishResult::Failed { error, retained } => {
                warn!(
                    "Publish of {} failed, continuing with existing topology ({}): {}",
                    name,
                    retained
                        .as_ref()
                        .map(|v| format!("version {}", v))
                        .unwrap_or_else(|| "no live graph".to_string()),
                    secrets::redact(&error.to_string())
                );
                self.state = ControllerState::PublishFailed {
                    live: retained.clone(),
                };
            }
        }

        self.record(name, &digest, &result).await;
        Ok(result)
    }

    async fn attempt(&self, name: &str, document: &WorkflowTemplate, digest: &str) -> PublishResult {
        let observed = match self.engine.live_template(name).await {
            Ok(observed) => observed,
            Err(error) => {
                return PublishResult::Failed {
                    error,
                    retained: self.live_version(),
                }
            }
        };

        if let Some(live) = &observed {
            if live.document.graph_digest() == Some(digest) {
                return PublishResult::Unchanged {
                    version: live.version.clone(),
                };
            }
        }

        let expected = observed.map(|live| live.version);
        debug!(
            "Replacing {} (expected version: {})",
            name,
            expected
                .as_ref()
                .map(GraphVersion::as_str)
                .unwrap_or("none")
        );

        match self
            .engine
            .apply_template(name, document, expected.as_ref())
            .await
        {
            Ok(version) => PublishResult::Published {
                version,
                digest: digest.to_string(),
            },
            Err(error) => PublishResult::Failed {
                error,
                retained: expected,
            },
        }
    }

    async fn record(&self, name: &str, digest: &str, result: &PublishResult) {
        let Some(history) = &self.history else {
            return;
        };

        let mut record = PublishRecord::new(name, digest, result.outcome())
            .with_version(result.live_version().map(|v| v.to_string()))
            .with_commit(self.commit_id.clone());
        if let PublishResult::Failed { error, .. } = result {
            record = record.with_detail(secrets::redact(&error.to_string()));
        }

        // History is advisory; a failed write never changes the publish outcome
        if let Err(e) = history.record(&record).await {
            warn!("Failed to record publish history for {}: {}", name, e);
        }
    }
}
