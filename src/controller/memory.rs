//! In-process workflow engine
//!
//! Keeps one versioned record per template name, replaces it only on a
//! matching version, and pins every execution to the template that was live
//! when the execution was created.

use crate::compiler::template::WorkflowTemplate;
use crate::controller::{GraphVersion, LiveTemplate, WorkflowEngine};
use crate::core::error::PublishError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Identifier of a submitted execution
pub type ExecutionId = Uuid;

#[derive(Debug, Clone)]
struct PinnedExecution {
    version: GraphVersion,
    snapshot: Arc<WorkflowTemplate>,
}

#[derive(Debug, Default)]
struct EngineState {
    templates: HashMap<String, (GraphVersion, Arc<WorkflowTemplate>)>,
    executions: HashMap<ExecutionId, PinnedExecution>,
    next_version: u64,
    applies: usize,
    injected_failure: Option<PublishError>,
}

/// Fake engine for tests and dry runs. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct InMemoryEngine {
    state: Arc<RwLock<EngineState>>,
}

impl InMemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `apply_template` call fail with `error` without touching state
    pub async fn fail_next_apply(&self, error: PublishError) {
        self.state.write().await.injected_failure = Some(error);
    }

    /// Number of accepted applies
    pub async fn apply_count(&self) -> usize {
        self.state.read().await.applies
    }

    /// Start an execution of the live template, pinned to it
    pub async fn submit_execution(&self, name: &str) -> Option<ExecutionId> {
        let mut state = self.state.write().await;
        let (version, snapshot) = state.templates.get(name).cloned()?;
        let id = Uuid::new_v4();
        state
            .executions
            .insert(id, PinnedExecution { version, snapshot });
        Some(id)
    }

    /// Template an execution runs, fixed at creation
    pub async fn execution_graph(&self, id: ExecutionId) -> Option<Arc<WorkflowTemplate>> {
        let state = self.state.read().await;
        state.executions.get(&id).map(|e| e.snapshot.clone())
    }

    pub async fn execution_version(&self, id: ExecutionId) -> Option<GraphVersion> {
        let state = self.state.read().await;
        state.executions.get(&id).map(|e| e.version.clone())
    }
}

#[async_trait]
impl WorkflowEngine for InMemoryEngine {
    async fn apply_template(
        &self,
        name: &str,
        document: &WorkflowTemplate,
        expected: Option<&GraphVersion>,
    ) -> Result<GraphVersion, PublishError> {
        let mut state = self.state.write().await;

        if let Some(error) = state.injected_failure.take() {
            return Err(error);
        }

        if document.name() != name {
            return Err(PublishError::Rejected {
                name: name.to_string(),
                reason: format!("document is named '{}'", document.name()),
            });
        }

        let found = state.templates.get(name).map(|(version, _)| version.clone());
        if found.as_ref() != expected {
            return Err(PublishError::Conflict {
                name: name.to_string(),
                expected: expected
                    .map(|v| v.to_string())
                    .unwrap_or_else(|| "none".to_string()),
                found: found
                    .map(|v| v.to_string())
                    .unwrap_or_else(|| "none".to_string()),
            });
        }

        state.next_version += 1;
        let version = GraphVersion::new(state.next_version.to_string());
        state
            .templates
            .insert(name.to_string(), (version.clone(), Arc::new(document.clone())));
        state.applies += 1;
        Ok(version)
    }

    async fn live_template(&self, name: &str) -> Result<Option<LiveTemplate>, PublishError> {
        let state = self.state.read().await;
        Ok(state.templates.get(name).map(|(version, document)| LiveTemplate {
            version: version.clone(),
            document: document.as_ref().clone(),
        }))
    }

    async fn delete_template(&self, name: &str) -> Result<bool, PublishError> {
        let mut state = self.state.write().await;
        Ok(state.templates.remove(name).is_some())
    }
}
