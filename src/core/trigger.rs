//! Trigger events delivered by the webhook path

use serde::{Deserialize, Serialize};
use thiserror::Error;

const BRANCH_REF_PREFIX: &str = "refs/heads/";
const TAG_REF_PREFIX: &str = "refs/tags/";

/// Why a webhook payload could not be turned into a trigger
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TriggerError {
    #[error("missing '{0}' field in webhook payload")]
    MissingField(String),

    #[error("invalid '{0}' field in webhook payload")]
    InvalidField(String),
}

/// One commit push that starts an execution of the live graph
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub commit_id: String,
    /// Bare branch name or fully qualified ref, as delivered
    pub branch_ref: String,
    pub source_url: String,
    pub actor: Option<String>,
}

/// Strip `refs/heads/` so both delivery forms name the same branch
pub fn normalize_branch(branch_ref: &str) -> &str {
    branch_ref
        .strip_prefix(BRANCH_REF_PREFIX)
        .unwrap_or(branch_ref)
}

impl TriggerEvent {
    pub fn new(
        commit_id: impl Into<String>,
        branch_ref: impl Into<String>,
        source_url: impl Into<String>,
    ) -> Self {
        Self {
            commit_id: commit_id.into(),
            branch_ref: branch_ref.into(),
            source_url: source_url.into(),
            actor: None,
        }
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    /// Logical branch name, or None for tag pushes
    pub fn branch(&self) -> Option<&str> {
        if self.branch_ref.starts_with(TAG_REF_PREFIX) {
            return None;
        }
        Some(normalize_branch(&self.branch_ref))
    }

    /// Extract a trigger from a push webhook payload
    pub fn from_webhook_payload(payload: &serde_json::Value) -> Result<Self, TriggerError> {
        let object = payload
            .as_object()
            .ok_or_else(|| TriggerError::InvalidField("(payload)".to_string()))?;

        let commit_id = required_str(object.get("after"), "after")?;
        let branch_ref = required_str(object.get("ref"), "ref")?;

        let repository = object
            .get("repository")
            .ok_or_else(|| TriggerError::MissingField("repository".to_string()))?;
        let source_url = required_str(repository.get("clone_url"), "repository.clone_url")?;

        // Not every provider sends the pusher; name wins over login
        let actor = object.get("pusher").and_then(|pusher| {
            pusher
                .get("name")
                .and_then(|v| v.as_str())
                .or_else(|| pusher.get("login").and_then(|v| v.as_str()))
                .map(str::to_string)
        });

        Ok(Self {
            commit_id,
            branch_ref,
            source_url,
            actor,
        })
    }
}

fn required_str(value: Option<&serde_json::Value>, field: &str) -> Result<String, TriggerError> {
    let value = value.ok_or_else(|| TriggerError::MissingField(field.to_string()))?;
    match value.as_str() {
        Some(s) if !s.is_empty() => Ok(s.to_string()),
        _ => Err(TriggerError::InvalidField(field.to_string())),
    }
}

/// Accepts only pushes to one target branch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchFilter {
    target: String,
}

impl BranchFilter {
    pub fn new(target: impl Into<String>) -> Self {
        let target = target.into();
        let target = normalize_branch(&target).to_string();
        Self { target }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn matches(&self, event: &TriggerEvent) -> bool {
        event.branch() == Some(self.target.as_str())
    }
}
