//! Error taxonomy for config parsing, compilation, publishing and stage execution

use thiserror::Error;

/// Rejection of a pipeline description before any compilation happens
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// Missing or malformed field, unsupported version, empty list, duplicate identifier
    #[error("schema error at {field}: {message}")]
    Schema { field: String, message: String },

    /// A string value looks like a credential. Advisory, not cryptographic detection.
    #[error("possible secret in {field}: value looks like {kind}")]
    SecretLeakage { field: String, kind: String },
}

impl ValidationError {
    pub fn schema(field: impl Into<String>, message: impl Into<String>) -> Self {
        ValidationError::Schema {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Field path the error refers to
    pub fn field(&self) -> &str {
        match self {
            ValidationError::Schema { field, .. } => field,
            ValidationError::SecretLeakage { field, .. } => field,
        }
    }
}

/// Compiler failures. Graphs that fail here are never published.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CompileError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("compiled graph violates invariant at stage '{stage}': {message}")]
    Invariant { stage: String, message: String },
}

impl CompileError {
    pub fn invariant(stage: impl Into<String>, message: impl Into<String>) -> Self {
        CompileError::Invariant {
            stage: stage.into(),
            message: message.into(),
        }
    }
}

/// Graph submission failures. Non-fatal to the running execution.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PublishError {
    /// The engine refused the document (malformed or invalid template)
    #[error("engine rejected template '{name}': {reason}")]
    Rejected { name: String, reason: String },

    /// The engine could not be reached, timed out, or refused our credentials
    #[error("engine unreachable while applying '{name}': {reason}")]
    Transport { name: String, reason: String },

    /// Another publisher replaced the live graph after we read its version
    #[error("live template '{name}' changed during publish (expected version {expected}, found {found})")]
    Conflict {
        name: String,
        expected: String,
        found: String,
    },
}

/// A stage's shell payload failed. Halts the execution; never retried automatically.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StageExecutionError {
    #[error("stage '{stage}' command `{command}` exited with code {exit_code}")]
    CommandFailed {
        stage: String,
        command: String,
        exit_code: i32,
    },

    #[error("stage '{stage}' could not spawn `{command}`: {reason}")]
    Spawn {
        stage: String,
        command: String,
        reason: String,
    },

    #[error("stage '{stage}' command `{command}` timed out after {secs} seconds")]
    Timeout {
        stage: String,
        command: String,
        secs: u64,
    },

    #[error("checkout of {commit} failed: {reason}")]
    Checkout { commit: String, reason: String },

    #[error("stage '{stage}': stack '{stack}' failed: {reason}")]
    StackFailed {
        stage: String,
        stack: String,
        reason: String,
    },

    #[error("stage '{stage}': {failed} of {total} test command(s) failed")]
    TestsFailed {
        stage: String,
        failed: usize,
        total: usize,
    },
}

/// Naming scheme violations between pipeline instances
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IsolationError {
    #[error("invalid instance name '{name}': {reason}")]
    InvalidInstanceName { name: String, reason: String },

    #[error("invalid {category} name '{name}': {reason}")]
    InvalidName {
        category: String,
        name: String,
        reason: String,
    },

    #[error("{category} name '{name}' is already used by instance '{owner}'")]
    NameCollision {
        category: String,
        name: String,
        owner: String,
    },

    #[error("teardown of '{instance}' references foreign resource {kind}/{name}")]
    ForeignResource {
        instance: String,
        kind: String,
        name: String,
    },
}
