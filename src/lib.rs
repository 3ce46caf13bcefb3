//! shipgraph - self-updating deployment pipelines on a shared workflow engine

pub mod cli;
pub mod compiler;
pub mod controller;
pub mod core;
pub mod persistence;
pub mod runtime;
pub mod validation;

// Re-export commonly used types
pub use compiler::{compile, compile_in, compile_with_names, ImageSet, WorkflowTemplate};
pub use controller::{
    Controller, ControllerState, GraphVersion, InMemoryEngine, KubectlEngine, PublishResult,
    SelfDeployStage, WorkflowEngine,
};
pub use core::{
    BranchFilter, CompileError, IsolationError, PipelineConfig, PipelineIdentity, PublishError,
    ResourceNameSet, StageExecutionError, StageGraph, TriggerEvent, ValidationError,
};
pub use runtime::{CommandRunner, ShellRunner, StageResult};
