//! Scenario-based tests for shipgraph

#[path = "../helpers.rs"]
mod helpers;

mod artifact_tagging;
mod compile_topology;
mod config_rejection;
mod execution_pinning;
mod isolation;
mod stage_runtime;
mod trigger_matching;
