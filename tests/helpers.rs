//! Test utility functions for shipgraph
#![allow(dead_code)]

use async_trait::async_trait;
use shipgraph::compiler::{compile, ImageSet};
use shipgraph::core::config::PipelineConfig;
use shipgraph::core::graph::StageGraph;
use shipgraph::core::identity::PipelineIdentity;
use shipgraph::runtime::{CommandOutput, CommandRunner, RunError};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// One environment in a generated description
pub struct EnvFixture {
    pub name: &'static str,
    pub stacks: Vec<(&'static str, &'static str)>,
    pub tests: Vec<&'static str>,
}

impl EnvFixture {
    pub fn new(name: &'static str, stacks: &[&'static str]) -> Self {
        Self {
            name,
            stacks: stacks.iter().map(|s| (*s, "infra")).collect(),
            tests: Vec::new(),
        }
    }

    pub fn with_tests(mut self, tests: &[&'static str]) -> Self {
        self.tests = tests.to_vec();
        self
    }
}

/// Render a description with the given environments
pub fn config_yaml(build: &[&str], environments: &[EnvFixture]) -> String {
    let mut yaml = String::from("version: \"1.0\"\nbuild:\n  commands:\n");
    for command in build {
        yaml.push_str(&format!("    - {:?}\n", command));
    }
    yaml.push_str("environments:\n");
    for env in environments {
        yaml.push_str(&format!(
            "  - name: {}\n    region: us-east-1\n    account: \"123456789012\"\n    stacks:\n",
            env.name
        ));
        for (stack, path) in &env.stacks {
            yaml.push_str(&format!("      - name: {}\n        path: {}\n", stack, path));
        }
        if !env.tests.is_empty() {
            yaml.push_str("    tests:\n      commands:\n");
            for command in &env.tests {
                yaml.push_str(&format!("        - {:?}\n", command));
            }
        }
    }
    yaml
}

/// One environment, stacks A then B, no tests
pub fn single_environment_yaml() -> String {
    config_yaml(&["npm ci", "npm run build"], &[EnvFixture::new("env1", &["A", "B"])])
}

/// env1 with tests, env2 without
pub fn two_environment_yaml() -> String {
    config_yaml(
        &["npm ci"],
        &[
            EnvFixture::new("env1", &["A"]).with_tests(&["npm run test:smoke"]),
            EnvFixture::new("env2", &["A"]),
        ],
    )
}

pub fn identity(name: &str) -> PipelineIdentity {
    PipelineIdentity::new(name).expect("valid instance name")
}

/// Parse and compile with default images
pub fn compile_yaml(yaml: &str, instance: &str) -> StageGraph {
    let config = PipelineConfig::from_yaml(yaml).expect("valid description");
    compile(&config, &identity(instance), &ImageSet::default()).expect("compiles")
}

/// Assert stage names in order
pub fn assert_stage_order(graph: &StageGraph, expected: &[&str]) {
    assert_eq!(
        graph.stage_names(),
        expected,
        "stage order mismatch for graph {}",
        graph.name
    );
}

/// Byte offset of `needle` in `haystack`, failing loudly when absent
pub fn position(haystack: &str, needle: &str) -> usize {
    haystack
        .find(needle)
        .unwrap_or_else(|| panic!("`{}` not found in:\n{}", needle, haystack))
}

/// Call recorded by [`RecordingRunner`]
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub command: String,
    pub dir: PathBuf,
    pub env: Vec<(String, String)>,
}

impl RecordedCall {
    pub fn env_var(&self, name: &str) -> Option<&str> {
        self.env
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Default)]
struct RunnerState {
    scripted: Vec<(String, i32, String)>,
    calls: Vec<RecordedCall>,
}

/// Fake command runner: answers by command prefix, records every call.
/// Clones share state.
#[derive(Clone, Default)]
pub struct RecordingRunner {
    state: Arc<Mutex<RunnerState>>,
}

impl RecordingRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Commands starting with `prefix` exit with `code` and print `stdout`.
    /// Earlier rules win.
    pub fn respond(self, prefix: &str, code: i32, stdout: &str) -> Self {
        self.state
            .lock()
            .unwrap()
            .scripted
            .push((prefix.to_string(), code, stdout.to_string()));
        self
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn commands(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.command).collect()
    }
}

#[async_trait]
impl CommandRunner for RecordingRunner {
    async fn run(
        &self,
        command: &str,
        dir: &Path,
        env: &[(String, String)],
    ) -> Result<CommandOutput, RunError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(RecordedCall {
            command: command.to_string(),
            dir: dir.to_path_buf(),
            env: env.to_vec(),
        });
        let (exit_code, stdout) = state
            .scripted
            .iter()
            .find(|(prefix, _, _)| command.starts_with(prefix.as_str()))
            .map(|(_, code, stdout)| (*code, stdout.clone()))
            .unwrap_or((0, String::new()));
        Ok(CommandOutput {
            exit_code,
            stdout,
            stderr: if exit_code == 0 {
                String::new()
            } else {
                format!("{} failed", command)
            },
            duration: Duration::from_millis(5),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixture_yaml_parses() {
        let config = PipelineConfig::from_yaml(&two_environment_yaml()).unwrap();
        assert_eq!(config.environments.len(), 2);
        assert!(config.environments[0].has_tests());
        assert!(!config.environments[1].has_tests());
    }

    #[tokio::test]
    async fn test_recording_runner_scripts_by_prefix() {
        let runner = RecordingRunner::new().respond("false", 1, "");
        let output = runner.run("false now", Path::new("."), &[]).await.unwrap();
        assert_eq!(output.exit_code, 1);
        let output = runner.run("true", Path::new("."), &[]).await.unwrap();
        assert!(output.success());
        assert_eq!(runner.commands(), vec!["false now", "true"]);
    }
}
