//! Pipeline description loaded from YAML

use crate::core::error::ValidationError;
use crate::core::secrets;
use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::sync::OnceLock;

/// Schema versions this build understands
pub const SUPPORTED_VERSIONS: &[&str] = &["1.0"];

/// The published schema every description is checked against by default
pub const DEFAULT_SCHEMA: &str = include_str!("../../schema/pipeline-config.schema.json");

/// Top-level pipeline description
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Schema version of the document
    pub version: String,

    /// Build stage commands
    pub build: BuildSpec,

    /// Deployment environments, in promotion order
    pub environments: Vec<EnvironmentSpec>,
}

/// Build stage configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildSpec {
    /// Shell commands run in order inside the build container
    pub commands: Vec<String>,
}

/// A single deployment target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentSpec {
    /// Unique environment name, used in stage names
    pub name: String,

    /// Opaque location identifiers handed to the infrastructure tool
    pub region: String,
    pub account: String,

    /// Stacks deployed strictly in this order
    pub stacks: Vec<StackSpec>,

    /// Post-deploy tests
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tests: Option<TestSpec>,
}

/// One infrastructure unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackSpec {
    /// Stack name, unique within its environment
    pub name: String,

    /// Reference resolved by the infrastructure tool
    pub path: String,
}

/// Test commands for an environment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestSpec {
    pub commands: Vec<String>,
}

impl EnvironmentSpec {
    /// Whether this environment gets a `test-<name>` stage
    pub fn has_tests(&self) -> bool {
        self.tests.as_ref().is_some_and(|t| !t.commands.is_empty())
    }

    /// Variables that point the cloud CLI and the infrastructure tool at this location
    pub fn location_env(&self) -> Vec<(String, String)> {
        vec![
            ("AWS_REGION".to_string(), self.region.clone()),
            ("AWS_DEFAULT_REGION".to_string(), self.region.clone()),
            ("AWS_ACCOUNT".to_string(), self.account.clone()),
            ("CDK_DEFAULT_REGION".to_string(), self.region.clone()),
            ("CDK_DEFAULT_ACCOUNT".to_string(), self.account.clone()),
        ]
    }
}

// Identifiers fail closed: a pattern that does not compile accepts nothing
fn pattern_matches(cell: &'static OnceLock<Option<Regex>>, pattern: &str, value: &str) -> bool {
    cell.get_or_init(|| Regex::new(pattern).ok())
        .as_ref()
        .is_some_and(|re| re.is_match(value))
}

/// Environment names end up in stage and template names
pub fn is_valid_environment_name(name: &str) -> bool {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    pattern_matches(&RE, r"^[a-z][a-z0-9-]{0,40}$", name)
}

/// Stack names follow the infrastructure tool's naming rule
pub fn is_valid_stack_name(name: &str) -> bool {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    pattern_matches(&RE, r"^[A-Za-z][A-Za-z0-9-]{0,127}$", name)
}

fn is_valid_location(value: &str) -> bool {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    pattern_matches(&RE, r"^[A-Za-z0-9][A-Za-z0-9._:-]*$", value)
}

/// The bundled schema, parsed once
fn bundled_schema() -> Result<&'static serde_json::Value, ValidationError> {
    static SCHEMA: OnceLock<Result<serde_json::Value, String>> = OnceLock::new();
    SCHEMA
        .get_or_init(|| serde_json::from_str(DEFAULT_SCHEMA).map_err(|e| e.to_string()))
        .as_ref()
        .map_err(|e| ValidationError::schema("(schema)", format!("bundled schema is not valid JSON: {}", e)))
}

/// Parses descriptions and checks them against a JSON schema
#[derive(Debug, Clone, Default)]
pub struct ConfigParser {
    /// Caller-supplied schema; `None` means the bundled one
    schema: Option<serde_json::Value>,
}

impl ConfigParser {
    /// Parser using the bundled schema
    pub fn new() -> Self {
        Self::default()
    }

    /// Parser using a caller-supplied schema document
    pub fn with_schema(schema: serde_json::Value) -> Self {
        Self {
            schema: Some(schema),
        }
    }

    /// Load a schema from a JSON file
    pub fn from_schema_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Schema file not found: {}", path.display()))?;
        let schema = serde_json::from_str(&content)
            .with_context(|| format!("Schema file is not valid JSON: {}", path.display()))?;
        Ok(Self::with_schema(schema))
    }

    /// Parse and validate a raw YAML document
    pub fn parse(&self, raw: &str) -> Result<PipelineConfig, ValidationError> {
        let document: serde_yaml::Value = serde_yaml::from_str(raw)
            .map_err(|e| ValidationError::schema("(document)", format!("invalid YAML: {}", e)))?;
        let document = serde_json::to_value(&document).map_err(|e| {
            ValidationError::schema("(document)", format!("not representable as JSON: {}", e))
        })?;

        self.check_schema(&document)?;

        let config: PipelineConfig = serde_json::from_value(document)
            .map_err(|e| ValidationError::schema("(document)", e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read a file and parse it
    pub fn parse_file<P: AsRef<Path>>(&self, path: P) -> Result<PipelineConfig> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Configuration file not found: {}", path.display()))?;
        let config = self.parse(&content)?;
        Ok(config)
    }

    fn check_schema(&self, document: &serde_json::Value) -> Result<(), ValidationError> {
        let schema = match &self.schema {
            Some(schema) => schema,
            None => bundled_schema()?,
        };
        let validator = jsonschema::validator_for(schema)
            .map_err(|e| ValidationError::schema("(schema)", format!("schema does not compile: {}", e)))?;

        if let Some(error) = validator.iter_errors(document).next() {
            let field = pointer_to_field(&error.instance_path.to_string());
            return Err(ValidationError::schema(field, error.to_string()));
        }
        Ok(())
    }
}

/// Turn a JSON pointer like `/environments/0/stacks` into `environments[0].stacks`
fn pointer_to_field(pointer: &str) -> String {
    let mut field = String::new();
    for segment in pointer.split('/').filter(|s| !s.is_empty()) {
        if segment.chars().all(|c| c.is_ascii_digit()) {
            field.push_str(&format!("[{}]", segment));
        } else {
            if !field.is_empty() {
                field.push('.');
            }
            field.push_str(segment);
        }
    }
    if field.is_empty() {
        "(root)".to_string()
    } else {
        field
    }
}

impl PipelineConfig {
    /// Load pipeline configuration from a YAML file, using the bundled schema
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        ConfigParser::new().parse_file(path)
    }

    /// Parse pipeline configuration from a YAML string, using the bundled schema
    pub fn from_yaml(yaml: &str) -> Result<Self, ValidationError> {
        ConfigParser::new().parse(yaml)
    }

    /// Parse against a caller-supplied schema instead of the bundled one
    pub fn parse_with_schema(yaml: &str, schema: &serde_json::Value) -> Result<Self, ValidationError> {
        ConfigParser::with_schema(schema.clone()).parse(yaml)
    }

    /// Semantic checks the schema cannot express
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !SUPPORTED_VERSIONS.contains(&self.version.as_str()) {
            return Err(ValidationError::schema(
                "version",
                format!(
                    "unsupported version '{}' (supported: {})",
                    self.version,
                    SUPPORTED_VERSIONS.join(", ")
                ),
            ));
        }

        check_commands("build.commands", &self.build.commands)?;

        if self.environments.is_empty() {
            return Err(ValidationError::schema(
                "environments",
                "at least one environment is required",
            ));
        }

        let mut seen_envs = HashSet::new();
        for (i, env) in self.environments.iter().enumerate() {
            let at = format!("environments[{}]", i);

            if !is_valid_environment_name(&env.name) {
                return Err(ValidationError::schema(
                    format!("{}.name", at),
                    format!(
                        "'{}' must be lowercase letters, digits and '-', starting with a letter",
                        env.name
                    ),
                ));
            }
            if !seen_envs.insert(env.name.as_str()) {
                return Err(ValidationError::schema(
                    format!("{}.name", at),
                    format!("duplicate environment name '{}'", env.name),
                ));
            }

            check_location(&format!("{}.region", at), &env.region)?;
            check_location(&format!("{}.account", at), &env.account)?;

            if env.stacks.is_empty() {
                return Err(ValidationError::schema(
                    format!("{}.stacks", at),
                    format!("environment '{}' must declare at least one stack", env.name),
                ));
            }

            let mut seen_stacks = HashSet::new();
            for (j, stack) in env.stacks.iter().enumerate() {
                let stack_at = format!("{}.stacks[{}]", at, j);
                if !is_valid_stack_name(&stack.name) {
                    return Err(ValidationError::schema(
                        format!("{}.name", stack_at),
                        format!("'{}' is not a valid stack name", stack.name),
                    ));
                }
                if !seen_stacks.insert(stack.name.as_str()) {
                    return Err(ValidationError::schema(
                        format!("{}.name", stack_at),
                        format!(
                            "duplicate stack name '{}' in environment '{}'",
                            stack.name, env.name
                        ),
                    ));
                }
                if stack.path.trim().is_empty() {
                    return Err(ValidationError::schema(
                        format!("{}.path", stack_at),
                        "must not be empty",
                    ));
                }
            }

            if let Some(tests) = &env.tests {
                check_commands(&format!("{}.tests.commands", at), &tests.commands)?;
            }
        }

        self.check_secrets()
    }

    /// Scan every string value for credential-shaped content
    fn check_secrets(&self) -> Result<(), ValidationError> {
        let leak = |field: String, value: &str| match secrets::detect(value) {
            Some(kind) => Err(ValidationError::SecretLeakage {
                field,
                kind: kind.to_string(),
            }),
            None => Ok(()),
        };

        for (i, cmd) in self.build.commands.iter().enumerate() {
            leak(format!("build.commands[{}]", i), cmd)?;
        }
        for (i, env) in self.environments.iter().enumerate() {
            let at = format!("environments[{}]", i);
            leak(format!("{}.name", at), &env.name)?;
            leak(format!("{}.region", at), &env.region)?;
            leak(format!("{}.account", at), &env.account)?;
            for (j, stack) in env.stacks.iter().enumerate() {
                leak(format!("{}.stacks[{}].name", at, j), &stack.name)?;
                leak(format!("{}.stacks[{}].path", at, j), &stack.path)?;
            }
            if let Some(tests) = &env.tests {
                for (j, cmd) in tests.commands.iter().enumerate() {
                    leak(format!("{}.tests.commands[{}]", at, j), cmd)?;
                }
            }
        }
        Ok(())
    }

    /// Look up an environment by name
    pub fn environment(&self, name: &str) -> Option<&EnvironmentSpec> {
        self.environments.iter().find(|e| e.name == name)
    }

    /// Number of environments that get a test stage
    pub fn tested_environment_count(&self) -> usize {
        self.environments.iter().filter(|e| e.has_tests()).count()
    }
}

fn check_commands(field: &str, commands: &[String]) -> Result<(), ValidationError> {
    if commands.is_empty() {
        return Err(ValidationError::schema(field, "at least one command is required"));
    }
    for (i, cmd) in commands.iter().enumerate() {
        if cmd.trim().is_empty() {
            return Err(ValidationError::schema(
                format!("{}[{}]", field, i),
                "command must not be empty",
            ));
        }
    }
    Ok(())
}

fn check_location(field: &str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::schema(field, "must not be empty"));
    }
    if !is_valid_location(value) {
        return Err(ValidationError::schema(
            field,
            format!("'{}' contains whitespace or shell metacharacters", value),
        ));
    }
    Ok(())
}
