//! WorkflowTemplate document handed to the workflow engine

use crate::core::graph::{ParameterSource, Stage, StageGraph, WORKFLOW_PARAMETERS};
use crate::core::identity::{ResourceNameSet, SecretSource, WebhookSecret};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const API_VERSION: &str = "argoproj.io/v1alpha1";
pub const KIND: &str = "WorkflowTemplate";
pub const DEFAULT_NAMESPACE: &str = "argo";
pub const ENTRYPOINT: &str = "main";

/// Annotation carrying the digest of the graph a document was rendered from
pub const DIGEST_ANNOTATION: &str = "shipgraph.io/graph-digest";
pub const INSTANCE_LABEL: &str = "shipgraph.io/instance";
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowTemplate {
    pub api_version: String,
    pub kind: String,
    pub metadata: Metadata,
    pub spec: WorkflowSpec,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    pub name: String,
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowSpec {
    pub service_account_name: String,
    pub entrypoint: String,
    pub arguments: Arguments,
    pub templates: Vec<Template>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Arguments {
    #[serde(default)]
    pub parameters: Vec<Parameter>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Parameter {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_from: Option<ValueFrom>,
}

impl Parameter {
    fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            value: None,
            value_from: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueFrom {
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Template {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub steps: Option<Vec<Vec<WorkflowStep>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs: Option<Arguments>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Arguments>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<Container>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub name: String,
    pub template: String,
    pub arguments: Arguments,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    pub image: String,
    pub command: Vec<String>,
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

/// Environment variable a stage script reads an input parameter from
pub fn env_var_name(parameter: &str) -> String {
    parameter.to_ascii_uppercase().replace('-', "_")
}

impl WorkflowTemplate {
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// Digest of the graph this document was rendered from, if recorded
    pub fn graph_digest(&self) -> Option<&str> {
        self.metadata
            .annotations
            .get(DIGEST_ANNOTATION)
            .map(String::as_str)
    }

    /// Stage names in execution order, read back from the `main` steps
    pub fn stage_names(&self) -> Vec<&str> {
        self.spec
            .templates
            .iter()
            .find(|t| t.name == self.spec.entrypoint)
            .and_then(|t| t.steps.as_ref())
            .map(|groups| {
                groups
                    .iter()
                    .flatten()
                    .map(|step| step.name.as_str())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).context("Failed to serialize WorkflowTemplate")
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).context("Failed to parse WorkflowTemplate")
    }
}

/// Key under which the webhook validation secret is stored
pub const WEBHOOK_SECRET_KEY: &str = "secret";

/// Secret document holding one instance's webhook validation secret
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretManifest {
    pub api_version: String,
    pub kind: String,
    pub metadata: Metadata,
    #[serde(rename = "type")]
    pub secret_type: String,
    pub string_data: BTreeMap<String, String>,
}

impl std::fmt::Debug for SecretManifest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretManifest")
            .field("metadata", &self.metadata)
            .field("string_data", &"[REDACTED]")
            .finish()
    }
}

impl SecretManifest {
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).context("Failed to serialize Secret")
    }
}

/// Secret for `names.webhook_secret()`, created alongside the instance
pub fn render_webhook_secret(
    names: &ResourceNameSet,
    secret: &WebhookSecret,
    namespace: &str,
) -> SecretManifest {
    let mut labels = BTreeMap::new();
    labels.insert(INSTANCE_LABEL.to_string(), names.instance().to_string());
    labels.insert(MANAGED_BY_LABEL.to_string(), "shipgraph".to_string());

    let mut string_data = BTreeMap::new();
    string_data.insert(WEBHOOK_SECRET_KEY.to_string(), secret.expose().to_string());

    SecretManifest {
        api_version: "v1".to_string(),
        kind: "Secret".to_string(),
        metadata: Metadata {
            name: names.webhook_secret().to_string(),
            namespace: namespace.to_string(),
            resource_version: None,
            labels,
            annotations: BTreeMap::new(),
        },
        secret_type: "Opaque".to_string(),
        string_data,
    }
}

/// Secret document to create for an instance, if its secret is generated here
pub fn webhook_secret_for(
    names: &ResourceNameSet,
    source: &SecretSource,
    namespace: &str,
) -> Option<SecretManifest> {
    match source {
        SecretSource::Generated(secret) => Some(render_webhook_secret(names, secret, namespace)),
        SecretSource::External { .. } => None,
    }
}

/// Render a graph into the default namespace
pub fn render(graph: &StageGraph) -> WorkflowTemplate {
    render_in(graph, DEFAULT_NAMESPACE)
}

pub fn render_in(graph: &StageGraph, namespace: &str) -> WorkflowTemplate {
    let steps: Vec<Vec<WorkflowStep>> = graph
        .stages
        .iter()
        .map(|stage| vec![workflow_step(stage)])
        .collect();

    let mut templates = vec![Template {
        name: ENTRYPOINT.to_string(),
        steps: Some(steps),
        inputs: None,
        outputs: None,
        container: None,
    }];
    templates.extend(graph.stages.iter().map(stage_template));

    let mut labels = BTreeMap::new();
    labels.insert(INSTANCE_LABEL.to_string(), graph.instance.clone());
    labels.insert(MANAGED_BY_LABEL.to_string(), "shipgraph".to_string());

    let mut annotations = BTreeMap::new();
    annotations.insert(DIGEST_ANNOTATION.to_string(), graph.digest());

    WorkflowTemplate {
        api_version: API_VERSION.to_string(),
        kind: KIND.to_string(),
        metadata: Metadata {
            name: graph.name.clone(),
            namespace: namespace.to_string(),
            resource_version: None,
            labels,
            annotations,
        },
        spec: WorkflowSpec {
            service_account_name: graph.service_account.clone(),
            entrypoint: ENTRYPOINT.to_string(),
            arguments: Arguments {
                parameters: WORKFLOW_PARAMETERS
                    .iter()
                    .map(|name| Parameter::named(name))
                    .collect(),
            },
            templates,
        },
    }
}

fn workflow_step(stage: &Stage) -> WorkflowStep {
    let parameters = stage
        .inputs
        .iter()
        .map(|input| {
            let value = match &input.source {
                ParameterSource::Workflow { parameter } => {
                    format!("{{{{workflow.parameters.{parameter}}}}}")
                }
                ParameterSource::Stage { stage, output } => {
                    format!("{{{{steps.{stage}.outputs.parameters.{output}}}}}")
                }
            };
            Parameter {
                name: input.name.clone(),
                value: Some(value),
                value_from: None,
            }
        })
        .collect();

    WorkflowStep {
        name: stage.name.clone(),
        template: stage.name.clone(),
        arguments: Arguments { parameters },
    }
}

fn stage_template(stage: &Stage) -> Template {
    let inputs = Arguments {
        parameters: stage
            .inputs
            .iter()
            .map(|input| Parameter::named(&input.name))
            .collect(),
    };

    let outputs = stage.output.as_ref().map(|output| Arguments {
        parameters: vec![Parameter {
            name: output.name.clone(),
            value: None,
            value_from: Some(ValueFrom {
                path: output.path.clone(),
            }),
        }],
    });

    // Inputs reach the script through the environment, never by text substitution
    let mut env: Vec<EnvVar> = stage
        .inputs
        .iter()
        .map(|input| EnvVar {
            name: env_var_name(&input.name),
            value: format!("{{{{inputs.parameters.{}}}}}", input.name),
        })
        .collect();
    env.extend(stage.payload.env.iter().map(|(name, value)| EnvVar {
        name: name.clone(),
        value: value.clone(),
    }));

    Template {
        name: stage.name.clone(),
        steps: None,
        inputs: Some(inputs),
        outputs,
        container: Some(Container {
            image: stage.payload.image.clone(),
            command: vec!["/bin/bash".to_string()],
            args: vec!["-c".to_string(), stage.payload.script.clone()],
            env,
        }),
    }
}
