//! Per-instance resource naming
//!
//! Many pipeline instances share one cluster, one workflow engine and one
//! event bus. Nothing locks between them: every externally visible name is
//! derived from the instance name, so two instances with different names
//! never touch each other's graph, credentials or artifact storage.

use crate::core::error::IsolationError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::OnceLock;
use uuid::Uuid;

/// Prefix used when the caller does not supply one
pub const DEFAULT_PREFIX: &str = "shipgraph";

/// Names belonging to the shared substrate. No instance may own or delete them.
pub const SHARED_SUBSTRATE: &[&str] = &["argo", "argo-events", "default", "kube-system", "eventbus-default"];

// A pattern that fails to compile matches nothing, so every name is rejected
fn pattern_matches(cell: &'static OnceLock<Option<Regex>>, pattern: &str, value: &str) -> bool {
    cell.get_or_init(|| Regex::new(pattern).ok())
        .as_ref()
        .is_some_and(|re| re.is_match(value))
}

fn is_valid_instance_name(name: &str) -> bool {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    pattern_matches(&RE, r"^[a-z]([a-z0-9]|-[a-z0-9]){0,29}$", name)
}

// No '-': `<prefix>-<instance>` must split back into exactly one pair
fn is_valid_prefix(prefix: &str) -> bool {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    pattern_matches(&RE, r"^[a-z][a-z0-9]{0,19}$", prefix)
}

fn is_valid_resource_name(name: &str) -> bool {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    pattern_matches(&RE, r"^[a-z0-9]([a-z0-9-]{1,61}[a-z0-9])$", name)
}

/// Identity of one pipeline instance
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PipelineIdentity {
    instance_name: String,
    resource_name_prefix: String,
}

impl PipelineIdentity {
    /// Identity with the default prefix
    pub fn new(instance_name: impl Into<String>) -> Result<Self, IsolationError> {
        let instance_name = instance_name.into();
        if instance_name.len() > 30 || !is_valid_instance_name(&instance_name) {
            return Err(IsolationError::InvalidInstanceName {
                name: instance_name,
                reason: "must be 1-30 lowercase letters, digits or single '-', starting with a letter and not ending with '-'".to_string(),
            });
        }
        Ok(Self {
            instance_name,
            resource_name_prefix: DEFAULT_PREFIX.to_string(),
        })
    }

    /// Replace the resource name prefix
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Result<Self, IsolationError> {
        let prefix = prefix.into();
        if !is_valid_prefix(&prefix) {
            return Err(IsolationError::InvalidName {
                category: "prefix".to_string(),
                name: prefix,
                reason: "must be 1-20 lowercase letters or digits, starting with a letter".to_string(),
            });
        }
        self.resource_name_prefix = prefix;
        Ok(self)
    }

    pub fn instance_name(&self) -> &str {
        &self.instance_name
    }

    pub fn prefix(&self) -> &str {
        &self.resource_name_prefix
    }
}

impl fmt::Display for PipelineIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.resource_name_prefix, self.instance_name)
    }
}

/// Every namespace this system creates names in
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NameCategory {
    /// The published workflow template
    Graph,
    /// Webhook receiver
    EventSource,
    /// Trigger filter that turns events into executions
    Sensor,
    /// Identity the stage containers run as
    ServiceAccount,
    /// Webhook validation secret
    WebhookSecret,
    /// Artifact storage location
    ArtifactBucket,
}

impl NameCategory {
    pub const ALL: [NameCategory; 6] = [
        NameCategory::Graph,
        NameCategory::EventSource,
        NameCategory::Sensor,
        NameCategory::ServiceAccount,
        NameCategory::WebhookSecret,
        NameCategory::ArtifactBucket,
    ];

    fn suffix(self) -> Option<&'static str> {
        match self {
            NameCategory::Graph => None,
            NameCategory::EventSource => Some("github"),
            NameCategory::Sensor => Some("sensor"),
            NameCategory::ServiceAccount => Some("executor"),
            NameCategory::WebhookSecret => Some("webhook"),
            NameCategory::ArtifactBucket => Some("artifacts"),
        }
    }

    /// Resource kind as the owning system calls it
    pub fn kind(self) -> &'static str {
        match self {
            NameCategory::Graph => "workflowtemplate",
            NameCategory::EventSource => "eventsource",
            NameCategory::Sensor => "sensor",
            NameCategory::ServiceAccount => "serviceaccount",
            NameCategory::WebhookSecret => "secret",
            NameCategory::ArtifactBucket => "bucket",
        }
    }
}

impl fmt::Display for NameCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            NameCategory::Graph => "graph",
            NameCategory::EventSource => "event-source",
            NameCategory::Sensor => "sensor",
            NameCategory::ServiceAccount => "service-account",
            NameCategory::WebhookSecret => "webhook-secret",
            NameCategory::ArtifactBucket => "artifact-bucket",
        };
        f.write_str(label)
    }
}

impl std::str::FromStr for NameCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NameCategory::ALL
            .into_iter()
            .find(|category| category.to_string() == s)
            .ok_or_else(|| {
                let known: Vec<String> = NameCategory::ALL.iter().map(|c| c.to_string()).collect();
                format!("unknown name category '{}' (expected one of: {})", s, known.join(", "))
            })
    }
}

/// Caller-supplied replacements for individual derived names
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameOverrides {
    names: BTreeMap<NameCategory, String>,
}

impl NameOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, category: NameCategory, name: impl Into<String>) -> Self {
        self.names.insert(category, name.into());
        self
    }

    pub fn get(&self, category: NameCategory) -> Option<&str> {
        self.names.get(&category).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// `category=name` pairs joined by ',', the form `--name` and `SHIPGRAPH_NAMES` accept
    pub fn to_arg_list(&self) -> String {
        self.names
            .iter()
            .map(|(category, name)| format!("{}={}", category, name))
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// All externally visible names of one instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceNameSet {
    instance: String,
    prefix: String,
    names: BTreeMap<NameCategory, String>,
}

/// One name used by two instances in the same category
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameCollision {
    pub category: NameCategory,
    pub name: String,
}

impl ResourceNameSet {
    pub fn instance(&self) -> &str {
        &self.instance
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Names that differ from what the prefix and instance derive by default
    pub fn overrides(&self) -> NameOverrides {
        self.names
            .iter()
            .filter(|(category, name)| {
                **name != default_name(&self.prefix, &self.instance, **category)
            })
            .fold(NameOverrides::new(), |overrides, (category, name)| {
                overrides.with(*category, name)
            })
    }

    pub fn get(&self, category: NameCategory) -> &str {
        // Every category is filled by derive_names_with
        self.names.get(&category).map(String::as_str).unwrap_or_default()
    }

    pub fn graph(&self) -> &str {
        self.get(NameCategory::Graph)
    }

    pub fn event_source(&self) -> &str {
        self.get(NameCategory::EventSource)
    }

    pub fn sensor(&self) -> &str {
        self.get(NameCategory::Sensor)
    }

    pub fn service_account(&self) -> &str {
        self.get(NameCategory::ServiceAccount)
    }

    pub fn webhook_secret(&self) -> &str {
        self.get(NameCategory::WebhookSecret)
    }

    pub fn artifact_bucket(&self) -> &str {
        self.get(NameCategory::ArtifactBucket)
    }

    pub fn iter(&self) -> impl Iterator<Item = (NameCategory, &str)> {
        self.names.iter().map(|(c, n)| (*c, n.as_str()))
    }

    /// Names shared with `other` in the same category
    pub fn collisions(&self, other: &ResourceNameSet) -> Vec<NameCollision> {
        self.names
            .iter()
            .filter(|(category, name)| other.names.get(category) == Some(name))
            .map(|(category, name)| NameCollision {
                category: *category,
                name: name.clone(),
            })
            .collect()
    }
}

/// Derive the default name set for an identity
pub fn derive_names(identity: &PipelineIdentity) -> ResourceNameSet {
    let names = NameCategory::ALL
        .iter()
        .map(|category| {
            let name = default_name(&identity.resource_name_prefix, &identity.instance_name, *category);
            (*category, name)
        })
        .collect();
    ResourceNameSet {
        instance: identity.instance_name.clone(),
        prefix: identity.resource_name_prefix.clone(),
        names,
    }
}

/// Derive names, applying any overrides
pub fn derive_names_with(
    identity: &PipelineIdentity,
    overrides: &NameOverrides,
) -> Result<ResourceNameSet, IsolationError> {
    let mut set = derive_names(identity);
    for (category, name) in &overrides.names {
        check_resource_name(*category, name)?;
        set.names.insert(*category, name.clone());
    }
    Ok(set)
}

fn default_name(prefix: &str, instance: &str, category: NameCategory) -> String {
    match category.suffix() {
        Some(suffix) => format!("{}-{}-{}", prefix, instance, suffix),
        None => format!("{}-{}", prefix, instance),
    }
}

fn check_resource_name(category: NameCategory, name: &str) -> Result<(), IsolationError> {
    let reason = if !is_valid_resource_name(name) {
        Some("must be 3-63 lowercase letters, digits or '-'")
    } else if SHARED_SUBSTRATE.contains(&name) {
        Some("belongs to the shared substrate")
    } else {
        None
    };
    match reason {
        Some(reason) => Err(IsolationError::InvalidName {
            category: category.to_string(),
            name: name.to_string(),
            reason: reason.to_string(),
        }),
        None => Ok(()),
    }
}

/// Tracks which instance owns which name on a shared substrate
#[derive(Debug, Default)]
pub struct NameRegistry {
    owners: HashMap<(NameCategory, String), String>,
    instances: HashMap<String, ResourceNameSet>,
}

impl NameRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim every name in `set`. Either all names are claimed or none are.
    pub fn register(&mut self, set: ResourceNameSet) -> Result<(), IsolationError> {
        for (category, name) in set.iter() {
            if let Some(owner) = self.owners.get(&(category, name.to_string())) {
                if owner != &set.instance {
                    return Err(IsolationError::NameCollision {
                        category: category.to_string(),
                        name: name.to_string(),
                        owner: owner.clone(),
                    });
                }
            }
        }

        if let Some(previous) = self.instances.remove(&set.instance) {
            for (category, name) in previous.iter() {
                self.owners.remove(&(category, name.to_string()));
            }
        }
        for (category, name) in set.iter() {
            self.owners
                .insert((category, name.to_string()), set.instance.clone());
        }
        self.instances.insert(set.instance.clone(), set);
        Ok(())
    }

    pub fn get(&self, instance: &str) -> Option<&ResourceNameSet> {
        self.instances.get(instance)
    }

    /// Release an instance's names and return the plan to delete its resources
    pub fn teardown(&mut self, instance: &str) -> Option<Result<TeardownPlan, IsolationError>> {
        let set = self.instances.get(instance)?;
        let plan = teardown_plan(set);
        if let Err(e) = plan.verify_owned_by(self) {
            return Some(Err(e));
        }
        if let Some(set) = self.instances.remove(instance) {
            for (category, name) in set.iter() {
                self.owners.remove(&(category, name.to_string()));
            }
        }
        Some(Ok(plan))
    }

    fn owner_of(&self, category: NameCategory, name: &str) -> Option<&str> {
        self.owners
            .get(&(category, name.to_string()))
            .map(String::as_str)
    }
}

/// A resource scheduled for deletion
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TeardownEntry {
    pub category: NameCategory,
    pub kind: &'static str,
    pub name: String,
}

/// Resources removed when an instance is destroyed, dependents first
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TeardownPlan {
    pub instance: String,
    pub entries: Vec<TeardownEntry>,
}

/// Build the deletion plan for one instance's own resources
pub fn teardown_plan(set: &ResourceNameSet) -> TeardownPlan {
    const ORDER: [NameCategory; 6] = [
        NameCategory::Sensor,
        NameCategory::EventSource,
        NameCategory::Graph,
        NameCategory::WebhookSecret,
        NameCategory::ServiceAccount,
        NameCategory::ArtifactBucket,
    ];

    let entries = ORDER
        .iter()
        .map(|category| TeardownEntry {
            category: *category,
            kind: category.kind(),
            name: set.get(*category).to_string(),
        })
        .collect();

    TeardownPlan {
        instance: set.instance.clone(),
        entries,
    }
}

impl TeardownPlan {
    /// Reject the plan if it names the shared substrate or anything the
    /// instance's own name set does not contain
    pub fn verify(&self, owned: &ResourceNameSet) -> Result<(), IsolationError> {
        for entry in &self.entries {
            let foreign = SHARED_SUBSTRATE.contains(&entry.name.as_str())
                || owned.instance != self.instance
                || owned.get(entry.category) != entry.name;
            if foreign {
                return Err(self.foreign(entry));
            }
        }
        Ok(())
    }

    fn verify_owned_by(&self, registry: &NameRegistry) -> Result<(), IsolationError> {
        for entry in &self.entries {
            let owner = registry.owner_of(entry.category, &entry.name);
            if SHARED_SUBSTRATE.contains(&entry.name.as_str()) || owner != Some(self.instance.as_str()) {
                return Err(self.foreign(entry));
            }
        }
        Ok(())
    }

    fn foreign(&self, entry: &TeardownEntry) -> IsolationError {
        IsolationError::ForeignResource {
            instance: self.instance.clone(),
            kind: entry.kind.to_string(),
            name: entry.name.clone(),
        }
    }
}

/// Webhook validation secret generated for one instance
#[derive(Clone, PartialEq, Eq)]
pub struct WebhookSecret(String);

impl WebhookSecret {
    /// Length of a generated secret in hex characters
    pub const LEN: usize = 64;

    /// Fresh secret from the OS random source
    pub fn generate() -> Self {
        Self(format!(
            "{}{}",
            Uuid::new_v4().simple(),
            Uuid::new_v4().simple()
        ))
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for WebhookSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WebhookSecret([REDACTED])")
    }
}

/// Where an instance's webhook secret comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecretSource {
    Generated(WebhookSecret),
    /// Caller opted into a secret managed elsewhere
    External { secret_ref: String },
}

impl SecretSource {
    /// Generate a per-instance secret unless an external reference is given
    pub fn for_instance(external_ref: Option<String>) -> Self {
        match external_ref {
            Some(secret_ref) => SecretSource::External { secret_ref },
            None => SecretSource::Generated(WebhookSecret::generate()),
        }
    }
}
