//! Persistence layer for publish history and build artifacts

pub mod artifacts;
#[cfg(feature = "sqlite")]
pub mod store;

pub use artifacts::{artifact_key, ArtifactStore, ArtifactTag, InMemoryArtifactStore, LocalArtifactStore, StoredArtifact};
#[cfg(feature = "sqlite")]
pub use store::SqliteGraphHistory;

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Outcome of one publish attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishOutcome {
    Published,
    Unchanged,
    Failed,
}

impl fmt::Display for PublishOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PublishOutcome::Published => "published",
            PublishOutcome::Unchanged => "unchanged",
            PublishOutcome::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for PublishOutcome {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "published" => Ok(PublishOutcome::Published),
            "unchanged" => Ok(PublishOutcome::Unchanged),
            "failed" => Ok(PublishOutcome::Failed),
            other => bail!("Unknown publish outcome: {}", other),
        }
    }
}

/// One entry of the append-only publish history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishRecord {
    /// Unique record ID
    pub id: Uuid,

    /// Template name on the engine
    pub graph_name: String,

    /// Live version after the attempt (the retained one on failure)
    pub version: Option<String>,

    /// Digest of the graph that was offered
    pub digest: String,

    /// Commit the graph was compiled from
    pub commit_id: Option<String>,

    pub outcome: PublishOutcome,

    /// Redacted failure message
    pub detail: Option<String>,

    pub recorded_at: DateTime<Utc>,
}

impl PublishRecord {
    pub fn new(
        graph_name: impl Into<String>,
        digest: impl Into<String>,
        outcome: PublishOutcome,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            graph_name: graph_name.into(),
            version: None,
            digest: digest.into(),
            commit_id: None,
            outcome,
            detail: None,
            recorded_at: Utc::now(),
        }
    }

    pub fn with_version(mut self, version: Option<String>) -> Self {
        self.version = version;
        self
    }

    pub fn with_commit(mut self, commit_id: Option<String>) -> Self {
        self.commit_id = commit_id;
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Trait for publish history backends
#[async_trait::async_trait]
pub trait GraphHistory: Send + Sync {
    /// Append a record
    async fn record(&self, record: &PublishRecord) -> Result<()>;

    /// All records for a graph, newest first
    async fn list(&self, graph_name: &str) -> Result<Vec<PublishRecord>>;

    /// Most recent record for a graph
    async fn latest(&self, graph_name: &str) -> Result<Option<PublishRecord>> {
        Ok(self.list(graph_name).await?.into_iter().next())
    }

    /// Names of every graph with at least one record
    async fn list_graphs(&self) -> Result<Vec<String>>;
}

/// In-memory history (for tests and dry runs)
pub struct InMemoryGraphHistory {
    records: tokio::sync::RwLock<HashMap<String, Vec<PublishRecord>>>,
}

impl InMemoryGraphHistory {
    pub fn new() -> Self {
        Self {
            records: tokio::sync::RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryGraphHistory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl GraphHistory for InMemoryGraphHistory {
    async fn record(&self, record: &PublishRecord) -> Result<()> {
        let mut records = self.records.write().await;
        records
            .entry(record.graph_name.clone())
            .or_insert_with(Vec::new)
            .push(record.clone());
        Ok(())
    }

    async fn list(&self, graph_name: &str) -> Result<Vec<PublishRecord>> {
        let records = self.records.read().await;
        Ok(records
            .get(graph_name)
            .map(|list| list.iter().rev().cloned().collect())
            .unwrap_or_default())
    }

    async fn list_graphs(&self) -> Result<Vec<String>> {
        let records = self.records.read().await;
        let mut names: Vec<String> = records.keys().cloned().collect();
        names.sort();
        Ok(names)
    }
}
