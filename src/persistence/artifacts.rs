//! Build artifact storage keyed by commit

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Provenance attached to every stored artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactTag {
    pub commit_id: String,
    pub timestamp: DateTime<Utc>,
}

impl ArtifactTag {
    pub fn new(commit_id: impl Into<String>) -> Self {
        Self {
            commit_id: commit_id.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Contents retrieved by key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredArtifact {
    pub key: String,
    pub tag: ArtifactTag,
    pub contents: Vec<u8>,
}

/// Storage key for an artifact: `<commit>/<name>`
pub fn artifact_key(commit_id: &str, name: &str) -> String {
    format!("{}/{}", commit_id, name)
}

fn check_commit_id(commit_id: &str) -> Result<()> {
    if commit_id.is_empty()
        || !commit_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        bail!("Invalid commit id for artifact storage: '{}'", commit_id);
    }
    Ok(())
}

fn check_name(name: &str) -> Result<()> {
    if name.is_empty()
        || name.starts_with('/')
        || name.contains('\\')
        || name.split('/').any(|part| part.is_empty() || part == "." || part == "..")
    {
        bail!("Invalid artifact name: '{}'", name);
    }
    Ok(())
}

fn split_key(key: &str) -> Result<(&str, &str)> {
    let (commit_id, name) = key
        .split_once('/')
        .with_context(|| format!("Invalid artifact key: '{}'", key))?;
    check_commit_id(commit_id)?;
    check_name(name)?;
    Ok((commit_id, name))
}

/// Trait for artifact storage backends
#[async_trait::async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Store contents under `<commit>/<name>` and return the key
    async fn put(&self, tag: &ArtifactTag, name: &str, contents: &[u8]) -> Result<String>;

    /// Retrieve contents and tag by key
    async fn get(&self, key: &str) -> Result<Option<StoredArtifact>>;

    /// Keys stored for a commit, sorted
    async fn list(&self, commit_id: &str) -> Result<Vec<String>>;

    /// Location handed downstream as the build's artifact path
    fn location(&self, commit_id: &str) -> String;
}

/// In-memory artifact store (for tests)
pub struct InMemoryArtifactStore {
    artifacts: tokio::sync::RwLock<BTreeMap<String, (ArtifactTag, Vec<u8>)>>,
}

impl InMemoryArtifactStore {
    pub fn new() -> Self {
        Self {
            artifacts: tokio::sync::RwLock::new(BTreeMap::new()),
        }
    }
}

impl Default for InMemoryArtifactStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ArtifactStore for InMemoryArtifactStore {
    async fn put(&self, tag: &ArtifactTag, name: &str, contents: &[u8]) -> Result<String> {
        check_commit_id(&tag.commit_id)?;
        check_name(name)?;
        let key = artifact_key(&tag.commit_id, name);
        let mut artifacts = self.artifacts.write().await;
        artifacts.insert(key.clone(), (tag.clone(), contents.to_vec()));
        Ok(key)
    }

    async fn get(&self, key: &str) -> Result<Option<StoredArtifact>> {
        split_key(key)?;
        let artifacts = self.artifacts.read().await;
        Ok(artifacts.get(key).map(|(tag, contents)| StoredArtifact {
            key: key.to_string(),
            tag: tag.clone(),
            contents: contents.clone(),
        }))
    }

    async fn list(&self, commit_id: &str) -> Result<Vec<String>> {
        check_commit_id(commit_id)?;
        let prefix = format!("{}/", commit_id);
        let artifacts = self.artifacts.read().await;
        Ok(artifacts
            .keys()
            .filter(|key| key.starts_with(&prefix))
            .cloned()
            .collect())
    }

    fn location(&self, commit_id: &str) -> String {
        format!("memory://{}/", commit_id)
    }
}

/// Filesystem artifact store
///
/// Layout: `<root>/<commit>/files/<name>` holds the bytes and
/// `<root>/<commit>/tags/<name>.json` the tag.
pub struct LocalArtifactStore {
    root: PathBuf,
}

impl LocalArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Store rooted under the local data directory, one folder per bucket name
    pub fn with_default_path(bucket: &str) -> Result<Self> {
        let data_dir = dirs::data_local_dir().unwrap_or_else(|| PathBuf::from("."));
        let root = data_dir.join("shipgraph").join("artifacts").join(bucket);
        std::fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create artifact directory: {}", root.display()))?;
        Ok(Self::new(root))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn file_path(&self, commit_id: &str, name: &str) -> PathBuf {
        self.root.join(commit_id).join("files").join(name)
    }

    fn tag_path(&self, commit_id: &str, name: &str) -> PathBuf {
        self.root
            .join(commit_id)
            .join("tags")
            .join(format!("{}.json", name))
    }
}

pub(crate) fn collect_files(dir: &Path, prefix: &str, out: &mut Vec<String>) -> Result<()> {
    if !dir.exists() {
        return Ok(());
    }
    for entry in std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read directory: {}", dir.display()))?
    {
        let entry = entry?;
        let file_name = entry.file_name().to_string_lossy().to_string();
        let relative = if prefix.is_empty() {
            file_name
        } else {
            format!("{}/{}", prefix, file_name)
        };
        if entry.file_type()?.is_dir() {
            collect_files(&entry.path(), &relative, out)?;
        } else {
            out.push(relative);
        }
    }
    Ok(())
}

#[async_trait::async_trait]
impl ArtifactStore for LocalArtifactStore {
    async fn put(&self, tag: &ArtifactTag, name: &str, contents: &[u8]) -> Result<String> {
        check_commit_id(&tag.commit_id)?;
        check_name(name)?;

        let file_path = self.file_path(&tag.commit_id, name);
        let tag_path = self.tag_path(&tag.commit_id, name);
        for path in [&file_path, &tag_path] {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
            }
        }

        tokio::fs::write(&file_path, contents)
            .await
            .with_context(|| format!("Failed to write artifact: {}", file_path.display()))?;
        let tag_json = serde_json::to_vec_pretty(tag)?;
        tokio::fs::write(&tag_path, tag_json)
            .await
            .with_context(|| format!("Failed to write artifact tag: {}", tag_path.display()))?;

        Ok(artifact_key(&tag.commit_id, name))
    }

    async fn get(&self, key: &str) -> Result<Option<StoredArtifact>> {
        let (commit_id, name) = split_key(key)?;
        let file_path = self.file_path(commit_id, name);
        if !file_path.exists() {
            return Ok(None);
        }

        let contents = tokio::fs::read(&file_path)
            .await
            .with_context(|| format!("Failed to read artifact: {}", file_path.display()))?;
        let tag_path = self.tag_path(commit_id, name);
        let tag_json = tokio::fs::read(&tag_path)
            .await
            .with_context(|| format!("Artifact tag missing: {}", tag_path.display()))?;
        let tag: ArtifactTag = serde_json::from_slice(&tag_json)
            .with_context(|| format!("Artifact tag is corrupt: {}", tag_path.display()))?;

        Ok(Some(StoredArtifact {
            key: key.to_string(),
            tag,
            contents,
        }))
    }

    async fn list(&self, commit_id: &str) -> Result<Vec<String>> {
        check_commit_id(commit_id)?;
        let mut names = Vec::new();
        collect_files(&self.root.join(commit_id).join("files"), "", &mut names)?;
        let mut keys: Vec<String> = names
            .iter()
            .map(|name| artifact_key(commit_id, name))
            .collect();
        keys.sort();
        Ok(keys)
    }

    fn location(&self, commit_id: &str) -> String {
        format!("{}/", self.root.join(commit_id).join("files").display())
    }
}
