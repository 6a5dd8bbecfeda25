//! Local artifact store
//!
//! Layout: `<root>/<tag name>/<version>/` holding the model files plus a
//! `manifest.json`. Imports are written to a hidden staging directory next
//! to the final one and renamed into place on commit.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{HostError, Result};
use crate::identity::{is_valid_tag_part, Tag};

pub const MANIFEST_NAME: &str = "manifest.json";

pub type Labels = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactManifest {
    pub tag: Tag,
    #[serde(default)]
    pub labels: Labels,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactRef {
    pub tag: Tag,
    pub path: PathBuf,
    pub manifest: ArtifactManifest,
}

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// `NotFound` when the tag has never been committed
    async fn get(&self, tag: &Tag) -> Result<ArtifactRef>;

    /// Newest committed artifact for a tag name
    async fn latest(&self, name: &str) -> Result<Option<ArtifactRef>>;

    /// Fresh, empty directory to write an import into
    async fn stage(&self, tag: &Tag) -> Result<PathBuf>;

    async fn commit(&self, tag: &Tag, staged: &Path, labels: Labels) -> Result<ArtifactRef>;
}

pub struct LocalModelStore {
    root: PathBuf,
}

impl LocalModelStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn artifact_dir(&self, tag: &Tag) -> Result<PathBuf> {
        tag.validate()?;
        Ok(self.root.join(&tag.name).join(&tag.version))
    }

    /// `<root>/<name>/<version>` exactly, nothing above or beside the root.
    fn is_artifact_path(&self, path: &Path) -> bool {
        path.strip_prefix(&self.root).map_or(false, |rel| {
            rel.components().count() == 2 && rel.components().all(|c| matches!(c, Component::Normal(_)))
        })
    }

    async fn read_manifest(dir: &Path) -> Result<ArtifactManifest> {
        let path = dir.join(MANIFEST_NAME);
        let raw = tokio::fs::read(&path).await.map_err(|e| HostError::io(&path, e))?;
        serde_json::from_slice(&raw).map_err(|e| HostError::io(&path, format!("corrupt manifest: {}", e)))
    }
}

#[async_trait]
impl ArtifactStore for LocalModelStore {
    async fn get(&self, tag: &Tag) -> Result<ArtifactRef> {
        let path = self.artifact_dir(tag)?;
        if !path.join(MANIFEST_NAME).is_file() {
            return Err(HostError::not_found(format!("artifact '{}' in {}", tag, self.root.display())));
        }
        let manifest = Self::read_manifest(&path).await?;
        Ok(ArtifactRef {
            tag: tag.clone(),
            path,
            manifest,
        })
    }

    async fn latest(&self, name: &str) -> Result<Option<ArtifactRef>> {
        let name = name.to_lowercase();
        if !is_valid_tag_part(&name) {
            return Err(HostError::invalid("tag name", format!("'{}' is not a valid tag name", name)));
        }
        let dir = self.root.join(name);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(HostError::io(&dir, e)),
        };

        let mut newest: Option<ArtifactRef> = None;
        while let Some(entry) = entries.next_entry().await.map_err(|e| HostError::io(&dir, e))? {
            let path = entry.path();
            let hidden = entry.file_name().to_string_lossy().starts_with('.');
            if hidden || !path.join(MANIFEST_NAME).is_file() {
                continue;
            }
            let manifest = Self::read_manifest(&path).await?;
            let is_newer = newest
                .as_ref()
                .map_or(true, |current| manifest.created_at > current.manifest.created_at);
            if is_newer {
                newest = Some(ArtifactRef {
                    tag: manifest.tag.clone(),
                    path,
                    manifest,
                });
            }
        }
        Ok(newest)
    }

    async fn stage(&self, tag: &Tag) -> Result<PathBuf> {
        tag.validate()?;
        let staged = self
            .root
            .join(&tag.name)
            .join(format!(".staging-{}-{}", tag.version, Uuid::new_v4().simple()));
        tokio::fs::create_dir_all(&staged).await.map_err(|e| HostError::io(&staged, e))?;
        debug!("Staging {} at {}", tag, staged.display());
        Ok(staged)
    }

    async fn commit(&self, tag: &Tag, staged: &Path, labels: Labels) -> Result<ArtifactRef> {
        let manifest = ArtifactManifest {
            tag: tag.clone(),
            labels,
            created_at: Utc::now(),
        };
        let manifest_path = staged.join(MANIFEST_NAME);
        let body = serde_json::to_vec_pretty(&manifest).map_err(|e| HostError::io(&manifest_path, e))?;
        tokio::fs::write(&manifest_path, body)
            .await
            .map_err(|e| HostError::io(&manifest_path, e))?;

        let target = self.artifact_dir(tag)?;
        if !self.is_artifact_path(&target) {
            return Err(HostError::io(&target, "artifact path escapes the store root"));
        }
        if target.exists() {
            tokio::fs::remove_dir_all(&target).await.map_err(|e| HostError::io(&target, e))?;
        }
        tokio::fs::rename(staged, &target)
            .await
            .map_err(|e| HostError::io(&target, e))?;
        info!("📦 Committed {} to {}", tag, target.display());

        Ok(ArtifactRef {
            tag: tag.clone(),
            path: target,
            manifest,
        })
    }
}
