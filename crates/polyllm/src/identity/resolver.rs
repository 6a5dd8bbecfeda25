//! Tag resolution
//!
//! Version sources, first match wins:
//! 1. deployment bypass (tag read from the model path inside a prebuilt artifact)
//! 2. `name:revision` embedded in the model id
//! 3. explicit caller version
//! 4. newest local artifact, when `use_local_latest` is on
//! 5. mtime digest of a local model directory
//! 6. commit hash from the remote repository
//!
//! Results are memoised by `(model_id, version, backend)`. Failures are not
//! cached and not retried.

use moka::future::Cache;
use std::path::{Component, Path};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::tag::{hash_from_mtime, is_local_path, tag_name, Tag};
use crate::config::RuntimeSettings;
use crate::error::{HostError, Result};
use crate::model_runtime::BackendKind;
use crate::store::{ArtifactStore, ModelRepository};

const MEMO_CAPACITY: u64 = 1024;

type MemoKey = (String, Option<String>, BackendKind);

pub struct TagResolver {
    settings: Arc<RuntimeSettings>,
    repository: Arc<dyn ModelRepository>,
    store: Arc<dyn ArtifactStore>,
    memo: Cache<MemoKey, Tag>,
}

impl TagResolver {
    pub fn new(
        settings: Arc<RuntimeSettings>,
        repository: Arc<dyn ModelRepository>,
        store: Arc<dyn ArtifactStore>,
    ) -> Self {
        Self {
            settings,
            repository,
            store,
            memo: Cache::builder().max_capacity(MEMO_CAPACITY).build(),
        }
    }

    pub async fn resolve(&self, model_id: &str, model_version: Option<&str>, kind: BackendKind) -> Result<Tag> {
        let key = (model_id.to_string(), model_version.map(str::to_string), kind);
        self.memo
            .try_get_with(key, self.compute(model_id, model_version, kind))
            .await
            .map_err(|e| (*e).clone())
    }

    async fn compute(&self, model_id: &str, model_version: Option<&str>, kind: BackendKind) -> Result<Tag> {
        let tag = self.lookup(model_id, model_version, kind).await?;
        tag.validate().map_err(|e| HostError::identity(model_id, e.to_string()))?;
        Ok(tag)
    }

    async fn lookup(&self, model_id: &str, model_version: Option<&str>, kind: BackendKind) -> Result<Tag> {
        if self.settings.deployment_path.is_some() {
            let tag = deployment_tag(model_id)?;
            debug!("Tag for {} read from deployment path: {}", model_id, tag);
            return Ok(tag);
        }

        if let Some((bare_id, revision)) = split_revision(model_id) {
            if let Some(version) = model_version {
                warn!(
                    "revision is specified within 'model_id' ({}), and model_version={} will be ignored",
                    revision, version
                );
            }
            return Ok(Tag::for_model(kind, bare_id, revision));
        }

        if let Some(version) = model_version {
            return Ok(Tag::for_model(kind, model_id, version));
        }

        if self.settings.use_local_latest {
            let name = tag_name(kind, model_id);
            let latest = self.store.latest(&name).await?;
            return match latest {
                Some(artifact) => {
                    info!("Using newest local artifact {}", artifact.tag);
                    Ok(artifact.tag)
                }
                None => Err(HostError::identity(model_id, format!("no local artifact named '{}'", name))),
            };
        }

        if is_local_path(model_id) {
            let version = hash_from_mtime(Path::new(model_id))
                .map_err(|e| HostError::identity(model_id, e.to_string()))?;
            return Ok(Tag::for_model(kind, model_id, &version));
        }

        let info = self
            .repository
            .model_info(model_id, "main")
            .await
            .map_err(|e| HostError::identity(model_id, e.to_string()))?;
        let sha = info
            .sha
            .ok_or_else(|| HostError::identity(model_id, "commit hash not found in repository metadata"))?;
        info!("Resolved {} to commit {}", model_id, sha);
        Ok(Tag::for_model(kind, model_id, &sha))
    }
}

/// `org/model:rev` -> `("org/model", "rev")`. Ids without a revision, or
/// local paths, give `None`.
fn split_revision(model_id: &str) -> Option<(&str, &str)> {
    if Path::new(model_id).exists() {
        return None;
    }
    match model_id.rsplit_once(':') {
        Some((id, revision)) if !id.is_empty() && !revision.is_empty() && !revision.contains('/') => {
            Some((id, revision))
        }
        _ => None,
    }
}

/// Inside a deployment the model id is `<...>/<tag name>/<version>`.
fn deployment_tag(model_id: &str) -> Result<Tag> {
    let parts: Vec<String> = Path::new(model_id)
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    match parts.as_slice() {
        [.., name, version] => Ok(Tag::new(name.clone(), version.clone())),
        _ => Err(HostError::identity(
            model_id,
            "inside a deployment the model id must end with <name>/<version>",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LocalModelStore;
    use crate::testing::FakeRepository;
    use tempfile::TempDir;

    fn resolver(settings: RuntimeSettings, repo: Arc<FakeRepository>, store_dir: &Path) -> TagResolver {
        TagResolver::new(Arc::new(settings), repo, Arc::new(LocalModelStore::new(store_dir)))
    }

    #[tokio::test]
    async fn test_remote_resolution_is_memoised() {
        let dir = TempDir::new().unwrap();
        let repo = Arc::new(FakeRepository::new("C0FFEE"));
        let resolver = resolver(RuntimeSettings::default(), repo.clone(), dir.path());

        let first = resolver.resolve("demo-model", None, BackendKind::Pt).await.unwrap();
        let second = resolver.resolve("demo-model", None, BackendKind::Pt).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.to_string(), "pt-demo-model:c0ffee");
        assert_eq!(repo.info_calls(), 1);

        let engine = resolver.resolve("demo-model", None, BackendKind::Vllm).await.unwrap();
        assert_eq!(engine.name, "vllm-demo-model");
        assert_eq!(repo.info_calls(), 2);
    }

    #[tokio::test]
    async fn test_embedded_revision_wins_over_version() {
        let dir = TempDir::new().unwrap();
        let repo = Arc::new(FakeRepository::new("unused"));
        let resolver = resolver(RuntimeSettings::default(), repo.clone(), dir.path());

        let tag = resolver.resolve("org/demo:rev1", Some("rev2"), BackendKind::Pt).await.unwrap();
        assert_eq!(tag.to_string(), "pt-org-demo:rev1");

        let explicit = resolver.resolve("org/demo", Some("rev2"), BackendKind::Pt).await.unwrap();
        assert_eq!(explicit.to_string(), "pt-org-demo:rev2");
        assert_eq!(repo.info_calls(), 0);
    }

    #[tokio::test]
    async fn test_local_path_uses_mtime_hash() {
        let dir = TempDir::new().unwrap();
        let model_dir = dir.path().join("local-llm");
        std::fs::create_dir(&model_dir).unwrap();
        let repo = Arc::new(FakeRepository::new("unused"));
        let resolver = resolver(RuntimeSettings::default(), repo.clone(), dir.path());

        let id = model_dir.display().to_string();
        let tag = resolver.resolve(&id, None, BackendKind::Pt).await.unwrap();
        assert_eq!(tag.name, "pt-local-llm");
        assert_eq!(tag.version, hash_from_mtime(&model_dir).unwrap());
        assert_eq!(repo.info_calls(), 0);
    }

    #[tokio::test]
    async fn test_repository_failure_is_identity_error_and_not_cached() {
        let dir = TempDir::new().unwrap();
        let repo = Arc::new(FakeRepository::new("abc"));
        repo.fail_info(true);
        let resolver = resolver(RuntimeSettings::default(), repo.clone(), dir.path());

        let err = resolver.resolve("org/flaky", None, BackendKind::Pt).await.unwrap_err();
        assert!(matches!(err, HostError::IdentityResolution { ref model_id, .. } if model_id == "org/flaky"));

        repo.fail_info(false);
        let tag = resolver.resolve("org/flaky", None, BackendKind::Pt).await.unwrap();
        assert_eq!(tag.version, "abc");
        assert_eq!(repo.info_calls(), 2);
    }

    #[tokio::test]
    async fn test_missing_commit_hash_fails() {
        let dir = TempDir::new().unwrap();
        let repo = Arc::new(FakeRepository::without_sha());
        let resolver = resolver(RuntimeSettings::default(), repo, dir.path());
        let err = resolver.resolve("org/nosha", None, BackendKind::Pt).await.unwrap_err();
        assert!(err.to_string().contains("commit hash"));
    }

    #[tokio::test]
    async fn test_deployment_bypass_reads_path() {
        let dir = TempDir::new().unwrap();
        let repo = Arc::new(FakeRepository::new("unused"));
        let settings = RuntimeSettings {
            deployment_path: Some("/home/bentoml/bento".into()),
            ..Default::default()
        };
        let resolver = resolver(settings, repo.clone(), dir.path());

        let tag = resolver
            .resolve("/home/bentoml/bento/models/pt-demo-model/abc123", None, BackendKind::Pt)
            .await
            .unwrap();
        assert_eq!(tag.to_string(), "pt-demo-model:abc123");
        assert!(resolver.resolve("flat", None, BackendKind::Pt).await.is_err());
        assert_eq!(repo.info_calls(), 0);
    }

    #[tokio::test]
    async fn test_use_local_latest() {
        let dir = TempDir::new().unwrap();
        let store = LocalModelStore::new(dir.path());
        let tag = Tag::new("pt-org-demo", "stored");
        let staged = store.stage(&tag).await.unwrap();
        store.commit(&tag, &staged, Default::default()).await.unwrap();

        let repo = Arc::new(FakeRepository::new("remote"));
        let settings = RuntimeSettings {
            use_local_latest: true,
            ..Default::default()
        };
        let resolver = resolver(settings, repo.clone(), dir.path());

        let resolved = resolver.resolve("org/demo", None, BackendKind::Pt).await.unwrap();
        assert_eq!(resolved, tag);
        assert!(resolver.resolve("org/other", None, BackendKind::Pt).await.is_err());
        assert_eq!(repo.info_calls(), 0);
    }

    #[tokio::test]
    async fn test_path_like_versions_are_rejected() {
        let dir = TempDir::new().unwrap();
        let repo = Arc::new(FakeRepository::new("../escape"));
        let resolver = resolver(RuntimeSettings::default(), repo, dir.path());

        for version in ["..", "a/b", ".hidden"] {
            let err = resolver.resolve("demo-model", Some(version), BackendKind::Pt).await.unwrap_err();
            assert!(matches!(err, HostError::IdentityResolution { ref model_id, .. } if model_id == "demo-model"));
        }
        let err = resolver.resolve("org/demo:..", None, BackendKind::Pt).await.unwrap_err();
        assert!(matches!(err, HostError::IdentityResolution { .. }));
        // a remote sha gets the same check
        assert!(resolver.resolve("demo-model", None, BackendKind::Pt).await.is_err());
    }

    #[test]
    fn test_split_revision() {
        assert_eq!(split_revision("org/model:v1"), Some(("org/model", "v1")));
        assert_eq!(split_revision("org/model"), None);
        assert_eq!(split_revision("org/model:"), None);
    }
}
