//! Remote model repository

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::config::RuntimeSettings;
use crate::error::{HostError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepoSibling {
    #[serde(rename = "rfilename")]
    pub filename: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepoInfo {
    /// Commit hash of the requested revision
    pub sha: Option<String>,
    #[serde(default)]
    pub siblings: Vec<RepoSibling>,
}

#[async_trait]
pub trait ModelRepository: Send + Sync {
    async fn model_info(&self, model_id: &str, revision: &str) -> Result<RepoInfo>;

    async fn fetch_file(&self, model_id: &str, revision: &str, filename: &str) -> Result<Vec<u8>>;

    /// Download every file of a revision under `dest`.
    async fn snapshot(&self, model_id: &str, revision: &str, dest: &Path) -> Result<Vec<PathBuf>> {
        let info = self.model_info(model_id, revision).await?;
        let mut written = Vec::with_capacity(info.siblings.len());
        for sibling in &info.siblings {
            let target = dest.join(&sibling.filename);
            if target.strip_prefix(dest).is_err() || sibling.filename.contains("..") {
                return Err(HostError::repository(model_id, format!("refusing to write '{}'", sibling.filename)));
            }
            let bytes = self.fetch_file(model_id, revision, &sibling.filename).await?;
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| HostError::io(parent, e))?;
            }
            tokio::fs::write(&target, bytes).await.map_err(|e| HostError::io(&target, e))?;
            written.push(target);
        }
        debug!("Snapshot of {}@{}: {} file(s)", model_id, revision, written.len());
        Ok(written)
    }
}

/// HTTP client for a Hugging Face compatible hub.
pub struct HubClient {
    http_client: reqwest::Client,
    endpoint: String,
    token: Option<String>,
}

impl HubClient {
    pub fn new(endpoint: impl Into<String>, token: Option<String>, timeout: Duration) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| HostError::repository("<client>", e.to_string()))?;
        Ok(Self {
            http_client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            token,
        })
    }

    pub fn from_settings(settings: &RuntimeSettings) -> Result<Self> {
        Self::new(
            settings.hub_endpoint.clone(),
            settings.hub_token.clone(),
            Duration::from_secs(settings.request_timeout_seconds),
        )
    }

    async fn get(&self, model_id: &str, url: &str, what: String) -> Result<reqwest::Response> {
        let mut request = self.http_client.get(url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let resp = request
            .send()
            .await
            .map_err(|e| HostError::repository(model_id, format!("request to {} failed: {}", url, e)))?;

        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(HostError::not_found(what));
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(HostError::repository(model_id, format!("{} returned {}: {}", url, status, body)));
        }
        Ok(resp)
    }
}

#[async_trait]
impl ModelRepository for HubClient {
    async fn model_info(&self, model_id: &str, revision: &str) -> Result<RepoInfo> {
        let url = format!("{}/api/models/{}/revision/{}", self.endpoint, model_id, revision);
        let resp = self.get(model_id, &url, format!("model '{}' at revision '{}'", model_id, revision)).await?;
        resp.json::<RepoInfo>()
            .await
            .map_err(|e| HostError::repository(model_id, format!("failed to parse model info: {}", e)))
    }

    async fn fetch_file(&self, model_id: &str, revision: &str, filename: &str) -> Result<Vec<u8>> {
        let url = format!("{}/{}/resolve/{}/{}", self.endpoint, model_id, revision, filename);
        info!("⬇️ Fetching {} from {}", filename, model_id);
        let resp = self.get(model_id, &url, format!("'{}' in '{}'", filename, model_id)).await?;
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| HostError::repository(model_id, format!("failed to read {}: {}", filename, e)))?;
        Ok(bytes.to_vec())
    }
}
