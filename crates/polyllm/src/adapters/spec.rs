//! Adapter specifications and family discovery

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use tracing::debug;

use crate::error::{HostError, Result};
use crate::store::ModelRepository;
use crate::Attrs;

pub const PEFT_CONFIG_NAME: &str = "adapter_config.json";

/// Adapter family, read from the `peft_type` field of an adapter config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AdapterType {
    #[serde(rename = "lora")]
    Lora,
    #[serde(rename = "adalora")]
    AdaLora,
    #[serde(rename = "ia3")]
    Ia3,
    #[serde(rename = "prompt_tuning")]
    PromptTuning,
    #[serde(rename = "prefix_tuning")]
    PrefixTuning,
    #[serde(rename = "p_tuning")]
    PTuning,
    #[serde(rename = "adaption_prompt")]
    AdaptionPrompt,
}

impl AdapterType {
    pub const ALL: [AdapterType; 7] = [
        AdapterType::Lora,
        AdapterType::AdaLora,
        AdapterType::Ia3,
        AdapterType::PromptTuning,
        AdapterType::PrefixTuning,
        AdapterType::PTuning,
        AdapterType::AdaptionPrompt,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AdapterType::Lora => "lora",
            AdapterType::AdaLora => "adalora",
            AdapterType::Ia3 => "ia3",
            AdapterType::PromptTuning => "prompt_tuning",
            AdapterType::PrefixTuning => "prefix_tuning",
            AdapterType::PTuning => "p_tuning",
            AdapterType::AdaptionPrompt => "adaption_prompt",
        }
    }

    /// Upper-case form used inside serialised adapter configs
    pub fn peft_type(&self) -> String {
        self.as_str().to_uppercase()
    }
}

impl fmt::Display for AdapterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AdapterType {
    type Err = HostError;

    fn from_str(s: &str) -> Result<Self> {
        let lowered = s.trim().to_lowercase();
        AdapterType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == lowered)
            .ok_or_else(|| HostError::adapter(s, "unknown adapter family"))
    }
}

/// One adapter entry. `name == None` marks the candidate for the family's
/// default adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterSpec {
    pub adapter_id: String,
    pub name: Option<String>,
    #[serde(default)]
    pub config: Attrs,
}

pub type AdaptersMapping = BTreeMap<AdapterType, Vec<AdapterSpec>>;

/// Caller-facing `adapter id -> name` pairs, in caller order.
pub type AdapterMap = Vec<(String, Option<String>)>;

/// Read every adapter's config (local directory first, remote repository
/// otherwise) and group the entries by family.
pub async fn resolve_peft_config_type(
    adapter_map: &AdapterMap,
    repository: &dyn ModelRepository,
) -> Result<AdaptersMapping> {
    let mut resolved = AdaptersMapping::new();
    for (adapter_id, name) in adapter_map {
        let config = read_adapter_config(adapter_id, repository).await?;
        let peft_type = config
            .get("peft_type")
            .and_then(|v| v.as_str())
            .ok_or_else(|| HostError::adapter(adapter_id, format!("'{}' has no 'peft_type' field", PEFT_CONFIG_NAME)))?;
        let family: AdapterType = peft_type.parse()?;
        debug!("Adapter {} resolved to family {}", adapter_id, family);
        resolved.entry(family).or_default().push(AdapterSpec {
            adapter_id: adapter_id.clone(),
            name: name.clone(),
            config,
        });
    }
    Ok(resolved)
}

async fn read_adapter_config(adapter_id: &str, repository: &dyn ModelRepository) -> Result<Attrs> {
    let local = Path::new(adapter_id).join(PEFT_CONFIG_NAME);
    let raw = if local.is_file() {
        tokio::fs::read(&local).await.map_err(|e| HostError::io(&local, e))?
    } else {
        repository
            .fetch_file(adapter_id, "main", PEFT_CONFIG_NAME)
            .await
            .map_err(|e| HostError::adapter(adapter_id, format!("failed to fetch {}: {}", PEFT_CONFIG_NAME, e)))?
    };
    serde_json::from_slice(&raw).map_err(|e| HostError::adapter(adapter_id, format!("invalid {}: {}", PEFT_CONFIG_NAME, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeRepository;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_family_parsing_is_case_insensitive() {
        assert_eq!("LORA".parse::<AdapterType>().unwrap(), AdapterType::Lora);
        assert_eq!("Prefix_Tuning".parse::<AdapterType>().unwrap(), AdapterType::PrefixTuning);
        let err = "qlora".parse::<AdapterType>().unwrap_err();
        assert!(err.to_string().contains("qlora"));
    }

    #[tokio::test]
    async fn test_groups_local_and_remote_adapters_by_family() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join(PEFT_CONFIG_NAME),
            json!({"peft_type": "LORA", "r": 16}).to_string(),
        )
        .unwrap();

        let repo = FakeRepository::new("abc123");
        repo.add_file("org/remote-ia3", PEFT_CONFIG_NAME, json!({"peft_type": "IA3"}).to_string());

        let local_id = dir.path().display().to_string();
        let map = vec![(local_id.clone(), None), ("org/remote-ia3".to_string(), Some("tone".to_string()))];
        let mapping = resolve_peft_config_type(&map, &repo).await.unwrap();

        assert_eq!(mapping[&AdapterType::Lora][0].adapter_id, local_id);
        assert_eq!(mapping[&AdapterType::Lora][0].config.get("r"), Some(&json!(16)));
        assert_eq!(mapping[&AdapterType::Ia3][0].name.as_deref(), Some("tone"));
    }

    #[tokio::test]
    async fn test_missing_peft_type_is_adapter_error() {
        let repo = FakeRepository::new("abc123");
        repo.add_file("org/broken", PEFT_CONFIG_NAME, json!({"r": 8}).to_string());
        let err = resolve_peft_config_type(&vec![("org/broken".into(), None)], &repo)
            .await
            .unwrap_err();
        assert!(matches!(err, HostError::AdapterResolution { ref family, .. } if family == "org/broken"));
    }
}
