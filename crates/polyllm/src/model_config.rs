// polyllm/crates/polyllm/src/model_config.rs
//
// Per-model configuration bound to a backend.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::adapters::{AdapterType, FineTuneConfig};
use crate::error::{HostError, Result};
use crate::Attrs;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationConfig {
    pub max_new_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
    #[serde(default)]
    pub stop: Vec<String>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_new_tokens: 256,
            temperature: 0.75,
            top_p: 0.9,
            top_k: 40,
            stop: Vec::new(),
        }
    }
}

impl GenerationConfig {
    pub const KEYS: [&'static str; 5] = ["max_new_tokens", "temperature", "top_p", "top_k", "stop"];

    /// Copy with any generation keys present in `attrs` applied. Keys are
    /// removed from `attrs` as they are consumed.
    pub fn with_overrides(&self, attrs: &mut Attrs) -> Result<Self> {
        let mut config = self.clone();
        if let Some(v) = attrs.remove("max_new_tokens") {
            config.max_new_tokens = as_u32(&v, "max_new_tokens")?;
        }
        if let Some(v) = attrs.remove("temperature") {
            config.temperature = as_f32(&v, "temperature")?;
        }
        if let Some(v) = attrs.remove("top_p") {
            config.top_p = as_f32(&v, "top_p")?;
        }
        if let Some(v) = attrs.remove("top_k") {
            config.top_k = as_u32(&v, "top_k")?;
        }
        if let Some(v) = attrs.remove("stop") {
            config.stop = match v {
                Value::String(s) => vec![s],
                other => serde_json::from_value(other).map_err(|e| HostError::invalid("stop", e.to_string()))?,
            };
        }
        Ok(config)
    }
}

fn as_u32(value: &Value, key: &str) -> Result<u32> {
    value
        .as_u64()
        .and_then(|v| u32::try_from(v).ok())
        .ok_or_else(|| HostError::invalid(key, format!("expected a non-negative integer, got {}", value)))
}

fn as_f32(value: &Value, key: &str) -> Result<f32> {
    value
        .as_f64()
        .map(|v| v as f32)
        .ok_or_else(|| HostError::invalid(key, format!("expected a number, got {}", value)))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Short name used in env keys and runner names (`flan-t5`, `llama`)
    pub start_name: String,
    pub default_id: String,
    pub model_ids: Vec<String>,
    pub requires_gpu: bool,
    pub trust_remote_code: bool,
    pub bettertransformer: bool,
    /// Tokenizer override for the engine kind
    pub tokenizer_id: Option<String>,
    pub generation: GenerationConfig,
    pub fine_tune_strategies: BTreeMap<AdapterType, FineTuneConfig>,
    /// Non-generation attrs captured at construction
    pub extras: Attrs,
}

impl ModelConfig {
    pub fn new(start_name: impl Into<String>, default_id: impl Into<String>) -> Self {
        let default_id = default_id.into();
        Self {
            start_name: start_name.into(),
            model_ids: vec![default_id.clone()],
            default_id,
            requires_gpu: false,
            trust_remote_code: false,
            bettertransformer: false,
            tokenizer_id: None,
            generation: GenerationConfig::default(),
            fine_tune_strategies: BTreeMap::new(),
            extras: Attrs::new(),
        }
    }

    pub fn requires_gpu(mut self, requires_gpu: bool) -> Self {
        self.requires_gpu = requires_gpu;
        self
    }

    pub fn with_strategy(mut self, strategy: FineTuneConfig) -> Self {
        self.fine_tune_strategies.insert(strategy.adapter_type, strategy);
        self
    }

    /// Name of this config class, used to bind fine-tune strategies.
    pub fn config_class(&self) -> String {
        let mut name: String = self
            .start_name
            .split(|c: char| !c.is_ascii_alphanumeric())
            .filter(|part| !part.is_empty())
            .map(|part| {
                let mut chars = part.chars();
                match chars.next() {
                    Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                    None => String::new(),
                }
            })
            .collect();
        name.push_str("Config");
        name
    }

    /// Build a config from caller attrs. Generation keys are absorbed; the
    /// leftovers are returned for the loader.
    pub fn construct_with(&self, mut attrs: Attrs) -> Result<(ModelConfig, Attrs)> {
        let mut config = self.clone();
        config.generation = self.generation.with_overrides(&mut attrs)?;
        if let Some(v) = attrs.remove("requires_gpu") {
            config.requires_gpu = v
                .as_bool()
                .ok_or_else(|| HostError::invalid("requires_gpu", "expected a boolean"))?;
        }
        config.extras = attrs.clone();
        Ok((config, attrs))
    }

    /// The family's strategy in the requested mode, falling back to the
    /// built-in defaults when the model declares none.
    pub fn default_strategy(&self, family: AdapterType, inference_mode: bool) -> FineTuneConfig {
        let strategy = self
            .fine_tune_strategies
            .get(&family)
            .cloned()
            .unwrap_or_else(|| FineTuneConfig::new(family, self.config_class()));
        if inference_mode {
            strategy.eval()
        } else {
            strategy.train()
        }
    }
}
