//! Configuration merger
//!
//! Folds caller options, environment defaults and per-backend defaults into
//! the argument sets used to build a model handle.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, warn};

use crate::adapters::AdapterMap;
use crate::config::{ModelEnvDefaults, RuntimeSettings};
use crate::error::{HostError, Result};
use crate::identity::{is_local_path, resolve_filepath};
use crate::model_config::ModelConfig;
use crate::model_runtime::BackendKind;
use crate::Attrs;

const TOKENIZER_PREFIX: &str = "_tokenizer_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuantizeMethod {
    Int8,
    Int4,
    Gptq,
}

impl QuantizeMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuantizeMethod::Int8 => "int8",
            QuantizeMethod::Int4 => "int4",
            QuantizeMethod::Gptq => "gptq",
        }
    }
}

impl fmt::Display for QuantizeMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QuantizeMethod {
    type Err = HostError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "int8" => Ok(QuantizeMethod::Int8),
            "int4" => Ok(QuantizeMethod::Int4),
            "gptq" => Ok(QuantizeMethod::Gptq),
            other => Err(HostError::invalid("quantize", format!("unknown method '{}', expected int8, int4 or gptq", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerialisationFormat {
    #[default]
    Safetensors,
    Legacy,
}

impl SerialisationFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            SerialisationFormat::Safetensors => "safetensors",
            SerialisationFormat::Legacy => "legacy",
        }
    }
}

impl fmt::Display for SerialisationFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SerialisationFormat {
    type Err = HostError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "safetensors" => Ok(SerialisationFormat::Safetensors),
            "legacy" => Ok(SerialisationFormat::Legacy),
            other => Err(HostError::invalid("serialisation", format!("unknown format '{}'", other))),
        }
    }
}

/// Framework-specific quantisation settings handed to the backend loader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QuantizationConfig {
    BitsAndBytes {
        load_in_8bit: bool,
        load_in_4bit: bool,
        #[serde(default)]
        options: Attrs,
    },
    Gptq {
        bits: u8,
        group_size: i64,
        desc_act: bool,
        #[serde(default)]
        options: Attrs,
    },
}

/// Infer a quantisation config from the method, absorbing the matching
/// prefixed keys out of `attrs`.
pub fn infer_quantization_config(method: QuantizeMethod, attrs: &mut Attrs) -> Result<QuantizationConfig> {
    match method {
        QuantizeMethod::Int8 => Ok(QuantizationConfig::BitsAndBytes {
            load_in_8bit: true,
            load_in_4bit: false,
            options: drain_prefixed(attrs, "llm_int8_", false),
        }),
        QuantizeMethod::Int4 => Ok(QuantizationConfig::BitsAndBytes {
            load_in_8bit: false,
            load_in_4bit: true,
            options: drain_prefixed(attrs, "bnb_4bit_", false),
        }),
        QuantizeMethod::Gptq => {
            let mut options = drain_prefixed(attrs, "gptq_", true);
            let bits = take_u64(&mut options, "bits")?.unwrap_or(4);
            let bits = u8::try_from(bits).map_err(|_| HostError::invalid("gptq_bits", "out of range"))?;
            let group_size = match options.remove("group_size") {
                Some(v) => v.as_i64().ok_or_else(|| HostError::invalid("gptq_group_size", "expected an integer"))?,
                None => 128,
            };
            let desc_act = match options.remove("desc_act") {
                Some(v) => v.as_bool().ok_or_else(|| HostError::invalid("gptq_desc_act", "expected a boolean"))?,
                None => false,
            };
            Ok(QuantizationConfig::Gptq { bits, group_size, desc_act, options })
        }
    }
}

fn drain_prefixed(attrs: &mut Attrs, prefix: &str, strip: bool) -> Attrs {
    let keys: Vec<String> = attrs.keys().filter(|k| k.starts_with(prefix)).cloned().collect();
    let mut drained = Attrs::new();
    for key in keys {
        if let Some(value) = attrs.remove(&key) {
            let name = if strip { key[prefix.len()..].to_string() } else { key };
            drained.insert(name, value);
        }
    }
    drained
}

fn take_u64(attrs: &mut Attrs, key: &str) -> Result<Option<u64>> {
    match attrs.remove(key) {
        Some(v) => v
            .as_u64()
            .map(Some)
            .ok_or_else(|| HostError::invalid(format!("gptq_{}", key), "expected a positive integer")),
        None => Ok(None),
    }
}

/// Split caller attrs into (model args, tokenizer args). Keys prefixed with
/// `_tokenizer_` go to the tokenizer with the prefix removed.
pub fn normalize_attrs(attrs: Attrs) -> (Attrs, Attrs) {
    let mut model = Attrs::new();
    let mut tokenizer = Attrs::new();
    for (key, value) in attrs {
        match key.strip_prefix(TOKENIZER_PREFIX) {
            Some(name) => {
                tokenizer.insert(name.to_string(), value);
            }
            None => {
                model.insert(key, value);
            }
        }
    }
    (model, tokenizer)
}

/// Later layers win.
pub fn merge_layers(layers: &[&Attrs]) -> Attrs {
    let mut merged = Attrs::new();
    for layer in layers {
        for (k, v) in layer.iter() {
            merged.insert(k.clone(), v.clone());
        }
    }
    merged
}

/// Caller-supplied construction options. Every field is optional; unset
/// fields fall back to the environment, then to the backend defaults.
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    pub model_id: Option<String>,
    pub model_version: Option<String>,
    pub quantize: Option<QuantizeMethod>,
    pub quantization_config: Option<QuantizationConfig>,
    pub bettertransformer: Option<bool>,
    pub adapter_id: Option<String>,
    pub adapter_name: Option<String>,
    pub adapter_map: Option<AdapterMap>,
    pub serialisation: Option<SerialisationFormat>,
    pub extra: Attrs,
}

impl LoadOptions {
    pub fn model_id(mut self, model_id: impl Into<String>) -> Self {
        self.model_id = Some(model_id.into());
        self
    }

    pub fn model_version(mut self, version: impl Into<String>) -> Self {
        self.model_version = Some(version.into());
        self
    }

    pub fn quantize(mut self, method: QuantizeMethod) -> Self {
        self.quantize = Some(method);
        self
    }

    pub fn adapter_map(mut self, map: AdapterMap) -> Self {
        self.adapter_map = Some(map);
        self
    }

    pub fn attr(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergedOptions {
    pub model_id: String,
    pub model_version: Option<String>,
    pub quantize: Option<QuantizeMethod>,
    pub quantization_config: Option<QuantizationConfig>,
    pub bettertransformer: Option<bool>,
    pub adapter_map: Option<AdapterMap>,
    pub serialisation: SerialisationFormat,
    /// Attrs not consumed by the merger
    pub remaining: Attrs,
}

pub fn merge_options(
    options: LoadOptions,
    env: &ModelEnvDefaults,
    settings: &RuntimeSettings,
    config: &ModelConfig,
    kind: BackendKind,
) -> Result<MergedOptions> {
    let LoadOptions {
        model_id,
        model_version,
        quantize,
        mut quantization_config,
        bettertransformer,
        adapter_id,
        adapter_name,
        mut adapter_map,
        serialisation,
        extra,
    } = options;
    let mut remaining = extra;

    let model_id = model_id
        .or_else(|| env.model_id.clone())
        .unwrap_or_else(|| config.default_id.clone());
    if model_id.trim().is_empty() {
        return Err(HostError::identity(&config.start_name, "no model id given and no default configured"));
    }
    let model_id = if is_local_path(&model_id) {
        resolve_filepath(Path::new(&model_id)).display().to_string()
    } else {
        model_id
    };

    let quantize = quantize.or(env.quantize);
    let bettertransformer = bettertransformer.or(env.bettertransformer);

    if quantization_config.is_some() && quantize.is_some() {
        return Err(HostError::conflict(
            "quantization_config",
            "quantize",
            "either customise quantization_config or use the quantize argument",
        ));
    }
    if let (Some(method), Some(true)) = (quantize, bettertransformer) {
        return Err(HostError::conflict(
            "quantize",
            "bettertransformer",
            format!("bettertransformer cannot be applied to a {} quantized model", method),
        ));
    }
    if quantization_config.is_none() {
        if let Some(method) = quantize {
            quantization_config = Some(infer_quantization_config(method, &mut remaining)?);
        }
    }

    let mut serialisation = serialisation.or(settings.serialisation).unwrap_or_default();
    if quantize == Some(QuantizeMethod::Gptq) {
        serialisation = SerialisationFormat::Safetensors;
    } else if kind.is_engine() {
        // the engine loader only reads the legacy layout for now
        serialisation = SerialisationFormat::Legacy;
    }

    if adapter_map.is_some() && adapter_id.is_some() {
        return Err(HostError::conflict(
            "adapter_map",
            "adapter_id",
            "provide either an adapter_map ({adapter_id: adapter_name | null, ...}) or adapter_id/adapter_name",
        ));
    }
    if adapter_map.is_none() {
        if let Some(id) = adapter_id {
            adapter_map = Some(vec![(id, adapter_name)]);
        }
    } else if adapter_name.is_some() {
        warn!("adapter_name is ignored when adapter_map is given");
    }
    if let Some(map) = &adapter_map {
        debug!(
            "Applying adapter layers: {:?}",
            map.iter().map(|(id, _)| id.as_str()).collect::<Vec<_>>()
        );
    }

    Ok(MergedOptions {
        model_id,
        model_version,
        quantize,
        quantization_config,
        bettertransformer,
        adapter_map,
        serialisation,
        remaining,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config() -> ModelConfig {
        ModelConfig::new("demo", "org/demo-model")
    }

    fn merge(options: LoadOptions, kind: BackendKind) -> Result<MergedOptions> {
        merge_options(options, &ModelEnvDefaults::default(), &RuntimeSettings::default(), &config(), kind)
    }

    #[test]
    fn test_quantize_and_config_conflict() {
        let options = LoadOptions {
            quantize: Some(QuantizeMethod::Int8),
            quantization_config: Some(QuantizationConfig::BitsAndBytes {
                load_in_8bit: true,
                load_in_4bit: false,
                options: Attrs::new(),
            }),
            ..Default::default()
        };
        let err = merge(options, BackendKind::Pt).unwrap_err();
        assert!(matches!(err, HostError::ConfigurationConflict { first: "quantization_config", second: "quantize", .. }));
    }

    #[test]
    fn test_adapter_map_and_adapter_id_conflict() {
        let options = LoadOptions {
            adapter_id: Some("path/a".into()),
            adapter_map: Some(vec![("path/b".into(), None)]),
            ..Default::default()
        };
        let err = merge(options, BackendKind::Pt).unwrap_err();
        assert!(matches!(err, HostError::ConfigurationConflict { first: "adapter_map", second: "adapter_id", .. }));
    }

    #[test]
    fn test_quantize_and_bettertransformer_conflict() {
        let options = LoadOptions {
            quantize: Some(QuantizeMethod::Int4),
            bettertransformer: Some(true),
            ..Default::default()
        };
        assert!(matches!(
            merge(options, BackendKind::Pt),
            Err(HostError::ConfigurationConflict { first: "quantize", second: "bettertransformer", .. })
        ));
    }

    #[test]
    fn test_adapter_id_promoted_to_map() {
        let options = LoadOptions {
            adapter_id: Some("path/a".into()),
            adapter_name: Some("extra".into()),
            ..Default::default()
        };
        let merged = merge(options, BackendKind::Pt).unwrap();
        assert_eq!(merged.adapter_map, Some(vec![("path/a".to_string(), Some("extra".to_string()))]));
    }

    #[test]
    fn test_int8_infers_bitsandbytes_and_absorbs_keys() {
        let options = LoadOptions::default()
            .quantize(QuantizeMethod::Int8)
            .attr("llm_int8_enable_fp32_cpu_offload", false)
            .attr("device_map", "auto");
        let merged = merge(options, BackendKind::Pt).unwrap();
        match merged.quantization_config {
            Some(QuantizationConfig::BitsAndBytes { load_in_8bit, options, .. }) => {
                assert!(load_in_8bit);
                assert_eq!(options.get("llm_int8_enable_fp32_cpu_offload"), Some(&json!(false)));
            }
            other => panic!("unexpected config: {:?}", other),
        }
        assert!(merged.remaining.contains_key("device_map"));
        assert!(!merged.remaining.contains_key("llm_int8_enable_fp32_cpu_offload"));
    }

    #[test]
    fn test_gptq_forces_safetensors() {
        let options = LoadOptions {
            quantize: Some(QuantizeMethod::Gptq),
            serialisation: Some(SerialisationFormat::Legacy),
            ..Default::default()
        }
        .attr("gptq_bits", 8);
        let merged = merge(options, BackendKind::Vllm).unwrap();
        assert_eq!(merged.serialisation, SerialisationFormat::Safetensors);
        match merged.quantization_config {
            Some(QuantizationConfig::Gptq { bits, group_size, desc_act, .. }) => {
                assert_eq!(bits, 8);
                assert_eq!(group_size, 128);
                assert!(!desc_act);
            }
            other => panic!("unexpected config: {:?}", other),
        }
    }

    #[test]
    fn test_engine_forces_legacy() {
        let options = LoadOptions {
            serialisation: Some(SerialisationFormat::Safetensors),
            ..Default::default()
        };
        assert_eq!(merge(options, BackendKind::Vllm).unwrap().serialisation, SerialisationFormat::Legacy);
    }

    #[test]
    fn test_precedence_call_over_env_over_default() {
        let env = ModelEnvDefaults {
            model_id: Some("org/from-env".into()),
            quantize: Some(QuantizeMethod::Int4),
            ..Default::default()
        };
        let settings = RuntimeSettings::default();

        let from_env = merge_options(LoadOptions::default(), &env, &settings, &config(), BackendKind::Pt).unwrap();
        assert_eq!(from_env.model_id, "org/from-env");
        assert_eq!(from_env.quantize, Some(QuantizeMethod::Int4));

        let explicit = merge_options(
            LoadOptions::default().model_id("org/explicit").quantize(QuantizeMethod::Int8),
            &env,
            &settings,
            &config(),
            BackendKind::Pt,
        )
        .unwrap();
        assert_eq!(explicit.model_id, "org/explicit");
        assert_eq!(explicit.quantize, Some(QuantizeMethod::Int8));

        let fallback = merge(LoadOptions::default(), BackendKind::Pt).unwrap();
        assert_eq!(fallback.model_id, "org/demo-model");
        assert_eq!(fallback.serialisation, SerialisationFormat::Safetensors);
    }

    #[test]
    fn test_normalize_attrs_splits_tokenizer_keys() {
        let mut attrs = Attrs::new();
        attrs.insert("_tokenizer_padding_side".into(), json!("left"));
        attrs.insert("torch_dtype".into(), json!("bfloat16"));
        let (model, tokenizer) = normalize_attrs(attrs);
        assert_eq!(model.get("torch_dtype"), Some(&json!("bfloat16")));
        assert_eq!(tokenizer.get("padding_side"), Some(&json!("left")));
        assert_eq!(model.len(), 1);
    }

    #[test]
    fn test_merge_layers_later_wins() {
        let mut base = Attrs::new();
        base.insert("a".into(), json!(1));
        base.insert("b".into(), json!(1));
        let mut over = Attrs::new();
        over.insert("b".into(), json!(2));
        let merged = merge_layers(&[&base, &over]);
        assert_eq!(merged.get("a"), Some(&json!(1)));
        assert_eq!(merged.get("b"), Some(&json!(2)));
    }

    #[test]
    fn test_parse_enums() {
        assert_eq!("GPTQ".parse::<QuantizeMethod>().unwrap(), QuantizeMethod::Gptq);
        assert!("int2".parse::<QuantizeMethod>().is_err());
        assert_eq!("legacy".parse::<SerialisationFormat>().unwrap(), SerialisationFormat::Legacy);
    }
}
