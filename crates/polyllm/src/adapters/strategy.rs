//! Fine-tune strategies
//!
//! A strategy carries the defaults a model family wants for one adapter type.
//! The family's "default" adapter is specialised through it; named adapters
//! use their own configs untouched.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::spec::AdapterType;
use crate::Attrs;

pub const DEFAULT_TASK_TYPE: &str = "CAUSAL_LM";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FineTuneConfig {
    pub adapter_type: AdapterType,
    pub adapter_config: Attrs,
    pub inference_mode: bool,
    /// Name of the config class this strategy is bound to
    pub llm_config_class: String,
}

impl FineTuneConfig {
    pub fn new(adapter_type: AdapterType, llm_config_class: impl Into<String>) -> Self {
        Self {
            adapter_type,
            adapter_config: default_adapter_config(adapter_type),
            inference_mode: false,
            llm_config_class: llm_config_class.into(),
        }
    }

    pub fn eval(mut self) -> Self {
        self.inference_mode = true;
        self
    }

    pub fn train(mut self) -> Self {
        self.inference_mode = false;
        self
    }

    pub fn with_config(mut self, overrides: &Attrs) -> Self {
        for (k, v) in overrides {
            self.adapter_config.insert(k.clone(), v.clone());
        }
        self
    }

    pub fn to_peft_config(&self) -> PeftConfig {
        PeftConfig::assemble(self.adapter_type, self.adapter_config.clone(), self.inference_mode)
    }
}

fn default_adapter_config(adapter_type: AdapterType) -> Attrs {
    let defaults = match adapter_type {
        AdapterType::Lora | AdapterType::AdaLora => json!({
            "r": 8,
            "lora_alpha": 16,
            "lora_dropout": 0.05,
            "bias": "none",
        }),
        _ => json!({}),
    };
    match defaults {
        Value::Object(map) => map,
        _ => Attrs::new(),
    }
}

/// Engine-ready adapter config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeftConfig {
    pub peft_type: String,
    pub task_type: String,
    pub inference_mode: bool,
    pub base_model_name_or_path: Option<String>,
    #[serde(flatten)]
    pub options: Attrs,
}

impl PeftConfig {
    /// Config taken verbatim from an adapter's own `adapter_config.json`
    pub fn from_adapter(adapter_type: AdapterType, config: &Attrs, inference_mode: bool) -> Self {
        Self::assemble(adapter_type, config.clone(), inference_mode)
    }

    /// Lift the typed fields out of `options`. `peft_type` and
    /// `inference_mode` in the map are ignored in favour of the arguments.
    fn assemble(adapter_type: AdapterType, mut options: Attrs, inference_mode: bool) -> Self {
        options.remove("peft_type");
        options.remove("inference_mode");
        let task_type = options
            .remove("task_type")
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| DEFAULT_TASK_TYPE.to_string());
        let base_model_name_or_path = options
            .remove("base_model_name_or_path")
            .and_then(|v| v.as_str().map(str::to_string));
        Self {
            peft_type: adapter_type.peft_type(),
            task_type,
            inference_mode,
            base_model_name_or_path,
            options,
        }
    }
}
