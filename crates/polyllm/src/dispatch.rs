//! Dispatch unit
//!
//! Wraps a model handle into the unit a serving layer schedules: named
//! operations with batching metadata, adapter switching as a side channel
//! and eager model loading at construction.

use futures::stream::BoxStream;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tracing::info;

use crate::adapters::PeftConfig;
use crate::error::{HostError, Result};
use crate::model_runtime::{Capabilities, Embeddings, GeneratedText, ModelBackend, ModelHandle};
use crate::store::ArtifactRef;
use crate::Attrs;

const GPU_RESOURCES: [&str; 2] = ["nvidia.com/gpu", "amd.com/gpu"];
const CPU_RESOURCE: &str = "cpu";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum BatchDim {
    Same(usize),
    /// (input dim, output dim)
    Split(usize, usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MethodSignature {
    pub batchable: bool,
    pub batch_dim: Option<BatchDim>,
}

impl MethodSignature {
    pub const fn unbatched() -> Self {
        Self {
            batchable: false,
            batch_dim: None,
        }
    }

    pub const fn batched(dim: usize) -> Self {
        Self {
            batchable: true,
            batch_dim: Some(BatchDim::Same(dim)),
        }
    }
}

/// Only methods the backend actually provides are exposed.
fn default_signatures(caps: Capabilities) -> BTreeMap<&'static str, MethodSignature> {
    let mut signatures = BTreeMap::new();
    signatures.insert("generate", MethodSignature::unbatched());
    if caps.supports_generate_one() {
        signatures.insert("generate_one", MethodSignature::unbatched());
    }
    if caps.supports_generate_iterator() {
        signatures.insert("generate_iterator", MethodSignature::batched(0));
    }
    if caps.supports_embeddings() {
        signatures.insert("embeddings", MethodSignature::unbatched());
    }
    signatures
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeftAdapterOutput {
    pub success: bool,
    pub result: BTreeMap<String, PeftConfig>,
    pub error_msg: String,
}

impl PeftAdapterOutput {
    fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            result: BTreeMap::new(),
            error_msg: message.into(),
        }
    }
}

pub struct DispatchUnit<B: ModelBackend> {
    handle: ModelHandle<B>,
    signatures: BTreeMap<&'static str, MethodSignature>,
}

impl<B: ModelBackend> DispatchUnit<B> {
    /// Loads the model now, and applies every configured adapter, so a
    /// broken model fails at worker startup instead of on first request.
    pub async fn new(mut handle: ModelHandle<B>) -> Result<Self> {
        let runner_name = runner_name(&handle);
        handle.model().await?;
        if handle.adapters_mapping().is_some() {
            info!("Applying adapters to {}...", runner_name);
            handle.ensure_adapters().await?;
        }
        info!("🚀 {} ready ({})", runner_name, handle.tag());
        let signatures = default_signatures(handle.capabilities());
        Ok(Self { handle, signatures })
    }

    pub fn handle(&self) -> &ModelHandle<B> {
        &self.handle
    }

    pub fn into_handle(self) -> ModelHandle<B> {
        self.handle
    }

    pub fn signatures(&self) -> &BTreeMap<&'static str, MethodSignature> {
        &self.signatures
    }

    pub fn signature(&self, method: &str) -> Option<MethodSignature> {
        self.signatures.get(method).copied()
    }

    pub fn runner_name(&self) -> String {
        runner_name(&self.handle)
    }

    pub fn supported_resources(&self) -> Vec<&'static str> {
        let mut resources = GPU_RESOURCES.to_vec();
        if !self.handle.config().requires_gpu {
            resources.push(CPU_RESOURCE);
        }
        resources
    }

    pub async fn set_adapter(&mut self, name: &str) -> Result<()> {
        self.handle.set_adapter(name).await
    }

    async fn switch_adapter(&mut self, attrs: &mut Attrs) -> Result<()> {
        match attrs.remove("adapter_name") {
            None | Some(Value::Null) => Ok(()),
            Some(Value::String(name)) => self.set_adapter(&name).await,
            Some(other) => Err(HostError::invalid("adapter_name", format!("expected a string, got {}", other))),
        }
    }

    pub async fn generate(&mut self, prompt: &str, mut attrs: Attrs) -> Result<Value> {
        self.switch_adapter(&mut attrs).await?;
        self.handle.generate(prompt, attrs).await
    }

    /// Full sanitize -> generate -> postprocess run.
    pub async fn call(&mut self, prompt: &str, mut attrs: Attrs) -> Result<Value> {
        self.switch_adapter(&mut attrs).await?;
        self.handle.call(prompt, attrs).await
    }

    pub async fn generate_one(&mut self, prompt: &str, stop: &[String], mut attrs: Attrs) -> Result<Vec<GeneratedText>> {
        self.switch_adapter(&mut attrs).await?;
        self.handle.generate_one(prompt, stop, attrs).await
    }

    pub async fn generate_iterator(&mut self, prompt: &str, mut attrs: Attrs) -> Result<BoxStream<'static, Result<Value>>> {
        self.switch_adapter(&mut attrs).await?;
        self.handle.generate_iterator(prompt, attrs).await
    }

    pub async fn embeddings(&mut self, prompts: &[String]) -> Result<Embeddings> {
        self.handle.embeddings(prompts).await
    }

    pub fn available_adapters(&self) -> PeftAdapterOutput {
        if self.handle.adapters_mapping().is_none() {
            return PeftAdapterOutput::failure("No adapters available for current running server.");
        }
        match self.handle.peft_configs() {
            Some(result) => PeftAdapterOutput {
                success: true,
                result,
                error_msg: String::new(),
            },
            None => PeftAdapterOutput::failure("Model is not adapter-wrapped"),
        }
    }

    /// Resolve identity and make sure the artifact is in the local store.
    pub async fn download_model(&mut self) -> Result<ArtifactRef> {
        self.handle.ensure_model_id_exists().await
    }

    pub fn describe(&self) -> Value {
        let caps = self.handle.capabilities();
        json!({
            "runner_name": self.runner_name(),
            "llm_type": B::NAME,
            "backend": B::kind(),
            "llm_tag": self.handle.tag().to_string(),
            "config": serde_json::to_value(self.handle.config()).unwrap_or(Value::Null),
            "runner_methods": self.signatures,
            "resources": self.supported_resources(),
            "supports_embeddings": caps.supports_embeddings(),
            "supports_hf_agent": caps.supports_generate_one(),
            "has_adapters": self.handle.adapters_mapping().is_some(),
        })
    }
}

fn runner_name<B: ModelBackend>(handle: &ModelHandle<B>) -> String {
    format!("llm-{}-runner", handle.config().start_name)
}
