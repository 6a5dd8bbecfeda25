//! Backend contract
//!
//! Every backend implements [`ModelBackend`]. Capabilities a backend does
//! not override fall back to the trait defaults; which ones it does
//! override is declared once per type in `CAPABILITIES` and recorded in the
//! process-wide capability table the first time a handle is built for it.

use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::BoxStream;
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::any::TypeId;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::engine::{EngineArgs, InferenceEngine};
use super::handle::ModelSpec;
use crate::adapters::AttachedAdapter;
use crate::config::RuntimeSettings;
use crate::error::{HostError, Result};
use crate::identity::{is_local_path, Tag};
use crate::model_config::ModelConfig;
use crate::options::QuantizationConfig;
use crate::store::{ArtifactRef, ArtifactStore, Labels, ModelRepository};
use crate::Attrs;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// General deep-learning framework
    Pt,
    Tf,
    Flax,
    /// Batched high-throughput inference engine
    Vllm,
}

impl BackendKind {
    /// Backend kind from a type name prefix (`FlaxOpt`, `TFOpt`, `VLLMLlama`).
    pub fn infer_from_name(name: &str) -> Self {
        if name.starts_with("Flax") {
            BackendKind::Flax
        } else if name.starts_with("TF") {
            BackendKind::Tf
        } else if name.starts_with("VLLM") {
            BackendKind::Vllm
        } else {
            BackendKind::Pt
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Pt => "pt",
            BackendKind::Tf => "tf",
            BackendKind::Flax => "flax",
            BackendKind::Vllm => "vllm",
        }
    }

    pub fn is_engine(&self) -> bool {
        matches!(self, BackendKind::Vllm)
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = HostError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "pt" => Ok(BackendKind::Pt),
            "tf" => Ok(BackendKind::Tf),
            "flax" => Ok(BackendKind::Flax),
            "vllm" => Ok(BackendKind::Vllm),
            other => Err(HostError::invalid("backend", format!("unknown backend '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    ImportModel,
    LoadModel,
    LoadTokenizer,
    Save,
    SanitizeParameters,
    Generate,
    GenerateOne,
    GenerateIterator,
    Embeddings,
    PostprocessGenerate,
    PostInitHook,
}

impl Capability {
    pub const ALL: [Capability; 11] = [
        Capability::ImportModel,
        Capability::LoadModel,
        Capability::LoadTokenizer,
        Capability::Save,
        Capability::SanitizeParameters,
        Capability::Generate,
        Capability::GenerateOne,
        Capability::GenerateIterator,
        Capability::Embeddings,
        Capability::PostprocessGenerate,
        Capability::PostInitHook,
    ];
}

/// Which capabilities a backend type overrides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Capabilities {
    pub import_model: bool,
    pub load_model: bool,
    pub load_tokenizer: bool,
    pub save: bool,
    pub sanitize_parameters: bool,
    pub generate: bool,
    pub generate_one: bool,
    pub generate_iterator: bool,
    pub embeddings: bool,
    pub postprocess_generate: bool,
    pub post_init_hook: bool,
}

impl Capabilities {
    pub const BASE: Capabilities = Capabilities {
        import_model: false,
        load_model: false,
        load_tokenizer: false,
        save: false,
        sanitize_parameters: false,
        generate: false,
        generate_one: false,
        generate_iterator: false,
        embeddings: false,
        postprocess_generate: false,
        post_init_hook: false,
    };

    pub const fn with(self, capability: Capability) -> Self {
        let mut caps = self;
        match capability {
            Capability::ImportModel => caps.import_model = true,
            Capability::LoadModel => caps.load_model = true,
            Capability::LoadTokenizer => caps.load_tokenizer = true,
            Capability::Save => caps.save = true,
            Capability::SanitizeParameters => caps.sanitize_parameters = true,
            Capability::Generate => caps.generate = true,
            Capability::GenerateOne => caps.generate_one = true,
            Capability::GenerateIterator => caps.generate_iterator = true,
            Capability::Embeddings => caps.embeddings = true,
            Capability::PostprocessGenerate => caps.postprocess_generate = true,
            Capability::PostInitHook => caps.post_init_hook = true,
        }
        caps
    }

    pub fn supports(&self, capability: Capability) -> bool {
        match capability {
            Capability::ImportModel => self.import_model,
            Capability::LoadModel => self.load_model,
            Capability::LoadTokenizer => self.load_tokenizer,
            Capability::Save => self.save,
            Capability::SanitizeParameters => self.sanitize_parameters,
            Capability::Generate => self.generate,
            Capability::GenerateOne => self.generate_one,
            Capability::GenerateIterator => self.generate_iterator,
            Capability::Embeddings => self.embeddings,
            Capability::PostprocessGenerate => self.postprocess_generate,
            Capability::PostInitHook => self.post_init_hook,
        }
    }

    pub fn supports_embeddings(&self) -> bool {
        self.embeddings
    }

    pub fn supports_generate_one(&self) -> bool {
        self.generate_one
    }

    pub fn supports_generate_iterator(&self) -> bool {
        self.generate_iterator
    }

    pub fn overridden(&self) -> Vec<Capability> {
        Capability::ALL.iter().copied().filter(|c| self.supports(*c)).collect()
    }
}

lazy_static! {
    // Keyed by type: two backends may share a display name.
    static ref CAPABILITY_TABLE: DashMap<TypeId, Capabilities> = DashMap::new();
}

/// Capabilities of `B` as the serving layer sees them. The engine kind
/// supplies `generate` and `postprocess_generate` uniformly.
pub fn effective_capabilities<B: ModelBackend>() -> Capabilities {
    let declared = B::CAPABILITIES;
    if B::kind().is_engine() {
        declared.with(Capability::Generate).with(Capability::PostprocessGenerate)
    } else {
        declared
    }
}

/// Record `B` in the capability table; later calls return the stored entry.
pub fn register<B: ModelBackend>() -> Capabilities {
    *CAPABILITY_TABLE.entry(TypeId::of::<B>()).or_insert_with(|| {
        let caps = effective_capabilities::<B>();
        debug!("Registered backend {} ({}) with {:?}", B::NAME, B::kind(), caps.overridden());
        caps
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    Cpu,
    Cuda,
}

/// Values a `post_init_hook` may adjust.
#[derive(Debug, Clone, PartialEq)]
pub struct PostInit {
    pub device: Device,
    pub bettertransformer: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedText {
    pub generated_text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embeddings {
    pub embeddings: Vec<Vec<f32>>,
    pub num_tokens: usize,
}

/// Output of `sanitize_parameters`
#[derive(Debug, Clone, PartialEq)]
pub struct Sanitized {
    pub prompt: String,
    pub generate_kwargs: Attrs,
    pub postprocess_kwargs: Attrs,
}

pub struct ImportContext<'a> {
    pub tag: &'a Tag,
    pub spec: &'a ModelSpec,
    pub model_args: Attrs,
    pub tokenizer_args: Attrs,
    pub trust_remote_code: bool,
    pub quantization_config: Option<&'a QuantizationConfig>,
    pub store: &'a dyn ArtifactStore,
    pub repository: &'a dyn ModelRepository,
    pub labels: Labels,
}

pub struct LoadContext<'a> {
    pub artifact: &'a ArtifactRef,
    pub spec: &'a ModelSpec,
    pub config: &'a ModelConfig,
    pub settings: &'a RuntimeSettings,
    pub model_args: Attrs,
    pub quantization_config: Option<&'a QuantizationConfig>,
    pub trust_remote_code: bool,
    pub device: Device,
    pub bettertransformer: bool,
    /// Set for the engine kind
    pub engine_args: Option<EngineArgs>,
}

pub struct TokenizerContext<'a> {
    pub artifact: &'a ArtifactRef,
    pub tokenizer_id: Option<&'a str>,
    pub tokenizer_args: Attrs,
    pub trust_remote_code: bool,
}

pub struct InferenceContext<'a, B: ModelBackend> {
    pub model: Arc<B::Model>,
    pub tokenizer: Option<Arc<B::Tokenizer>>,
    pub config: &'a ModelConfig,
    pub spec: &'a ModelSpec,
    pub device: Device,
    pub active_adapter: Option<&'a str>,
}

#[async_trait]
pub trait ModelBackend: Send + Sync + Sized + 'static {
    type Model: Send + Sync + 'static;
    type Tokenizer: Send + Sync + 'static;

    /// Type name; its prefix selects the backend kind.
    const NAME: &'static str;
    const CAPABILITIES: Capabilities = Capabilities::BASE;

    fn kind() -> BackendKind {
        BackendKind::infer_from_name(Self::NAME)
    }

    fn model_config(&self) -> ModelConfig;

    /// Base (model args, tokenizer args) for imports
    fn import_kwargs(&self) -> (Attrs, Attrs) {
        (Attrs::new(), Attrs::new())
    }

    fn post_init_hook(&self, _post: &mut PostInit) {}

    async fn import_model(&self, ctx: ImportContext<'_>) -> Result<ArtifactRef> {
        default_import(ctx).await
    }

    async fn load_model(&self, _ctx: LoadContext<'_>) -> Result<Self::Model> {
        Err(HostError::not_implemented(Self::NAME, "load_model"))
    }

    async fn load_tokenizer(&self, _ctx: TokenizerContext<'_>) -> Result<Self::Tokenizer> {
        Err(HostError::not_implemented(Self::NAME, "load_tokenizer"))
    }

    async fn save(&self, _model: &Self::Model, _tokenizer: Option<&Self::Tokenizer>, _dest: &Path) -> Result<()> {
        Err(HostError::not_implemented(Self::NAME, "save"))
    }

    fn sanitize_parameters(&self, prompt: &str, attrs: Attrs) -> Result<Sanitized> {
        Ok(Sanitized {
            prompt: prompt.to_string(),
            generate_kwargs: attrs.clone(),
            postprocess_kwargs: attrs,
        })
    }

    async fn generate(&self, _ctx: InferenceContext<'_, Self>, _prompt: &str, _attrs: Attrs) -> Result<Value> {
        Err(HostError::not_implemented(Self::NAME, "generate"))
    }

    async fn generate_one(
        &self,
        _ctx: InferenceContext<'_, Self>,
        _prompt: &str,
        _stop: &[String],
        _attrs: Attrs,
    ) -> Result<Vec<GeneratedText>> {
        Err(HostError::not_implemented(Self::NAME, "generate_one"))
    }

    async fn generate_iterator(
        &self,
        _ctx: InferenceContext<'_, Self>,
        _prompt: &str,
        _attrs: Attrs,
    ) -> Result<BoxStream<'static, Result<Value>>> {
        Err(HostError::not_implemented(Self::NAME, "generate_iterator"))
    }

    async fn embeddings(&self, _ctx: InferenceContext<'_, Self>, _prompts: &[String]) -> Result<Embeddings> {
        Err(HostError::not_implemented(Self::NAME, "embeddings"))
    }

    fn postprocess_generate(&self, _prompt: &str, result: Value, _attrs: Attrs) -> Result<Value> {
        Ok(result)
    }

    /// Engine view of a loaded model, required by the engine kind.
    fn as_engine(_model: &Self::Model) -> Option<&dyn InferenceEngine> {
        None
    }

    async fn load_adapter_weights(&self, _model: &Self::Model, _name: &str, _adapter: &AttachedAdapter) -> Result<()> {
        Ok(())
    }

    async fn activate_adapter(&self, _model: &Self::Model, _name: &str) -> Result<()> {
        Ok(())
    }
}

/// Copy a local model directory, or snapshot the remote repository, into a
/// staged directory and commit it under the tag.
pub async fn default_import(ctx: ImportContext<'_>) -> Result<ArtifactRef> {
    let staged = ctx.store.stage(ctx.tag).await?;
    let model_id = ctx.spec.model_id.as_str();

    let filled = if is_local_path(model_id) {
        info!("Importing {} from local directory {}", ctx.tag, model_id);
        copy_dir(Path::new(model_id), &staged).await
    } else {
        info!("Importing {} from repository {}@{}", ctx.tag, model_id, ctx.tag.version);
        ctx.repository
            .snapshot(model_id, &ctx.tag.version, &staged)
            .await
            .map(|_| ())
    };

    if let Err(e) = filled {
        if let Err(cleanup) = tokio::fs::remove_dir_all(&staged).await {
            warn!("Failed to remove staging dir {}: {}", staged.display(), cleanup);
        }
        return Err(e);
    }
    ctx.store.commit(ctx.tag, &staged, ctx.labels).await
}

async fn copy_dir(source: &Path, dest: &Path) -> Result<()> {
    let mut pending: Vec<(PathBuf, PathBuf)> = vec![(source.to_path_buf(), dest.to_path_buf())];
    while let Some((from, to)) = pending.pop() {
        tokio::fs::create_dir_all(&to).await.map_err(|e| HostError::io(&to, e))?;
        let mut entries = tokio::fs::read_dir(&from).await.map_err(|e| HostError::io(&from, e))?;
        while let Some(entry) = entries.next_entry().await.map_err(|e| HostError::io(&from, e))? {
            let path = entry.path();
            let target = to.join(entry.file_name());
            let file_type = entry.file_type().await.map_err(|e| HostError::io(&path, e))?;
            if file_type.is_dir() {
                pending.push((path, target));
            } else {
                tokio::fs::copy(&path, &target).await.map_err(|e| HostError::io(&path, e))?;
            }
        }
    }
    Ok(())
}
