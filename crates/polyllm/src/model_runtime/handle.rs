//! Model handle
//!
//! A handle is built by [`HandleBuilder`] (identity resolved, options
//! merged, nothing loaded) and then materialises its artifact, model,
//! tokenizer and adapters lazily. State only moves forward:
//! `Constructed -> ModelLoaded -> Adapted`.

use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::backend::{
    register, BackendKind, Capabilities, Device, Embeddings, GeneratedText, ImportContext, InferenceContext,
    LoadContext, ModelBackend, PostInit, Sanitized, TokenizerContext,
};
use super::engine::{first_completion_text, run_to_completion, EngineArgs, SamplingParams};
use crate::adapters::{
    resolve_peft_config_type, AdaptedModel, AdapterResolver, AdapterType, AdaptersMapping, ModelSlot, PeftConfig,
    ResolvedAdapterMapping, DEFAULT_ADAPTER_NAME,
};
use crate::config::{ModelEnvDefaults, RuntimeSettings};
use crate::error::{HostError, Result};
use crate::identity::{Tag, TagResolver};
use crate::model_config::ModelConfig;
use crate::options::{
    merge_layers, merge_options, normalize_attrs, LoadOptions, QuantizationConfig, QuantizeMethod,
    SerialisationFormat,
};
use crate::store::{ArtifactRef, ArtifactStore, HubClient, Labels, LocalModelStore, ModelRepository};
use crate::Attrs;

/// Immutable identity of a handle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub model_id: String,
    pub model_version: Option<String>,
    pub backend_kind: BackendKind,
    pub quantize_method: Option<QuantizeMethod>,
    pub serialisation_format: SerialisationFormat,
}

impl ModelSpec {
    pub fn new(model_id: impl Into<String>, backend_kind: BackendKind) -> Self {
        Self {
            model_id: model_id.into(),
            model_version: None,
            backend_kind,
            quantize_method: None,
            serialisation_format: SerialisationFormat::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HandleState {
    Constructed,
    ModelLoaded,
    Adapted,
}

/// Which attached adapters get their weights loaded eagerly.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum LoadAdapters {
    #[default]
    None,
    All,
    Only(Vec<String>),
}

#[derive(Debug, Clone)]
pub struct ApplyAdapter {
    pub inference_mode: bool,
    pub adapter_type: AdapterType,
    pub load_adapters: LoadAdapters,
    pub use_cache: bool,
}

impl Default for ApplyAdapter {
    fn default() -> Self {
        Self {
            inference_mode: true,
            adapter_type: AdapterType::Lora,
            load_adapters: LoadAdapters::None,
            use_cache: true,
        }
    }
}

pub struct HandleBuilder<B: ModelBackend> {
    backend: B,
    settings: Arc<RuntimeSettings>,
    options: LoadOptions,
    env: ModelEnvDefaults,
    repository: Option<Arc<dyn ModelRepository>>,
    store: Option<Arc<dyn ArtifactStore>>,
    resolver: Option<Arc<TagResolver>>,
}

impl<B: ModelBackend> HandleBuilder<B> {
    pub fn new(backend: B, settings: Arc<RuntimeSettings>) -> Self {
        Self {
            backend,
            settings,
            options: LoadOptions::default(),
            env: ModelEnvDefaults::default(),
            repository: None,
            store: None,
            resolver: None,
        }
    }

    pub fn options(mut self, options: LoadOptions) -> Self {
        self.options = options;
        self
    }

    pub fn env_defaults(mut self, env: ModelEnvDefaults) -> Self {
        self.env = env;
        self
    }

    pub fn repository(mut self, repository: Arc<dyn ModelRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    pub fn store(mut self, store: Arc<dyn ArtifactStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Share one resolver (and its memo) across handles.
    pub fn tag_resolver(mut self, resolver: Arc<TagResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub async fn build(self) -> Result<ModelHandle<B>> {
        let HandleBuilder {
            backend,
            settings,
            options,
            env,
            repository,
            store,
            resolver,
        } = self;
        let kind = B::kind();
        let capabilities = register::<B>();
        if let Some(framework) = env.framework.filter(|f| *f != kind) {
            warn!("Ignoring framework default {} for {}, which runs on {}", framework, B::NAME, kind);
        }

        let store: Arc<dyn ArtifactStore> = match store {
            Some(store) => store,
            None => Arc::new(LocalModelStore::new(settings.store_root.clone())),
        };
        let repository: Arc<dyn ModelRepository> = match repository {
            Some(repository) => repository,
            None => Arc::new(HubClient::from_settings(&settings)?),
        };
        let resolver = match resolver {
            Some(resolver) => resolver,
            None => Arc::new(TagResolver::new(settings.clone(), repository.clone(), store.clone())),
        };

        let class_config = backend.model_config();
        let merged = merge_options(options, &env, &settings, &class_config, kind)?;
        let (config, remaining) = class_config.construct_with(merged.remaining)?;

        let tag = resolver
            .resolve(&merged.model_id, merged.model_version.as_deref(), kind)
            .await?;

        let adapters_mapping = match &merged.adapter_map {
            Some(map) => Some(resolve_peft_config_type(map, repository.as_ref()).await?),
            None => None,
        };

        let (model_attrs, tokenizer_attrs) = normalize_attrs(remaining);
        let (import_model_args, import_tokenizer_args) = backend.import_kwargs();
        let mut model_args = merge_layers(&[&import_model_args, &model_attrs]);
        let tokenizer_args = merge_layers(&[&import_tokenizer_args, &tokenizer_attrs]);

        let trust_remote_code = match model_args.remove("trust_remote_code") {
            Some(v) => v
                .as_bool()
                .ok_or_else(|| HostError::invalid("trust_remote_code", "expected a boolean"))?,
            None => config.trust_remote_code,
        };
        if kind == BackendKind::Pt {
            model_args
                .entry("low_cpu_mem_usage".to_string())
                .or_insert(Value::Bool(true));
        }

        let mut bettertransformer = merged.bettertransformer.unwrap_or(config.bettertransformer);
        if adapters_mapping.is_some() && bettertransformer {
            warn!("bettertransformer is disabled for {} because adapters are attached", tag);
            bettertransformer = false;
        }

        let mut post = PostInit {
            device: if kind == BackendKind::Pt && settings.device_count > 0 {
                Device::Cuda
            } else {
                Device::Cpu
            },
            bettertransformer,
        };
        backend.post_init_hook(&mut post);

        let spec = ModelSpec {
            model_id: merged.model_id,
            model_version: merged.model_version,
            backend_kind: kind,
            quantize_method: merged.quantize,
            serialisation_format: merged.serialisation,
        };
        info!("🧩 Constructed {} handle {} (device {:?})", B::NAME, tag, post.device);

        Ok(ModelHandle {
            backend,
            spec,
            tag,
            config,
            capabilities,
            quantization_config: merged.quantization_config,
            adapters_mapping,
            model_args,
            tokenizer_args,
            trust_remote_code,
            bettertransformer: post.bettertransformer,
            device: post.device,
            settings,
            store,
            repository,
            artifact: None,
            model: None,
            tokenizer: None,
            adapter_resolver: AdapterResolver::new(),
        })
    }
}

pub struct ModelHandle<B: ModelBackend> {
    backend: B,
    spec: ModelSpec,
    tag: Tag,
    config: ModelConfig,
    capabilities: Capabilities,
    quantization_config: Option<QuantizationConfig>,
    adapters_mapping: Option<AdaptersMapping>,
    model_args: Attrs,
    tokenizer_args: Attrs,
    trust_remote_code: bool,
    bettertransformer: bool,
    device: Device,
    settings: Arc<RuntimeSettings>,
    store: Arc<dyn ArtifactStore>,
    repository: Arc<dyn ModelRepository>,
    artifact: Option<ArtifactRef>,
    model: Option<ModelSlot<B::Model>>,
    tokenizer: Option<Arc<B::Tokenizer>>,
    adapter_resolver: AdapterResolver,
}

impl<B: ModelBackend> ModelHandle<B> {
    pub fn from_pretrained(backend: B, settings: Arc<RuntimeSettings>) -> HandleBuilder<B> {
        HandleBuilder::new(backend, settings)
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn spec(&self) -> &ModelSpec {
        &self.spec
    }

    pub fn tag(&self) -> &Tag {
        &self.tag
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn quantization_config(&self) -> Option<&QuantizationConfig> {
        self.quantization_config.as_ref()
    }

    pub fn adapters_mapping(&self) -> Option<&AdaptersMapping> {
        self.adapters_mapping.as_ref()
    }

    pub fn model_args(&self) -> &Attrs {
        &self.model_args
    }

    pub fn tokenizer_args(&self) -> &Attrs {
        &self.tokenizer_args
    }

    pub fn trust_remote_code(&self) -> bool {
        self.trust_remote_code
    }

    pub fn bettertransformer(&self) -> bool {
        self.bettertransformer
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn state(&self) -> HandleState {
        match &self.model {
            None => HandleState::Constructed,
            Some(ModelSlot::Base(_)) => HandleState::ModelLoaded,
            Some(ModelSlot::Adapted(_)) => HandleState::Adapted,
        }
    }

    /// Labels recorded with an imported artifact.
    pub fn labels(&self) -> Labels {
        let mut labels = Labels::new();
        labels.insert("framework".into(), B::kind().as_str().into());
        labels.insert("backend".into(), B::NAME.into());
        labels.insert("model_name".into(), self.config.start_name.clone());
        labels.insert("model_id".into(), self.spec.model_id.clone());
        labels.insert(
            "serialisation_format".into(),
            self.spec.serialisation_format.as_str().into(),
        );
        if let Some(method) = self.spec.quantize_method {
            labels.insert("quantize".into(), method.as_str().into());
        }
        labels
    }

    /// Import the artifact into the local store. Call-time attrs win over
    /// the stored load arguments.
    pub async fn import_model(&self, call_attrs: Attrs) -> Result<ArtifactRef> {
        let (call_model, call_tokenizer) = normalize_attrs(call_attrs);
        let mut model_args = merge_layers(&[&self.model_args, &call_model]);
        let trust_remote_code = model_args
            .remove("trust_remote_code")
            .and_then(|v| v.as_bool())
            .unwrap_or(self.trust_remote_code);

        let ctx = ImportContext {
            tag: &self.tag,
            spec: &self.spec,
            model_args,
            tokenizer_args: merge_layers(&[&self.tokenizer_args, &call_tokenizer]),
            trust_remote_code,
            quantization_config: self.quantization_config.as_ref(),
            store: self.store.as_ref(),
            repository: self.repository.as_ref(),
            labels: self.labels(),
        };
        self.backend.import_model(ctx).await
    }

    /// Stored artifact for this tag, importing it on first miss.
    pub async fn artifact(&mut self) -> Result<ArtifactRef> {
        if let Some(artifact) = &self.artifact {
            return Ok(artifact.clone());
        }
        let artifact = match self.store.get(&self.tag).await {
            Ok(artifact) => artifact,
            Err(e) if e.is_not_found() => {
                info!("{} not in local store, importing", self.tag);
                self.import_model(Attrs::new()).await?
            }
            Err(e) => return Err(e),
        };
        self.artifact = Some(artifact.clone());
        Ok(artifact)
    }

    /// Resolve identity and materialise the artifact without loading weights.
    pub async fn ensure_model_id_exists(&mut self) -> Result<ArtifactRef> {
        self.artifact().await
    }

    pub async fn model(&mut self) -> Result<Arc<B::Model>> {
        self.load_model_with(Attrs::new()).await
    }

    /// First call loads the weights; later calls return the same model.
    pub async fn load_model_with(&mut self, call_attrs: Attrs) -> Result<Arc<B::Model>> {
        if let Some(slot) = &self.model {
            return Ok(slot.base().clone());
        }
        if self.config.requires_gpu && self.settings.device_count == 0 {
            return Err(HostError::unavailable(
                format!("{} ({})", self.tag, B::NAME),
                "a GPU, but none is available",
            ));
        }

        let artifact = self.artifact().await?;
        let (call_model, _) = normalize_attrs(call_attrs);
        let model_args = merge_layers(&[&self.model_args, &call_model]);
        let engine_args = if B::kind().is_engine() {
            Some(EngineArgs {
                model: artifact.path.clone(),
                tokenizer: self
                    .config
                    .tokenizer_id
                    .clone()
                    .unwrap_or_else(|| self.spec.model_id.clone()),
                tokenizer_mode: "auto".to_string(),
                tensor_parallel_size: self.settings.device_count.max(1),
                dtype: "auto".to_string(),
                trust_remote_code: self.trust_remote_code,
                quantization: self.spec.quantize_method.map(|m| m.as_str().to_string()),
            })
        } else {
            None
        };

        let ctx = LoadContext {
            artifact: &artifact,
            spec: &self.spec,
            config: &self.config,
            settings: &self.settings,
            model_args,
            quantization_config: self.quantization_config.as_ref(),
            trust_remote_code: self.trust_remote_code,
            device: self.device,
            bettertransformer: self.bettertransformer,
            engine_args,
        };
        let model = Arc::new(self.backend.load_model(ctx).await?);
        info!("✅ Loaded model {} from {}", self.tag, artifact.path.display());
        self.model = Some(ModelSlot::Base(model.clone()));
        Ok(model)
    }

    pub async fn tokenizer(&mut self) -> Result<Arc<B::Tokenizer>> {
        self.tokenizer_with(Attrs::new()).await
    }

    /// Loads independently of the model. Call-time args win over stored ones.
    pub async fn tokenizer_with(&mut self, call_attrs: Attrs) -> Result<Arc<B::Tokenizer>> {
        if let Some(tokenizer) = &self.tokenizer {
            return Ok(tokenizer.clone());
        }
        let artifact = self.artifact().await?;
        let ctx = TokenizerContext {
            artifact: &artifact,
            tokenizer_id: self.config.tokenizer_id.as_deref(),
            tokenizer_args: merge_layers(&[&self.tokenizer_args, &call_attrs]),
            trust_remote_code: self.trust_remote_code,
        };
        let tokenizer = Arc::new(self.backend.load_tokenizer(ctx).await?);
        debug!("Loaded tokenizer for {}", self.tag);
        self.tokenizer = Some(tokenizer.clone());
        Ok(tokenizer)
    }

    pub async fn save_pretrained(&self, dest: &Path) -> Result<()> {
        let model = self
            .model
            .as_ref()
            .map(|slot| slot.base().clone())
            .ok_or_else(|| HostError::ModelNotLoaded { tag: self.tag.to_string() })?;
        self.backend.save(&model, self.tokenizer.as_deref(), dest).await
    }

    pub fn sanitize_parameters(&self, prompt: &str, attrs: Attrs) -> Result<Sanitized> {
        self.backend.sanitize_parameters(prompt, attrs)
    }

    pub async fn generate(&mut self, prompt: &str, mut attrs: Attrs) -> Result<Value> {
        let model = self.inference_model().await?;
        if B::kind().is_engine() {
            let engine = B::as_engine(&model).ok_or_else(|| HostError::not_implemented(B::NAME, "as_engine"))?;
            let generation = self.config.generation.with_overrides(&mut attrs)?;
            let outputs = run_to_completion(engine, prompt, &SamplingParams::from(&generation)).await?;
            return serde_json::to_value(outputs).map_err(|e| HostError::backend(B::NAME, e.to_string()));
        }
        let tokenizer = self.tokenizer_if_supported().await?;
        let ctx = self.inference_context(model, tokenizer);
        self.backend.generate(ctx, prompt, attrs).await
    }

    pub async fn generate_one(&mut self, prompt: &str, stop: &[String], attrs: Attrs) -> Result<Vec<GeneratedText>> {
        self.require(self.capabilities.supports_generate_one(), "generate_one")?;
        let model = self.inference_model().await?;
        let tokenizer = self.tokenizer_if_supported().await?;
        let ctx = self.inference_context(model, tokenizer);
        self.backend.generate_one(ctx, prompt, stop, attrs).await
    }

    /// Lazy stream of partial results; the caller may start consuming before
    /// generation finishes.
    pub async fn generate_iterator(&mut self, prompt: &str, attrs: Attrs) -> Result<BoxStream<'static, Result<Value>>> {
        self.require(self.capabilities.supports_generate_iterator(), "generate_iterator")?;
        let model = self.inference_model().await?;
        let tokenizer = self.tokenizer_if_supported().await?;
        let ctx = self.inference_context(model, tokenizer);
        self.backend.generate_iterator(ctx, prompt, attrs).await
    }

    pub async fn embeddings(&mut self, prompts: &[String]) -> Result<Embeddings> {
        self.require(self.capabilities.supports_embeddings(), "embeddings")?;
        let model = self.inference_model().await?;
        let tokenizer = self.tokenizer_if_supported().await?;
        let ctx = self.inference_context(model, tokenizer);
        self.backend.embeddings(ctx, prompts).await
    }

    pub fn postprocess_generate(&self, prompt: &str, result: Value, attrs: Attrs) -> Result<Value> {
        if B::kind().is_engine() {
            return first_completion_text(&result);
        }
        self.backend.postprocess_generate(prompt, result, attrs)
    }

    /// sanitize -> generate -> postprocess
    pub async fn call(&mut self, prompt: &str, attrs: Attrs) -> Result<Value> {
        let Sanitized {
            prompt,
            generate_kwargs,
            postprocess_kwargs,
        } = self.sanitize_parameters(prompt, attrs)?;
        let raw = self.generate(&prompt, generate_kwargs).await?;
        self.postprocess_generate(&prompt, raw, postprocess_kwargs)
    }

    pub fn resolve_adapters(&mut self, inference_mode: bool, use_cache: bool) -> Result<ResolvedAdapterMapping> {
        self.adapter_resolver
            .resolve(self.adapters_mapping.as_ref(), &self.config, inference_mode, use_cache)
    }

    /// Wrap the loaded model with the family's default adapter and add the
    /// rest. Calling it again once the model is wrapped is a no-op.
    pub async fn apply_adapter(&mut self, options: ApplyAdapter) -> Result<&AdaptedModel<B::Model>> {
        let base = match &self.model {
            None => return Err(HostError::ModelNotLoaded { tag: self.tag.to_string() }),
            Some(ModelSlot::Adapted(_)) => return self.adapted_model(),
            Some(ModelSlot::Base(model)) => model.clone(),
        };
        if B::kind() != BackendKind::Pt {
            return Err(HostError::unavailable(
                format!("adapters on {}", B::NAME),
                "the pt backend kind",
            ));
        }

        let mut mapping = self.resolve_adapters(options.inference_mode, options.use_cache)?;
        let family = options.adapter_type;
        let mut by_name = mapping.remove(&family).ok_or_else(|| {
            let configured: Vec<&str> = self
                .adapters_mapping
                .iter()
                .flat_map(|m| m.keys())
                .map(|t| t.as_str())
                .collect();
            HostError::adapter(family.as_str(), format!("not configured; choose from {:?}", configured))
        })?;
        let default = by_name
            .remove(DEFAULT_ADAPTER_NAME)
            .ok_or_else(|| HostError::adapter(family.as_str(), "no unnamed adapter to use as 'default'"))?;

        let to_load: Vec<String> = match options.load_adapters {
            LoadAdapters::None => Vec::new(),
            LoadAdapters::All => by_name.keys().cloned().collect(),
            LoadAdapters::Only(names) => names,
        };
        // nothing reaches the backend until every requested name is known
        if let Some(unknown) = to_load
            .iter()
            .find(|name| name.as_str() != DEFAULT_ADAPTER_NAME && !by_name.contains_key(name.as_str()))
        {
            return Err(HostError::adapter(family.as_str(), format!("no adapter named '{}'", unknown)));
        }

        let mut adapted = AdaptedModel::wrap(base.clone(), family, &default);
        for (name, adapter) in &by_name {
            adapted.add_adapter(name, adapter);
        }
        if let Some(attached) = adapted.adapter(DEFAULT_ADAPTER_NAME).cloned() {
            self.backend
                .load_adapter_weights(&base, DEFAULT_ADAPTER_NAME, &attached)
                .await?;
        }
        for name in &to_load {
            let attached = adapted
                .adapter(name)
                .cloned()
                .ok_or_else(|| HostError::adapter(family.as_str(), format!("no adapter named '{}'", name)))?;
            if attached.weights_loaded {
                continue;
            }
            self.backend.load_adapter_weights(&base, name, &attached).await?;
            adapted.mark_loaded(name)?;
        }

        info!(
            "🔗 Applied {} adapter(s) [{}] to {}",
            family,
            adapted.adapters().keys().cloned().collect::<Vec<_>>().join(", "),
            self.tag
        );
        self.model = Some(ModelSlot::Adapted(adapted));
        self.adapted_model()
    }

    /// Compose the configured adapters onto a freshly loaded model, using the
    /// first configured family (lora when present) with every weight loaded.
    /// No-op without a mapping, before the model loads, or once wrapped.
    pub async fn ensure_adapters(&mut self) -> Result<()> {
        let family = match (&self.adapters_mapping, &self.model) {
            (Some(mapping), Some(ModelSlot::Base(_))) => match mapping.keys().next() {
                Some(family) => *family,
                None => return Ok(()),
            },
            _ => return Ok(()),
        };
        debug!("Composing {} adapters onto {} before first inference", family, self.tag);
        self.apply_adapter(ApplyAdapter {
            adapter_type: family,
            load_adapters: LoadAdapters::All,
            ..Default::default()
        })
        .await?;
        Ok(())
    }

    /// Switch the active adapter, loading its weights first if needed.
    pub async fn set_adapter(&mut self, name: &str) -> Result<()> {
        if self.adapters_mapping.is_none() {
            return Err(HostError::adapter(
                &self.config.start_name,
                "no adapters available for current running server",
            ));
        }
        let adapted = self
            .model
            .as_mut()
            .and_then(|slot| slot.adapted_mut())
            .ok_or_else(|| HostError::adapter(&self.config.start_name, "model is not adapter-wrapped"))?;
        let attached = adapted
            .adapter(name)
            .cloned()
            .ok_or_else(|| HostError::adapter(adapted.family().as_str(), format!("no adapter named '{}'", name)))?;
        let base = adapted.base().clone();

        if !attached.weights_loaded {
            self.backend.load_adapter_weights(&base, name, &attached).await?;
            adapted.mark_loaded(name)?;
        }
        self.backend.activate_adapter(&base, name).await?;
        adapted.set_active(name)?;
        info!("Successfully applied adapter layer {}", name);
        Ok(())
    }

    pub fn adapted_model(&self) -> Result<&AdaptedModel<B::Model>> {
        self.model
            .as_ref()
            .and_then(|slot| slot.adapted())
            .ok_or_else(|| HostError::adapter(&self.config.start_name, "model is not adapter-wrapped"))
    }

    pub fn active_adapter(&self) -> Option<&str> {
        self.model
            .as_ref()
            .and_then(|slot| slot.adapted())
            .map(|adapted| adapted.active())
    }

    /// Default fine-tune config for training a new adapter of `family`.
    pub fn training_adapter_config(&self, family: AdapterType, overrides: &Attrs) -> PeftConfig {
        self.config
            .default_strategy(family, false)
            .with_config(overrides)
            .to_peft_config()
    }

    pub fn peft_configs(&self) -> Option<BTreeMap<String, PeftConfig>> {
        self.adapted_model().ok().map(|adapted| adapted.peft_configs())
    }

    async fn inference_model(&mut self) -> Result<Arc<B::Model>> {
        let model = self.model().await?;
        self.ensure_adapters().await?;
        Ok(model)
    }

    fn require(&self, supported: bool, capability: &'static str) -> Result<()> {
        if supported {
            Ok(())
        } else {
            Err(HostError::not_implemented(B::NAME, capability))
        }
    }

    async fn tokenizer_if_supported(&mut self) -> Result<Option<Arc<B::Tokenizer>>> {
        if self.capabilities.load_tokenizer {
            Ok(Some(self.tokenizer().await?))
        } else {
            Ok(self.tokenizer.clone())
        }
    }

    fn inference_context(&self, model: Arc<B::Model>, tokenizer: Option<Arc<B::Tokenizer>>) -> InferenceContext<'_, B> {
        InferenceContext {
            model,
            tokenizer,
            config: &self.config,
            spec: &self.spec,
            device: self.device,
            active_adapter: self.active_adapter(),
        }
    }
}
