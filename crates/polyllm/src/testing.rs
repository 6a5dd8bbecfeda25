//! Fakes shared by the unit tests.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{json, Value};
use std::collections::{BTreeMap, VecDeque};
use futures::stream::BoxStream;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::sync::mpsc;

use crate::adapters::AttachedAdapter;
use crate::config::RuntimeSettings;
use crate::error::{HostError, Result};
use crate::model_config::ModelConfig;
use crate::model_runtime::{
    Capabilities, Capability, CompletionOutput, Embeddings, InferenceContext, InferenceEngine, LoadContext,
    ModelBackend, ModelHandle, RequestOutput, SamplingParams,
};
use crate::options::LoadOptions;
use crate::store::{LocalModelStore, ModelRepository, RepoInfo, RepoSibling};
use crate::Attrs;

pub struct FakeRepository {
    sha: Option<String>,
    files: DashMap<(String, String), Vec<u8>>,
    info_calls: AtomicUsize,
    fail: AtomicBool,
}

impl FakeRepository {
    pub fn new(sha: &str) -> Self {
        Self {
            sha: Some(sha.to_string()),
            files: DashMap::new(),
            info_calls: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
        }
    }

    pub fn without_sha() -> Self {
        Self {
            sha: None,
            ..Self::new("")
        }
    }

    pub fn add_file(&self, model_id: &str, filename: &str, content: impl Into<Vec<u8>>) {
        self.files
            .insert((model_id.to_string(), filename.to_string()), content.into());
    }

    pub fn fail_info(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn info_calls(&self) -> usize {
        self.info_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModelRepository for FakeRepository {
    async fn model_info(&self, model_id: &str, _revision: &str) -> Result<RepoInfo> {
        self.info_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(HostError::repository(model_id, "connection refused"));
        }
        let siblings = self
            .files
            .iter()
            .filter(|entry| entry.key().0 == model_id)
            .map(|entry| RepoSibling {
                filename: entry.key().1.clone(),
            })
            .collect();
        Ok(RepoInfo {
            sha: self.sha.clone(),
            siblings,
        })
    }

    async fn fetch_file(&self, model_id: &str, _revision: &str, filename: &str) -> Result<Vec<u8>> {
        self.files
            .get(&(model_id.to_string(), filename.to_string()))
            .map(|entry| entry.value().clone())
            .ok_or_else(|| HostError::not_found(format!("'{}' in '{}'", filename, model_id)))
    }
}

#[derive(Debug)]
pub struct DemoModel {
    pub path: PathBuf,
}

/// Counters shared between a [`DemoBackend`] and the test holding it.
#[derive(Clone, Default)]
pub struct CallLog {
    loads: Arc<AtomicUsize>,
    activations: Arc<Mutex<Vec<String>>>,
    weight_loads: Arc<Mutex<Vec<String>>>,
}

impl CallLog {
    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn activations(&self) -> Vec<String> {
        self.activations.lock().map(|v| v.clone()).unwrap_or_default()
    }

    pub fn weight_loads(&self) -> Vec<String> {
        self.weight_loads.lock().map(|v| v.clone()).unwrap_or_default()
    }
}

/// Framework backend overriding only `load_model` and `generate`.
pub struct DemoBackend {
    config: ModelConfig,
    calls: CallLog,
}

impl DemoBackend {
    pub fn new() -> Self {
        Self::with_config(ModelConfig::new("demo", "demo-model"))
    }

    pub fn with_config(config: ModelConfig) -> Self {
        Self {
            config,
            calls: CallLog::default(),
        }
    }

    pub fn calls(&self) -> CallLog {
        self.calls.clone()
    }
}

#[async_trait]
impl ModelBackend for DemoBackend {
    type Model = DemoModel;
    type Tokenizer = ();

    const NAME: &'static str = "DemoLM";
    const CAPABILITIES: Capabilities = Capabilities::BASE
        .with(Capability::LoadModel)
        .with(Capability::Generate);

    fn model_config(&self) -> ModelConfig {
        self.config.clone()
    }

    async fn load_model(&self, ctx: LoadContext<'_>) -> Result<DemoModel> {
        self.calls.loads.fetch_add(1, Ordering::SeqCst);
        Ok(DemoModel {
            path: ctx.artifact.path.clone(),
        })
    }

    async fn save(&self, model: &DemoModel, _tokenizer: Option<&()>, dest: &Path) -> Result<()> {
        std::fs::create_dir_all(dest).map_err(|e| HostError::io(dest, e))?;
        let target = dest.join("weights.txt");
        std::fs::write(&target, model.path.display().to_string()).map_err(|e| HostError::io(&target, e))
    }

    async fn generate(&self, ctx: InferenceContext<'_, Self>, prompt: &str, _attrs: Attrs) -> Result<Value> {
        Ok(json!({
            "text": format!("{} world", prompt),
            "adapter": ctx.active_adapter,
        }))
    }

    async fn load_adapter_weights(&self, _model: &DemoModel, name: &str, _adapter: &AttachedAdapter) -> Result<()> {
        if let Ok(mut loads) = self.calls.weight_loads.lock() {
            loads.push(name.to_string());
        }
        Ok(())
    }

    async fn activate_adapter(&self, _model: &DemoModel, name: &str) -> Result<()> {
        if let Ok(mut activations) = self.calls.activations.lock() {
            activations.push(name.to_string());
        }
        Ok(())
    }
}

pub struct EmbeddingBackend;

#[async_trait]
impl ModelBackend for EmbeddingBackend {
    type Model = ();
    type Tokenizer = ();

    const NAME: &'static str = "DemoEmbedder";
    const CAPABILITIES: Capabilities = Capabilities::BASE
        .with(Capability::LoadModel)
        .with(Capability::Embeddings);

    fn model_config(&self) -> ModelConfig {
        ModelConfig::new("embedder", "demo-embedder")
    }

    async fn load_model(&self, _ctx: LoadContext<'_>) -> Result<()> {
        Ok(())
    }

    async fn embeddings(&self, _ctx: InferenceContext<'_, Self>, prompts: &[String]) -> Result<Embeddings> {
        Ok(Embeddings {
            embeddings: prompts.iter().map(|p| vec![p.len() as f32]).collect(),
            num_tokens: prompts.len(),
        })
    }
}

/// Streams whatever the test pushes into the feed, ending when the sender
/// is dropped.
pub struct StreamingBackend {
    feed: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
}

impl StreamingBackend {
    pub fn new() -> (Self, mpsc::UnboundedSender<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { feed: Mutex::new(Some(rx)) }, tx)
    }
}

#[async_trait]
impl ModelBackend for StreamingBackend {
    type Model = ();
    type Tokenizer = ();

    const NAME: &'static str = "StreamingLM";
    const CAPABILITIES: Capabilities = Capabilities::BASE
        .with(Capability::LoadModel)
        .with(Capability::GenerateIterator);

    fn model_config(&self) -> ModelConfig {
        ModelConfig::new("stream", "demo-stream")
    }

    async fn load_model(&self, _ctx: LoadContext<'_>) -> Result<()> {
        Ok(())
    }

    async fn generate_iterator(
        &self,
        _ctx: InferenceContext<'_, Self>,
        prompt: &str,
        _attrs: Attrs,
    ) -> Result<BoxStream<'static, Result<Value>>> {
        let mut feed = self
            .feed
            .lock()
            .map_err(|_| HostError::backend(Self::NAME, "poisoned"))?
            .take()
            .ok_or_else(|| HostError::backend(Self::NAME, "feed already consumed"))?;
        let prompt = prompt.to_string();
        let stream = async_stream::stream! {
            while let Some(chunk) = feed.recv().await {
                yield Ok::<Value, HostError>(json!({ "text": format!("{}{}", prompt, chunk) }));
            }
        };
        Ok(Box::pin(stream))
    }
}

struct ScriptedRequest {
    prompt: String,
    remaining: VecDeque<String>,
}

/// Engine that emits one scripted chunk per step for every request.
pub struct ScriptedEngine {
    script: Vec<String>,
    requests: Mutex<BTreeMap<String, ScriptedRequest>>,
    steps: AtomicUsize,
    drop_requests: bool,
}

impl ScriptedEngine {
    pub fn new(script: Vec<&str>) -> Self {
        Self {
            script: script.into_iter().map(str::to_string).collect(),
            requests: Mutex::new(BTreeMap::new()),
            steps: AtomicUsize::new(0),
            drop_requests: false,
        }
    }

    /// Accepts requests but never schedules them.
    pub fn dropping_requests() -> Self {
        Self {
            drop_requests: true,
            ..Self::new(vec!["never"])
        }
    }

    pub fn add_foreign_request(&self, request_id: &str) {
        let params = SamplingParams::from(&crate::model_config::GenerationConfig::default());
        let _ = self.add_request(request_id, "foreign", &params);
    }

    pub fn steps(&self) -> usize {
        self.steps.load(Ordering::SeqCst)
    }
}

impl InferenceEngine for ScriptedEngine {
    fn add_request(&self, request_id: &str, prompt: &str, _params: &SamplingParams) -> Result<()> {
        if self.drop_requests {
            return Ok(());
        }
        let mut requests = self
            .requests
            .lock()
            .map_err(|_| HostError::backend("scripted", "poisoned"))?;
        requests.insert(
            request_id.to_string(),
            ScriptedRequest {
                prompt: prompt.to_string(),
                remaining: self.script.iter().cloned().collect(),
            },
        );
        Ok(())
    }

    fn has_unfinished_requests(&self) -> bool {
        self.requests.lock().map(|r| !r.is_empty()).unwrap_or(false)
    }

    fn step(&self) -> Result<Vec<RequestOutput>> {
        self.steps.fetch_add(1, Ordering::SeqCst);
        let mut requests = self
            .requests
            .lock()
            .map_err(|_| HostError::backend("scripted", "poisoned"))?;
        let mut outputs = Vec::new();
        let mut done = Vec::new();
        for (id, request) in requests.iter_mut() {
            let chunk = request.remaining.pop_front().unwrap_or_default();
            let finished = request.remaining.is_empty();
            outputs.push(RequestOutput {
                request_id: id.clone(),
                prompt: request.prompt.clone(),
                outputs: vec![CompletionOutput {
                    index: 0,
                    text: format!("{} {}", request.prompt, chunk),
                    token_ids: Vec::new(),
                    finish_reason: finished.then(|| "stop".to_string()),
                }],
                finished,
            });
            if finished {
                done.push(id.clone());
            }
        }
        for id in done {
            requests.remove(&id);
        }
        Ok(outputs)
    }
}

/// Engine-kind backend driving a [`ScriptedEngine`].
pub struct VLLMDemo;

#[async_trait]
impl ModelBackend for VLLMDemo {
    type Model = ScriptedEngine;
    type Tokenizer = ();

    const NAME: &'static str = "VLLMDemo";
    const CAPABILITIES: Capabilities = Capabilities::BASE.with(Capability::LoadModel);

    fn model_config(&self) -> ModelConfig {
        ModelConfig::new("demo", "demo-model")
    }

    async fn load_model(&self, ctx: LoadContext<'_>) -> Result<ScriptedEngine> {
        if ctx.engine_args.is_none() {
            return Err(HostError::backend(Self::NAME, "engine args missing"));
        }
        Ok(ScriptedEngine::new(vec!["thinking", "done"]))
    }

    fn as_engine(model: &ScriptedEngine) -> Option<&dyn InferenceEngine> {
        Some(model)
    }
}

pub async fn demo_handle_with<B: ModelBackend>(
    backend: B,
    settings: RuntimeSettings,
    options: LoadOptions,
    repository: FakeRepository,
) -> (TempDir, ModelHandle<B>, CallLog)
where
    B: HasCallLog,
{
    let dir = TempDir::new().unwrap();
    let calls = backend.call_log_handle();
    let settings = RuntimeSettings {
        store_root: dir.path().join("store"),
        ..settings
    };
    let handle = ModelHandle::from_pretrained(backend, Arc::new(settings))
        .options(options)
        .repository(Arc::new(repository))
        .store(Arc::new(LocalModelStore::new(dir.path().join("store"))))
        .build()
        .await
        .unwrap();
    (dir, handle, calls)
}

pub async fn demo_handle(options: LoadOptions, repository: FakeRepository) -> (TempDir, ModelHandle<DemoBackend>, CallLog) {
    demo_handle_with(DemoBackend::new(), RuntimeSettings::default(), options, repository).await
}

/// Backends that expose a call log to tests.
pub trait HasCallLog {
    fn call_log_handle(&self) -> CallLog;
}

impl HasCallLog for DemoBackend {
    fn call_log_handle(&self) -> CallLog {
        self.calls()
    }
}

impl HasCallLog for VLLMDemo {
    fn call_log_handle(&self) -> CallLog {
        CallLog::default()
    }
}

impl HasCallLog for EmbeddingBackend {
    fn call_log_handle(&self) -> CallLog {
        CallLog::default()
    }
}

impl HasCallLog for StreamingBackend {
    fn call_log_handle(&self) -> CallLog {
        CallLog::default()
    }
}
