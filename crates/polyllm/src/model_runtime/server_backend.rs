//! llama-server backend
//!
//! Serves GGUF artifacts through an OpenAI-compatible llama.cpp server. With
//! `POLYLLM_SERVER_BIN` set the backend spawns the server on the artifact's
//! weight file; otherwise it attaches to a server already listening on the
//! configured host and port.

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, Command, Stdio};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::backend::{
    Capabilities, Capability, Device, Embeddings, GeneratedText, InferenceContext, LoadContext, ModelBackend,
    Sanitized,
};
use crate::error::{HostError, Result};
use crate::model_config::ModelConfig;
use crate::Attrs;

const HEALTH_ATTEMPTS: u32 = 30;
const HEALTH_INTERVAL: Duration = Duration::from_secs(2);
const DEFAULT_CONTEXT_SIZE: u64 = 4096;

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
    #[serde(default)]
    usage: Option<EmbeddingUsage>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingUsage {
    #[serde(default)]
    prompt_tokens: usize,
}

/// A running (or attached) llama-server.
pub struct ServerProcess {
    base_url: String,
    http_client: reqwest::Client,
    child: Option<Child>,
}

impl ServerProcess {
    fn client(timeout: Duration) -> Result<reqwest::Client> {
        reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| HostError::backend(LlamaServer::NAME, e.to_string()))
    }

    /// Attach to a server that is already up.
    pub async fn connect(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let process = Self {
            base_url: base_url.into(),
            http_client: Self::client(timeout)?,
            child: None,
        };
        if !process.is_ready().await {
            return Err(HostError::backend(
                LlamaServer::NAME,
                format!("no healthy server at {}", process.base_url),
            ));
        }
        info!("Attached to llama-server at {}", process.base_url);
        Ok(process)
    }

    pub async fn spawn(binary: &Path, weights: &Path, host: &str, port: u16, args: &[String], timeout: Duration) -> Result<Self> {
        if !binary.exists() {
            return Err(HostError::unavailable(
                LlamaServer::NAME,
                format!("the llama-server binary at {}", binary.display()),
            ));
        }
        info!("Starting llama-server for {}", weights.display());
        info!("  Binary: {}", binary.display());
        info!("  Port: {}", port);

        let mut cmd = Command::new(binary);
        cmd.arg("--model")
            .arg(weights)
            .arg("--host")
            .arg(host)
            .arg("--port")
            .arg(port.to_string())
            .args(args)
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        let mut child = cmd
            .spawn()
            .map_err(|e| HostError::backend(LlamaServer::NAME, format!("failed to spawn llama-server: {}", e)))?;
        if let Some(stderr) = child.stderr.take() {
            forward_stderr(stderr);
        }

        let process = Self {
            base_url: format!("http://{}:{}", host, port),
            http_client: Self::client(timeout)?,
            child: Some(child),
        };

        for attempt in 1..=HEALTH_ATTEMPTS {
            sleep(HEALTH_INTERVAL).await;
            if process.is_ready().await {
                info!("✅ llama-server ready after {} seconds", attempt * HEALTH_INTERVAL.as_secs() as u32);
                return Ok(process);
            }
            if attempt % 5 == 0 {
                info!("Still waiting for llama-server... ({}/{})", attempt, HEALTH_ATTEMPTS);
            }
        }
        Err(HostError::backend(
            LlamaServer::NAME,
            format!("llama-server failed to become healthy at {}", process.base_url),
        ))
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn is_ready(&self) -> bool {
        match self.http_client.get(format!("{}/health", self.base_url)).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    async fn post(&self, path: &str, body: &Value) -> Result<reqwest::Response> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .http_client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| HostError::backend(LlamaServer::NAME, format!("request to {} failed: {}", url, e)))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(HostError::backend(LlamaServer::NAME, format!("{} returned {}: {}", url, status, body)));
        }
        Ok(resp)
    }

    pub async fn complete(&self, body: &Value) -> Result<Value> {
        self.post("/v1/completions", body)
            .await?
            .json()
            .await
            .map_err(|e| HostError::backend(LlamaServer::NAME, format!("failed to parse completion: {}", e)))
    }

    /// Server-sent completion chunks, one `{"text": ..}` per event.
    pub async fn stream(&self, body: &Value) -> Result<BoxStream<'static, Result<Value>>> {
        let byte_stream = self.post("/v1/completions", body).await?.bytes_stream();

        let sse_stream = async_stream::try_stream! {
            let mut buffer: Vec<u8> = Vec::new();
            futures::pin_mut!(byte_stream);

            while let Some(chunk) = byte_stream.next().await {
                let chunk = chunk.map_err(|e| HostError::backend(LlamaServer::NAME, format!("stream read error: {}", e)))?;
                buffer.extend_from_slice(&chunk);

                for line in drain_lines(&mut buffer) {
                    let data = match line.strip_prefix("data: ") {
                        Some(data) => data,
                        None => continue,
                    };
                    if data == "[DONE]" {
                        return;
                    }
                    let event: CompletionResponse = serde_json::from_str(data)
                        .map_err(|e| HostError::backend(LlamaServer::NAME, format!("bad stream event: {}", e)))?;
                    let text = event.choices.into_iter().next().map(|c| c.text).unwrap_or_default();
                    yield json!({ "text": text });
                }
            }
        };
        Ok(Box::pin(sse_stream))
    }

    pub async fn embed(&self, inputs: &[String]) -> Result<Embeddings> {
        debug!("Generating embeddings for {} text(s) via llama-server", inputs.len());
        let body = json!({ "model": "local-llm", "input": inputs });
        let response: EmbeddingResponse = self
            .post("/v1/embeddings", &body)
            .await?
            .json()
            .await
            .map_err(|e| HostError::backend(LlamaServer::NAME, format!("failed to parse embeddings: {}", e)))?;
        Ok(Embeddings {
            num_tokens: response.usage.map(|u| u.prompt_tokens).unwrap_or(0),
            embeddings: response.data.into_iter().map(|d| d.embedding).collect(),
        })
    }
}

/// Split complete lines off the front of `buffer`. Bytes after the last
/// newline stay buffered, so a multi-byte character split across network
/// chunks is decoded only once it is whole.
fn drain_lines(buffer: &mut Vec<u8>) -> Vec<String> {
    let mut lines = Vec::new();
    while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
        let line: Vec<u8> = buffer.drain(..=pos).collect();
        lines.push(String::from_utf8_lossy(&line).trim().to_string());
    }
    lines
}

/// Relay the server's stderr into the log so the pipe never fills up.
fn forward_stderr(stderr: ChildStderr) {
    let spawned = std::thread::Builder::new()
        .name("llama-server-stderr".into())
        .spawn(move || {
            for line in BufReader::new(stderr).lines() {
                match line {
                    Ok(line) => debug!("llama-server: {}", line),
                    Err(_) => break,
                }
            }
        });
    if let Err(e) = spawned {
        warn!("Failed to start llama-server log reader: {}", e);
    }
}

impl Drop for ServerProcess {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            match child.kill() {
                Ok(_) => {
                    let _ = child.wait();
                    info!("llama-server process stopped");
                }
                Err(e) => warn!("Failed to kill llama-server process: {}", e),
            }
        }
    }
}

pub struct LlamaServer {
    config: ModelConfig,
}

impl LlamaServer {
    pub fn new(config: ModelConfig) -> Self {
        Self { config }
    }

    fn request_body(&self, prompt: &str, mut attrs: Attrs, stream: bool) -> Result<Value> {
        let generation = self.config.generation.with_overrides(&mut attrs)?;
        let mut body = json!({
            "model": "local-llm",
            "prompt": prompt,
            "max_tokens": generation.max_new_tokens,
            "temperature": generation.temperature,
            "top_p": generation.top_p,
            "top_k": generation.top_k,
            "stop": generation.stop,
            "stream": stream,
        });
        if let Value::Object(map) = &mut body {
            for (k, v) in attrs {
                map.insert(k, v);
            }
        }
        Ok(body)
    }
}

impl Default for LlamaServer {
    fn default() -> Self {
        Self::new(ModelConfig::new("llama", "TheBloke/Llama-2-7B-Chat-GGUF"))
    }
}

/// First `.gguf` file under `dir`, breadth first.
async fn find_weights(dir: &Path) -> Result<PathBuf> {
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&current).await.map_err(|e| HostError::io(&current, e))?;
        let mut nested = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| HostError::io(&current, e))? {
            let path = entry.path();
            if path.is_dir() {
                nested.push(path);
            } else if path.extension().map_or(false, |ext| ext.eq_ignore_ascii_case("gguf")) {
                return Ok(path);
            }
        }
        pending.splice(0..0, nested);
    }
    Err(HostError::not_found(format!("a .gguf weight file under {}", dir.display())))
}

#[async_trait]
impl ModelBackend for LlamaServer {
    type Model = ServerProcess;
    type Tokenizer = ();

    const NAME: &'static str = "LlamaServer";
    const CAPABILITIES: Capabilities = Capabilities::BASE
        .with(Capability::LoadModel)
        .with(Capability::SanitizeParameters)
        .with(Capability::Generate)
        .with(Capability::GenerateOne)
        .with(Capability::GenerateIterator)
        .with(Capability::Embeddings)
        .with(Capability::PostprocessGenerate);

    fn model_config(&self) -> ModelConfig {
        self.config.clone()
    }

    async fn load_model(&self, ctx: LoadContext<'_>) -> Result<ServerProcess> {
        let settings = ctx.settings;
        let timeout = Duration::from_secs(settings.request_timeout_seconds);
        let Some(binary) = &settings.server_binary else {
            let url = format!("http://{}:{}", settings.server_host, settings.server_port);
            return ServerProcess::connect(url, timeout).await;
        };

        let weights = find_weights(&ctx.artifact.path).await?;
        let context_size = ctx
            .model_args
            .get("n_ctx")
            .and_then(|v| v.as_u64())
            .unwrap_or(DEFAULT_CONTEXT_SIZE);
        let gpu_layers = match ctx.device {
            Device::Cuda => 99,
            Device::Cpu => 0,
        };
        let args = vec![
            "--ctx-size".to_string(),
            context_size.to_string(),
            "--n-gpu-layers".to_string(),
            gpu_layers.to_string(),
            "--embedding".to_string(),
        ];
        ServerProcess::spawn(binary, &weights, &settings.server_host, settings.server_port, &args, timeout).await
    }

    fn sanitize_parameters(&self, prompt: &str, mut attrs: Attrs) -> Result<Sanitized> {
        let generation = self.config.generation.with_overrides(&mut attrs)?;
        let mut generate_kwargs = Attrs::new();
        generate_kwargs.insert("max_tokens".into(), json!(generation.max_new_tokens));
        generate_kwargs.insert("temperature".into(), json!(generation.temperature));
        generate_kwargs.insert("top_p".into(), json!(generation.top_p));
        generate_kwargs.insert("top_k".into(), json!(generation.top_k));
        generate_kwargs.insert("stop".into(), json!(generation.stop));
        generate_kwargs.extend(attrs);
        Ok(Sanitized {
            prompt: prompt.to_string(),
            generate_kwargs,
            postprocess_kwargs: Attrs::new(),
        })
    }

    async fn generate(&self, ctx: InferenceContext<'_, Self>, prompt: &str, attrs: Attrs) -> Result<Value> {
        let body = self.request_body(prompt, attrs, false)?;
        ctx.model.complete(&body).await
    }

    async fn generate_one(
        &self,
        ctx: InferenceContext<'_, Self>,
        prompt: &str,
        stop: &[String],
        mut attrs: Attrs,
    ) -> Result<Vec<GeneratedText>> {
        let mut stops = self.config.generation.with_overrides(&mut attrs)?.stop;
        stops.extend(stop.iter().cloned());
        attrs.insert("stop".into(), json!(stops));
        let body = self.request_body(prompt, attrs, false)?;
        let response: CompletionResponse = serde_json::from_value(ctx.model.complete(&body).await?)
            .map_err(|e| HostError::backend(Self::NAME, format!("unexpected completion shape: {}", e)))?;
        Ok(response
            .choices
            .into_iter()
            .take(1)
            .map(|c| GeneratedText { generated_text: c.text })
            .collect())
    }

    async fn generate_iterator(
        &self,
        ctx: InferenceContext<'_, Self>,
        prompt: &str,
        attrs: Attrs,
    ) -> Result<BoxStream<'static, Result<Value>>> {
        let body = self.request_body(prompt, attrs, true)?;
        ctx.model.stream(&body).await
    }

    async fn embeddings(&self, ctx: InferenceContext<'_, Self>, prompts: &[String]) -> Result<Embeddings> {
        ctx.model.embed(prompts).await
    }

    fn postprocess_generate(&self, _prompt: &str, result: Value, _attrs: Attrs) -> Result<Value> {
        result["choices"][0]["text"]
            .as_str()
            .map(|text| Value::String(text.to_string()))
            .ok_or_else(|| HostError::backend(Self::NAME, "completion has no choices"))
    }
}
