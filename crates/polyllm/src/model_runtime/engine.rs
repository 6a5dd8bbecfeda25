//! High-throughput engine support
//!
//! Engine backends schedule requests internally. `generate` submits one
//! request and polls `step()` until that request reports finished.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use tracing::debug;
use uuid::Uuid;

use crate::error::{HostError, Result};
use crate::model_config::GenerationConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    pub n: u32,
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
    #[serde(default)]
    pub stop: Vec<String>,
}

impl From<&GenerationConfig> for SamplingParams {
    fn from(config: &GenerationConfig) -> Self {
        Self {
            n: 1,
            max_tokens: config.max_new_tokens,
            temperature: config.temperature,
            top_p: config.top_p,
            top_k: config.top_k,
            stop: config.stop.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionOutput {
    pub index: usize,
    pub text: String,
    #[serde(default)]
    pub token_ids: Vec<u32>,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestOutput {
    pub request_id: String,
    pub prompt: String,
    pub outputs: Vec<CompletionOutput>,
    pub finished: bool,
}

/// Arguments the handle passes to an engine loader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineArgs {
    pub model: PathBuf,
    pub tokenizer: String,
    pub tokenizer_mode: String,
    pub tensor_parallel_size: usize,
    pub dtype: String,
    pub trust_remote_code: bool,
    pub quantization: Option<String>,
}

pub trait InferenceEngine: Send + Sync {
    fn add_request(&self, request_id: &str, prompt: &str, params: &SamplingParams) -> Result<()>;

    fn has_unfinished_requests(&self) -> bool;

    /// Advance the scheduler one iteration
    fn step(&self) -> Result<Vec<RequestOutput>>;
}

pub async fn run_to_completion(
    engine: &dyn InferenceEngine,
    prompt: &str,
    params: &SamplingParams,
) -> Result<Vec<RequestOutput>> {
    let request_id = Uuid::new_v4().simple().to_string();
    engine.add_request(&request_id, prompt, params)?;

    let mut finished = Vec::new();
    let mut steps = 0usize;
    while finished.is_empty() && engine.has_unfinished_requests() {
        steps += 1;
        finished.extend(
            engine
                .step()?
                .into_iter()
                .filter(|output| output.finished && output.request_id == request_id),
        );
        tokio::task::yield_now().await;
    }
    debug!("Request {} finished after {} step(s)", request_id, steps);

    if finished.is_empty() {
        return Err(HostError::backend(
            "engine",
            format!("scheduler drained before request {} finished", request_id),
        ));
    }
    Ok(finished)
}

/// Text of the first completion of the first finished request.
pub fn first_completion_text(result: &Value) -> Result<Value> {
    result[0]["outputs"][0]["text"]
        .as_str()
        .map(|text| Value::String(text.to_string()))
        .ok_or_else(|| HostError::backend("engine", "generation result has no completion text"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedEngine;

    #[tokio::test]
    async fn test_polls_until_own_request_finishes() {
        let engine = ScriptedEngine::new(vec!["partial", "done"]);
        engine.add_foreign_request("other");

        let outputs = run_to_completion(&engine, "hello", &SamplingParams::from(&GenerationConfig::default()))
            .await
            .unwrap();
        assert_eq!(outputs.len(), 1);
        assert!(outputs[0].finished);
        assert_eq!(outputs[0].outputs[0].text, "hello done");
        assert_eq!(engine.steps(), 2);
    }

    #[tokio::test]
    async fn test_drained_engine_is_an_error() {
        let engine = ScriptedEngine::dropping_requests();
        let err = run_to_completion(&engine, "hello", &SamplingParams::from(&GenerationConfig::default()))
            .await
            .unwrap_err();
        assert!(matches!(err, HostError::Backend { .. }));
    }

    #[test]
    fn test_first_completion_text() {
        let result = serde_json::json!([{"outputs": [{"text": "a"}, {"text": "b"}]}]);
        assert_eq!(first_completion_text(&result).unwrap(), Value::String("a".into()));
        assert!(first_completion_text(&serde_json::json!([])).is_err());
    }
}
