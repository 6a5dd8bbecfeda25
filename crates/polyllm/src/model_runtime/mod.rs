//! Model runtime: the backend contract, the lazily materialised model
//! handle and the concrete backends shipped with the crate.

pub mod backend;
pub mod engine;
pub mod handle;
pub mod server_backend;

pub use backend::{
    default_import, effective_capabilities, register, BackendKind, Capabilities, Capability, Device,
    Embeddings, GeneratedText, ImportContext, InferenceContext, LoadContext, ModelBackend, PostInit, Sanitized,
    TokenizerContext,
};
pub use engine::{
    first_completion_text, run_to_completion, CompletionOutput, EngineArgs, InferenceEngine, RequestOutput,
    SamplingParams,
};
pub use handle::{ApplyAdapter, HandleBuilder, HandleState, LoadAdapters, ModelHandle, ModelSpec};
pub use server_backend::{LlamaServer, ServerProcess};
