// polyllm/crates/polyllm/src/lib.rs

pub mod adapters;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod identity;
pub mod model_config;
pub mod model_runtime;
pub mod options;
pub mod store;
pub mod telemetry;

#[cfg(test)]
pub(crate) mod testing;

/// Free-form keyword arguments passed through the loaders and generators.
pub type Attrs = serde_json::Map<String, serde_json::Value>;

// Public API exports
pub use config::{ModelEnvDefaults, RuntimeSettings};
pub use dispatch::{DispatchUnit, MethodSignature, PeftAdapterOutput};
pub use error::{HostError, Result};
pub use identity::{Tag, TagResolver};
pub use model_config::{GenerationConfig, ModelConfig};
pub use model_runtime::{
    ApplyAdapter, BackendKind, Capabilities, Capability, HandleBuilder, HandleState, LlamaServer, LoadAdapters,
    ModelBackend, ModelHandle, ModelSpec,
};
pub use options::{LoadOptions, QuantizationConfig, QuantizeMethod, SerialisationFormat};
pub use store::{ArtifactStore, HubClient, LocalModelStore, ModelRepository};
