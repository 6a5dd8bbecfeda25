//! Adapter (parameter-efficient fine-tuning) resolution and composition

pub mod composed;
pub mod resolver;
pub mod spec;
pub mod strategy;

pub use composed::{AdaptedModel, AttachOrigin, AttachedAdapter, ModelSlot};
pub use resolver::{AdapterResolver, ResolvedAdapter, ResolvedAdapterMapping, DEFAULT_ADAPTER_NAME};
pub use spec::{resolve_peft_config_type, AdapterMap, AdapterSpec, AdapterType, AdaptersMapping, PEFT_CONFIG_NAME};
pub use strategy::{FineTuneConfig, PeftConfig};
