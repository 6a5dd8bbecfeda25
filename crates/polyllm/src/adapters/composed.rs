//! Adapter composition onto a loaded base model

use std::collections::BTreeMap;
use std::sync::Arc;

use super::resolver::{ResolvedAdapter, DEFAULT_ADAPTER_NAME};
use super::spec::AdapterType;
use super::strategy::PeftConfig;
use crate::error::{HostError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachOrigin {
    /// The default adapter that wrapped the base model
    Wrapped,
    /// Added onto the wrapped model afterwards
    Added,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AttachedAdapter {
    pub config: PeftConfig,
    pub source: String,
    pub origin: AttachOrigin,
    pub weights_loaded: bool,
}

/// Base model plus the adapter layers attached to it.
#[derive(Debug)]
pub struct AdaptedModel<M> {
    base: Arc<M>,
    family: AdapterType,
    adapters: BTreeMap<String, AttachedAdapter>,
    active: String,
}

impl<M> AdaptedModel<M> {
    /// Wrap the base model with the family's default adapter. Weights of the
    /// default adapter count as loaded.
    pub fn wrap(base: Arc<M>, family: AdapterType, default: &ResolvedAdapter) -> Self {
        let mut adapters = BTreeMap::new();
        adapters.insert(
            DEFAULT_ADAPTER_NAME.to_string(),
            AttachedAdapter {
                config: default.config.clone(),
                source: default.source.clone(),
                origin: AttachOrigin::Wrapped,
                weights_loaded: true,
            },
        );
        Self {
            base,
            family,
            adapters,
            active: DEFAULT_ADAPTER_NAME.to_string(),
        }
    }

    /// Attach structure only; weights load later.
    pub fn add_adapter(&mut self, name: &str, adapter: &ResolvedAdapter) {
        self.adapters.insert(
            name.to_string(),
            AttachedAdapter {
                config: adapter.config.clone(),
                source: adapter.source.clone(),
                origin: AttachOrigin::Added,
                weights_loaded: false,
            },
        );
    }

    pub fn mark_loaded(&mut self, name: &str) -> Result<()> {
        let adapter = self.adapter_mut(name)?;
        adapter.weights_loaded = true;
        Ok(())
    }

    pub fn set_active(&mut self, name: &str) -> Result<()> {
        self.adapter_mut(name)?;
        self.active = name.to_string();
        Ok(())
    }

    pub fn base(&self) -> &Arc<M> {
        &self.base
    }

    pub fn family(&self) -> AdapterType {
        self.family
    }

    pub fn active(&self) -> &str {
        &self.active
    }

    pub fn adapter(&self, name: &str) -> Option<&AttachedAdapter> {
        self.adapters.get(name)
    }

    pub fn adapters(&self) -> &BTreeMap<String, AttachedAdapter> {
        &self.adapters
    }

    pub fn wrapped_count(&self) -> usize {
        self.adapters.values().filter(|a| a.origin == AttachOrigin::Wrapped).count()
    }

    pub fn peft_configs(&self) -> BTreeMap<String, PeftConfig> {
        self.adapters
            .iter()
            .map(|(name, a)| (name.clone(), a.config.clone()))
            .collect()
    }

    fn adapter_mut(&mut self, name: &str) -> Result<&mut AttachedAdapter> {
        let family = self.family;
        self.adapters
            .get_mut(name)
            .ok_or_else(|| HostError::adapter(family.as_str(), format!("no adapter named '{}' is attached", name)))
    }
}

/// The handle's model slot, either bare or adapter-wrapped.
#[derive(Debug)]
pub enum ModelSlot<M> {
    Base(Arc<M>),
    Adapted(AdaptedModel<M>),
}

impl<M> ModelSlot<M> {
    pub fn base(&self) -> &Arc<M> {
        match self {
            ModelSlot::Base(model) => model,
            ModelSlot::Adapted(adapted) => adapted.base(),
        }
    }

    pub fn adapted(&self) -> Option<&AdaptedModel<M>> {
        match self {
            ModelSlot::Adapted(adapted) => Some(adapted),
            ModelSlot::Base(_) => None,
        }
    }

    pub fn adapted_mut(&mut self) -> Option<&mut AdaptedModel<M>> {
        match self {
            ModelSlot::Adapted(adapted) => Some(adapted),
            ModelSlot::Base(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Attrs;

    fn resolved(source: &str) -> ResolvedAdapter {
        ResolvedAdapter {
            config: PeftConfig::from_adapter(AdapterType::Lora, &Attrs::new(), true),
            source: source.to_string(),
        }
    }

    #[test]
    fn test_wrap_then_add() {
        let base = Arc::new(42u32);
        let mut adapted = AdaptedModel::wrap(base.clone(), AdapterType::Lora, &resolved("path/a"));
        adapted.add_adapter("extra", &resolved("path/b"));

        assert!(Arc::ptr_eq(adapted.base(), &base));
        assert_eq!(adapted.wrapped_count(), 1);
        assert_eq!(adapted.adapter("extra").unwrap().origin, AttachOrigin::Added);
        assert!(!adapted.adapter("extra").unwrap().weights_loaded);
        assert_eq!(adapted.active(), DEFAULT_ADAPTER_NAME);
    }

    #[test]
    fn test_set_active_unknown_adapter_fails() {
        let mut adapted = AdaptedModel::wrap(Arc::new(()), AdapterType::Lora, &resolved("path/a"));
        assert!(adapted.set_active("missing").is_err());
        assert!(adapted.mark_loaded("missing").is_err());
        assert_eq!(adapted.active(), DEFAULT_ADAPTER_NAME);
    }
}
