//! Adapter resolution
//!
//! Turns the family-grouped specs into `family -> name -> (config, source)`.
//! The first unnamed adapter of a family becomes `"default"` and is built
//! from the family's fine-tune strategy; any later unnamed adapter in the
//! same family is rejected.

use std::collections::BTreeMap;
use tracing::debug;

use super::spec::{AdapterType, AdaptersMapping};
use super::strategy::PeftConfig;
use crate::error::{HostError, Result};
use crate::model_config::ModelConfig;

pub const DEFAULT_ADAPTER_NAME: &str = "default";

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedAdapter {
    pub config: PeftConfig,
    /// Adapter id or local path the weights come from
    pub source: String,
}

pub type ResolvedAdapterMapping = BTreeMap<AdapterType, BTreeMap<String, ResolvedAdapter>>;

/// Per-handle resolver holding the resolved mapping once it is built.
#[derive(Debug, Default)]
pub struct AdapterResolver {
    cache: Option<ResolvedAdapterMapping>,
}

impl AdapterResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cached(&self) -> bool {
        self.cache.is_some()
    }

    /// `use_cache = false` always rebuilds and leaves the cache untouched,
    /// which is what training loops want when adapter configs change
    /// between iterations.
    pub fn resolve(
        &mut self,
        mapping: Option<&AdaptersMapping>,
        config: &ModelConfig,
        inference_mode: bool,
        use_cache: bool,
    ) -> Result<ResolvedAdapterMapping> {
        let mapping = mapping.ok_or_else(|| {
            HostError::adapter(&config.start_name, "no adapters mapping is configured for this model")
        })?;

        if use_cache {
            if let Some(cached) = &self.cache {
                return Ok(cached.clone());
            }
        } else {
            debug!("Adapter mapping resolution will not be cached");
        }

        let resolved = transpose(mapping, config, inference_mode)?;
        if use_cache && self.cache.is_none() {
            self.cache = Some(resolved.clone());
        }
        Ok(resolved)
    }
}

fn transpose(mapping: &AdaptersMapping, config: &ModelConfig, inference_mode: bool) -> Result<ResolvedAdapterMapping> {
    let mut resolved = ResolvedAdapterMapping::new();
    for (family, specs) in mapping {
        let strategy = config.default_strategy(*family, inference_mode);
        let mut converted_default = false;
        let mut by_name = BTreeMap::new();

        for spec in specs {
            let name = match &spec.name {
                Some(name) => name.clone(),
                None if converted_default => {
                    return Err(HostError::adapter(
                        family.as_str(),
                        format!(
                            "cannot resolve a second unnamed adapter '{}'; only one adapter per family may become '{}'",
                            spec.adapter_id, DEFAULT_ADAPTER_NAME
                        ),
                    ));
                }
                None => {
                    converted_default = true;
                    DEFAULT_ADAPTER_NAME.to_string()
                }
            };

            let peft_config = if name == DEFAULT_ADAPTER_NAME {
                strategy.clone().with_config(&spec.config).to_peft_config()
            } else {
                PeftConfig::from_adapter(*family, &spec.config, inference_mode)
            };
            by_name.insert(
                name,
                ResolvedAdapter {
                    config: peft_config,
                    source: spec.adapter_id.clone(),
                },
            );
        }
        resolved.insert(*family, by_name);
    }
    Ok(resolved)
}
