// polyllm/crates/polyllm/src/config.rs
//
// The only place that reads the process environment. Everything below the
// handle builder receives these structs as values.

use anyhow::{Context, Result};
use std::env;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::model_runtime::BackendKind;
use crate::options::{QuantizeMethod, SerialisationFormat};

const ENV_VARS_TRUE_VALUES: &[&str] = &["1", "ON", "YES", "TRUE"];

pub const DEFAULT_HUB_ENDPOINT: &str = "https://huggingface.co";

#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    /// Root of the local artifact store
    pub store_root: PathBuf,
    pub hub_endpoint: String,
    pub hub_token: Option<String>,
    pub device_count: usize,
    /// Set when running inside a prebuilt deployment artifact
    pub deployment_path: Option<PathBuf>,
    pub use_local_latest: bool,
    pub serialisation: Option<SerialisationFormat>,
    pub server_binary: Option<PathBuf>,
    pub server_host: String,
    pub server_port: u16,
    pub request_timeout_seconds: u64,
    pub debug: bool,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            store_root: default_store_root(),
            hub_endpoint: DEFAULT_HUB_ENDPOINT.to_string(),
            hub_token: None,
            device_count: 0,
            deployment_path: None,
            use_local_latest: false,
            serialisation: None,
            server_binary: None,
            server_host: "127.0.0.1".to_string(),
            server_port: 8081,
            request_timeout_seconds: 600,
            debug: false,
        }
    }
}

impl RuntimeSettings {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let store_root = env::var("POLYLLM_HOME")
            .map(PathBuf::from)
            .unwrap_or(defaults.store_root);

        let serialisation = match env::var("POLYLLM_SERIALIZATION") {
            Ok(value) => Some(
                value
                    .parse::<SerialisationFormat>()
                    .with_context(|| format!("POLYLLM_SERIALIZATION={} is not a valid format", value))?,
            ),
            Err(_) => None,
        };

        // The deployment bypass is only meaningful inside a container.
        let deployment_path = if in_container() {
            env::var("POLYLLM_DEPLOYMENT_PATH")
                .or_else(|_| env::var("BENTO_PATH"))
                .ok()
                .map(PathBuf::from)
        } else {
            None
        };

        let settings = Self {
            store_root,
            hub_endpoint: env::var("POLYLLM_HUB_ENDPOINT").unwrap_or(defaults.hub_endpoint),
            hub_token: env::var("HF_TOKEN").ok().filter(|t| !t.is_empty()),
            device_count: detect_device_count(),
            deployment_path,
            use_local_latest: env_flag("POLYLLM_USE_LOCAL_LATEST").unwrap_or(false),
            serialisation,
            server_binary: env::var("POLYLLM_SERVER_BIN").ok().map(PathBuf::from),
            server_host: env::var("POLYLLM_SERVER_HOST").unwrap_or(defaults.server_host),
            server_port: env::var("POLYLLM_SERVER_PORT")
                .unwrap_or_else(|_| defaults.server_port.to_string())
                .parse()
                .context("POLYLLM_SERVER_PORT must be a port number")?,
            request_timeout_seconds: env::var("POLYLLM_REQUEST_TIMEOUT_SECONDS")
                .unwrap_or_else(|_| defaults.request_timeout_seconds.to_string())
                .parse()
                .context("POLYLLM_REQUEST_TIMEOUT_SECONDS must be an integer")?,
            debug: debug_from_env(),
        };

        info!(
            "Runtime settings: store={}, hub={}, devices={}, deployment={}",
            settings.store_root.display(),
            settings.hub_endpoint,
            settings.device_count,
            settings.deployment_path.is_some()
        );
        Ok(settings)
    }

    pub fn print_config(&self) {
        info!("Current Configuration:");
        info!("- Store Root: {}", self.store_root.display());
        info!("- Hub Endpoint: {}", self.hub_endpoint);
        info!("- GPU Devices: {}", self.device_count);
        info!("- Use Local Latest: {}", self.use_local_latest);
        info!("- Serialisation: {:?}", self.serialisation);
        info!("- Server: {}:{}", self.server_host, self.server_port);
    }
}

/// Per-model environment defaults, keyed by the model's start name
/// (`POLYLLM_<START_NAME>_<FIELD>`).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelEnvDefaults {
    pub model_id: Option<String>,
    pub quantize: Option<QuantizeMethod>,
    pub bettertransformer: Option<bool>,
    pub framework: Option<BackendKind>,
}

impl ModelEnvDefaults {
    pub fn from_env(start_name: &str) -> Result<Self> {
        let prefix = env_prefix(start_name);
        let var = |field: &str| env::var(format!("{}_{}", prefix, field)).ok();

        let quantize = match var("QUANTIZE") {
            Some(v) => Some(
                v.parse::<QuantizeMethod>()
                    .with_context(|| format!("{}_QUANTIZE={} is not a quantize method", prefix, v))?,
            ),
            None => None,
        };
        let framework = match var("FRAMEWORK") {
            Some(v) => Some(
                v.parse::<BackendKind>()
                    .with_context(|| format!("{}_FRAMEWORK={} is not a backend", prefix, v))?,
            ),
            None => None,
        };

        let defaults = Self {
            model_id: var("MODEL_ID"),
            quantize,
            bettertransformer: var("BETTERTRANSFORMER").map(|v| is_truthy(&v)),
            framework,
        };
        debug!("Environment defaults for {}: {:?}", start_name, defaults);
        Ok(defaults)
    }

    /// Backend kind to use when the caller names none.
    pub fn framework_or(&self, fallback: BackendKind) -> BackendKind {
        self.framework.unwrap_or(fallback)
    }
}

/// `POLYLLM_DEBUG`, readable before the tracing subscriber exists.
pub fn debug_from_env() -> bool {
    env_flag("POLYLLM_DEBUG").unwrap_or(false)
}

/// `flan-t5` -> `POLYLLM_FLAN_T5`
pub fn env_prefix(start_name: &str) -> String {
    let upper: String = start_name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect();
    format!("POLYLLM_{}", upper)
}

pub fn is_truthy(value: &str) -> bool {
    ENV_VARS_TRUE_VALUES.contains(&value.trim().to_uppercase().as_str())
}

fn env_flag(key: &str) -> Option<bool> {
    env::var(key).ok().map(|v| is_truthy(&v))
}

fn default_store_root() -> PathBuf {
    env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| env::temp_dir())
        .join(".polyllm")
        .join("models")
}

fn in_container() -> bool {
    if Path::new("/.dockerenv").exists() {
        return true;
    }
    std::fs::read_to_string("/proc/self/cgroup")
        .map(|cgroup| cgroup.contains("docker") || cgroup.contains("kubepods"))
        .unwrap_or(false)
}

#[cfg(feature = "nvml")]
fn detect_device_count() -> usize {
    use nvml_wrapper::Nvml;

    match Nvml::init().and_then(|nvml| nvml.device_count()) {
        Ok(count) => {
            info!("Detected {} NVIDIA GPU(s)", count);
            count as usize
        }
        Err(e) => {
            warn!("Failed to query NVML, falling back to CUDA_VISIBLE_DEVICES: {}", e);
            visible_devices_from_env()
        }
    }
}

#[cfg(not(feature = "nvml"))]
fn detect_device_count() -> usize {
    visible_devices_from_env()
}

fn visible_devices_from_env() -> usize {
    match env::var("CUDA_VISIBLE_DEVICES") {
        Ok(devices) => count_visible_devices(&devices),
        Err(_) => {
            debug!("CUDA_VISIBLE_DEVICES not set, assuming no GPU");
            0
        }
    }
}

fn count_visible_devices(devices: &str) -> usize {
    let devices = devices.trim();
    if devices.is_empty() || devices.starts_with("-1") {
        if !devices.is_empty() {
            warn!("CUDA_VISIBLE_DEVICES={} hides every device", devices);
        }
        return 0;
    }
    devices.split(',').filter(|d| !d.trim().is_empty()).count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_prefix_from_start_name() {
        assert_eq!(env_prefix("flan-t5"), "POLYLLM_FLAN_T5");
        assert_eq!(env_prefix("llama"), "POLYLLM_LLAMA");
    }

    #[test]
    fn test_truthy_values() {
        assert!(is_truthy("true"));
        assert!(is_truthy(" YES "));
        assert!(is_truthy("1"));
        assert!(!is_truthy("0"));
        assert!(!is_truthy("off"));
    }

    #[test]
    fn test_count_visible_devices() {
        assert_eq!(count_visible_devices("0,1"), 2);
        assert_eq!(count_visible_devices(""), 0);
        assert_eq!(count_visible_devices("-1"), 0);
        assert_eq!(count_visible_devices("3"), 1);
    }

    #[test]
    fn test_framework_default_only_fills_gaps() {
        let env = ModelEnvDefaults {
            framework: Some(BackendKind::Vllm),
            ..Default::default()
        };
        assert_eq!(env.framework_or(BackendKind::Pt), BackendKind::Vllm);
        assert_eq!(ModelEnvDefaults::default().framework_or(BackendKind::Pt), BackendKind::Pt);
    }

    #[test]
    fn test_default_settings() {
        let settings = RuntimeSettings::default();
        assert_eq!(settings.device_count, 0);
        assert!(settings.deployment_path.is_none());
        assert!(!settings.use_local_latest);
        assert_eq!(settings.hub_endpoint, DEFAULT_HUB_ENDPOINT);
        assert!(settings.store_root.ends_with("models"));
    }

    #[test]
    fn test_model_env_defaults_from_env() {
        // unique start name so parallel tests don't collide
        std::env::set_var("POLYLLM_ENVTEST_MODEL_MODEL_ID", "org/envtest");
        std::env::set_var("POLYLLM_ENVTEST_MODEL_QUANTIZE", "int4");
        std::env::set_var("POLYLLM_ENVTEST_MODEL_BETTERTRANSFORMER", "on");

        let defaults = ModelEnvDefaults::from_env("envtest-model").unwrap();
        assert_eq!(defaults.model_id.as_deref(), Some("org/envtest"));
        assert_eq!(defaults.quantize, Some(QuantizeMethod::Int4));
        assert_eq!(defaults.bettertransformer, Some(true));
        assert_eq!(defaults.framework, None);
    }

    #[test]
    fn test_model_env_defaults_rejects_bad_quantize() {
        std::env::set_var("POLYLLM_BADQ_QUANTIZE", "int3");
        assert!(ModelEnvDefaults::from_env("badq").is_err());
    }
}
