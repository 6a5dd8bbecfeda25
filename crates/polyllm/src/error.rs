//! Error types for the model-handle runtime
//!
//! Every variant carries the identifier the caller has to fix (model id,
//! adapter family, option names) so the message is actionable on its own.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, HostError>;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum HostError {
    /// Tag or version could not be determined
    #[error("failed to resolve identity for '{model_id}': {reason}")]
    IdentityResolution { model_id: String, reason: String },

    /// Two mutually exclusive options were both set
    #[error("'{first}' and '{second}' are mutually exclusive: {hint}")]
    ConfigurationConflict {
        first: &'static str,
        second: &'static str,
        hint: String,
    },

    /// GPU required but absent, or an optional dependency is missing
    #[error("{subject} requires {requirement}")]
    CapabilityUnavailable { subject: String, requirement: String },

    #[error("adapter resolution failed for '{family}': {reason}")]
    AdapterResolution { family: String, reason: String },

    /// A capability has no override and no usable default
    #[error("{backend} does not implement '{capability}'")]
    BackendNotImplemented {
        backend: String,
        capability: &'static str,
    },

    #[error("model '{tag}' is not loaded")]
    ModelNotLoaded { tag: String },

    #[error("not found: {what}")]
    NotFound { what: String },

    #[error("model repository error for '{model_id}': {message}")]
    Repository { model_id: String, message: String },

    #[error("invalid value for '{option}': {reason}")]
    InvalidOption { option: String, reason: String },

    #[error("I/O error at {path}: {message}")]
    Io { path: String, message: String },

    #[error("{backend} backend error: {message}")]
    Backend { backend: String, message: String },
}

impl HostError {
    pub fn identity(model_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::IdentityResolution {
            model_id: model_id.into(),
            reason: reason.into(),
        }
    }

    pub fn conflict(first: &'static str, second: &'static str, hint: impl Into<String>) -> Self {
        Self::ConfigurationConflict {
            first,
            second,
            hint: hint.into(),
        }
    }

    pub fn unavailable(subject: impl Into<String>, requirement: impl Into<String>) -> Self {
        Self::CapabilityUnavailable {
            subject: subject.into(),
            requirement: requirement.into(),
        }
    }

    pub fn adapter(family: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::AdapterResolution {
            family: family.into(),
            reason: reason.into(),
        }
    }

    pub fn not_implemented(backend: impl Into<String>, capability: &'static str) -> Self {
        Self::BackendNotImplemented {
            backend: backend.into(),
            capability,
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    pub fn repository(model_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Repository {
            model_id: model_id.into(),
            message: message.into(),
        }
    }

    pub fn invalid(option: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidOption {
            option: option.into(),
            reason: reason.into(),
        }
    }

    pub fn io(path: impl AsRef<std::path::Path>, err: impl std::fmt::Display) -> Self {
        Self::Io {
            path: path.as_ref().display().to_string(),
            message: err.to_string(),
        }
    }

    pub fn backend(backend: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Backend {
            backend: backend.into(),
            message: message.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
