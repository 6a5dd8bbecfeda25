//! Artifact tags
//!
//! A tag is `{backend}-{normalised model id}:{version}`, always lower-case.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::UNIX_EPOCH;

use crate::error::{HostError, Result};
use crate::model_runtime::BackendKind;

lazy_static! {
    static ref NON_ALNUM: Regex = Regex::new(r"[^a-zA-Z0-9]+").unwrap();
    static ref TAG_PART: Regex = Regex::new(r"^[a-z0-9]([-._a-z0-9]*[a-z0-9])?$").unwrap();
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tag {
    pub name: String,
    pub version: String,
}

impl Tag {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into().to_lowercase(),
            version: version.into().to_lowercase(),
        }
    }

    /// Name and version each become one directory in the artifact store, so
    /// neither may contain separators or start with a dot.
    pub fn validate(&self) -> Result<()> {
        for (field, value) in [("tag name", &self.name), ("tag version", &self.version)] {
            if !is_valid_tag_part(value) {
                return Err(HostError::invalid(
                    field,
                    format!("'{}' must be lower-case alphanumerics joined by '-', '_' or '.'", value),
                ));
            }
        }
        Ok(())
    }

    /// Tag for a model id under a backend; `model_id` is normalised here.
    pub fn for_model(kind: BackendKind, model_id: &str, version: &str) -> Self {
        Self::new(tag_name(kind, model_id), version)
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.version)
    }
}

impl FromStr for Tag {
    type Err = HostError;

    fn from_str(s: &str) -> Result<Self> {
        match s.rsplit_once(':') {
            Some((name, version)) => {
                let tag = Tag::new(name, version);
                tag.validate()?;
                Ok(tag)
            }
            _ => Err(HostError::invalid("tag", format!("'{}' is not of the form name:version", s))),
        }
    }
}

pub fn is_valid_tag_part(part: &str) -> bool {
    TAG_PART.is_match(part)
}

pub fn tag_name(kind: BackendKind, model_id: &str) -> String {
    format!("{}-{}", kind.as_str(), normalise_model_name(model_id)).to_lowercase()
}

/// Local paths collapse to their directory name; anything else has every
/// run of non-alphanumerics replaced by `-`.
pub fn normalise_model_name(name: &str) -> String {
    let path = Path::new(name);
    if path.exists() {
        let base = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| name.to_string());
        return NON_ALNUM.replace_all(&base, "-").into_owned();
    }
    NON_ALNUM.replace_all(name, "-").into_owned()
}

pub fn is_local_path(model_id: &str) -> bool {
    Path::new(model_id).is_dir()
}

/// Absolute form of a local path, falling back to the input when it cannot
/// be canonicalised.
pub fn resolve_filepath(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Version for a local model directory: a digest of its mtime.
pub fn hash_from_mtime(path: &Path) -> Result<String> {
    let modified = std::fs::metadata(path)
        .and_then(|m| m.modified())
        .map_err(|e| HostError::io(path, e))?;
    let since_epoch = modified
        .duration_since(UNIX_EPOCH)
        .map_err(|e| HostError::io(path, e))?;
    let stamp = format!("{}.{:09}", since_epoch.as_secs(), since_epoch.subsec_nanos());
    Ok(blake3::hash(stamp.as_bytes()).to_hex()[..16].to_string())
}
