//! Artifact identity

pub mod resolver;
pub mod tag;

pub use resolver::TagResolver;
pub use tag::{hash_from_mtime, is_local_path, is_valid_tag_part, normalise_model_name, resolve_filepath, tag_name, Tag};
