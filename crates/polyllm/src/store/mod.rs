//! Artifact storage: the local content-addressed store and the remote
//! model repository it is filled from.

pub mod hub;
pub mod local;

pub use hub::{HubClient, ModelRepository, RepoInfo, RepoSibling};
pub use local::{ArtifactManifest, ArtifactRef, ArtifactStore, Labels, LocalModelStore, MANIFEST_NAME};
