pub mod artifacts;
pub mod broker;
pub mod config;
pub mod dryad;
pub mod error;
pub mod jobs;
pub mod node;
pub mod pagination;
pub mod shutdown;
pub mod spec;
pub mod status;

/// Job identifier, assigned by the job registry in creation order.
pub type JobId = u64;

/// Artifact identifier, assigned by the artifact registry in creation order.
pub type ArtifactId = u64;
