//! Artifact registry.
//!
//! Owns artifact identity, metadata and status, and runs the download
//! pipeline for artifacts that have to be fetched:
//!
//! - [`ArtifactManager::create_artifact`]: local content, READY immediately
//! - [`ArtifactManager::push_artifact`]: PENDING, then DOWNLOADING, then
//!   READY or FAILED, reported over the caller's status channel
//! - [`ArtifactManager::get_artifact_info`] and
//!   [`ArtifactManager::list_artifacts`] for lookups

pub mod fetcher;
pub mod manager;
pub mod storage;
pub mod types;

pub use fetcher::{Fetcher, UriFetcher};
pub use manager::ArtifactManager;
pub use storage::ArtifactStorage;
pub use types::{
    ArtifactDescription, ArtifactFilter, ArtifactInfo, ArtifactSortKey, ArtifactStatus,
    ArtifactType,
};
