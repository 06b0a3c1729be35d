use std::path::{Path, PathBuf};

use crate::artifacts::types::ArtifactDescription;
use crate::ArtifactId;

/// On-disk layout of artifact files:
/// `<root>/<job_id>/<type>/<artifact_id>-<alias>`.
#[derive(Debug, Clone)]
pub struct ArtifactStorage {
    root: PathBuf,
}

impl ArtifactStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, id: ArtifactId, desc: &ArtifactDescription) -> PathBuf {
        self.root
            .join(desc.job_id.to_string())
            .join(desc.artifact_type.dir_name())
            .join(format!("{}-{}", id, sanitize_alias(&desc.alias)))
    }

    /// Create the parent directories of an artifact path.
    pub async fn prepare(&self, path: &Path) -> std::io::Result<()> {
        match path.parent() {
            Some(dir) => tokio::fs::create_dir_all(dir).await,
            None => Ok(()),
        }
    }
}

fn sanitize_alias(alias: &str) -> String {
    let cleaned: String = alias
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "artifact".to_string()
    } else {
        cleaned.to_string()
    }
}
