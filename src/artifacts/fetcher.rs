use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use crate::error::WorkerError;

/// Brings remote content to a local path.
#[async_trait]
pub trait Fetcher: Send + Sync + 'static {
    /// Fetch `uri` into `dest`, returning the number of bytes written.
    async fn fetch(&self, uri: &str, dest: &Path) -> Result<u64, WorkerError>;
}

/// Fetches `file://` URIs and absolute paths from the local filesystem and
/// `http(s)://` URIs over the network.
#[derive(Debug, Clone)]
pub struct UriFetcher {
    client: reqwest::Client,
}

impl Default for UriFetcher {
    fn default() -> Self {
        Self::new(Duration::from_secs(300))
    }
}

impl UriFetcher {
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Failed to build HTTP client, using defaults");
                reqwest::Client::new()
            });
        Self { client }
    }

    async fn fetch_http(&self, uri: &str, dest: &Path) -> Result<u64, WorkerError> {
        let mut response = self
            .client
            .get(uri)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| WorkerError::Fetch(e.to_string()))?;

        let mut file = tokio::fs::File::create(dest).await?;
        let mut written = 0u64;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| WorkerError::Fetch(e.to_string()))?
        {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        Ok(written)
    }
}

#[async_trait]
impl Fetcher for UriFetcher {
    async fn fetch(&self, uri: &str, dest: &Path) -> Result<u64, WorkerError> {
        if uri.starts_with("http://") || uri.starts_with("https://") {
            return self.fetch_http(uri, dest).await;
        }

        let source = match uri.strip_prefix("file://") {
            Some(path) => path,
            None if uri.starts_with('/') => uri,
            None => return Err(WorkerError::UnsupportedUri(uri.to_string())),
        };
        tokio::fs::copy(source, dest)
            .await
            .map_err(|e| WorkerError::Fetch(format!("{}: {}", source, e)))
    }
}
