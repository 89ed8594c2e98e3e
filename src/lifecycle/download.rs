//! Bounded artifact download with streaming sha256

use super::requests::is_bare_filename;
use super::LifecycleError;
use futures_util::StreamExt;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

pub const DEFAULT_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_ARTIFACT_BYTES: u64 = 200 * 1024 * 1024;

/// A downloaded file in its own temp dir, removed on drop
#[derive(Debug)]
pub struct DownloadedArtifact {
    path: PathBuf,
    sha256: String,
    size: u64,
    _dir: TempDir,
}

impl DownloadedArtifact {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Lowercase hex digest
    pub fn sha256(&self) -> &str {
        &self.sha256
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Case-insensitive comparison against the declared digest
    pub fn verify_sha256(&self, expected: &str) -> Result<(), LifecycleError> {
        verify_sha256(expected, &self.sha256)
    }
}

pub fn verify_sha256(expected: &str, actual: &str) -> Result<(), LifecycleError> {
    let expected = expected.to_ascii_lowercase();
    let actual = actual.to_ascii_lowercase();
    if expected != actual {
        return Err(LifecycleError::Integrity(format!(
            "sha256 mismatch: expected {expected}, got {actual}"
        )));
    }
    Ok(())
}

/// HTTP fetcher with a whole-download timeout and a byte cap
#[derive(Debug, Clone)]
pub struct ArtifactFetcher {
    client: reqwest::Client,
    timeout: Duration,
    max_bytes: u64,
}

impl ArtifactFetcher {
    pub fn new(timeout: Duration, max_bytes: u64) -> Result<Self, LifecycleError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("lucid-agent-core/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(timeout)
            .build()
            .map_err(|e| LifecycleError::Operational(format!("HTTP client setup failed: {e}")))?;
        Ok(Self {
            client,
            timeout,
            max_bytes,
        })
    }

    /// Download `url` into a fresh temp dir as `file_name`
    pub async fn fetch(&self, url: &str, file_name: &str) -> Result<DownloadedArtifact, LifecycleError> {
        if !is_bare_filename(file_name) {
            return Err(LifecycleError::Validation(format!(
                "artifact name must be a bare filename: {file_name}"
            )));
        }
        let dir = tempfile::Builder::new()
            .prefix("lucid-artifact-")
            .tempdir()
            .map_err(|e| LifecycleError::Operational(format!("temp dir creation failed: {e}")))?;
        let path = dir.path().join(file_name);

        info!(url, "Downloading artifact");
        let (sha256, size) = tokio::time::timeout(self.timeout, self.stream_to_file(url, &path))
            .await
            .map_err(|_| {
                LifecycleError::Operational(format!(
                    "download timed out after {}s",
                    self.timeout.as_secs()
                ))
            })??;
        debug!(url, size, sha256 = %sha256, "Artifact downloaded");

        Ok(DownloadedArtifact {
            path,
            sha256,
            size,
            _dir: dir,
        })
    }

    async fn stream_to_file(&self, url: &str, path: &Path) -> Result<(String, u64), LifecycleError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| LifecycleError::Operational(format!("download failed: {e}")))?;

        if let Some(length) = response.content_length() {
            if length > self.max_bytes {
                return Err(self.too_large());
            }
        }

        let mut file = tokio::fs::File::create(path)
            .await
            .map_err(|e| LifecycleError::Operational(format!("artifact write failed: {e}")))?;
        let mut hasher = Sha256::new();
        let mut size: u64 = 0;
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk =
                chunk.map_err(|e| LifecycleError::Operational(format!("download failed: {e}")))?;
            size += chunk.len() as u64;
            if size > self.max_bytes {
                return Err(self.too_large());
            }
            hasher.update(&chunk);
            file.write_all(&chunk)
                .await
                .map_err(|e| LifecycleError::Operational(format!("artifact write failed: {e}")))?;
        }
        file.flush()
            .await
            .map_err(|e| LifecycleError::Operational(format!("artifact write failed: {e}")))?;

        Ok((format!("{:x}", hasher.finalize()), size))
    }

    fn too_large(&self) -> LifecycleError {
        LifecycleError::Operational(format!("download exceeded max_bytes={}", self.max_bytes))
    }
}
