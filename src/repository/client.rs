// src/repository/client.rs

//! HTTP access to repository mirrors
//!
//! Downloads go to a temporary file next to their destination and are renamed
//! into place, so a partial transfer never looks like a cached archive.

use super::RepositoryIndex;
use crate::config::FetchConfig;
use crate::error::{Error, Result};
use crate::packages::QualifiedId;
use reqwest::blocking::Client;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

/// Retry delay in milliseconds
const RETRY_DELAY_MS: u64 = 1000;

/// Obtains package archives from a repository's mirrors
pub trait Fetcher: Send + Sync {
    /// Download the archive of `package` into `destination`, trying `mirrors`
    /// in order, and return the path of the local archive
    fn fetch(&self, package: &QualifiedId, mirrors: &[String], destination: &Path)
    -> Result<PathBuf>;
}

/// HTTP client wrapper with retry support
pub struct RepositoryClient {
    client: Client,
    max_retries: u32,
    retry_delay: Duration,
}

impl RepositoryClient {
    /// Create a new repository client
    pub fn new(config: &FetchConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| Error::InitError(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            max_retries: config.retries.max(1),
            retry_delay: Duration::from_millis(RETRY_DELAY_MS),
        })
    }

    /// Shorten the pause between attempts
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Fetch repository metadata from a mirror with retry support
    pub fn fetch_metadata(&self, mirror: &str) -> Result<RepositoryIndex> {
        let metadata_url = format!("{}/metadata.json", mirror.trim_end_matches('/'));

        info!("Fetching repository metadata from {}", metadata_url);

        self.with_retries(&metadata_url, || {
            let response = self
                .client
                .get(&metadata_url)
                .send()
                .map_err(|e| Error::DownloadError(e.to_string()))?;

            if !response.status().is_success() {
                return Err(Error::DownloadError(format!(
                    "HTTP {} from {}",
                    response.status(),
                    metadata_url
                )));
            }

            let index: RepositoryIndex = response.json().map_err(|e| {
                Error::DownloadError(format!("Failed to parse metadata JSON: {}", e))
            })?;

            info!("Successfully fetched metadata for {} packages", index.packages.len());
            Ok(index)
        })
    }

    /// Download a file to the specified path with retry support
    pub fn download_file(&self, url: &str, dest_path: &Path) -> Result<()> {
        info!("Downloading {} to {}", url, dest_path.display());

        let parent = dest_path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent).map_err(|e| Error::filesystem(parent, e))?;

        self.with_retries(url, || {
            let mut response = self
                .client
                .get(url)
                .send()
                .map_err(|e| Error::DownloadError(e.to_string()))?;

            if !response.status().is_success() {
                return Err(Error::DownloadError(format!(
                    "HTTP {} from {}",
                    response.status(),
                    url
                )));
            }

            // Write to temporary file first
            let mut temp = NamedTempFile::new_in(parent).map_err(|e| Error::filesystem(parent, e))?;
            io::copy(&mut response, temp.as_file_mut()).map_err(|e| {
                Error::DownloadError(format!("Failed to write downloaded data: {}", e))
            })?;

            // Atomic rename from temp to final destination
            temp.persist(dest_path)
                .map_err(|e| Error::filesystem(dest_path, e.error))?;

            info!("Successfully downloaded to {}", dest_path.display());
            Ok(())
        })
    }

    /// Run `attempt` until it succeeds, a non-transient error occurs, or the
    /// retry budget is spent
    fn with_retries<T>(&self, what: &str, mut attempt: impl FnMut() -> Result<T>) -> Result<T> {
        let mut tries = 0;
        loop {
            tries += 1;
            match attempt() {
                Ok(value) => return Ok(value),
                Err(Error::DownloadError(e)) if tries < self.max_retries => {
                    warn!("Attempt {} for {} failed: {}, retrying...", tries, what, e);
                    std::thread::sleep(self.retry_delay * tries);
                }
                Err(Error::DownloadError(e)) => {
                    return Err(Error::DownloadError(format!(
                        "Failed after {} attempts: {}",
                        tries, e
                    )));
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Fetcher downloading from `<mirror>/api/p/<category>/<name>/<version>/download`
pub struct MirrorFetcher {
    client: RepositoryClient,
}

impl MirrorFetcher {
    pub fn new(config: &FetchConfig) -> Result<Self> {
        Ok(Self {
            client: RepositoryClient::new(config)?,
        })
    }

    pub fn from_client(client: RepositoryClient) -> Self {
        Self { client }
    }

    /// Download route of a package on one mirror
    pub fn package_url(mirror: &str, package: &QualifiedId) -> String {
        format!(
            "{}/api/p/{}/{}/{}/download",
            mirror.trim_end_matches('/'),
            package.category(),
            package.name(),
            package.version()
        )
    }
}

impl Fetcher for MirrorFetcher {
    fn fetch(
        &self,
        package: &QualifiedId,
        mirrors: &[String],
        destination: &Path,
    ) -> Result<PathBuf> {
        let mut last_error = String::from("no mirrors configured");

        for mirror in mirrors {
            let url = Self::package_url(mirror, package);
            debug!("Trying mirror {} for {}", mirror, package);

            match self.client.download_file(&url, destination) {
                Ok(()) => return Ok(destination.to_path_buf()),
                Err(e) => {
                    warn!("Mirror {} failed for {}: {}", mirror, package, e);
                    last_error = e.to_string();
                }
            }
        }

        Err(Error::FetchFailed {
            package: package.id().clone(),
            reason: last_error,
        })
    }
}
