// src/repository/mod.rs

//! Repository management and package downloading
//!
//! This module provides functionality for:
//! - Describing configured repositories and their mirrors
//! - Synchronizing repository indexes into the `available` directory
//! - Downloading package archives from mirrors

mod client;

pub use client::{Fetcher, MirrorFetcher, RepositoryClient};

use crate::config::RepositoryConfig;
use crate::error::{Error, Result};
use crate::packages::PackageManifest;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{info, warn};

/// A configured repository and its resolution priority
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Repository {
    name: String,
    /// Position in the configuration; 0 is the highest priority
    priority: usize,
    config: RepositoryConfig,
}

impl Repository {
    pub fn new(name: impl Into<String>, priority: usize, config: RepositoryConfig) -> Self {
        Self {
            name: name.into(),
            priority,
            config,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn priority(&self) -> usize {
        self.priority
    }

    pub fn mirrors(&self) -> &[String] {
        &self.config.mirrors
    }

    pub fn config(&self) -> &RepositoryConfig {
        &self.config
    }

    /// Location of this repository's synced index
    pub fn index_path(&self, available_dir: &Path) -> PathBuf {
        available_dir.join(format!("{}.json", self.name))
    }
}

/// Repository index format (simple JSON document per repository)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryIndex {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synced_at: Option<String>,
    #[serde(default)]
    pub packages: Vec<PackageManifest>,
}

impl RepositoryIndex {
    pub fn new(name: impl Into<String>, packages: Vec<PackageManifest>) -> Self {
        Self {
            name: name.into(),
            synced_at: None,
            packages,
        }
    }

    /// Read an index written by [`RepositoryIndex::write`]
    pub fn read(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| Error::filesystem(path, e))?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Atomically replace the index at `path`
    pub fn write(&self, path: &Path) -> Result<()> {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent).map_err(|e| Error::filesystem(parent, e))?;

        let mut temp = NamedTempFile::new_in(parent).map_err(|e| Error::filesystem(parent, e))?;
        serde_json::to_writer_pretty(temp.as_file_mut(), self)?;
        temp.as_file_mut()
            .flush()
            .and_then(|_| temp.as_file().sync_all())
            .map_err(|e| Error::filesystem(temp.path(), e))?;
        temp.persist(path).map_err(|e| Error::filesystem(path, e.error))?;
        Ok(())
    }
}

/// Synchronize one repository's index into `available_dir`
///
/// Mirrors are tried in order; the first one that serves a valid index wins.
/// Returns the number of package definitions in the new index.
pub fn sync_repository(
    client: &RepositoryClient,
    repo: &Repository,
    available_dir: &Path,
) -> Result<usize> {
    info!("Synchronizing repository: {}", repo.name());

    let mut last_error = None;
    for mirror in repo.mirrors() {
        match client.fetch_metadata(mirror) {
            Ok(mut index) => {
                index.name = repo.name().to_string();
                index.synced_at = Some(current_timestamp());
                index.write(&repo.index_path(available_dir))?;

                info!(
                    "Synchronized {} packages from repository {}",
                    index.packages.len(),
                    repo.name()
                );
                return Ok(index.packages.len());
            }
            Err(e) => {
                warn!("Mirror {} of {} failed: {}", mirror, repo.name(), e);
                last_error = Some(e);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| {
        Error::Config(format!("Repository '{}' has no mirrors", repo.name()))
    }))
}

/// Check if repository metadata needs refresh
pub fn needs_sync(repo: &Repository, available_dir: &Path) -> bool {
    let index = match RepositoryIndex::read(&repo.index_path(available_dir)) {
        Ok(index) => index,
        Err(_) => return true, // Never synced, or unreadable
    };

    match index.synced_at.as_deref().map(parse_timestamp) {
        Some(Ok(last_sync_time)) => {
            let now = chrono::Utc::now().timestamp().max(0) as u64;
            let age_seconds = now.saturating_sub(last_sync_time);
            age_seconds > repo.config().metadata_expire
        }
        _ => true,
    }
}

/// Get current timestamp as ISO 8601 string
fn current_timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Parse ISO 8601 timestamp to Unix seconds
fn parse_timestamp(timestamp: &str) -> Result<u64> {
    use chrono::DateTime;

    let dt = DateTime::parse_from_rfc3339(timestamp)
        .map_err(|e| Error::Config(format!("Invalid timestamp '{}': {}", timestamp, e)))?;

    Ok(dt.timestamp().max(0) as u64)
}
