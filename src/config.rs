// src/config.rs

//! Configuration for Nest
//!
//! The core is parametrized by a handful of filesystem roots and an ordered
//! list of repositories. Everything is loaded from one TOML file, usually
//! `/etc/nest/config.toml`:
//!
//! ```toml
//! orphans = "report"
//!
//! [paths]
//! root = "/"
//!
//! [repositories.stable]
//! mirrors = ["https://stable.example.org"]
//! ```
//!
//! Repository declaration order is resolution priority, highest first.

use crate::error::{Error, Result};
use crate::repository::Repository;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Default location of the configuration file
pub const DEFAULT_CONFIG_PATH: &str = "/etc/nest/config.toml";

/// Filesystem roots the core operates on
///
/// Unset entries default to `<root>/var/nest/<entry>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigPaths {
    #[serde(default = "default_root")]
    root: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    available: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    downloaded: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    installed: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    depgraph: Option<PathBuf>,
}

fn default_root() -> PathBuf {
    PathBuf::from("/")
}

impl Default for ConfigPaths {
    fn default() -> Self {
        Self {
            root: default_root(),
            available: None,
            downloaded: None,
            installed: None,
            depgraph: None,
        }
    }
}

impl ConfigPaths {
    /// Paths with every entry derived from `root`
    pub fn under(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Default::default()
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding one synced index per repository
    pub fn available(&self) -> PathBuf {
        self.resolve(&self.available, "var/nest/available")
    }

    /// Cache of downloaded package archives
    pub fn downloaded(&self) -> PathBuf {
        self.resolve(&self.downloaded, "var/nest/downloaded")
    }

    /// Root that installed packages are unpacked into
    pub fn installed(&self) -> PathBuf {
        self.resolve(&self.installed, "var/nest/installed")
    }

    /// Dependency graph store
    pub fn depgraph(&self) -> PathBuf {
        self.resolve(&self.depgraph, "var/nest/depgraph")
    }

    pub fn set_available(&mut self, path: impl Into<PathBuf>) {
        self.available = Some(path.into());
    }

    pub fn set_downloaded(&mut self, path: impl Into<PathBuf>) {
        self.downloaded = Some(path.into());
    }

    pub fn set_installed(&mut self, path: impl Into<PathBuf>) {
        self.installed = Some(path.into());
    }

    pub fn set_depgraph(&mut self, path: impl Into<PathBuf>) {
        self.depgraph = Some(path.into());
    }

    /// Re-root every path under `new_root`, chroot style
    ///
    /// Explicitly configured paths are rebased as well, so `/var/nest/installed`
    /// becomes `<new_root>/var/nest/installed`.
    pub fn rebase(&mut self, new_root: &Path) {
        let rebase = |path: &Path| new_root.join(path.strip_prefix("/").unwrap_or(path));
        self.root = rebase(&self.root);
        for entry in [
            &mut self.available,
            &mut self.downloaded,
            &mut self.installed,
            &mut self.depgraph,
        ] {
            if let Some(path) = entry {
                *path = rebase(path);
            }
        }
    }

    fn resolve(&self, explicit: &Option<PathBuf>, default: &str) -> PathBuf {
        explicit
            .clone()
            .unwrap_or_else(|| self.root.join(default))
    }
}

/// Per-repository settings from `[repositories.<name>]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryConfig {
    /// Mirror base URLs, tried in order
    #[serde(default)]
    pub mirrors: Vec<String>,
    /// Seconds after which a synced index is considered stale
    #[serde(default = "default_metadata_expire")]
    pub metadata_expire: u64,
}

fn default_metadata_expire() -> u64 {
    3600
}

impl RepositoryConfig {
    pub fn new(mirrors: Vec<String>) -> Self {
        Self {
            mirrors,
            metadata_expire: default_metadata_expire(),
        }
    }
}

/// Download settings from `[fetch]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Per-request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    /// Attempts per mirror before moving on
    #[serde(default = "default_retries")]
    pub retries: u32,
    /// Concurrent downloads within one transaction
    #[serde(default = "default_workers")]
    pub workers: usize,
}

fn default_timeout() -> u64 {
    30
}

fn default_retries() -> u32 {
    3
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get().min(8))
        .unwrap_or(4)
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout: default_timeout(),
            retries: default_retries(),
            workers: default_workers(),
        }
    }
}

impl FetchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

/// What to do with packages nothing explicit depends on anymore
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrphanPolicy {
    /// Keep orphans installed and list them
    #[default]
    Report,
    /// Remove orphans as part of the transaction that created them
    Prune,
}

/// A handle holding every configuration option of Nest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    paths: ConfigPaths,
    #[serde(default)]
    repositories: IndexMap<String, RepositoryConfig>,
    #[serde(default)]
    fetch: FetchConfig,
    #[serde(default)]
    orphans: OrphanPolicy,
    /// Resolution restarts allowed when the installed state changes underneath
    #[serde(default = "default_max_retries")]
    max_retries: u32,
}

fn default_max_retries() -> u32 {
    3
}

impl Default for Config {
    fn default() -> Self {
        Self {
            paths: ConfigPaths::default(),
            repositories: IndexMap::new(),
            fetch: FetchConfig::default(),
            orphans: OrphanPolicy::default(),
            max_retries: default_max_retries(),
        }
    }
}

impl Config {
    /// Load the configuration located at the default path
    pub fn load() -> Result<Config> {
        Config::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load and validate the configuration file located at the given path
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Config> {
        let path = path.as_ref();
        debug!("Loading configuration from {}", path.display());

        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;

        Config::parse(&content)
    }

    /// Parse and validate configuration text
    pub fn parse(content: &str) -> Result<Config> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check invariants serde cannot express
    pub fn validate(&self) -> Result<()> {
        for (name, repo) in &self.repositories {
            if repo.mirrors.is_empty() {
                return Err(Error::Config(format!(
                    "Repository '{}' has no mirrors",
                    name
                )));
            }
        }
        if self.fetch.workers == 0 {
            return Err(Error::Config("fetch.workers must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn paths(&self) -> &ConfigPaths {
        &self.paths
    }

    pub fn paths_mut(&mut self) -> &mut ConfigPaths {
        &mut self.paths
    }

    pub fn fetch(&self) -> &FetchConfig {
        &self.fetch
    }

    pub fn fetch_mut(&mut self) -> &mut FetchConfig {
        &mut self.fetch
    }

    pub fn orphans(&self) -> OrphanPolicy {
        self.orphans
    }

    pub fn set_orphans(&mut self, policy: OrphanPolicy) {
        self.orphans = policy;
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn set_max_retries(&mut self, retries: u32) {
        self.max_retries = retries;
    }

    /// Append a repository with the lowest priority so far
    pub fn add_repository(&mut self, name: impl Into<String>, config: RepositoryConfig) {
        self.repositories.insert(name.into(), config);
    }

    /// Repositories in priority order, highest first
    pub fn repositories(&self) -> Vec<Repository> {
        self.repositories
            .iter()
            .enumerate()
            .map(|(priority, (name, config))| Repository::new(name.clone(), priority, config.clone()))
            .collect()
    }

    /// Look up a repository by name
    pub fn repository(&self, name: &str) -> Option<Repository> {
        self.repositories().into_iter().find(|r| r.name() == name)
    }
}
