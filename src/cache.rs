// src/cache.rs

//! Cache of downloaded package archives
//!
//! Archives live at
//! `<downloaded>/<repository>/<category>/<name>/<name>-<version>.nest`. A
//! cached archive is only reused when it still hashes to the checksum of the
//! definition being installed.

use crate::error::{Error, Result};
use crate::hash;
use crate::packages::PackageDefinition;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// The `downloaded` directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedCache {
    root: PathBuf,
}

impl DownloadedCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Where the archive of `definition` is cached
    pub fn package_path(&self, definition: &PackageDefinition) -> PathBuf {
        self.root
            .join(&definition.repository)
            .join(&definition.category)
            .join(definition.name())
            .join(format!("{}-{}.nest", definition.name(), definition.version()))
    }

    /// A cached archive that can be used without downloading again
    ///
    /// Archives whose checksum no longer matches are deleted.
    pub fn reusable(&self, definition: &PackageDefinition) -> Result<Option<PathBuf>> {
        let path = self.package_path(definition);
        if !path.is_file() {
            return Ok(None);
        }

        let Some(expected) = &definition.checksum else {
            debug!("Reusing unchecked archive {}", path.display());
            return Ok(Some(path));
        };

        match hash::verify_checksum(&path, expected) {
            Ok(()) => {
                debug!("Reusing cached archive {}", path.display());
                Ok(Some(path))
            }
            Err(Error::ChecksumMismatch { .. }) => {
                warn!(
                    "Cached archive {} is stale, downloading {} again",
                    path.display(),
                    definition.id
                );
                fs::remove_file(&path).map_err(|e| Error::filesystem(&path, e))?;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Remove the cached archive of `definition`, if any
    ///
    /// Used when a fresh download fails verification.
    pub fn remove_package(&self, definition: &PackageDefinition) -> Result<()> {
        let path = self.package_path(definition);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::filesystem(&path, e)),
        }
    }
}
