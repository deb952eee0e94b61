// src/packages/id.rs

//! Package identifiers

use crate::error::{Error, Result};
use semver::Version;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A concrete (name, version) pair identifying one installable unit
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PackageId {
    name: String,
    version: Version,
}

impl PackageId {
    /// Create a new PackageId, validating the name
    pub fn new(name: impl Into<String>, version: Version) -> Result<Self> {
        let name = name.into();
        validate_name(&name)?;
        Ok(Self { name, version })
    }

    /// Parse a name and a version string
    pub fn parse(name: &str, version: &str) -> Result<Self> {
        let version = Version::parse(version).map_err(|e| Error::MalformedDefinition {
            package: name.to_string(),
            reason: format!("invalid version '{}': {}", version, e),
        })?;
        Self::new(name, version)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &Version {
        &self.version
    }
}

impl fmt::Display for PackageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.name, self.version)
    }
}

impl FromStr for PackageId {
    type Err = Error;

    /// Parse the `name#version` form used in diagnostics and the CLI
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (name, version) = s.split_once('#').ok_or_else(|| Error::MalformedDefinition {
            package: s.to_string(),
            reason: "expected 'name#version'".to_string(),
        })?;
        Self::parse(name, version)
    }
}

/// A package as repositories address it: `repository::category/name#version`
///
/// The category groups packages on mirrors and in the download cache; it
/// does not take part in resolution, where names stay unique.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QualifiedId {
    repository: String,
    category: String,
    id: PackageId,
}

impl QualifiedId {
    pub fn new(repository: impl Into<String>, category: impl Into<String>, id: PackageId) -> Result<Self> {
        let repository = repository.into();
        let category = category.into();
        validate_name(&repository)?;
        validate_name(&category)?;
        Ok(Self {
            repository,
            category,
            id,
        })
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    pub fn id(&self) -> &PackageId {
        &self.id
    }

    pub fn name(&self) -> &str {
        self.id.name()
    }

    pub fn version(&self) -> &Version {
        self.id.version()
    }
}

impl fmt::Display for QualifiedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}/{}", self.repository, self.category, self.id)
    }
}

impl FromStr for QualifiedId {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let malformed = || Error::MalformedDefinition {
            package: s.to_string(),
            reason: "expected 'repository::category/name#version'".to_string(),
        };
        let (repository, rest) = s.split_once("::").ok_or_else(malformed)?;
        let (category, id) = rest.split_once('/').ok_or_else(malformed)?;
        Self::new(repository, category, id.parse()?)
    }
}

/// Check that a package or capability name is usable as a directory name
///
/// Names start with an ASCII alphanumeric character and continue with
/// alphanumerics or `.`, `_`, `+`, `-`.
pub fn validate_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) if first.is_ascii_alphanumeric() => {
            chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '+' | '-'))
        }
        _ => false,
    };

    if valid {
        Ok(())
    } else {
        Err(Error::MalformedDefinition {
            package: name.to_string(),
            reason: "invalid package name".to_string(),
        })
    }
}
