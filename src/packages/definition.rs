// src/packages/definition.rs

//! Package definitions and their repository wire format

use super::id::{PackageId, QualifiedId, validate_name};
use crate::error::{Error, Result};
use crate::version::VersionConstraint;
use chrono::{DateTime, Utc};
use semver::Version;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Whether a package carries a payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageKind {
    /// Ships a `data.tar.gz` payload that is unpacked into the installed root
    #[default]
    Effective,
    /// Metadata only; groups dependencies and touches no files
    Virtual,
}

impl PackageKind {
    pub fn as_str(&self) -> &str {
        match self {
            PackageKind::Effective => "effective",
            PackageKind::Virtual => "virtual",
        }
    }
}

impl FromStr for PackageKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "effective" => Ok(PackageKind::Effective),
            "virtual" => Ok(PackageKind::Virtual),
            _ => Err(format!("Invalid package kind: {}", s)),
        }
    }
}

/// Category of packages whose manifest names none
pub const UNCATEGORIZED: &str = "uncategorized";

/// Descriptive fields shown to users; never used for resolution
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageMetadata {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maintainer: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub licenses: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_url: Option<String>,
}

impl PackageMetadata {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

/// A dependency edge: a package name or capability plus a constraint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
    pub target: String,
    pub constraint: VersionConstraint,
    pub optional: bool,
}

impl Dependency {
    /// Create a required dependency
    pub fn required(target: impl Into<String>, constraint: VersionConstraint) -> Self {
        Self {
            target: target.into(),
            constraint,
            optional: false,
        }
    }

    /// Create an optional dependency
    pub fn optional(target: impl Into<String>, constraint: VersionConstraint) -> Self {
        Self {
            target: target.into(),
            constraint,
            optional: true,
        }
    }
}

impl fmt::Display for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.target, self.constraint)?;
        if self.optional {
            f.write_str(" (optional)")?;
        }
        Ok(())
    }
}

/// A conflict edge: no installed package may match it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    pub target: String,
    pub constraint: VersionConstraint,
}

/// A capability provided at a given version
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Provide {
    pub capability: String,
    pub version: Version,
}

/// An immutable package definition from the package universe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageDefinition {
    pub id: PackageId,
    pub kind: PackageKind,
    /// Repository the definition was loaded from
    pub repository: String,
    /// Group the package is filed under on mirrors and in the cache
    pub category: String,
    /// When the archive was built
    pub wrap_date: Option<DateTime<Utc>>,
    pub metadata: PackageMetadata,
    /// SHA-256 of the package archive, hex encoded
    pub checksum: Option<String>,
    pub dependencies: Vec<Dependency>,
    pub conflicts: Vec<Conflict>,
    pub provides: Vec<Provide>,
}

impl PackageDefinition {
    /// Create a definition with no edges
    pub fn new(id: PackageId, repository: impl Into<String>) -> Self {
        Self {
            id,
            kind: PackageKind::Effective,
            repository: repository.into(),
            category: UNCATEGORIZED.to_string(),
            wrap_date: None,
            metadata: PackageMetadata::default(),
            checksum: None,
            dependencies: Vec::new(),
            conflicts: Vec::new(),
            provides: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        self.id.name()
    }

    pub fn version(&self) -> &Version {
        self.id.version()
    }

    /// The address of this package on its repository's mirrors
    pub fn qualified_id(&self) -> Result<QualifiedId> {
        QualifiedId::new(&self.repository, &self.category, self.id.clone())
    }

    /// The version at which this package satisfies `target`, if it does
    ///
    /// Every package provides its own name at its own version; declared
    /// capabilities are checked after that.
    pub fn satisfies(&self, target: &str, constraint: &VersionConstraint) -> Option<&Version> {
        if self.name() == target && constraint.matches(self.version()) {
            return Some(self.version());
        }
        self.provides
            .iter()
            .find(|p| p.capability == target && constraint.matches(&p.version))
            .map(|p| &p.version)
    }

    /// Whether one of this package's conflict edges matches `other`
    ///
    /// A package never conflicts with another version of its own name;
    /// exclusivity by name is enforced separately.
    pub fn conflicts_with(&self, other: &PackageDefinition) -> Option<&Conflict> {
        if self.name() == other.name() {
            return None;
        }
        self.conflicts
            .iter()
            .find(|c| other.satisfies(&c.target, &c.constraint).is_some())
    }

    /// Whether the two packages conflict in either direction
    pub fn clashes_with(&self, other: &PackageDefinition) -> bool {
        self.conflicts_with(other).is_some() || other.conflicts_with(self).is_some()
    }

    /// Reject definitions whose dependencies are satisfied only by themselves
    /// through a declared capability
    fn check_self_satisfying(&self) -> Result<()> {
        for dep in &self.dependencies {
            if dep.target == self.name() {
                continue;
            }
            let self_provided = self
                .provides
                .iter()
                .any(|p| p.capability == dep.target && dep.constraint.matches(&p.version));
            if self_provided {
                return Err(Error::MalformedDefinition {
                    package: self.id.to_string(),
                    reason: format!(
                        "depends on capability '{}' that it provides itself",
                        dep.target
                    ),
                });
            }
        }
        Ok(())
    }
}

impl fmt::Display for PackageDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

/// Package metadata as stored in a repository index
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageManifest {
    pub name: String,
    #[serde(default = "default_category")]
    pub category: String,
    pub version: String,
    #[serde(default)]
    pub kind: PackageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wrap_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "PackageMetadata::is_empty")]
    pub metadata: PackageMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub optional_dependencies: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub conflicts: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub provides: BTreeMap<String, String>,
}

fn default_category() -> String {
    UNCATEGORIZED.to_string()
}

impl PackageManifest {
    /// Create minimal manifest for a package with no edges
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            category: default_category(),
            version: version.into(),
            ..Default::default()
        }
    }

    /// File the package under `category`
    pub fn in_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn described_as(mut self, description: impl Into<String>) -> Self {
        self.metadata.description = description.into();
        self
    }

    /// Add a required dependency
    pub fn depends_on(mut self, target: &str, constraint: &str) -> Self {
        self.dependencies.insert(target.to_string(), constraint.to_string());
        self
    }

    /// Add an optional dependency
    pub fn recommends(mut self, target: &str, constraint: &str) -> Self {
        self.optional_dependencies
            .insert(target.to_string(), constraint.to_string());
        self
    }

    /// Add a conflict
    pub fn conflicts_with(mut self, target: &str, constraint: &str) -> Self {
        self.conflicts.insert(target.to_string(), constraint.to_string());
        self
    }

    /// Add a provided capability
    pub fn provides(mut self, capability: &str, version: &str) -> Self {
        self.provides.insert(capability.to_string(), version.to_string());
        self
    }

    /// Mark the package as virtual
    pub fn virtual_package(mut self) -> Self {
        self.kind = PackageKind::Virtual;
        self
    }

    /// Set the archive checksum
    pub fn with_checksum(mut self, checksum: impl Into<String>) -> Self {
        self.checksum = Some(checksum.into());
        self
    }

    /// Validate the manifest and turn it into a definition
    pub fn into_definition(self, repository: &str) -> Result<PackageDefinition> {
        let id = PackageId::parse(&self.name, &self.version)?;
        let malformed = |reason: String| Error::MalformedDefinition {
            package: id.to_string(),
            reason,
        };
        validate_name(&self.category)
            .map_err(|_| malformed(format!("invalid category '{}'", self.category)))?;

        let parse_edge = |target: &str, constraint: &str| -> Result<VersionConstraint> {
            validate_name(target).map_err(|_| malformed(format!("invalid target '{}'", target)))?;
            constraint.parse().map_err(|e| {
                malformed(format!(
                    "invalid constraint '{}' on '{}': {}",
                    constraint, target, e
                ))
            })
        };

        let mut dependencies = Vec::new();
        for (target, constraint) in &self.dependencies {
            dependencies.push(Dependency::required(target, parse_edge(target, constraint)?));
        }
        for (target, constraint) in &self.optional_dependencies {
            dependencies.push(Dependency::optional(target, parse_edge(target, constraint)?));
        }

        let mut conflicts = Vec::new();
        for (target, constraint) in &self.conflicts {
            conflicts.push(Conflict {
                target: target.clone(),
                constraint: parse_edge(target, constraint)?,
            });
        }

        let mut provides = Vec::new();
        for (capability, version) in &self.provides {
            validate_name(capability)
                .map_err(|_| malformed(format!("invalid capability '{}'", capability)))?;
            let version = Version::parse(version).map_err(|e| {
                malformed(format!(
                    "invalid version '{}' for capability '{}': {}",
                    version, capability, e
                ))
            })?;
            provides.push(Provide {
                capability: capability.clone(),
                version,
            });
        }

        let definition = PackageDefinition {
            id,
            kind: self.kind,
            repository: repository.to_string(),
            category: self.category,
            wrap_date: self.wrap_date,
            metadata: self.metadata,
            checksum: self.checksum.map(|c| c.to_lowercase()),
            dependencies,
            conflicts,
            provides,
        };
        definition.check_self_satisfying()?;
        Ok(definition)
    }
}

impl From<&PackageDefinition> for PackageManifest {
    fn from(def: &PackageDefinition) -> Self {
        let mut manifest = PackageManifest::new(def.name(), def.version().to_string());
        manifest.category = def.category.clone();
        manifest.wrap_date = def.wrap_date;
        manifest.metadata = def.metadata.clone();
        manifest.kind = def.kind;
        manifest.checksum = def.checksum.clone();
        for dep in &def.dependencies {
            let map = if dep.optional {
                &mut manifest.optional_dependencies
            } else {
                &mut manifest.dependencies
            };
            map.insert(dep.target.clone(), dep.constraint.to_string());
        }
        for conflict in &def.conflicts {
            manifest
                .conflicts
                .insert(conflict.target.clone(), conflict.constraint.to_string());
        }
        for provide in &def.provides {
            manifest
                .provides
                .insert(provide.capability.clone(), provide.version.to_string());
        }
        manifest
    }
}
