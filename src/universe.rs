// src/universe.rs

//! Package universe
//!
//! An in-memory index over every definition from the synced repositories.
//! Lookups go by package name or by provided capability and return
//! candidates in resolution order: repository priority, then version
//! descending, then direct name matches before capability providers.

use crate::error::{Error, Result};
use crate::packages::{PackageDefinition, PackageId, PackageManifest};
use crate::repository::{Repository, RepositoryIndex};
use crate::version::VersionConstraint;
use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::{debug, info, warn};

/// A definition that could not be loaded
#[derive(Debug)]
pub struct RejectedDefinition {
    pub repository: String,
    pub error: Error,
}

/// Read-only index of the available package definitions
#[derive(Debug, Default)]
pub struct Universe {
    definitions: Vec<PackageDefinition>,
    /// Repository name -> priority (0 is highest)
    priorities: HashMap<String, usize>,
    /// Package name or capability -> definition indices
    by_target: HashMap<String, Vec<usize>>,
    rejected: Vec<RejectedDefinition>,
}

impl Universe {
    /// Build a universe from in-memory repositories, highest priority first
    pub fn from_repositories<I, S>(repositories: I) -> Result<Self>
    where
        I: IntoIterator<Item = (S, Vec<PackageManifest>)>,
        S: Into<String>,
    {
        let mut universe = Universe::default();
        let mut supplied = 0;

        for (priority, (name, manifests)) in repositories.into_iter().enumerate() {
            supplied += manifests.len();
            universe.add_repository(name.into(), priority, manifests);
        }

        universe.finish(supplied)
    }

    /// Load the synced index of every configured repository
    ///
    /// Repositories that were never synced are skipped with a warning.
    pub fn load(available_dir: &Path, repositories: &[Repository]) -> Result<Self> {
        let mut universe = Universe::default();
        let mut supplied = 0;

        for repo in repositories {
            let path = repo.index_path(available_dir);
            if !path.exists() {
                warn!(
                    "Repository {} has not been synced yet (missing {})",
                    repo.name(),
                    path.display()
                );
                continue;
            }

            let index = RepositoryIndex::read(&path)?;
            supplied += index.packages.len();
            universe.add_repository(repo.name().to_string(), repo.priority(), index.packages);
        }

        let universe = universe.finish(supplied)?;
        info!(
            "Loaded {} package definitions from {} repositories",
            universe.len(),
            universe.priorities.len()
        );
        Ok(universe)
    }

    fn add_repository(&mut self, name: String, priority: usize, manifests: Vec<PackageManifest>) {
        debug!("Indexing repository {} (priority {})", name, priority);
        self.priorities.insert(name.clone(), priority);

        let mut seen: HashSet<PackageId> = HashSet::new();
        for manifest in manifests {
            let result = manifest.into_definition(&name).and_then(|def| {
                if seen.insert(def.id.clone()) {
                    Ok(def)
                } else {
                    Err(Error::MalformedDefinition {
                        package: def.id.to_string(),
                        reason: format!("declared twice in repository '{}'", name),
                    })
                }
            });

            match result {
                Ok(def) => self.insert(def),
                Err(error) => {
                    warn!("Skipping definition from {}: {}", name, error);
                    self.rejected.push(RejectedDefinition {
                        repository: name.clone(),
                        error,
                    });
                }
            }
        }
    }

    fn insert(&mut self, def: PackageDefinition) {
        let index = self.definitions.len();
        self.by_target
            .entry(def.name().to_string())
            .or_default()
            .push(index);
        for provide in &def.provides {
            let entry = self.by_target.entry(provide.capability.clone()).or_default();
            if !entry.contains(&index) {
                entry.push(index);
            }
        }
        self.definitions.push(def);
    }

    fn finish(self, supplied: usize) -> Result<Self> {
        if supplied > 0 && self.definitions.is_empty() {
            return Err(Error::MalformedDefinition {
                package: "*".to_string(),
                reason: format!("all {} supplied definitions were rejected", supplied),
            });
        }
        Ok(self)
    }

    /// Definitions satisfying `constraint` on `target`, in resolution order
    pub fn lookup(&self, target: &str, constraint: &VersionConstraint) -> Vec<&PackageDefinition> {
        let Some(indices) = self.by_target.get(target) else {
            return Vec::new();
        };

        let mut matches: Vec<(usize, Reverse<&semver::Version>, bool, &PackageDefinition)> =
            indices
                .iter()
                .map(|&i| &self.definitions[i])
                .filter_map(|def| {
                    def.satisfies(target, constraint).map(|version| {
                        (
                            self.priority_of(def),
                            Reverse(version),
                            def.name() != target,
                            def,
                        )
                    })
                })
                .collect();

        matches.sort_by(|a, b| (a.0, a.1, a.2).cmp(&(b.0, b.1, b.2)));
        matches.into_iter().map(|(_, _, _, def)| def).collect()
    }

    /// The highest priority definition of an exact PackageId
    pub fn get(&self, id: &PackageId) -> Option<&PackageDefinition> {
        self.by_target
            .get(id.name())?
            .iter()
            .map(|&i| &self.definitions[i])
            .filter(|def| &def.id == id)
            .min_by_key(|def| self.priority_of(def))
    }

    /// Whether any definition is named `target` or provides it
    pub fn knows(&self, target: &str) -> bool {
        self.by_target.contains_key(target)
    }

    /// Repository priority of a definition; unknown repositories sort last
    pub fn priority_of(&self, def: &PackageDefinition) -> usize {
        self.priorities
            .get(&def.repository)
            .copied()
            .unwrap_or(usize::MAX)
    }

    /// Definitions skipped while loading
    pub fn rejected(&self) -> &[RejectedDefinition] {
        &self.rejected
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PackageDefinition> {
        self.definitions.iter()
    }
}
