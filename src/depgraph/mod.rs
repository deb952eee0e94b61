// src/depgraph/mod.rs

//! The dependency graph of installed packages
//!
//! Records are keyed by package name, so at most one version of a name can
//! be installed. Reasons and resolved edges refer to other records by
//! `PackageId` rather than by reference; the whole graph is a plain value
//! that can be cloned, diffed and written out in one piece.

mod store;

pub use store::{DepGraphStore, HistoryEntry, Snapshot, StoreWriter};

use crate::packages::{PackageDefinition, PackageId};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt;

/// Why a package is installed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallReason {
    /// Requested by the user
    Explicit,
    /// Pulled in for the given dependents
    DependencyOf(BTreeSet<PackageId>),
}

impl InstallReason {
    pub fn is_explicit(&self) -> bool {
        matches!(self, InstallReason::Explicit)
    }
}

impl fmt::Display for InstallReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstallReason::Explicit => f.write_str("explicit"),
            InstallReason::DependencyOf(dependents) => {
                let names: Vec<String> = dependents.iter().map(|id| id.to_string()).collect();
                write!(f, "dependency of {}", names.join(", "))
            }
        }
    }
}

/// An installed package
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledRecord {
    /// Snapshot of the definition it was installed from
    pub definition: PackageDefinition,
    pub reason: InstallReason,
    /// Providers chosen for its dependencies
    pub depends_on: BTreeSet<PackageId>,
}

impl InstalledRecord {
    pub fn new(definition: PackageDefinition, reason: InstallReason) -> Self {
        Self {
            definition,
            reason,
            depends_on: BTreeSet::new(),
        }
    }

    pub fn id(&self) -> &PackageId {
        &self.definition.id
    }

    pub fn name(&self) -> &str {
        self.definition.name()
    }
}

/// A broken graph invariant
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvariantViolation {
    /// A required dependency has no installed provider among the resolved edges
    UnsatisfiedDependency { package: PackageId, dependency: String },
    /// Two installed packages conflict
    Conflict { package: PackageId, other: PackageId },
    /// A reason set names a package that is not installed
    DanglingReason { package: PackageId, missing: PackageId },
    /// A resolved edge points at a package that is not installed
    DanglingEdge { package: PackageId, missing: PackageId },
}

impl fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvariantViolation::UnsatisfiedDependency {
                package,
                dependency,
            } => write!(f, "{} has no provider for {}", package, dependency),
            InvariantViolation::Conflict { package, other } => {
                write!(f, "{} conflicts with {}", package, other)
            }
            InvariantViolation::DanglingReason { package, missing } => {
                write!(f, "{} is installed for {}, which is not installed", package, missing)
            }
            InvariantViolation::DanglingEdge { package, missing } => {
                write!(f, "{} depends on {}, which is not installed", package, missing)
            }
        }
    }
}

/// The installed package set
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DepGraph {
    records: BTreeMap<String, InstalledRecord>,
}

impl DepGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record, returning the one it replaces for the same name
    pub fn insert(&mut self, record: InstalledRecord) -> Option<InstalledRecord> {
        self.records.insert(record.name().to_string(), record)
    }

    pub fn remove(&mut self, name: &str) -> Option<InstalledRecord> {
        self.records.remove(name)
    }

    /// The record installed under `name`
    pub fn get(&self, name: &str) -> Option<&InstalledRecord> {
        self.records.get(name)
    }

    /// The record of exactly `id`
    pub fn get_id(&self, id: &PackageId) -> Option<&InstalledRecord> {
        self.records
            .get(id.name())
            .filter(|record| record.id() == id)
    }

    pub fn contains(&self, id: &PackageId) -> bool {
        self.get_id(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records in name order
    pub fn iter(&self) -> impl Iterator<Item = &InstalledRecord> {
        self.records.values()
    }

    pub fn ids(&self) -> impl Iterator<Item = &PackageId> {
        self.records.values().map(|r| r.id())
    }

    /// Records by the packages their resolved edges point at, self edges
    /// left out
    pub fn dependents(&self) -> HashMap<&PackageId, Vec<&InstalledRecord>> {
        let mut dependents: HashMap<&PackageId, Vec<&InstalledRecord>> = HashMap::new();
        for record in self.records.values() {
            for provider in record.depends_on.iter().filter(|p| *p != record.id()) {
                dependents.entry(provider).or_default().push(record);
            }
        }
        dependents
    }

    /// Installed packages not reachable from any explicit package
    pub fn orphans(&self) -> Vec<PackageId> {
        let mut reachable: BTreeSet<&str> = BTreeSet::new();
        let mut queue: VecDeque<&InstalledRecord> = self
            .records
            .values()
            .filter(|r| r.reason.is_explicit())
            .collect();

        while let Some(record) = queue.pop_front() {
            if !reachable.insert(record.name()) {
                continue;
            }
            for dep in &record.depends_on {
                if let Some(next) = self.get_id(dep) {
                    queue.push_back(next);
                }
            }
        }

        self.records
            .values()
            .filter(|r| !reachable.contains(r.name()))
            .map(|r| r.id().clone())
            .collect()
    }

    /// Derive every non-explicit reason from the current dependents
    pub fn recompute_reasons(&mut self) {
        let mut dependents: BTreeMap<String, BTreeSet<PackageId>> = BTreeMap::new();
        for record in self.records.values() {
            for dep in &record.depends_on {
                if dep != record.id() && self.contains(dep) {
                    dependents
                        .entry(dep.name().to_string())
                        .or_default()
                        .insert(record.id().clone());
                }
            }
        }

        for (name, record) in self.records.iter_mut() {
            if !record.reason.is_explicit() {
                record.reason =
                    InstallReason::DependencyOf(dependents.remove(name).unwrap_or_default());
            }
        }
    }

    /// Check the graph invariants, returning every violation found
    pub fn verify(&self) -> Vec<InvariantViolation> {
        let mut violations = Vec::new();

        for record in self.records.values() {
            for edge in &record.depends_on {
                if !self.contains(edge) {
                    violations.push(InvariantViolation::DanglingEdge {
                        package: record.id().clone(),
                        missing: edge.clone(),
                    });
                }
            }

            for dep in record.definition.dependencies.iter().filter(|d| !d.optional) {
                if record.definition.satisfies(&dep.target, &dep.constraint).is_some() {
                    continue;
                }
                let satisfied = record.depends_on.iter().any(|edge| {
                    self.get_id(edge).is_some_and(|provider| {
                        provider
                            .definition
                            .satisfies(&dep.target, &dep.constraint)
                            .is_some()
                    })
                });
                if !satisfied {
                    violations.push(InvariantViolation::UnsatisfiedDependency {
                        package: record.id().clone(),
                        dependency: dep.to_string(),
                    });
                }
            }

            if let InstallReason::DependencyOf(dependents) = &record.reason {
                for dependent in dependents {
                    if !self.contains(dependent) {
                        violations.push(InvariantViolation::DanglingReason {
                            package: record.id().clone(),
                            missing: dependent.clone(),
                        });
                    }
                }
            }
        }

        let records: Vec<&InstalledRecord> = self.records.values().collect();
        for (i, a) in records.iter().enumerate() {
            for b in &records[i + 1..] {
                if a.definition.clashes_with(&b.definition) {
                    violations.push(InvariantViolation::Conflict {
                        package: a.id().clone(),
                        other: b.id().clone(),
                    });
                }
            }
        }

        violations
    }
}

impl FromIterator<InstalledRecord> for DepGraph {
    fn from_iter<T: IntoIterator<Item = InstalledRecord>>(iter: T) -> Self {
        let mut graph = DepGraph::new();
        for record in iter {
            graph.insert(record);
        }
        graph
    }
}
