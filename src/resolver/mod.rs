// src/resolver/mod.rs

//! Dependency resolution
//!
//! The resolver turns a change request into a target package set that is
//! consistent with itself and with what stays installed:
//!
//! - every explicitly installed package that is not being removed stays
//!   satisfiable, preferring the version already installed
//! - removed names are excluded outright, so a removal that would break a
//!   remaining package fails instead of silently dropping it
//! - dependency-only packages are kept where they still fit, or pruned
//!   when the orphan policy says so
//!
//! Failures name the edges that could not be satisfied together.

mod conflict;
mod search;

pub use conflict::{EdgeDescription, EdgeKind, EdgeSource, Unsatisfiable};

use crate::config::OrphanPolicy;
use crate::depgraph::{DepGraph, InstallReason, InstalledRecord, Snapshot};
use crate::error::{Error, Result};
use crate::packages::{PackageId, validate_name};
use crate::universe::Universe;
use crate::version::VersionConstraint;
pub use search::Scope;
use search::{Edge, Problem, Upgrade};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info};

/// A package name or capability with a version constraint, optionally
/// pinned to a repository and category
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    pub name: String,
    pub constraint: VersionConstraint,
    pub scope: Scope,
}

impl Requirement {
    pub fn new(name: impl Into<String>, constraint: VersionConstraint) -> Self {
        Self {
            name: name.into(),
            constraint,
            scope: Scope::default(),
        }
    }

    /// Requirement on any version of `name`
    pub fn any(name: impl Into<String>) -> Self {
        Self::new(name, VersionConstraint::Any)
    }
}

impl FromStr for Requirement {
    type Err = Error;

    /// Parse `[repository::][category/]name[constraint]`, e.g. `lib>=2.0`,
    /// `sys-libs/zlib` or `stable::sys-libs/zlib=1.2.13`
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let mut scope = Scope::default();
        let s = match s.split_once("::") {
            Some((repository, rest)) => {
                validate_name(repository)?;
                scope.repository = Some(repository.to_string());
                rest
            }
            None => s,
        };
        let s = match s.split_once('/') {
            Some((category, rest)) => {
                validate_name(category)?;
                scope.category = Some(category.to_string());
                rest
            }
            None => s,
        };

        let split = s
            .find(|c: char| matches!(c, '<' | '>' | '=' | '^' | '~' | '*' | ' '))
            .unwrap_or(s.len());
        let (name, constraint) = s.split_at(split);

        validate_name(name)?;
        let constraint = constraint.parse().map_err(|e| Error::MalformedDefinition {
            package: s.to_string(),
            reason: format!("invalid version constraint: {}", e),
        })?;
        let mut requirement = Self::new(name, constraint);
        requirement.scope = scope;
        Ok(requirement)
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(repository) = &self.scope.repository {
            write!(f, "{}::", repository)?;
        }
        if let Some(category) = &self.scope.category {
            write!(f, "{}/", category)?;
        }
        if self.constraint.is_any() {
            f.write_str(&self.name)
        } else {
            write!(f, "{}{}", self.name, self.constraint)
        }
    }
}

/// Which installed packages an upgrade covers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpgradeTarget {
    All,
    Packages(Vec<String>),
}

/// A user-requested change of the installed set
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeRequest {
    Install(Vec<Requirement>),
    Remove(Vec<String>),
    Upgrade(UpgradeTarget),
}

impl fmt::Display for ChangeRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeRequest::Install(requirements) => {
                f.write_str("install")?;
                for requirement in requirements {
                    write!(f, " {}", requirement)?;
                }
                Ok(())
            }
            ChangeRequest::Remove(names) => write!(f, "uninstall {}", names.join(" ")),
            ChangeRequest::Upgrade(UpgradeTarget::All) => f.write_str("upgrade"),
            ChangeRequest::Upgrade(UpgradeTarget::Packages(names)) => {
                write!(f, "upgrade {}", names.join(" "))
            }
        }
    }
}

/// Knobs of a resolution pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolveOptions {
    pub orphans: OrphanPolicy,
}

/// The result of a successful resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetSet {
    /// The installed graph after the change
    pub graph: DepGraph,
    /// Generation of the snapshot this was computed against
    pub base_generation: u64,
    /// Dependency-only packages nothing explicit needs anymore: kept ones
    /// under the report policy, dropped ones under the prune policy
    pub orphans: Vec<PackageId>,
    /// Human-readable request, recorded in the history
    pub description: String,
}

/// Resolves change requests against a universe and an installed snapshot
pub struct Resolver<'a> {
    universe: &'a Universe,
    snapshot: &'a Snapshot,
    options: ResolveOptions,
}

impl<'a> Resolver<'a> {
    pub fn new(universe: &'a Universe, snapshot: &'a Snapshot) -> Self {
        Self {
            universe,
            snapshot,
            options: ResolveOptions::default(),
        }
    }

    pub fn with_options(mut self, options: ResolveOptions) -> Self {
        self.options = options;
        self
    }

    /// Compute the target set for `request`
    pub fn resolve(&self, request: &ChangeRequest) -> Result<TargetSet> {
        info!("Resolving: {}", request);
        let installed = &self.snapshot.graph;

        let mut edges = Vec::new();
        let mut absent = BTreeSet::new();
        let mut upgrade = Upgrade::Nothing;

        match request {
            ChangeRequest::Install(requirements) => {
                for requirement in requirements {
                    if !self.is_known(&requirement.name, &requirement.scope) {
                        return Err(Error::PackageNotFound(requirement.to_string()));
                    }
                    edges.push(Edge {
                        source: EdgeSource::Request,
                        target: requirement.name.clone(),
                        constraint: requirement.constraint.clone(),
                        optional: false,
                        scope: requirement.scope.clone(),
                    });
                }
            }
            ChangeRequest::Remove(names) => {
                for name in names {
                    if installed.get(name).is_none() {
                        return Err(Error::NotInstalled(name.clone()));
                    }
                    absent.insert(name.clone());
                }
            }
            ChangeRequest::Upgrade(UpgradeTarget::All) => upgrade = Upgrade::All,
            ChangeRequest::Upgrade(UpgradeTarget::Packages(names)) => {
                for name in names {
                    if installed.get(name).is_none() {
                        return Err(Error::NotInstalled(name.clone()));
                    }
                }
                upgrade = Upgrade::Names(names.iter().cloned().collect());
            }
        }

        let mut retained = Vec::new();
        for record in installed.iter() {
            let name = record.name();
            if absent.contains(name) {
                continue;
            }
            if record.reason.is_explicit() {
                edges.push(Edge {
                    source: EdgeSource::Explicit,
                    target: name.to_string(),
                    constraint: VersionConstraint::Any,
                    optional: false,
                    scope: Scope::default(),
                });
            } else if self.options.orphans == OrphanPolicy::Report {
                let constraint = if upgrade.includes(name) {
                    VersionConstraint::Any
                } else {
                    VersionConstraint::exact(record.id().version())
                };
                retained.push(Edge {
                    source: EdgeSource::Retained,
                    target: name.to_string(),
                    constraint,
                    optional: true,
                    scope: Scope::default(),
                });
            }
        }

        debug!(
            "Seeded search with {} edges, {} retained, {} removed names",
            edges.len(),
            retained.len(),
            absent.len()
        );

        let problem = Problem {
            universe: self.universe,
            installed,
            edges,
            retained,
            absent,
            upgrade,
        };
        let solution = search::solve(&problem)?;

        let mut graph: DepGraph = solution
            .into_iter()
            .map(|resolved| InstalledRecord {
                definition: resolved.definition.clone(),
                reason: if resolved.explicit {
                    InstallReason::Explicit
                } else {
                    InstallReason::DependencyOf(BTreeSet::new())
                },
                depends_on: resolved.depends_on,
            })
            .collect();
        graph.recompute_reasons();

        let orphans = match self.options.orphans {
            OrphanPolicy::Report => graph.orphans(),
            OrphanPolicy::Prune => installed
                .iter()
                .filter(|r| !r.reason.is_explicit())
                .filter(|r| !problem.absent.contains(r.name()))
                .filter(|r| graph.get(r.name()).is_none())
                .map(|r| r.id().clone())
                .collect(),
        };

        info!(
            "Resolved {} packages ({} orphaned)",
            graph.len(),
            orphans.len()
        );

        Ok(TargetSet {
            graph,
            base_generation: self.snapshot.generation,
            orphans,
            description: request.to_string(),
        })
    }

    /// Whether some definition or installed package in `scope` answers to `target`
    fn is_known(&self, target: &str, scope: &Scope) -> bool {
        if scope.is_any() && self.universe.knows(target) {
            return true;
        }
        self.universe
            .lookup(target, &VersionConstraint::Any)
            .into_iter()
            .chain(self.snapshot.graph.iter().map(|r| &r.definition))
            .any(|def| scope.admits(def) && def.satisfies(target, &VersionConstraint::Any).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packages::PackageManifest;

    fn universe(manifests: Vec<PackageManifest>) -> Universe {
        Universe::from_repositories([("stable", manifests)]).unwrap()
    }

    fn id(name: &str, version: &str) -> PackageId {
        PackageId::parse(name, version).unwrap()
    }

    fn install(names: &[&str]) -> ChangeRequest {
        ChangeRequest::Install(names.iter().map(|n| n.parse().unwrap()).collect())
    }

    fn remove(names: &[&str]) -> ChangeRequest {
        ChangeRequest::Remove(names.iter().map(|n| n.to_string()).collect())
    }

    fn empty() -> Snapshot {
        Snapshot {
            graph: DepGraph::new(),
            generation: 0,
        }
    }

    /// Resolve against `snapshot` and pretend the result was committed
    fn step(
        universe: &Universe,
        snapshot: &Snapshot,
        request: &ChangeRequest,
        orphans: OrphanPolicy,
    ) -> Result<Snapshot> {
        let target = Resolver::new(universe, snapshot)
            .with_options(ResolveOptions { orphans })
            .resolve(request)?;
        assert!(target.graph.verify().is_empty(), "{:?}", target.graph.verify());
        Ok(Snapshot {
            graph: target.graph,
            generation: snapshot.generation + 1,
        })
    }

    fn installed_ids(snapshot: &Snapshot) -> Vec<String> {
        snapshot.graph.ids().map(|id| id.to_string()).collect()
    }

    fn unsatisfiable(result: Result<impl fmt::Debug>) -> Unsatisfiable {
        match result {
            Err(Error::Unsatisfiable(u)) => u,
            other => panic!("expected Unsatisfiable, got {:?}", other),
        }
    }

    #[test]
    fn test_dependency_pulled_in() {
        let universe = universe(vec![
            PackageManifest::new("app", "1.0.0").depends_on("lib", ">=2.0"),
            PackageManifest::new("lib", "2.3.0"),
        ]);
        let snapshot = empty();
        let target = Resolver::new(&universe, &snapshot)
            .resolve(&install(&["app"]))
            .unwrap();

        let ids: Vec<String> = target.graph.ids().map(|id| id.to_string()).collect();
        assert_eq!(ids, ["app#1.0.0", "lib#2.3.0"]);
        assert_eq!(
            target.graph.get("lib").unwrap().reason,
            InstallReason::DependencyOf([id("app", "1.0.0")].into_iter().collect())
        );
        assert!(target.graph.get("app").unwrap().reason.is_explicit());
        assert_eq!(target.description, "install app");
    }

    #[test]
    fn test_unsatisfiable_names_the_edge() {
        let universe = universe(vec![
            PackageManifest::new("app", "1.0.0").depends_on("lib", ">=2.0"),
            PackageManifest::new("lib", "1.9.0"),
        ]);
        let snapshot = empty();
        let err = unsatisfiable(Resolver::new(&universe, &snapshot).resolve(&install(&["app"])));
        assert!(err.mentions("app#1.0.0 -> lib >=2.0"), "{}", err);
    }

    #[test]
    fn test_newest_version_preferred() {
        let universe = universe(vec![
            PackageManifest::new("some-library", "1.0.0"),
            PackageManifest::new("some-library", "3.0.0"),
            PackageManifest::new("some-library", "2.0.0"),
        ]);
        let snapshot = empty();
        let target = Resolver::new(&universe, &snapshot)
            .resolve(&install(&["some-library"]))
            .unwrap();
        assert!(target.graph.contains(&id("some-library", "3.0.0")));
    }

    #[test]
    fn test_backtracks_to_older_version() {
        // The newest app needs a lib that conflicts with an installed tool
        let universe = universe(vec![
            PackageManifest::new("app", "2.0.0").depends_on("lib", ">=2"),
            PackageManifest::new("app", "1.0.0").depends_on("lib", "<2"),
            PackageManifest::new("lib", "2.0.0").conflicts_with("tool", "*"),
            PackageManifest::new("lib", "1.0.0"),
            PackageManifest::new("tool", "1.0.0"),
        ]);
        let snapshot = step(&universe, &empty(), &install(&["tool"]), OrphanPolicy::Report).unwrap();
        let snapshot = step(&universe, &snapshot, &install(&["app"]), OrphanPolicy::Report).unwrap();

        assert_eq!(installed_ids(&snapshot), ["app#1.0.0", "lib#1.0.0", "tool#1.0.0"]);
    }

    #[test]
    fn test_incompatible_requests_fail() {
        let universe = universe(vec![
            PackageManifest::new("a", "1.0.0").depends_on("x", "=1.0.0"),
            PackageManifest::new("b", "1.0.0").depends_on("x", "=2.0.0"),
            PackageManifest::new("x", "1.0.0"),
            PackageManifest::new("x", "2.0.0"),
        ]);
        let snapshot = empty();
        let err = unsatisfiable(Resolver::new(&universe, &snapshot).resolve(&install(&["a", "b"])));
        assert!(err.mentions("a#1.0.0 -> x =1.0.0"), "{}", err);
        assert!(err.mentions("b#1.0.0 -> x =2.0.0"), "{}", err);
    }

    #[test]
    fn test_capability_provider() {
        let universe = universe(vec![
            PackageManifest::new("browser", "1.0.0").depends_on("tls", ">=1.2"),
            PackageManifest::new("openssl", "3.0.2").provides("tls", "1.3.0"),
        ]);
        let snapshot = empty();
        let target = Resolver::new(&universe, &snapshot)
            .resolve(&install(&["browser"]))
            .unwrap();
        let browser = target.graph.get("browser").unwrap();
        assert_eq!(
            browser.depends_on,
            [id("openssl", "3.0.2")].into_iter().collect()
        );
    }

    #[test]
    fn test_mutual_dependency_and_self_cycle() {
        let universe = universe(vec![
            PackageManifest::new("a", "1.0.0").depends_on("b", "*"),
            PackageManifest::new("b", "1.0.0").depends_on("a", "*"),
            PackageManifest::new("solo", "1.0.0").depends_on("solo", "1.0.0"),
        ]);
        let snapshot = empty();
        let target = Resolver::new(&universe, &snapshot)
            .resolve(&install(&["a", "solo"]))
            .unwrap();

        assert_eq!(target.graph.len(), 3);
        assert!(target.graph.get("a").unwrap().depends_on.contains(&id("b", "1.0.0")));
        assert!(target.graph.get("b").unwrap().depends_on.contains(&id("a", "1.0.0")));
        assert!(target.graph.get("solo").unwrap().depends_on.is_empty());
        assert!(target.graph.verify().is_empty());
    }

    #[test]
    fn test_optional_dependency() {
        let universe = universe(vec![
            PackageManifest::new("editor", "1.0.0")
                .recommends("spell", "*")
                .recommends("missing-plugin", "*"),
            PackageManifest::new("spell", "1.0.0"),
        ]);
        let snapshot = empty();
        let target = Resolver::new(&universe, &snapshot)
            .resolve(&install(&["editor"]))
            .unwrap();
        assert!(target.graph.contains(&id("spell", "1.0.0")));
        assert_eq!(target.graph.len(), 2);
    }

    #[test]
    fn test_optional_dependency_skipped_on_conflict() {
        let universe = universe(vec![
            PackageManifest::new("editor", "1.0.0").recommends("spell", "*"),
            PackageManifest::new("spell", "1.0.0").conflicts_with("tool", "*"),
            PackageManifest::new("tool", "1.0.0"),
        ]);
        let snapshot = empty();
        let target = Resolver::new(&universe, &snapshot)
            .resolve(&install(&["tool", "editor"]))
            .unwrap();
        assert_eq!(target.graph.len(), 2);
        assert!(target.graph.get("spell").is_none());
    }

    #[test]
    fn test_removal_blocked_by_dependent() {
        let universe = universe(vec![
            PackageManifest::new("app", "1.0.0").depends_on("lib", ">=2.0"),
            PackageManifest::new("lib", "2.3.0"),
        ]);
        let snapshot = step(&universe, &empty(), &install(&["app", "lib"]), OrphanPolicy::Report).unwrap();

        let err = unsatisfiable(Resolver::new(&universe, &snapshot).resolve(&remove(&["lib"])));
        assert!(err.mentions("app#1.0.0 -> lib >=2.0"), "{}", err);
        assert!(err.mentions("request removes lib"), "{}", err);

        // Removing both is fine
        let snapshot = step(&universe, &snapshot, &remove(&["app", "lib"]), OrphanPolicy::Report).unwrap();
        assert!(snapshot.graph.is_empty());
    }

    #[test]
    fn test_orphans_reported_or_pruned() {
        let universe = universe(vec![
            PackageManifest::new("app", "1.0.0").depends_on("lib", ">=2.0"),
            PackageManifest::new("lib", "2.3.0"),
        ]);
        let installed = step(&universe, &empty(), &install(&["app"]), OrphanPolicy::Report).unwrap();

        let reported = Resolver::new(&universe, &installed)
            .resolve(&remove(&["app"]))
            .unwrap();
        assert_eq!(reported.orphans, vec![id("lib", "2.3.0")]);
        assert!(reported.graph.contains(&id("lib", "2.3.0")));

        let pruned = Resolver::new(&universe, &installed)
            .with_options(ResolveOptions {
                orphans: OrphanPolicy::Prune,
            })
            .resolve(&remove(&["app"]))
            .unwrap();
        assert_eq!(pruned.orphans, vec![id("lib", "2.3.0")]);
        assert!(pruned.graph.is_empty());
    }

    #[test]
    fn test_installed_version_kept_and_upgrade() {
        let old = universe(vec![
            PackageManifest::new("app", "1.0.0").depends_on("lib", ">=1"),
            PackageManifest::new("lib", "1.0.0"),
        ]);
        let installed = step(&old, &empty(), &install(&["app"]), OrphanPolicy::Report).unwrap();

        let new = universe(vec![
            PackageManifest::new("app", "1.0.0").depends_on("lib", ">=1"),
            PackageManifest::new("app", "1.1.0").depends_on("lib", ">=1"),
            PackageManifest::new("lib", "1.0.0"),
            PackageManifest::new("lib", "1.5.0"),
            PackageManifest::new("other", "1.0.0").depends_on("lib", "*"),
        ]);

        // Unrelated installs keep what is there
        let more = step(&new, &installed, &install(&["other"]), OrphanPolicy::Report).unwrap();
        assert_eq!(installed_ids(&more), ["app#1.0.0", "lib#1.0.0", "other#1.0.0"]);

        // Upgrading one name leaves its dependencies alone
        let app_only = step(
            &new,
            &installed,
            &ChangeRequest::Upgrade(UpgradeTarget::Packages(vec!["app".to_string()])),
            OrphanPolicy::Report,
        )
        .unwrap();
        assert_eq!(installed_ids(&app_only), ["app#1.1.0", "lib#1.0.0"]);

        let everything = step(
            &new,
            &installed,
            &ChangeRequest::Upgrade(UpgradeTarget::All),
            OrphanPolicy::Report,
        )
        .unwrap();
        assert_eq!(installed_ids(&everything), ["app#1.1.0", "lib#1.5.0"]);
    }

    #[test]
    fn test_installed_package_missing_from_repositories_stays() {
        let old = universe(vec![PackageManifest::new("legacy", "0.9.0")]);
        let installed = step(&old, &empty(), &install(&["legacy"]), OrphanPolicy::Report).unwrap();

        let new = universe(vec![PackageManifest::new("app", "1.0.0")]);
        let after = step(&new, &installed, &install(&["app"]), OrphanPolicy::Report).unwrap();
        assert_eq!(installed_ids(&after), ["app#1.0.0", "legacy#0.9.0"]);
    }

    #[test]
    fn test_unknown_and_not_installed() {
        let universe = universe(vec![PackageManifest::new("app", "1.0.0")]);
        let snapshot = empty();
        let resolver = Resolver::new(&universe, &snapshot);

        assert!(matches!(
            resolver.resolve(&install(&["ghost"])),
            Err(Error::PackageNotFound(name)) if name == "ghost"
        ));
        assert!(matches!(
            resolver.resolve(&remove(&["app"])),
            Err(Error::NotInstalled(name)) if name == "app"
        ));
        assert!(matches!(
            resolver.resolve(&ChangeRequest::Upgrade(UpgradeTarget::Packages(vec![
                "app".to_string()
            ]))),
            Err(Error::NotInstalled(_))
        ));
    }

    #[test]
    fn test_reinstall_marks_dependency_explicit() {
        let universe = universe(vec![
            PackageManifest::new("app", "1.0.0").depends_on("lib", "*"),
            PackageManifest::new("lib", "2.3.0"),
        ]);
        let installed = step(&universe, &empty(), &install(&["app"]), OrphanPolicy::Report).unwrap();
        let after = step(&universe, &installed, &install(&["lib"]), OrphanPolicy::Report).unwrap();

        assert!(after.graph.get("lib").unwrap().reason.is_explicit());
        let after = step(&universe, &after, &remove(&["app"]), OrphanPolicy::Prune).unwrap();
        assert_eq!(installed_ids(&after), ["lib#2.3.0"]);
    }

    /// Versions of `p0..p{length}`, each depending on the next two packages
    fn chain(length: usize, versions: &[&str]) -> Vec<PackageManifest> {
        let mut manifests = Vec::new();
        for i in 0..length {
            for version in versions {
                let mut manifest = PackageManifest::new(format!("p{}", i), *version);
                for next in [i + 1, i + 2].into_iter().filter(|&n| n < length) {
                    manifest = manifest.depends_on(&format!("p{}", next), "*");
                }
                manifests.push(manifest);
            }
        }
        manifests
    }

    #[test]
    fn test_long_chain_resolves() {
        let universe = universe(chain(5000, &["1.0.0"]));
        let snapshot = step(&universe, &empty(), &install(&["p0"]), OrphanPolicy::Report).unwrap();

        assert_eq!(snapshot.graph.len(), 5000);
        assert!(snapshot.graph.get("p0").unwrap().reason.is_explicit());
        assert_eq!(snapshot.graph.get("p4998").unwrap().depends_on.len(), 1);
    }

    #[test]
    fn test_long_chain_of_decisions_backjumps_at_the_tail() {
        // Every package has two versions; only the newest tail is broken
        let mut manifests = chain(2000, &["1.0.0", "2.0.0"]);
        for manifest in manifests.iter_mut() {
            if manifest.name == "p1999" && manifest.version == "2.0.0" {
                *manifest = PackageManifest::new("p1999", "2.0.0").depends_on("missing", "*");
            }
        }
        let universe = universe(manifests);
        let snapshot = step(&universe, &empty(), &install(&["p0"]), OrphanPolicy::Report).unwrap();

        assert_eq!(snapshot.graph.len(), 2000);
        assert!(snapshot.graph.contains(&id("p1998", "2.0.0")));
        assert!(snapshot.graph.contains(&id("p1999", "1.0.0")));
    }

    #[test]
    fn test_scoped_requirement_picks_category_and_repository() {
        let universe = Universe::from_repositories([
            (
                "stable",
                vec![
                    PackageManifest::new("zlib", "1.2.13").in_category("sys-libs"),
                    PackageManifest::new("tool", "1.0.0").in_category("dev-util"),
                ],
            ),
            (
                "testing",
                vec![PackageManifest::new("zlib", "1.3.0").in_category("sys-libs")],
            ),
        ])
        .unwrap();
        let snapshot = empty();
        let resolver = Resolver::new(&universe, &snapshot);

        // Repository priority wins without a repository in the request
        let request = ChangeRequest::Install(vec!["sys-libs/zlib".parse().unwrap()]);
        let target = resolver.resolve(&request).unwrap();
        assert!(target.graph.contains(&id("zlib", "1.2.13")));

        let request = ChangeRequest::Install(vec!["testing::sys-libs/zlib".parse().unwrap()]);
        let target = resolver.resolve(&request).unwrap();
        assert!(target.graph.contains(&id("zlib", "1.3.0")));

        let request = ChangeRequest::Install(vec!["dev-util/zlib".parse().unwrap()]);
        assert!(matches!(
            resolver.resolve(&request),
            Err(Error::PackageNotFound(name)) if name == "dev-util/zlib"
        ));
    }

    #[test]
    fn test_requirement_parsing() {
        let req: Requirement = "lib>=2.0".parse().unwrap();
        assert_eq!(req.name, "lib");
        assert_eq!(req.to_string(), "lib>=2.0");

        let req: Requirement = "stable::sys-libs/zlib=1.2.13".parse().unwrap();
        assert_eq!(req.name, "zlib");
        assert_eq!(req.scope.repository.as_deref(), Some("stable"));
        assert_eq!(req.scope.category.as_deref(), Some("sys-libs"));
        assert_eq!(req.to_string(), "stable::sys-libs/zlib=1.2.13");

        let req: Requirement = "sys-libs/zlib".parse().unwrap();
        assert!(req.scope.repository.is_none());
        assert_eq!(req.to_string(), "sys-libs/zlib");

        let req: Requirement = "app".parse().unwrap();
        assert!(req.constraint.is_any());
        assert_eq!(req.to_string(), "app");

        assert!("lib>=two".parse::<Requirement>().is_err());
        assert!(">=2".parse::<Requirement>().is_err());
    }
}
