// src/resolver/conflict.rs

//! Diagnostics for failed resolutions

use crate::packages::PackageId;
use crate::version::VersionConstraint;
use std::fmt;

/// Where an edge comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EdgeSource {
    /// The change request itself
    Request,
    /// An explicitly installed package that must stay satisfiable
    Explicit,
    /// A dependency-only package kept while it still fits
    Retained,
    /// A dependency or conflict declared by a package
    Package(PackageId),
}

impl fmt::Display for EdgeSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EdgeSource::Request => f.write_str("request"),
            EdgeSource::Explicit => f.write_str("installed"),
            EdgeSource::Retained => f.write_str("retained"),
            EdgeSource::Package(id) => write!(f, "{}", id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
    Requires,
    Conflicts,
    Removes,
}

/// One edge taking part in a resolution failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgeDescription {
    pub source: EdgeSource,
    pub kind: EdgeKind,
    pub target: String,
    pub constraint: VersionConstraint,
}

impl EdgeDescription {
    pub fn requires(source: EdgeSource, target: &str, constraint: &VersionConstraint) -> Self {
        Self {
            source,
            kind: EdgeKind::Requires,
            target: target.to_string(),
            constraint: constraint.clone(),
        }
    }

    pub fn conflicts(source: &PackageId, target: &str, constraint: &VersionConstraint) -> Self {
        Self {
            source: EdgeSource::Package(source.clone()),
            kind: EdgeKind::Conflicts,
            target: target.to_string(),
            constraint: constraint.clone(),
        }
    }

    pub fn removes(target: &str) -> Self {
        Self {
            source: EdgeSource::Request,
            kind: EdgeKind::Removes,
            target: target.to_string(),
            constraint: VersionConstraint::Any,
        }
    }
}

impl fmt::Display for EdgeDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            EdgeKind::Requires => {
                write!(f, "{} -> {} {}", self.source, self.target, self.constraint)
            }
            EdgeKind::Conflicts => write!(
                f,
                "{} conflicts with {} {}",
                self.source, self.target, self.constraint
            ),
            EdgeKind::Removes => write!(f, "{} removes {}", self.source, self.target),
        }
    }
}

/// No package set satisfies the request together with the installed state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsatisfiable {
    /// Edges that together cannot be satisfied
    pub edges: Vec<EdgeDescription>,
}

impl Unsatisfiable {
    /// Whether an edge renders exactly as `text`
    pub fn mentions(&self, text: &str) -> bool {
        self.edges.iter().any(|e| e.to_string() == text)
    }
}

impl fmt::Display for Unsatisfiable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Unsatisfiable request; conflicting edges:")?;
        for edge in &self.edges {
            write!(f, "\n  {}", edge)?;
        }
        Ok(())
    }
}

impl std::error::Error for Unsatisfiable {}
