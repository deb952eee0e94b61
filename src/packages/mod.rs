// src/packages/mod.rs

//! Requirement model for Nest
//!
//! Value types for package identifiers, dependency, conflict and capability
//! declarations, and the repository manifest format they are loaded from.

mod definition;
mod id;

pub use definition::{
    Conflict, Dependency, PackageDefinition, PackageKind, PackageManifest, PackageMetadata, Provide,
    UNCATEGORIZED,
};
pub use id::{PackageId, QualifiedId, validate_name};
