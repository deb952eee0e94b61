// src/lib.rs

//! Nest Package Manager core
//!
//! Dependency resolution and atomic, rollback-safe transactions over an
//! installed package root.
//!
//! # Architecture
//!
//! - Repositories: prioritized, mirrored JSON indexes synced into `available`
//! - Universe: read-only index of every available package definition
//! - Depgraph: installed packages, their reasons and resolved edges, kept in
//!   SQLite with a generation counter
//! - Resolver: backtracking search from a change request to a target set
//! - Transactions: ordered steps, journaled on disk, committed or rolled back
//!   as a whole

pub mod cache;
pub mod config;
pub mod db;
pub mod depgraph;
mod error;
pub mod filesystem;
pub mod hash;
pub mod hooks;
pub mod packages;
pub mod repository;
pub mod resolver;
pub mod transaction;
pub mod universe;
pub mod version;

pub use config::Config;
pub use error::{Error, Result};
pub use resolver::{ChangeRequest, Requirement, Resolver, Scope, TargetSet, UpgradeTarget};
pub use transaction::{TransactionEngine, TransactionOutcome};
pub use universe::Universe;
