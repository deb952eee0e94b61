// src/depgraph/store.rs

//! Persistence of the dependency graph
//!
//! The graph lives in a SQLite database. Readers take a [`Snapshot`] in a
//! read transaction; the single writer holds `BEGIN EXCLUSIVE` from the
//! confirmed plan until commit or rollback and replaces the whole record set
//! at commit.
//! Every commit bumps a generation counter that snapshots are validated
//! against.

use super::{DepGraph, InstallReason, InstalledRecord};
use crate::db::models::{
    self, InstalledPackage, LinkTable, PackageLink, PackageRelation, RelationKind,
    TransactionRecord,
};
use crate::db;
use crate::error::{Error, Result};
use crate::packages::{Conflict, Dependency, PackageDefinition, PackageId, PackageKind, Provide};
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use semver::Version;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// A committed transaction as listed by `history`
pub type HistoryEntry = TransactionRecord;

/// The installed graph as of one generation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub graph: DepGraph,
    pub generation: u64,
}

/// Handle to the depgraph database
#[derive(Debug, Clone)]
pub struct DepGraphStore {
    path: PathBuf,
    busy_timeout: Duration,
}

impl DepGraphStore {
    /// Open the store, creating and migrating the database if needed
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        db::init(&path)?;
        Ok(Self {
            path,
            busy_timeout: Duration::from_millis(db::BUSY_TIMEOUT_MS),
        })
    }

    /// How long [`lock`](Self::lock) waits for another writer
    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the installed graph and its generation consistently
    pub fn snapshot(&self) -> Result<Snapshot> {
        let mut conn = db::open(&self.path)?;
        db::transaction(&mut conn, |tx| {
            Ok(Snapshot {
                graph: load_graph(tx)?,
                generation: models::get_generation(tx)?,
            })
        })
    }

    /// Current generation without loading the graph
    pub fn generation(&self) -> Result<u64> {
        let conn = db::open(&self.path)?;
        models::get_generation(&conn)
    }

    /// Committed transactions, newest first
    pub fn history(&self) -> Result<Vec<HistoryEntry>> {
        let conn = db::open(&self.path)?;
        TransactionRecord::list_all(&conn)
    }

    /// Take the exclusive write lock at whatever generation is current
    ///
    /// Only the transaction engine locks, so that crash recovery always runs
    /// first. Gives up with [`Error::StoreBusy`] when another writer holds
    /// the lock for longer than the busy timeout.
    pub(crate) fn lock(&self) -> Result<StoreWriter> {
        let conn = db::open(&self.path)?;
        conn.busy_timeout(self.busy_timeout)?;
        conn.execute_batch("BEGIN EXCLUSIVE").map_err(|e| {
            if e.sqlite_error_code() == Some(rusqlite::ErrorCode::DatabaseBusy) {
                warn!("Depgraph at {} is locked by another writer", self.path.display());
                Error::StoreBusy(self.path.clone())
            } else {
                Error::Database(e)
            }
        })?;

        let mut writer = StoreWriter {
            conn,
            generation: 0,
            finished: false,
        };
        writer.generation = models::get_generation(&writer.conn)?;
        debug!("Acquired depgraph lock at generation {}", writer.generation);
        Ok(writer)
    }
}

/// The exclusive writer of a [`DepGraphStore`]
///
/// Dropping it without committing rolls the database transaction back.
pub struct StoreWriter {
    conn: Connection,
    generation: u64,
    finished: bool,
}

impl StoreWriter {
    /// Generation the lock was taken at
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Generation a successful commit will produce
    pub fn next_generation(&self) -> u64 {
        self.generation + 1
    }

    /// The graph as seen under the lock
    pub fn graph(&self) -> Result<DepGraph> {
        load_graph(&self.conn)
    }

    /// Replace the installed graph, record `entry` in the history and commit
    ///
    /// The generations of `entry` are filled in here. Returns the new
    /// generation.
    pub fn commit(mut self, graph: &DepGraph, mut entry: HistoryEntry) -> Result<u64> {
        let generation = self.next_generation();

        write_graph(&self.conn, graph)?;
        models::set_generation(&self.conn, generation)?;
        entry.base_generation = self.generation;
        entry.generation = generation;
        entry.insert(&self.conn)?;

        self.conn.execute_batch("COMMIT")?;
        self.finished = true;

        info!(
            "Committed depgraph generation {} ({} packages installed)",
            generation,
            graph.len()
        );
        Ok(generation)
    }

    /// Release the lock without changing anything
    pub fn abort(mut self) -> Result<()> {
        self.conn.execute_batch("ROLLBACK")?;
        self.finished = true;
        debug!("Released depgraph lock at generation {}", self.generation);
        Ok(())
    }
}

impl Drop for StoreWriter {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(e) = self.conn.execute_batch("ROLLBACK") {
                warn!("Failed to roll back depgraph transaction: {}", e);
            }
        }
    }
}

fn corrupt(package: &str, reason: impl std::fmt::Display) -> Error {
    Error::MalformedDefinition {
        package: package.to_string(),
        reason: format!("corrupt depgraph row: {}", reason),
    }
}

fn load_graph(conn: &Connection) -> Result<DepGraph> {
    let mut relations: HashMap<String, Vec<PackageRelation>> = HashMap::new();
    for relation in PackageRelation::list_all(conn)? {
        relations
            .entry(relation.package_name.clone())
            .or_default()
            .push(relation);
    }

    let links = |table| -> Result<HashMap<String, BTreeSet<PackageId>>> {
        let mut by_package: HashMap<String, BTreeSet<PackageId>> = HashMap::new();
        for link in PackageLink::list_all(conn, table)? {
            let id = PackageId::parse(&link.other_name, &link.other_version)?;
            by_package.entry(link.package_name).or_default().insert(id);
        }
        Ok(by_package)
    };
    let mut reasons = links(LinkTable::Reasons)?;
    let mut edges = links(LinkTable::Edges)?;

    let mut graph = DepGraph::new();
    for row in InstalledPackage::list_all(conn)? {
        let mut definition = PackageDefinition::new(
            PackageId::parse(&row.name, &row.version)?,
            row.repository.clone(),
        );
        definition.kind = row
            .kind
            .parse::<PackageKind>()
            .map_err(|e| corrupt(&row.name, e))?;
        definition.checksum = row.checksum.clone();
        definition.category = row.category.clone();
        if let Some(wrap_date) = &row.wrap_date {
            definition.wrap_date = Some(
                DateTime::parse_from_rfc3339(wrap_date)
                    .map_err(|e| corrupt(&row.name, e))?
                    .with_timezone(&Utc),
            );
        }
        if let Some(metadata) = &row.metadata {
            definition.metadata = serde_json::from_str(metadata).map_err(|e| corrupt(&row.name, e))?;
        }

        for relation in relations.remove(&row.name).unwrap_or_default() {
            apply_relation(&mut definition, relation)?;
        }

        let reason = if row.explicit {
            InstallReason::Explicit
        } else {
            InstallReason::DependencyOf(reasons.remove(&row.name).unwrap_or_default())
        };

        graph.insert(InstalledRecord {
            definition,
            reason,
            depends_on: edges.remove(&row.name).unwrap_or_default(),
        });
    }

    Ok(graph)
}

fn apply_relation(definition: &mut PackageDefinition, relation: PackageRelation) -> Result<()> {
    let name = relation.package_name.as_str();
    match relation.relation {
        RelationKind::Depends | RelationKind::Recommends => {
            let constraint = relation
                .constraint
                .parse()
                .map_err(|e| corrupt(name, e))?;
            definition.dependencies.push(if relation.relation == RelationKind::Depends {
                Dependency::required(relation.target, constraint)
            } else {
                Dependency::optional(relation.target, constraint)
            });
        }
        RelationKind::Conflicts => {
            let constraint = relation
                .constraint
                .parse()
                .map_err(|e| corrupt(name, e))?;
            definition.conflicts.push(Conflict {
                target: relation.target,
                constraint,
            });
        }
        RelationKind::Provides => {
            let version = Version::parse(&relation.constraint).map_err(|e| corrupt(name, e))?;
            definition.provides.push(Provide {
                capability: relation.target,
                version,
            });
        }
    }
    Ok(())
}

fn write_graph(conn: &Connection, graph: &DepGraph) -> Result<()> {
    InstalledPackage::delete_all(conn)?;

    for record in graph.iter() {
        let def = &record.definition;
        let name = def.name();

        InstalledPackage {
            name: name.to_string(),
            version: def.version().to_string(),
            kind: def.kind.as_str().to_string(),
            repository: def.repository.clone(),
            checksum: def.checksum.clone(),
            explicit: record.reason.is_explicit(),
            category: def.category.clone(),
            wrap_date: def.wrap_date.map(|d| d.to_rfc3339()),
            metadata: if def.metadata.is_empty() {
                None
            } else {
                Some(serde_json::to_string(&def.metadata)?)
            },
        }
        .insert(conn)?;

        for dep in &def.dependencies {
            let kind = if dep.optional {
                RelationKind::Recommends
            } else {
                RelationKind::Depends
            };
            PackageRelation::new(name, kind, &dep.target, dep.constraint.to_string())
                .insert(conn)?;
        }
        for conflict in &def.conflicts {
            PackageRelation::new(
                name,
                RelationKind::Conflicts,
                &conflict.target,
                conflict.constraint.to_string(),
            )
            .insert(conn)?;
        }
        for provide in &def.provides {
            PackageRelation::new(
                name,
                RelationKind::Provides,
                &provide.capability,
                provide.version.to_string(),
            )
            .insert(conn)?;
        }

        for target in &record.depends_on {
            PackageLink::new(name, target.name(), target.version().to_string())
                .insert(conn, LinkTable::Edges)?;
        }
        if let InstallReason::DependencyOf(dependents) = &record.reason {
            for dependent in dependents {
                PackageLink::new(name, dependent.name(), dependent.version().to_string())
                    .insert(conn, LinkTable::Reasons)?;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packages::PackageManifest;
    use tempfile::tempdir;

    fn sample_graph() -> DepGraph {
        let app = PackageManifest::new("app", "1.0.0")
            .depends_on("lib", ">=2.0")
            .depends_on("tls", "^1.2")
            .recommends("docs", "*")
            .conflicts_with("legacy-app", "<2")
            .with_checksum("ABCDEF")
            .into_definition("stable")
            .unwrap();
        let lib = PackageManifest::new("lib", "2.3.0")
            .into_definition("stable")
            .unwrap();
        let openssl = PackageManifest::new("openssl", "3.0.2")
            .provides("tls", "1.3.0")
            .into_definition("unstable")
            .unwrap();
        let meta = PackageManifest::new("meta", "1.0.0")
            .depends_on("app", "*")
            .virtual_package()
            .into_definition("stable")
            .unwrap();

        let mut app = InstalledRecord::new(app, InstallReason::Explicit);
        app.depends_on.insert(lib.id.clone());
        app.depends_on.insert(openssl.id.clone());
        let mut meta = InstalledRecord::new(meta, InstallReason::Explicit);
        meta.depends_on.insert(app.id().clone());

        let mut graph: DepGraph = [
            app,
            meta,
            InstalledRecord::new(lib, InstallReason::DependencyOf(BTreeSet::new())),
            InstalledRecord::new(openssl, InstallReason::DependencyOf(BTreeSet::new())),
        ]
        .into_iter()
        .collect();
        graph.recompute_reasons();
        graph
    }

    #[test]
    fn test_round_trip() {
        let dir = tempdir().unwrap();
        let store = DepGraphStore::open(dir.path().join("depgraph")).unwrap();
        let graph = sample_graph();

        let writer = store.lock().unwrap();
        let generation = writer
            .commit(&graph, HistoryEntry::new("install app meta", 0, 0))
            .unwrap();
        assert_eq!(generation, 1);

        let snapshot = store.snapshot().unwrap();
        assert_eq!(snapshot.generation, 1);
        assert_eq!(snapshot.graph, graph);
        assert!(snapshot.graph.verify().is_empty());

        // Reopening reads the same state
        let reopened = DepGraphStore::open(store.path()).unwrap();
        assert_eq!(reopened.snapshot().unwrap().graph, graph);
    }

    #[test]
    fn test_empty_store() {
        let dir = tempdir().unwrap();
        let store = DepGraphStore::open(dir.path().join("depgraph")).unwrap();
        let snapshot = store.snapshot().unwrap();
        assert!(snapshot.graph.is_empty());
        assert_eq!(snapshot.generation, 0);
        assert!(store.history().unwrap().is_empty());
    }

    #[test]
    fn test_writer_starts_at_committed_generation() {
        let dir = tempdir().unwrap();
        let store = DepGraphStore::open(dir.path().join("depgraph")).unwrap();

        store
            .lock()
            .unwrap()
            .commit(&sample_graph(), HistoryEntry::new("first", 0, 0))
            .unwrap();

        let writer = store.lock().unwrap();
        assert_eq!(writer.generation(), 1);
        assert_eq!(writer.next_generation(), 2);
        assert_eq!(writer.graph().unwrap(), sample_graph());
    }

    #[test]
    fn test_second_writer_reports_busy_store() {
        let dir = tempdir().unwrap();
        let store = DepGraphStore::open(dir.path().join("depgraph")).unwrap();
        let other = DepGraphStore::open(store.path())
            .unwrap()
            .with_busy_timeout(Duration::from_millis(50));

        let writer = store.lock().unwrap();
        match other.lock() {
            Err(Error::StoreBusy(path)) => assert_eq!(path, store.path()),
            Err(e) => panic!("expected StoreBusy, got {}", e),
            Ok(_) => panic!("two writers held the lock"),
        }

        // Readers are not blocked
        assert_eq!(other.snapshot().unwrap().generation, 0);

        writer.abort().unwrap();
        assert!(other.lock().is_ok());
    }

    #[test]
    fn test_category_and_metadata_round_trip() {
        let dir = tempdir().unwrap();
        let store = DepGraphStore::open(dir.path().join("depgraph")).unwrap();

        let manifest: PackageManifest = serde_json::from_str(
            r#"{
                "name": "zlib",
                "category": "sys-libs",
                "version": "1.2.13",
                "wrap_date": "2019-05-27T16:34:15Z",
                "metadata": {"description": "Compression library", "licenses": ["Zlib"]}
            }"#,
        )
        .unwrap();
        let zlib = manifest.into_definition("stable").unwrap();
        let graph: DepGraph = [InstalledRecord::new(zlib.clone(), InstallReason::Explicit)]
            .into_iter()
            .collect();

        store
            .lock()
            .unwrap()
            .commit(&graph, HistoryEntry::new("install zlib", 0, 0))
            .unwrap();

        let snapshot = store.snapshot().unwrap();
        let stored = &snapshot.graph.get("zlib").unwrap().definition;
        assert_eq!(stored, &zlib);
        assert_eq!(stored.category, "sys-libs");
        assert_eq!(stored.metadata.description, "Compression library");
        assert!(stored.wrap_date.is_some());
    }

    #[test]
    fn test_abort_and_drop_leave_store_unchanged() {
        let dir = tempdir().unwrap();
        let store = DepGraphStore::open(dir.path().join("depgraph")).unwrap();

        let writer = store.lock().unwrap();
        write_graph(&writer.conn, &sample_graph()).unwrap();
        writer.abort().unwrap();
        assert!(store.snapshot().unwrap().graph.is_empty());

        {
            let writer = store.lock().unwrap();
            write_graph(&writer.conn, &sample_graph()).unwrap();
        }
        let snapshot = store.snapshot().unwrap();
        assert!(snapshot.graph.is_empty());
        assert_eq!(snapshot.generation, 0);
    }

    #[test]
    fn test_readers_see_last_commit_while_locked() {
        let dir = tempdir().unwrap();
        let store = DepGraphStore::open(dir.path().join("depgraph")).unwrap();
        let writer = store.lock().unwrap();
        write_graph(&writer.conn, &sample_graph()).unwrap();

        let snapshot = store.snapshot().unwrap();
        assert!(snapshot.graph.is_empty());
        assert_eq!(writer.graph().unwrap().len(), 4);
    }

    #[test]
    fn test_history_records_generations() {
        let dir = tempdir().unwrap();
        let store = DepGraphStore::open(dir.path().join("depgraph")).unwrap();

        store
            .lock()
            .unwrap()
            .commit(&sample_graph(), HistoryEntry::new("install app", 7, 7))
            .unwrap();
        store
            .lock()
            .unwrap()
            .commit(&DepGraph::new(), HistoryEntry::new("uninstall app", 0, 0))
            .unwrap();

        let history = store.history().unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].description, "uninstall app");
        assert_eq!((history[0].base_generation, history[0].generation), (1, 2));
        assert_eq!((history[1].base_generation, history[1].generation), (0, 1));
    }

    #[test]
    fn test_dangling_reason_cannot_be_committed() {
        let dir = tempdir().unwrap();
        let store = DepGraphStore::open(dir.path().join("depgraph")).unwrap();

        let mut graph = sample_graph();
        graph.remove("meta");
        graph.remove("app");

        let result = store
            .lock()
            .unwrap()
            .commit(&graph, HistoryEntry::new("broken", 0, 0));
        assert!(matches!(result, Err(Error::Database(_))));
        assert_eq!(store.generation().unwrap(), 0);
    }
}
