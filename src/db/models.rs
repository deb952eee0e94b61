// src/db/models.rs

//! Data models for depgraph database entities
//!
//! This module defines Rust structs that correspond to database tables
//! and provides methods for creating and reading records. Rows are plain
//! strings here; `depgraph::store` turns them into typed records.

use crate::error::Result;
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::str::FromStr;

/// Read the store generation
pub fn get_generation(conn: &Connection) -> Result<u64> {
    let generation: i64 =
        conn.query_row("SELECT generation FROM store_state WHERE id = 1", [], |row| {
            row.get(0)
        })?;
    Ok(generation.max(0) as u64)
}

/// Overwrite the store generation
pub fn set_generation(conn: &Connection, generation: u64) -> Result<()> {
    conn.execute(
        "UPDATE store_state SET generation = ?1 WHERE id = 1",
        [generation as i64],
    )?;
    Ok(())
}

/// An installed package row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledPackage {
    pub name: String,
    pub version: String,
    pub kind: String,
    pub repository: String,
    pub checksum: Option<String>,
    pub explicit: bool,
    pub category: String,
    /// RFC 3339 timestamp
    pub wrap_date: Option<String>,
    /// JSON object
    pub metadata: Option<String>,
}

impl InstalledPackage {
    /// Insert this package into the database
    pub fn insert(&self, conn: &Connection) -> Result<()> {
        conn.execute(
            "INSERT INTO installed_packages (name, version, kind, repository, checksum, explicit, category, wrap_date, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                &self.name,
                &self.version,
                &self.kind,
                &self.repository,
                &self.checksum,
                self.explicit,
                &self.category,
                &self.wrap_date,
                &self.metadata,
            ],
        )?;
        Ok(())
    }

    /// Find an installed package by name
    pub fn find_by_name(conn: &Connection, name: &str) -> Result<Option<Self>> {
        let mut stmt = conn.prepare(
            "SELECT name, version, kind, repository, checksum, explicit, category, wrap_date, metadata
             FROM installed_packages WHERE name = ?1",
        )?;

        let package = stmt.query_row([name], Self::from_row).optional()?;

        Ok(package)
    }

    /// List all installed packages
    pub fn list_all(conn: &Connection) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(
            "SELECT name, version, kind, repository, checksum, explicit, category, wrap_date, metadata
             FROM installed_packages ORDER BY name",
        )?;

        let packages = stmt
            .query_map([], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(packages)
    }

    /// Delete every installed package; dependent rows cascade
    pub fn delete_all(conn: &Connection) -> Result<()> {
        conn.execute("DELETE FROM installed_packages", [])?;
        Ok(())
    }

    /// Convert a database row to an InstalledPackage
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            name: row.get(0)?,
            version: row.get(1)?,
            kind: row.get(2)?,
            repository: row.get(3)?,
            checksum: row.get(4)?,
            explicit: row.get(5)?,
            category: row.get(6)?,
            wrap_date: row.get(7)?,
            metadata: row.get(8)?,
        })
    }
}

/// Kind of a definition relation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationKind {
    Depends,
    Recommends,
    Conflicts,
    Provides,
}

impl RelationKind {
    pub fn as_str(&self) -> &str {
        match self {
            RelationKind::Depends => "depends",
            RelationKind::Recommends => "recommends",
            RelationKind::Conflicts => "conflicts",
            RelationKind::Provides => "provides",
        }
    }
}

impl FromStr for RelationKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "depends" => Ok(RelationKind::Depends),
            "recommends" => Ok(RelationKind::Recommends),
            "conflicts" => Ok(RelationKind::Conflicts),
            "provides" => Ok(RelationKind::Provides),
            _ => Err(format!("Invalid relation kind: {}", s)),
        }
    }
}

/// One dependency, conflict or provided capability of an installed package
///
/// For `provides` rows the constraint column holds the provided version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageRelation {
    pub package_name: String,
    pub relation: RelationKind,
    pub target: String,
    pub constraint: String,
}

impl PackageRelation {
    pub fn new(
        package_name: &str,
        relation: RelationKind,
        target: &str,
        constraint: impl Into<String>,
    ) -> Self {
        Self {
            package_name: package_name.to_string(),
            relation,
            target: target.to_string(),
            constraint: constraint.into(),
        }
    }

    /// Insert this relation into the database
    pub fn insert(&self, conn: &Connection) -> Result<()> {
        conn.execute(
            "INSERT INTO package_relations (package_name, relation, target, constraint_text)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                &self.package_name,
                self.relation.as_str(),
                &self.target,
                &self.constraint,
            ],
        )?;
        Ok(())
    }

    /// List every relation, grouped by package in insertion order
    pub fn list_all(conn: &Connection) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(
            "SELECT package_name, relation, target, constraint_text
             FROM package_relations ORDER BY package_name, id",
        )?;

        let relations = stmt
            .query_map([], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(relations)
    }

    /// Installed packages declaring a relation of `kind` on `target`
    pub fn find_by_target(
        conn: &Connection,
        relation: RelationKind,
        target: &str,
    ) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(
            "SELECT package_name, relation, target, constraint_text
             FROM package_relations WHERE relation = ?1 AND target = ?2 ORDER BY package_name",
        )?;

        let relations = stmt
            .query_map(params![relation.as_str(), target], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(relations)
    }

    /// Convert a database row to a PackageRelation
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let relation_str: String = row.get(1)?;
        let relation = relation_str.parse::<RelationKind>().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                1,
                rusqlite::types::Type::Text,
                Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
            )
        })?;

        Ok(Self {
            package_name: row.get(0)?,
            relation,
            target: row.get(2)?,
            constraint: row.get(3)?,
        })
    }
}

/// A `(name, version)` reference from one installed package to another
///
/// Stored in `package_reasons` (dependents) and `resolved_edges` (providers).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageLink {
    pub package_name: String,
    pub other_name: String,
    pub other_version: String,
}

/// Tables holding [`PackageLink`] rows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkTable {
    /// Dependents a dependency-only package is installed for
    Reasons,
    /// Providers chosen for a package's dependencies
    Edges,
}

impl LinkTable {
    fn insert_sql(&self) -> &'static str {
        match self {
            LinkTable::Reasons => {
                "INSERT INTO package_reasons (package_name, dependent_name, dependent_version)
                 VALUES (?1, ?2, ?3)"
            }
            LinkTable::Edges => {
                "INSERT INTO resolved_edges (package_name, target_name, target_version)
                 VALUES (?1, ?2, ?3)"
            }
        }
    }

    fn select_sql(&self) -> &'static str {
        match self {
            LinkTable::Reasons => {
                "SELECT package_name, dependent_name, dependent_version
                 FROM package_reasons ORDER BY package_name, dependent_name"
            }
            LinkTable::Edges => {
                "SELECT package_name, target_name, target_version
                 FROM resolved_edges ORDER BY package_name, target_name"
            }
        }
    }
}

impl PackageLink {
    pub fn new(package_name: &str, other_name: &str, other_version: impl Into<String>) -> Self {
        Self {
            package_name: package_name.to_string(),
            other_name: other_name.to_string(),
            other_version: other_version.into(),
        }
    }

    /// Insert this link into `table`
    pub fn insert(&self, conn: &Connection, table: LinkTable) -> Result<()> {
        conn.execute(
            table.insert_sql(),
            params![&self.package_name, &self.other_name, &self.other_version],
        )?;
        Ok(())
    }

    /// List every link of `table`
    pub fn list_all(conn: &Connection, table: LinkTable) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(table.select_sql())?;

        let links = stmt
            .query_map([], |row| {
                Ok(Self {
                    package_name: row.get(0)?,
                    other_name: row.get(1)?,
                    other_version: row.get(2)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(links)
    }
}

/// A committed transaction in the history
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionRecord {
    pub id: Option<i64>,
    pub description: String,
    pub base_generation: u64,
    pub generation: u64,
    pub installed: usize,
    pub removed: usize,
    pub replaced: usize,
    pub committed_at: Option<String>,
}

impl TransactionRecord {
    /// Create a new history entry moving `base_generation` to `generation`
    pub fn new(description: impl Into<String>, base_generation: u64, generation: u64) -> Self {
        Self {
            id: None,
            description: description.into(),
            base_generation,
            generation,
            installed: 0,
            removed: 0,
            replaced: 0,
            committed_at: None,
        }
    }

    /// Insert this record into the database
    pub fn insert(&mut self, conn: &Connection) -> Result<i64> {
        conn.execute(
            "INSERT INTO transactions (description, base_generation, generation, installed, removed, replaced)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                &self.description,
                self.base_generation as i64,
                self.generation as i64,
                self.installed as i64,
                self.removed as i64,
                self.replaced as i64,
            ],
        )?;

        let id = conn.last_insert_rowid();
        self.id = Some(id);
        Ok(id)
    }

    /// Find the transaction that produced a generation
    pub fn find_by_generation(conn: &Connection, generation: u64) -> Result<Option<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, description, base_generation, generation, installed, removed, replaced, committed_at
             FROM transactions WHERE generation = ?1",
        )?;

        let record = stmt
            .query_row([generation as i64], Self::from_row)
            .optional()?;

        Ok(record)
    }

    /// List all transactions, newest first
    pub fn list_all(conn: &Connection) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, description, base_generation, generation, installed, removed, replaced, committed_at
             FROM transactions ORDER BY generation DESC",
        )?;

        let records = stmt
            .query_map([], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(records)
    }

    /// Convert a database row to a TransactionRecord
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let count = |i: usize| -> rusqlite::Result<usize> { Ok(row.get::<_, i64>(i)?.max(0) as usize) };

        Ok(Self {
            id: Some(row.get(0)?),
            description: row.get(1)?,
            base_generation: row.get::<_, i64>(2)?.max(0) as u64,
            generation: row.get::<_, i64>(3)?.max(0) as u64,
            installed: count(4)?,
            removed: count(5)?,
            replaced: count(6)?,
            committed_at: row.get(7)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema;
    use tempfile::NamedTempFile;

    fn create_test_db() -> (NamedTempFile, Connection) {
        let temp_file = NamedTempFile::new().unwrap();
        let conn = Connection::open(temp_file.path()).unwrap();
        conn.execute("PRAGMA foreign_keys = ON", []).unwrap();
        schema::migrate(&conn).unwrap();
        (temp_file, conn)
    }

    fn package(name: &str, version: &str, explicit: bool) -> InstalledPackage {
        InstalledPackage {
            name: name.to_string(),
            version: version.to_string(),
            kind: "effective".to_string(),
            repository: "stable".to_string(),
            checksum: None,
            explicit,
            category: "dev-util".to_string(),
            wrap_date: None,
            metadata: None,
        }
    }

    #[test]
    fn test_installed_package_crud() {
        let (_temp, conn) = create_test_db();

        package("lib", "2.3.0", false).insert(&conn).unwrap();
        package("app", "1.0.0", true).insert(&conn).unwrap();

        let all = InstalledPackage::list_all(&conn).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].name, "app");
        assert!(all[0].explicit);

        let lib = InstalledPackage::find_by_name(&conn, "lib").unwrap().unwrap();
        assert_eq!(lib.version, "2.3.0");
        assert_eq!(lib.category, "dev-util");
        assert!(InstalledPackage::find_by_name(&conn, "gone").unwrap().is_none());
    }

    #[test]
    fn test_cascade_delete() {
        let (_temp, conn) = create_test_db();

        package("lib", "2.3.0", false).insert(&conn).unwrap();
        package("app", "1.0.0", true).insert(&conn).unwrap();
        PackageRelation::new("app", RelationKind::Depends, "lib", ">=2.0")
            .insert(&conn)
            .unwrap();
        PackageLink::new("app", "lib", "2.3.0")
            .insert(&conn, LinkTable::Edges)
            .unwrap();
        PackageLink::new("lib", "app", "1.0.0")
            .insert(&conn, LinkTable::Reasons)
            .unwrap();

        let dependents =
            PackageRelation::find_by_target(&conn, RelationKind::Depends, "lib").unwrap();
        assert_eq!(dependents.len(), 1);
        assert_eq!(dependents[0].package_name, "app");

        InstalledPackage::delete_all(&conn).unwrap();

        assert!(PackageRelation::list_all(&conn).unwrap().is_empty());
        assert!(PackageLink::list_all(&conn, LinkTable::Edges).unwrap().is_empty());
        assert!(PackageLink::list_all(&conn, LinkTable::Reasons).unwrap().is_empty());
    }

    #[test]
    fn test_relation_kind_parsing() {
        assert_eq!("provides".parse::<RelationKind>().unwrap(), RelationKind::Provides);
        assert_eq!(RelationKind::Recommends.as_str(), "recommends");
        assert!("obsoletes".parse::<RelationKind>().is_err());
    }

    #[test]
    fn test_transaction_history() {
        let (_temp, conn) = create_test_db();

        let mut first = TransactionRecord::new("install app", 0, 1);
        first.installed = 2;
        first.insert(&conn).unwrap();
        TransactionRecord::new("uninstall app", 1, 2)
            .insert(&conn)
            .unwrap();

        let history = TransactionRecord::list_all(&conn).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].description, "uninstall app");
        assert!(history[0].committed_at.is_some());

        let found = TransactionRecord::find_by_generation(&conn, 1).unwrap().unwrap();
        assert_eq!(found.installed, 2);
        assert!(TransactionRecord::find_by_generation(&conn, 9).unwrap().is_none());
    }

    #[test]
    fn test_generation() {
        let (_temp, conn) = create_test_db();
        assert_eq!(get_generation(&conn).unwrap(), 0);
        set_generation(&conn, 3).unwrap();
        assert_eq!(get_generation(&conn).unwrap(), 3);
    }
}
