// src/db/schema.rs

//! Database schema definitions and migrations for the depgraph store
//!
//! This module defines the SQLite schema for the installed package set and
//! provides a migration system to evolve the schema over time.

use crate::error::{Error, Result};
use rusqlite::Connection;
use tracing::{debug, info};

/// Current schema version
pub const SCHEMA_VERSION: i32 = 3;

/// Initialize the schema version tracking table
fn init_schema_version(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;
    Ok(())
}

/// Get the current schema version from the database
pub fn get_schema_version(conn: &Connection) -> Result<i32> {
    init_schema_version(conn)?;

    let version = conn
        .query_row(
            "SELECT version FROM schema_version ORDER BY version DESC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    Ok(version)
}

/// Set the schema version
fn set_schema_version(conn: &Connection, version: i32) -> Result<()> {
    conn.execute("INSERT INTO schema_version (version) VALUES (?1)", [version])?;
    Ok(())
}

/// Apply all pending migrations to bring the database up to date
pub fn migrate(conn: &Connection) -> Result<()> {
    let current_version = get_schema_version(conn)?;
    debug!("Current schema version: {}", current_version);

    if current_version >= SCHEMA_VERSION {
        debug!("Schema is up to date");
        return Ok(());
    }

    for version in (current_version + 1)..=SCHEMA_VERSION {
        info!("Applying migration to version {}", version);
        apply_migration(conn, version)?;
        set_schema_version(conn, version)?;
    }

    info!("Schema migration complete. Now at version {}", SCHEMA_VERSION);
    Ok(())
}

/// Apply a specific migration version
fn apply_migration(conn: &Connection, version: i32) -> Result<()> {
    match version {
        1 => migrate_v1(conn),
        2 => migrate_v2(conn),
        3 => migrate_v3(conn),
        _ => Err(Error::InitError(format!(
            "Unknown migration version: {}",
            version
        ))),
    }
}

/// Initial schema - Version 1
///
/// Creates the installed package set:
/// - installed_packages: one row per installed name
/// - package_relations: the definition snapshot (dependencies, conflicts, provides)
/// - package_reasons: dependents justifying a dependency-only package
/// - resolved_edges: the provider chosen for each dependency
/// - store_state: the generation counter
///
/// References between installed packages are deferred so a whole graph can be
/// rewritten inside one transaction.
fn migrate_v1(conn: &Connection) -> Result<()> {
    debug!("Creating schema version 1");

    conn.execute_batch(
        "
        CREATE TABLE installed_packages (
            name TEXT PRIMARY KEY,
            version TEXT NOT NULL,
            kind TEXT NOT NULL CHECK(kind IN ('effective', 'virtual')),
            repository TEXT NOT NULL,
            checksum TEXT,
            explicit INTEGER NOT NULL CHECK(explicit IN (0, 1))
        );

        CREATE TABLE package_relations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            package_name TEXT NOT NULL,
            relation TEXT NOT NULL CHECK(relation IN ('depends', 'recommends', 'conflicts', 'provides')),
            target TEXT NOT NULL,
            constraint_text TEXT NOT NULL,
            FOREIGN KEY (package_name) REFERENCES installed_packages(name)
                ON DELETE CASCADE DEFERRABLE INITIALLY DEFERRED
        );

        CREATE INDEX idx_relations_package ON package_relations(package_name);
        CREATE INDEX idx_relations_target ON package_relations(target);

        CREATE TABLE package_reasons (
            package_name TEXT NOT NULL,
            dependent_name TEXT NOT NULL,
            dependent_version TEXT NOT NULL,
            PRIMARY KEY (package_name, dependent_name),
            FOREIGN KEY (package_name) REFERENCES installed_packages(name)
                ON DELETE CASCADE DEFERRABLE INITIALLY DEFERRED,
            FOREIGN KEY (dependent_name) REFERENCES installed_packages(name)
                ON DELETE CASCADE DEFERRABLE INITIALLY DEFERRED
        );

        CREATE TABLE resolved_edges (
            package_name TEXT NOT NULL,
            target_name TEXT NOT NULL,
            target_version TEXT NOT NULL,
            PRIMARY KEY (package_name, target_name),
            FOREIGN KEY (package_name) REFERENCES installed_packages(name)
                ON DELETE CASCADE DEFERRABLE INITIALLY DEFERRED,
            FOREIGN KEY (target_name) REFERENCES installed_packages(name)
                ON DELETE CASCADE DEFERRABLE INITIALLY DEFERRED
        );

        CREATE INDEX idx_edges_target ON resolved_edges(target_name);

        CREATE TABLE store_state (
            id INTEGER PRIMARY KEY CHECK(id = 1),
            generation INTEGER NOT NULL
        );

        INSERT INTO store_state (id, generation) VALUES (1, 0);
        ",
    )?;

    info!("Schema version 1 created successfully");
    Ok(())
}

/// Schema Version 2: Add transaction history
///
/// One row per committed transaction with the generation it produced.
fn migrate_v2(conn: &Connection) -> Result<()> {
    debug!("Migrating to schema version 2");

    conn.execute_batch(
        "
        CREATE TABLE transactions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            description TEXT NOT NULL,
            base_generation INTEGER NOT NULL,
            generation INTEGER NOT NULL UNIQUE,
            installed INTEGER NOT NULL DEFAULT 0,
            removed INTEGER NOT NULL DEFAULT 0,
            replaced INTEGER NOT NULL DEFAULT 0,
            committed_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        );

        CREATE INDEX idx_transactions_committed_at ON transactions(committed_at);
        ",
    )?;

    info!("Schema version 2 applied successfully");
    Ok(())
}

/// Schema Version 3: Package categories and descriptive metadata
///
/// Rows written before this version are filed as uncategorized. `metadata`
/// holds the manifest's metadata object as JSON.
fn migrate_v3(conn: &Connection) -> Result<()> {
    debug!("Migrating to schema version 3");

    conn.execute_batch(
        "
        ALTER TABLE installed_packages ADD COLUMN category TEXT NOT NULL DEFAULT 'uncategorized';
        ALTER TABLE installed_packages ADD COLUMN wrap_date TEXT;
        ALTER TABLE installed_packages ADD COLUMN metadata TEXT;
        ",
    )?;

    info!("Schema version 3 applied successfully");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn create_test_db() -> (NamedTempFile, Connection) {
        let temp_file = NamedTempFile::new().unwrap();
        let conn = Connection::open(temp_file.path()).unwrap();
        conn.execute("PRAGMA foreign_keys = ON", []).unwrap();
        (temp_file, conn)
    }

    #[test]
    fn test_schema_version_tracking() {
        let (_temp, conn) = create_test_db();

        let version = get_schema_version(&conn).unwrap();
        assert_eq!(version, 0);

        set_schema_version(&conn, 1).unwrap();
        let version = get_schema_version(&conn).unwrap();
        assert_eq!(version, 1);
    }

    #[test]
    fn test_migrate_creates_all_tables() {
        let (_temp, conn) = create_test_db();
        migrate(&conn).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap();

        for table in [
            "installed_packages",
            "package_relations",
            "package_reasons",
            "resolved_edges",
            "store_state",
            "transactions",
            "schema_version",
        ] {
            assert!(tables.contains(&table.to_string()), "missing {}", table);
        }
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let (_temp, conn) = create_test_db();

        migrate(&conn).unwrap();
        let version1 = get_schema_version(&conn).unwrap();

        migrate(&conn).unwrap();
        let version2 = get_schema_version(&conn).unwrap();

        assert_eq!(version1, version2);
        assert_eq!(version1, SCHEMA_VERSION);
    }

    #[test]
    fn test_rows_from_version_two_are_uncategorized() {
        let (_temp, conn) = create_test_db();
        init_schema_version(&conn).unwrap();
        for version in 1..=2 {
            apply_migration(&conn, version).unwrap();
            set_schema_version(&conn, version).unwrap();
        }
        conn.execute(
            "INSERT INTO installed_packages (name, version, kind, repository, explicit)
             VALUES ('app', '1.0.0', 'effective', 'stable', 1)",
            [],
        )
        .unwrap();

        migrate(&conn).unwrap();
        let (category, metadata): (String, Option<String>) = conn
            .query_row(
                "SELECT category, metadata FROM installed_packages WHERE name = 'app'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(category, "uncategorized");
        assert!(metadata.is_none());
    }

    #[test]
    fn test_one_row_per_name() {
        let (_temp, conn) = create_test_db();
        migrate(&conn).unwrap();

        let insert = "INSERT INTO installed_packages (name, version, kind, repository, explicit)
                      VALUES (?1, ?2, 'effective', 'stable', 1)";
        conn.execute(insert, ["app", "1.0.0"]).unwrap();
        assert!(conn.execute(insert, ["app", "2.0.0"]).is_err());
    }

    #[test]
    fn test_dangling_reason_fails_at_commit() {
        let (_temp, mut conn) = create_test_db();
        migrate(&conn).unwrap();

        let tx = conn.transaction().unwrap();
        tx.execute(
            "INSERT INTO installed_packages (name, version, kind, repository, explicit)
             VALUES ('lib', '2.3.0', 'effective', 'stable', 0)",
            [],
        )
        .unwrap();
        // Deferred: the statement itself succeeds
        tx.execute(
            "INSERT INTO package_reasons (package_name, dependent_name, dependent_version)
             VALUES ('lib', 'app', '1.0.0')",
            [],
        )
        .unwrap();
        assert!(tx.commit().is_err());
    }
}
