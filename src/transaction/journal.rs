// src/transaction/journal.rs

//! On-disk undo log of a running transaction
//!
//! While a transaction mutates the installed root it keeps a work directory
//! at `<installed>/.transaction`:
//!
//! ```text
//! .transaction/
//!   journal.json   what has been (or is about to be) changed
//!   staging/       payloads unpacked before they are moved into place
//!   backup/        displaced package directories
//! ```
//!
//! Every entry is persisted before the rename it describes, so undoing the
//! journal in reverse always restores the previous state, whether the
//! process is still running or crashed halfway through.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

/// Name of the work directory inside the installed root
pub const WORK_DIR_NAME: &str = ".transaction";

/// One filesystem mutation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum JournalEntry {
    /// A staged payload moved to `<installed>/<name>`
    Placed { name: String },
    /// `<installed>/<name>` moved to the backup directory
    Displaced { name: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Journal {
    pub description: String,
    /// Generation the transaction started from
    pub base_generation: u64,
    /// Generation the transaction commits as
    pub target_generation: u64,
    pub entries: Vec<JournalEntry>,
}

impl Journal {
    pub fn new(description: impl Into<String>, base_generation: u64, target_generation: u64) -> Self {
        Self {
            description: description.into(),
            base_generation,
            target_generation,
            entries: Vec::new(),
        }
    }
}

/// What crash recovery found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// No leftover work directory
    Clean,
    /// A work directory without a journal; nothing had been changed
    Discarded,
    /// The interrupted transaction had committed; leftovers were deleted
    Completed { generation: u64 },
    /// The interrupted transaction had not committed and was undone
    RolledBack { generation: u64 },
}

/// The work directory of the installed root
#[derive(Debug, Clone)]
pub struct WorkDir {
    installed: PathBuf,
    root: PathBuf,
}

impl WorkDir {
    pub fn new(installed: &Path) -> Self {
        Self {
            installed: installed.to_path_buf(),
            root: installed.join(WORK_DIR_NAME),
        }
    }

    pub fn exists(&self) -> bool {
        self.root.exists()
    }

    /// Where package `name` lives when installed
    pub fn live_path(&self, name: &str) -> PathBuf {
        self.installed.join(name)
    }

    pub fn staging_path(&self, name: &str) -> PathBuf {
        self.root.join("staging").join(name)
    }

    pub fn backup_path(&self, name: &str) -> PathBuf {
        self.root.join("backup").join(name)
    }

    fn journal_path(&self) -> PathBuf {
        self.root.join("journal.json")
    }

    /// Create the work directory around a fresh journal
    pub fn create(&self, journal: &Journal) -> Result<()> {
        if self.exists() {
            return Err(Error::filesystem(
                &self.root,
                io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    "another transaction left its work directory behind",
                ),
            ));
        }

        fs::create_dir_all(&self.root).map_err(|e| Error::filesystem(&self.root, e))?;
        self.persist(journal)?;
        for dir in ["staging", "backup"] {
            let path = self.root.join(dir);
            fs::create_dir(&path).map_err(|e| Error::filesystem(&path, e))?;
        }
        debug!("Created work directory {}", self.root.display());
        Ok(())
    }

    /// Append `entry` and make it durable
    pub fn record(&self, journal: &mut Journal, entry: JournalEntry) -> Result<()> {
        journal.entries.push(entry);
        self.persist(journal)
    }

    /// Atomically replace the journal file
    fn persist(&self, journal: &Journal) -> Result<()> {
        let path = self.journal_path();
        let mut temp = NamedTempFile::new_in(&self.root).map_err(|e| Error::filesystem(&self.root, e))?;
        serde_json::to_writer(&mut temp, journal)?;
        temp.flush().map_err(|e| Error::filesystem(temp.path(), e))?;
        temp.as_file()
            .sync_all()
            .map_err(|e| Error::filesystem(temp.path(), e))?;
        temp.persist(&path)
            .map_err(|e| Error::filesystem(&path, e.error))?;
        Ok(())
    }

    /// The journal left in the work directory, if any
    pub fn load(&self) -> Result<Option<Journal>> {
        let path = self.journal_path();
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::filesystem(&path, e)),
        }
    }

    /// Revert every entry of `journal`, newest first
    ///
    /// Each reverted entry is dropped from the persisted journal. Entries
    /// whose rename never happened are skipped, so an undo interrupted
    /// halfway can simply be run again.
    pub fn undo(&self, journal: &mut Journal) -> Result<()> {
        while let Some(entry) = journal.entries.last() {
            match entry {
                JournalEntry::Placed { name } => {
                    let live = self.live_path(name);
                    if live.exists() {
                        debug!("Undo: removing {}", live.display());
                        remove_path(&live)?;
                    }
                }
                JournalEntry::Displaced { name } => {
                    // Later placements are undone by now, so a live directory
                    // means this rename never happened
                    let backup = self.backup_path(name);
                    let live = self.live_path(name);
                    if backup.exists() && !live.exists() {
                        debug!("Undo: restoring {}", live.display());
                        fs::rename(&backup, &live).map_err(|e| Error::filesystem(&live, e))?;
                    }
                }
            }
            journal.entries.pop();
            self.persist(journal)?;
        }
        Ok(())
    }

    /// Delete the work directory and everything in it
    pub fn remove(&self) -> Result<()> {
        match fs::remove_dir_all(&self.root) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::filesystem(&self.root, e)),
        }
    }

    /// Finish or undo a transaction interrupted by a crash
    ///
    /// Must be called with the store lock held, at the store's current
    /// generation.
    pub fn recover(&self, committed_generation: u64) -> Result<RecoveryOutcome> {
        if !self.exists() {
            return Ok(RecoveryOutcome::Clean);
        }

        let Some(mut journal) = self.load()? else {
            warn!("Removing work directory without a journal");
            self.remove()?;
            return Ok(RecoveryOutcome::Discarded);
        };

        let generation = journal.target_generation;
        if generation <= committed_generation {
            info!(
                "Interrupted transaction '{}' had committed generation {}; cleaning up",
                journal.description, generation
            );
            self.remove()?;
            Ok(RecoveryOutcome::Completed { generation })
        } else {
            warn!(
                "Rolling back interrupted transaction '{}' ({} journal entries)",
                journal.description,
                journal.entries.len()
            );
            self.undo(&mut journal)?;
            self.remove()?;
            Ok(RecoveryOutcome::RolledBack { generation })
        }
    }
}

fn remove_path(path: &Path) -> Result<()> {
    let result = if path.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    result.map_err(|e| Error::filesystem(path, e))
}
