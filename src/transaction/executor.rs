// src/transaction/executor.rs

//! Transaction execution
//!
//! Execution runs in three phases against a locked store:
//!
//! 1. archives of every incoming effective package are fetched in parallel
//!    and verified, before anything under the installed root is touched;
//! 2. steps are applied in plan order, journaling each rename first and
//!    running the package's instruction hooks around it;
//! 3. the new graph is committed, then the work directory is dropped.
//!
//! Any failure before the commit undoes the journal and releases the lock
//! without writing, leaving the installed root and the store as they were.
//! Side effects of hooks that already ran are not reverted.

use super::journal::{Journal, JournalEntry, WorkDir};
use super::plan::{Step, TransactionPlan};
use crate::cache::DownloadedCache;
use crate::depgraph::{DepGraph, HistoryEntry, StoreWriter};
use crate::error::{Error, Result};
use crate::filesystem::Unpacker;
use crate::hash;
use crate::hooks::{self, Hook};
use crate::packages::{PackageDefinition, PackageId, PackageKind};
use crate::repository::Fetcher;
use rayon::prelude::*;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error, info, warn};

/// Shared flag asking a running transaction to stop
///
/// Cancelling before the commit rolls the transaction back.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Clear the flag so the next transaction can run
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(())
    }
}

/// How a transaction ended
#[derive(Debug)]
pub enum TransactionOutcome {
    /// The target state is installed and committed as `generation`
    Committed {
        generation: u64,
        plan: TransactionPlan,
        orphans: Vec<PackageId>,
    },
    /// The target state was already in place
    NothingToDo,
    /// The plan was not confirmed
    Declined,
    /// A step failed or the transaction was cancelled; nothing changed
    RolledBack { reason: Error },
}

impl TransactionOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, TransactionOutcome::Committed { .. })
    }
}

/// Applies plans to the installed root
pub struct Executor<'e> {
    installed: &'e Path,
    cache: &'e DownloadedCache,
    fetcher: &'e dyn Fetcher,
    unpacker: &'e dyn Unpacker,
    /// Mirrors by repository name
    mirrors: &'e HashMap<String, Vec<String>>,
    workers: usize,
    cancel: &'e CancellationToken,
}

impl<'e> Executor<'e> {
    pub fn new(
        installed: &'e Path,
        cache: &'e DownloadedCache,
        fetcher: &'e dyn Fetcher,
        unpacker: &'e dyn Unpacker,
        mirrors: &'e HashMap<String, Vec<String>>,
        cancel: &'e CancellationToken,
    ) -> Self {
        Self {
            installed,
            cache,
            fetcher,
            unpacker,
            mirrors,
            workers: 1,
            cancel,
        }
    }

    /// Number of concurrent downloads
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Apply `plan` and commit `graph` through `writer`
    ///
    /// Transaction-fatal errors come back as [`TransactionOutcome::RolledBack`];
    /// anything else is returned as an error after the same rollback.
    pub fn execute(
        &self,
        plan: TransactionPlan,
        graph: &DepGraph,
        orphans: Vec<PackageId>,
        description: &str,
        writer: StoreWriter,
    ) -> Result<TransactionOutcome> {
        info!(
            "Starting transaction '{}' at generation {} ({} steps)",
            description,
            writer.generation(),
            plan.steps.len()
        );
        let mut journal = Journal::new(description, writer.generation(), writer.next_generation());
        let work = WorkDir::new(self.installed);

        let archives = match self.prefetch(&plan) {
            Ok(archives) => archives,
            Err(e) => return finish_failed(e, writer),
        };

        if let Err(e) = work.create(&journal) {
            return finish_failed(e, writer);
        }

        for step in &plan.steps {
            let applied = self
                .cancel
                .check()
                .and_then(|()| self.apply(step, &archives, &work, &mut journal));
            if let Err(e) = applied {
                warn!("Step '{}' failed: {}", step, e);
                return self.roll_back(e, &work, &mut journal, Some(writer));
            }
        }

        let mut entry = HistoryEntry::new(description, journal.base_generation, journal.target_generation);
        entry.installed = plan.install_count();
        entry.removed = plan.remove_count();
        entry.replaced = plan.replace_count();

        if let Err(e) = self.cancel.check() {
            return self.roll_back(e, &work, &mut journal, Some(writer));
        }

        // A failed commit drops the writer, which rolls the store back
        let generation = match writer.commit(graph, entry) {
            Ok(generation) => generation,
            Err(e) => {
                warn!("Commit of '{}' failed: {}", description, e);
                return self.roll_back(e, &work, &mut journal, None);
            }
        };

        if let Err(e) = work.remove() {
            warn!("Committed, but failed to clean up work directory: {}", e);
        }
        info!("Transaction '{}' committed as generation {}", description, generation);

        Ok(TransactionOutcome::Committed {
            generation,
            plan,
            orphans,
        })
    }

    /// Fetch and verify every archive the plan unpacks
    fn prefetch(&self, plan: &TransactionPlan) -> Result<HashMap<PackageId, PathBuf>> {
        let wanted: Vec<&PackageDefinition> = plan
            .incoming()
            .into_iter()
            .filter(|def| def.kind == PackageKind::Effective)
            .collect();
        if wanted.is_empty() {
            return Ok(HashMap::new());
        }

        debug!(
            "Prefetching {} archives with {} workers",
            wanted.len(),
            self.workers
        );
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.workers)
            .build()
            .map_err(|e| Error::InitError(format!("Failed to start download pool: {}", e)))?;

        let fetched: Vec<(PackageId, PathBuf)> = pool.install(|| {
            wanted
                .par_iter()
                .map(|def| -> Result<(PackageId, PathBuf)> {
                    Ok((def.id.clone(), self.obtain(def)?))
                })
                .collect::<Result<Vec<_>>>()
        })?;
        Ok(fetched.into_iter().collect())
    }

    /// Local archive of `def`, from the cache or a mirror
    fn obtain(&self, def: &PackageDefinition) -> Result<PathBuf> {
        self.cancel.check()?;

        if let Some(path) = self.cache.reusable(def)? {
            return Ok(path);
        }

        let mirrors = self.mirrors.get(&def.repository).ok_or_else(|| Error::FetchFailed {
            package: def.id.clone(),
            reason: format!("repository '{}' is not configured", def.repository),
        })?;

        let destination = self.cache.package_path(def);
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::filesystem(parent, e))?;
        }

        let qualified = def.qualified_id().map_err(|e| Error::FetchFailed {
            package: def.id.clone(),
            reason: e.to_string(),
        })?;
        let path = self.fetcher.fetch(&qualified, mirrors, &destination)?;
        if let Some(expected) = &def.checksum
            && let Err(e) = hash::verify_checksum(&path, expected)
        {
            if let Err(remove) = self.cache.remove_package(def) {
                warn!("Failed to remove bad archive {}: {}", path.display(), remove);
            }
            return Err(e);
        }
        Ok(path)
    }

    fn apply(
        &self,
        step: &Step,
        archives: &HashMap<PackageId, PathBuf>,
        work: &WorkDir,
        journal: &mut Journal,
    ) -> Result<()> {
        debug!("Applying: {}", step);
        match step {
            Step::Install(def) => self.place(def, archives, work, journal),
            Step::Remove(id) => self.take_out(id, work, journal),
            Step::Replace { old, new } => {
                self.take_out(old, work, journal)?;
                self.place(new, archives, work, journal)
            }
            Step::Group(steps) => steps
                .iter()
                .try_for_each(|inner| self.apply(inner, archives, work, journal)),
        }
    }

    /// Unpack `def` into staging and move it into place
    fn place(
        &self,
        def: &PackageDefinition,
        archives: &HashMap<PackageId, PathBuf>,
        work: &WorkDir,
        journal: &mut Journal,
    ) -> Result<()> {
        if def.kind == PackageKind::Virtual {
            return Ok(());
        }

        let archive = archives.get(&def.id).ok_or_else(|| Error::FetchFailed {
            package: def.id.clone(),
            reason: "archive was not prefetched".to_string(),
        })?;

        let name = def.name();
        let staging = work.staging_path(name);
        self.unpacker
            .unpack(archive, def.checksum.as_deref(), &staging)?;
        hooks::run(Hook::BeforeInstall, &def.id, &staging, self.installed)?;

        // A stray directory under the same name is kept as a backup
        displace(name, work, journal)?;

        let live = work.live_path(name);
        work.record(journal, JournalEntry::Placed { name: name.to_string() })?;
        fs::rename(&staging, &live).map_err(|e| Error::filesystem(&live, e))?;
        debug!("Placed {} at {}", def.id, live.display());
        hooks::run(Hook::AfterInstall, &def.id, &live, self.installed)
    }

    /// Move an installed package out of the root, running its remove hooks
    fn take_out(&self, id: &PackageId, work: &WorkDir, journal: &mut Journal) -> Result<()> {
        let live = work.live_path(id.name());
        if !live.exists() {
            return Ok(());
        }
        hooks::run(Hook::BeforeRemove, id, &live, self.installed)?;
        displace(id.name(), work, journal)?;
        hooks::run(Hook::AfterRemove, id, &work.backup_path(id.name()), self.installed)
    }

    /// Undo the journal and release the store lock
    fn roll_back(
        &self,
        reason: Error,
        work: &WorkDir,
        journal: &mut Journal,
        writer: Option<StoreWriter>,
    ) -> Result<TransactionOutcome> {
        warn!(
            "Rolling back '{}' ({} journal entries)",
            journal.description,
            journal.entries.len()
        );

        let undone = work.undo(journal).and_then(|()| work.remove());
        if let Err(e) = undone {
            error!("Rollback of '{}' failed: {}", journal.description, e);
            return Err(e);
        }

        match writer {
            Some(writer) => finish_failed(reason, writer),
            None => Err(reason),
        }
    }
}

/// Move the live directory of `name`, if there is one, into the backup
fn displace(name: &str, work: &WorkDir, journal: &mut Journal) -> Result<()> {
    let live = work.live_path(name);
    if !live.exists() {
        return Ok(());
    }
    work.record(journal, JournalEntry::Displaced { name: name.to_string() })?;
    let backup = work.backup_path(name);
    fs::rename(&live, &backup).map_err(|e| Error::filesystem(&live, e))?;
    debug!("Displaced {}", live.display());
    Ok(())
}

/// Release the lock and classify `reason`
fn finish_failed(reason: Error, writer: StoreWriter) -> Result<TransactionOutcome> {
    if let Err(e) = writer.abort() {
        warn!("Failed to release depgraph lock: {}", e);
    }
    if reason.is_step_fatal() {
        info!("Transaction rolled back: {}", reason);
        Ok(TransactionOutcome::RolledBack { reason })
    } else {
        Err(reason)
    }
}
