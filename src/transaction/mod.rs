// src/transaction/mod.rs

//! Transactions over the installed root
//!
//! A transaction takes the installed state from one store generation to the
//! next. [`TransactionEngine`] ties the pieces together:
//!
//! ```text
//! request -> Resolver -> TargetSet -> plan -> confirm -> lock + recover -> Executor -> commit
//! ```
//!
//! Resolution, planning and confirmation work on an unlocked snapshot, so a
//! prompt waiting on the user never holds the store. If another writer
//! commits in between, locking fails with `StaleSnapshot` and
//! [`TransactionEngine::apply`] resolves again against the fresh state.

mod executor;
mod journal;
mod plan;

pub use executor::{CancellationToken, Executor, TransactionOutcome};
pub use journal::{Journal, JournalEntry, RecoveryOutcome, WORK_DIR_NAME, WorkDir};
pub use plan::{Step, TransactionPlan, plan};

use crate::cache::DownloadedCache;
use crate::config::{Config, OrphanPolicy};
use crate::depgraph::{DepGraphStore, Snapshot, StoreWriter};
use crate::error::{Error, Result};
use crate::filesystem::{TarUnpacker, Unpacker};
use crate::repository::{Fetcher, MirrorFetcher, Repository};
use crate::resolver::{ChangeRequest, ResolveOptions, Resolver, TargetSet};
use crate::universe::Universe;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Resolves, plans and executes change requests against one installation
pub struct TransactionEngine {
    store: DepGraphStore,
    installed: PathBuf,
    available: PathBuf,
    cache: DownloadedCache,
    repositories: Vec<Repository>,
    mirrors: HashMap<String, Vec<String>>,
    fetcher: Box<dyn Fetcher>,
    unpacker: Box<dyn Unpacker>,
    orphans: OrphanPolicy,
    workers: usize,
    max_retries: u32,
    cancel: CancellationToken,
}

impl TransactionEngine {
    /// Engine downloading from mirrors and unpacking `.nest` archives
    pub fn from_config(config: &Config) -> Result<Self> {
        let fetcher = MirrorFetcher::new(config.fetch())?;
        Self::new(config, Box::new(fetcher), Box::new(TarUnpacker))
    }

    /// Engine with the given collaborators, opening (and creating) the store
    pub fn new(config: &Config, fetcher: Box<dyn Fetcher>, unpacker: Box<dyn Unpacker>) -> Result<Self> {
        let paths = config.paths();
        let installed = paths.installed();
        fs::create_dir_all(&installed).map_err(|e| Error::filesystem(&installed, e))?;

        let repositories = config.repositories();
        let mirrors = repositories
            .iter()
            .map(|r| (r.name().to_string(), r.mirrors().to_vec()))
            .collect();

        Ok(Self {
            store: DepGraphStore::open(paths.depgraph())?,
            installed,
            available: paths.available(),
            cache: DownloadedCache::new(paths.downloaded()),
            repositories,
            mirrors,
            fetcher,
            unpacker,
            orphans: config.orphans(),
            workers: config.fetch().workers,
            max_retries: config.max_retries(),
            cancel: CancellationToken::new(),
        })
    }

    pub fn store(&self) -> &DepGraphStore {
        &self.store
    }

    pub fn installed_root(&self) -> &Path {
        &self.installed
    }

    pub fn cache(&self) -> &DownloadedCache {
        &self.cache
    }

    pub fn repositories(&self) -> &[Repository] {
        &self.repositories
    }

    /// Token that cancels the running transaction from another thread
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Load the universe from the synced repository indexes
    pub fn load_universe(&self) -> Result<Universe> {
        Universe::load(&self.available, &self.repositories)
    }

    /// Resolve `request` against the current snapshot
    pub fn resolve(&self, universe: &Universe, request: &ChangeRequest) -> Result<TargetSet> {
        let snapshot = self.store.snapshot()?;
        self.resolve_against(universe, &snapshot, request)
    }

    fn resolve_against(
        &self,
        universe: &Universe,
        snapshot: &Snapshot,
        request: &ChangeRequest,
    ) -> Result<TargetSet> {
        Resolver::new(universe, snapshot)
            .with_options(ResolveOptions {
                orphans: self.orphans,
            })
            .resolve(request)
    }

    /// Preview the steps `target` would take, without locking
    pub fn plan(&self, target: &TargetSet) -> Result<TransactionPlan> {
        let snapshot = self.store.snapshot()?;
        check_generation(target.base_generation, snapshot.generation)?;
        Ok(plan(&snapshot.graph, &target.graph))
    }

    /// Plan `target`, lock the store and execute the plan
    pub fn plan_and_execute(&self, target: TargetSet) -> Result<TransactionOutcome> {
        self.plan_and_execute_with(target, &mut |_: &TransactionPlan| true)
    }

    /// Like [`plan_and_execute`](Self::plan_and_execute), asking `confirm`
    /// before a non-empty plan is executed
    ///
    /// `confirm` runs before the store is locked. The generation is checked
    /// again once the lock is held.
    pub fn plan_and_execute_with(
        &self,
        target: TargetSet,
        confirm: &mut dyn FnMut(&TransactionPlan) -> bool,
    ) -> Result<TransactionOutcome> {
        let snapshot = self.store.snapshot()?;
        check_generation(target.base_generation, snapshot.generation)?;
        let plan = plan(&snapshot.graph, &target.graph);

        if plan.is_empty() && snapshot.graph == target.graph {
            info!("Nothing to do for '{}'", target.description);
            return Ok(TransactionOutcome::NothingToDo);
        }

        if !plan.is_empty() && !confirm(&plan) {
            info!("Transaction '{}' declined", target.description);
            return Ok(TransactionOutcome::Declined);
        }

        let writer = self.lock(target.base_generation)?;

        Executor::new(
            &self.installed,
            &self.cache,
            self.fetcher.as_ref(),
            self.unpacker.as_ref(),
            &self.mirrors,
            &self.cancel,
        )
        .with_workers(self.workers)
        .execute(
            plan,
            &target.graph,
            target.orphans,
            &target.description,
            writer,
        )
    }

    /// Resolve and execute `request`, starting over when the installed state
    /// changes underneath
    pub fn apply(&self, universe: &Universe, request: &ChangeRequest) -> Result<TransactionOutcome> {
        self.apply_with(universe, request, &mut |_: &TransactionPlan| true)
    }

    /// Like [`apply`](Self::apply), asking `confirm` before executing
    pub fn apply_with(
        &self,
        universe: &Universe,
        request: &ChangeRequest,
        confirm: &mut dyn FnMut(&TransactionPlan) -> bool,
    ) -> Result<TransactionOutcome> {
        let mut attempt = 0;
        loop {
            let target = self.resolve(universe, request)?;
            match self.plan_and_execute_with(target, confirm) {
                Err(Error::StaleSnapshot { expected, found }) if attempt < self.max_retries => {
                    attempt += 1;
                    warn!(
                        "Installed state moved from generation {} to {}, resolving again (attempt {}/{})",
                        expected, found, attempt, self.max_retries
                    );
                }
                result => return result,
            }
        }
    }

    /// Take the store lock at whatever generation is current and repair
    /// what an interrupted transaction left behind
    pub fn recover(&self) -> Result<RecoveryOutcome> {
        let writer = self.store.lock()?;
        let outcome = self.recover_locked(&writer)?;
        writer.abort()?;
        Ok(outcome)
    }

    /// Take the store lock, recover, and check nothing was committed since
    /// `expected_generation`
    fn lock(&self, expected_generation: u64) -> Result<StoreWriter> {
        let writer = self.store.lock()?;
        self.recover_locked(&writer)?;
        check_generation(expected_generation, writer.generation())?;
        Ok(writer)
    }

    fn recover_locked(&self, writer: &StoreWriter) -> Result<RecoveryOutcome> {
        let outcome = WorkDir::new(&self.installed).recover(writer.generation())?;
        if outcome != RecoveryOutcome::Clean {
            info!("Recovered from an interrupted transaction: {:?}", outcome);
        }
        Ok(outcome)
    }
}

fn check_generation(expected: u64, found: u64) -> Result<()> {
    if expected != found {
        warn!(
            "Snapshot is stale: expected generation {}, found {}",
            expected, found
        );
        return Err(Error::StaleSnapshot { expected, found });
    }
    Ok(())
}
