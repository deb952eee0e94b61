// src/main.rs

use anyhow::{Context, Result, bail};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use nest::config::DEFAULT_CONFIG_PATH;
use nest::packages::PackageDefinition;
use nest::repository::{RepositoryClient, needs_sync, sync_repository};
use nest::transaction::TransactionPlan;
use nest::{ChangeRequest, Config, Requirement, TransactionEngine, TransactionOutcome, UpgradeTarget};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "nest")]
#[command(author, version, about = "Package manager with dependency resolution and rollback-safe transactions", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Operate on another root directory (every configured path is moved under it)
    #[arg(short, long, global = true)]
    root: Option<PathBuf>,

    /// Do not ask for confirmation
    #[arg(short, long, global = true)]
    yes: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Synchronize repository metadata
    Pull {
        /// Repository name (syncs all if omitted)
        repository: Option<String>,
        /// Sync even if the metadata hasn't expired
        #[arg(short, long)]
        force: bool,
    },
    /// Install packages, e.g. `app`, `lib>=2.0` or `stable::sys-libs/zlib`
    Install {
        #[arg(required = true)]
        packages: Vec<String>,
    },
    /// Uninstall packages
    Uninstall {
        #[arg(required = true)]
        packages: Vec<String>,
    },
    /// Upgrade installed packages (all if none are given)
    Upgrade { packages: Vec<String> },
    /// List installed packages
    List,
    /// Show the metadata and installed version of a package
    Info { package: String },
    /// List installed packages nothing explicit depends on anymore
    Orphans,
    /// Show transaction history
    History,
    /// Generate shell completion scripts
    Completions { shell: Shell },
}

fn main() -> Result<()> {
    // Initialize tracing subscriber for logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let Some(command) = cli.command else {
        println!("Nest Package Manager v{}", env!("CARGO_PKG_VERSION"));
        println!("Run 'nest --help' for usage information");
        return Ok(());
    };

    if let Commands::Completions { shell } = command {
        clap_complete::generate(shell, &mut Cli::command(), "nest", &mut io::stdout());
        return Ok(());
    }

    let mut config = Config::load_from(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;
    if let Some(root) = &cli.root {
        config.paths_mut().rebase(root);
    }

    match command {
        Commands::Pull { repository, force } => pull(&config, repository.as_deref(), force),
        Commands::Install { packages } => {
            let requirements = parse_requirements(&packages)?;
            run(&config, ChangeRequest::Install(requirements), cli.yes)
        }
        Commands::Uninstall { packages } => run(&config, ChangeRequest::Remove(packages), cli.yes),
        Commands::Upgrade { packages } => {
            let target = if packages.is_empty() {
                UpgradeTarget::All
            } else {
                UpgradeTarget::Packages(packages)
            };
            run(&config, ChangeRequest::Upgrade(target), cli.yes)
        }
        Commands::List => list(&config),
        Commands::Info { package } => info(&config, &package),
        Commands::Orphans => orphans(&config),
        Commands::History => history(&config),
        Commands::Completions { .. } => Ok(()),
    }
}

fn parse_requirements(packages: &[String]) -> Result<Vec<Requirement>> {
    packages
        .iter()
        .map(|p| {
            p.parse::<Requirement>()
                .with_context(|| format!("Invalid package requirement '{}'", p))
        })
        .collect()
}

fn pull(config: &Config, only: Option<&str>, force: bool) -> Result<()> {
    let client = RepositoryClient::new(config.fetch())?;
    let available = config.paths().available();

    let repositories: Vec<_> = config
        .repositories()
        .into_iter()
        .filter(|r| only.is_none_or(|name| r.name() == name))
        .collect();
    if repositories.is_empty() {
        match only {
            Some(name) => bail!("Repository '{}' is not configured", name),
            None => bail!("No repositories configured"),
        }
    }

    let mut failed = Vec::new();
    for repo in &repositories {
        if !force && !needs_sync(repo, &available) {
            info!("Repository {} is up to date", repo.name());
            continue;
        }
        match sync_repository(&client, repo, &available) {
            Ok(count) => println!("{}: {} packages", repo.name(), count),
            Err(e) => {
                warn!("Failed to synchronize {}: {}", repo.name(), e);
                failed.push(repo.name().to_string());
            }
        }
    }

    if !failed.is_empty() {
        bail!("Failed to synchronize: {}", failed.join(", "));
    }
    Ok(())
}

fn run(config: &Config, request: ChangeRequest, assume_yes: bool) -> Result<()> {
    let engine = TransactionEngine::from_config(config)?;
    let universe = engine.load_universe()?;
    for rejected in universe.rejected() {
        println!("Skipped definition from {}: {}", rejected.repository, rejected.error);
    }

    let mut confirm = |plan: &TransactionPlan| {
        println!("{}", plan);
        assume_yes || ask("Proceed?")
    };
    let outcome = engine.apply_with(&universe, &request, &mut confirm)?;

    match outcome {
        TransactionOutcome::Committed {
            generation,
            orphans,
            ..
        } => {
            println!("Transaction committed (generation {})", generation);
            if !orphans.is_empty() {
                println!("Packages no longer needed by any explicit package:");
                for id in &orphans {
                    println!("  {}", id);
                }
            }
            Ok(())
        }
        TransactionOutcome::NothingToDo => {
            println!("Nothing to do.");
            Ok(())
        }
        TransactionOutcome::Declined => {
            println!("Aborted.");
            Ok(())
        }
        TransactionOutcome::RolledBack { reason } => {
            Err(anyhow::Error::new(reason).context("Transaction rolled back, nothing was changed"))
        }
    }
}

/// Ask a yes/no question on the terminal, defaulting to yes
fn ask(question: &str) -> bool {
    print!("{} [Y/n] ", question);
    if io::stdout().flush().is_err() {
        return false;
    }
    let mut answer = String::new();
    match io::stdin().lock().read_line(&mut answer) {
        Ok(_) => is_yes(&answer),
        Err(_) => false,
    }
}

fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_lowercase().as_str(), "" | "y" | "yes")
}

fn list(config: &Config) -> Result<()> {
    let engine = TransactionEngine::from_config(config)?;
    let snapshot = engine.store().snapshot()?;

    if snapshot.graph.is_empty() {
        println!("No packages installed.");
        return Ok(());
    }

    println!("Installed packages:");
    for record in snapshot.graph.iter() {
        println!(
            "  {}/{} {} ({})",
            record.definition.category,
            record.name(),
            record.definition.version(),
            record.reason
        );
    }
    println!("\nTotal: {} package(s)", snapshot.graph.len());
    Ok(())
}

fn info(config: &Config, name: &str) -> Result<()> {
    let engine = TransactionEngine::from_config(config)?;
    let universe = engine.load_universe()?;
    let snapshot = engine.store().snapshot()?;
    let installed = snapshot.graph.get(name);

    let available: Vec<&PackageDefinition> =
        universe.iter().filter(|def| def.name() == name).collect();
    let Some(shown) = installed
        .map(|record| &record.definition)
        .or_else(|| available.first().copied())
    else {
        bail!("Package '{}' is neither available nor installed", name);
    };

    let metadata = &shown.metadata;
    println!("Name:         {}", shown.name());
    println!("Category:     {}", shown.category);
    println!("Version:      {}", shown.version());
    if !metadata.description.is_empty() {
        println!("Description:  {}", metadata.description);
    }
    if !metadata.tags.is_empty() {
        println!("Tags:         {}", metadata.tags.join(", "));
    }
    if let Some(maintainer) = &metadata.maintainer {
        println!("Maintainer:   {}", maintainer);
    }
    if !metadata.licenses.is_empty() {
        println!("Licenses:     {}", metadata.licenses.join(", "));
    }
    if let Some(url) = &metadata.upstream_url {
        println!("Upstream:     {}", url);
    }
    if let Some(wrap_date) = &shown.wrap_date {
        println!("Wrapped:      {}", wrap_date.to_rfc3339());
    }

    match installed {
        Some(record) => println!("Installed:    {} ({})", record.id(), record.reason),
        None => println!("Installed:    no"),
    }
    if !available.is_empty() {
        println!("Available:");
        for def in &available {
            println!("  {}", def.qualified_id()?);
        }
    }
    Ok(())
}

fn orphans(config: &Config) -> Result<()> {
    let engine = TransactionEngine::from_config(config)?;
    let orphans = engine.store().snapshot()?.graph.orphans();

    if orphans.is_empty() {
        println!("No orphaned packages.");
    } else {
        for id in &orphans {
            println!("  {}", id);
        }
        println!("\nTotal: {} orphan(s)", orphans.len());
    }
    Ok(())
}

fn history(config: &Config) -> Result<()> {
    let engine = TransactionEngine::from_config(config)?;
    let entries = engine.store().history()?;

    if entries.is_empty() {
        println!("No transaction history.");
        return Ok(());
    }

    println!("Transaction history:");
    for entry in &entries {
        println!(
            "  [{}] {} - {} (+{} -{} ~{})",
            entry.generation,
            entry.committed_at.as_deref().unwrap_or("unknown"),
            entry.description,
            entry.installed,
            entry.removed,
            entry.replaced
        );
    }
    println!("\nTotal: {} transaction(s)", entries.len());
    Ok(())
}
