//! Reminder Cache Binary
//!
//! Operator tool for the reminder cache: inspect the unified cache directory,
//! migrate legacy cache locations and clean old entries. Every command prints
//! JSON to stdout; logs go to stderr.
//!
//! Cache directory precedence:
//!   1. --cache-dir flag
//!   2. REMINDER_CACHE_DIR env var
//!   3. ~/.reminder-cache
//!   4. Fallback: ./.reminder-cache

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use reminder_cache::cache::{CacheCategory, CleanCategory};
use reminder_cache::{
    CacheManager, CancellationToken, CleanOptions, CleanSelection, MigrationOptions, StoreConfig,
};
use serde_json::json;
use tracing_subscriber::EnvFilter;

/// Command line interface for the reminder cache.
#[derive(Debug, Parser)]
#[command(
    name = "reminder-cache",
    version,
    about = "Inspect, migrate and clean the reminder cache"
)]
struct Cli {
    /// Explicit cache directory (overrides env + home default)
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,

    /// Suppress info logs (only warnings+)
    #[arg(long, global = true)]
    quiet: bool,

    /// Disable ANSI color output
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the resolved cache directory and exit
    PrintCacheDir,
    /// Directory and fingerprint store statistics
    Stats,
    /// Drop task records older than the TTL
    Purge,
    /// Delete old cache entries by category
    Clean(CleanArgs),
    /// Move legacy cache data into the unified layout
    Migrate(MigrateArgs),
    /// Delete the oldest files of a category until it fits a size budget
    Evict(EvictArgs),
}

#[derive(Debug, Args)]
struct CleanArgs {
    /// Clean every category
    #[arg(long)]
    all: bool,
    #[arg(long)]
    tasks: bool,
    #[arg(long)]
    images: bool,
    #[arg(long)]
    image_hashes: bool,
    #[arg(long)]
    temp: bool,
    #[arg(long)]
    generated: bool,

    /// Only entries at least this old, e.g. 7d, 12h, 30m
    #[arg(long, default_value = "", value_name = "AGE")]
    older_than: String,

    /// Report what would be deleted without deleting
    #[arg(long)]
    dry_run: bool,

    /// Confirm deletion
    #[arg(long)]
    force: bool,

    /// Also wipe every task record regardless of age
    #[arg(long)]
    clear_all: bool,
}

impl CleanArgs {
    fn selection(&self) -> CleanSelection {
        if self.all {
            return CleanSelection::All;
        }
        let flags = [
            (self.tasks, CleanCategory::Tasks),
            (self.images, CleanCategory::Images),
            (self.image_hashes, CleanCategory::ImageHashes),
            (self.temp, CleanCategory::Temp),
            (self.generated, CleanCategory::Generated),
        ];
        CleanSelection::Only(
            flags
                .into_iter()
                .filter_map(|(set, category)| set.then_some(category))
                .collect(),
        )
    }
}

#[derive(Debug, Args)]
struct MigrateArgs {
    #[arg(long)]
    dry_run: bool,
    /// Back up occupied destinations under legacy/backups
    #[arg(long)]
    backup: bool,
    /// Remove legacy sources after a verified copy
    #[arg(long)]
    delete_source: bool,
    #[arg(long)]
    skip_existing: bool,
    /// Overwrite occupied destinations (wins over --skip-existing)
    #[arg(long)]
    force_overwrite: bool,
}

#[derive(Debug, Args)]
struct EvictArgs {
    /// images or temp
    #[arg(long, default_value = "images")]
    category: CacheCategory,
    #[arg(long, value_name = "BYTES")]
    max_bytes: u64,
    #[arg(long)]
    dry_run: bool,
}

/// Cancel `token` on Ctrl-C.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received; cancelling");
            token.cancel();
        }
    });
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logging / tracing setup
    let mut fmt = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(if cli.quiet { "warn" } else { "info" }.parse()?)
                .add_directive(
                    if cli.quiet {
                        "reminder_cache=warn"
                    } else {
                        "reminder_cache=info"
                    }
                    .parse()?,
                ),
        )
        .with_writer(std::io::stderr)
        .with_target(false);
    if cli.no_color {
        fmt = fmt.with_ansi(false);
    }
    fmt.init();

    let mut manager = CacheManager::from_env(cli.cache_dir.as_deref());

    match cli.command {
        Command::PrintCacheDir => {
            println!("{}", manager.layout().root().display());
        }
        Command::Stats => {
            let dirs = manager
                .layout()
                .stats()
                .context("Failed to read cache directory stats")?;
            let store = manager.open(StoreConfig::default()).await?;
            let mut directories = serde_json::Map::new();
            for (category, stats) in dirs {
                directories.insert(category.to_string(), serde_json::to_value(stats)?);
            }
            print_json(&json!({
                "cache_dir": manager.layout().root(),
                "legacy_cache": manager.layout().legacy_paths(),
                "directories": directories,
                "store": store.stats(),
            }))?;
        }
        Command::Purge => {
            let store = manager.open(StoreConfig::default()).await?;
            let purged = store.purge_expired();
            print_json(&json!({ "purged": purged, "remaining": store.len() }))?;
        }
        Command::Clean(args) => {
            if !args.dry_run && !args.force {
                bail!("Refusing to delete without --force (use --dry-run to preview)");
            }
            let options = CleanOptions {
                categories: args.selection(),
                dry_run: args.dry_run,
                force: args.force,
                older_than: args.older_than.clone(),
                clear_all: args.clear_all,
            };
            if options.categories.categories().is_empty() && !options.clear_all {
                bail!("No categories selected; pass --all or one of --tasks, --images, --image-hashes, --temp, --generated");
            }

            let cancel = CancellationToken::new();
            cancel_on_ctrl_c(cancel.clone());
            manager.open(StoreConfig::default()).await?;
            let summary = manager
                .clean(&options, &cancel)
                .await
                .context("Cleanup failed")?;
            print_json(&summary)?;
        }
        Command::Migrate(args) => {
            let options = MigrationOptions {
                dry_run: args.dry_run,
                backup: args.backup,
                delete_source: args.delete_source,
                skip_existing: args.skip_existing,
                force_overwrite: args.force_overwrite,
            };
            let cancel = CancellationToken::new();
            cancel_on_ctrl_c(cancel.clone());
            let result = manager
                .migrate(options, &cancel)
                .context("Migration failed")?;
            print_json(&result)?;
            if result.has_failures() {
                bail!("{} migration item(s) failed", result.failed.len());
            }
        }
        Command::Evict(args) => {
            let cancel = CancellationToken::new();
            cancel_on_ctrl_c(cancel.clone());
            let result = manager
                .evict_to_budget(args.category, args.max_bytes, args.dry_run, &cancel)
                .with_context(|| format!("Eviction of {} failed", args.category))?;
            print_json(&result)?;
        }
    }

    manager
        .shutdown()
        .await
        .context("Failed to flush the fingerprint store")?;
    Ok(())
}
