//! The `sediment` command line tool.
//!
//! Loads JSON descriptors from a directory and applies them to the database
//! in `DATABASE_URL`.

#![deny(missing_docs)]

use std::future::Future;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use sediment_core::{CancellationToken, MigrationError, Migrator, MigratorConfig, loader};
use sediment_sqlx::SqlxBackend;

mod commands;

/// Exit code when another runner holds the lock (`EX_TEMPFAIL`).
pub const EXIT_LOCKED: u8 = 75;
/// Exit code after Ctrl-C.
pub const EXIT_CANCELLED: u8 = 130;

/// Command line arguments.
#[derive(Debug, Parser)]
#[command(name = "sediment")]
#[command(about = "Schema migrations that converge on any database state", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Database connection URL (sqlite://, mysql://, postgres://).
    #[arg(long, env = "DATABASE_URL", global = true, hide_env_values = true)]
    pub database_url: Option<String>,

    /// Directory holding the descriptor files.
    #[arg(long, env = "SEDIMENT_MIGRATIONS", default_value = "migrations", global = true)]
    pub migrations: PathBuf,

    /// Prefix applied to every table, index and bookkeeping table.
    #[arg(long, env = "SEDIMENT_TABLE_PREFIX", default_value = "", global = true)]
    pub table_prefix: String,

    /// Name of the ledger table, before the prefix.
    #[arg(long, default_value = "migrations", global = true)]
    pub ledger_table: String,

    /// Seconds after which a held lock is considered abandoned.
    #[arg(long, default_value_t = 600, global = true)]
    pub lock_timeout_secs: u64,

    /// Attempts to make after the first when the lock is held.
    #[arg(long, default_value_t = 5, global = true)]
    pub lock_retries: u32,

    /// Run even when an applied descriptor was edited.
    #[arg(long, global = true)]
    pub ignore_checksums: bool,

    /// More output (-v debug, -vv trace).
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only warnings and errors.
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// What to do.
    #[command(subcommand)]
    pub command: Command,
}

/// Subcommands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Apply pending descriptors
    Migrate {
        /// Record each descriptor in its own batch
        #[arg(long)]
        step: bool,
        /// Print the plan without touching the database
        #[arg(long)]
        dry_run: bool,
    },
    /// Revert the latest batches
    Rollback {
        /// Number of batches to revert
        #[arg(long, default_value_t = 1)]
        batches: usize,
    },
    /// Revert every batch
    Reset,
    /// Show applied, pending and orphaned descriptors
    Status,
    /// Print the live schema as JSON
    Schema,
}

impl Cli {
    /// Log filter implied by `-v` and `-q`.
    pub fn log_level(&self) -> &'static str {
        match (self.quiet, self.verbose) {
            (true, _) => "warn",
            (false, 0) => "info",
            (false, 1) => "debug",
            (false, _) => "trace",
        }
    }

    /// Migrator settings from the flags.
    pub fn config(&self) -> MigratorConfig {
        MigratorConfig {
            table_prefix: self.table_prefix.clone(),
            ledger_table: self.ledger_table.clone(),
            lock_table: format!("{}_lock", self.ledger_table),
            lock_stale_after: Duration::from_secs(self.lock_timeout_secs),
            lock_retries: self.lock_retries,
            verify_checksums: !self.ignore_checksums,
            ..Default::default()
        }
    }
}

/// Runs the selected command, writing its report to `out`.
pub async fn run<W: Write>(cli: &Cli, cancel: &CancellationToken, out: &mut W) -> Result<()> {
    let url = cli
        .database_url
        .as_deref()
        .context("no database given: pass --database-url or set DATABASE_URL")?;
    // The live schema is read without any descriptors.
    let descriptors = if matches!(cli.command, Command::Schema) {
        Vec::new()
    } else {
        let descriptors = loader::load_dir(&cli.migrations).with_context(|| {
            format!("cannot load descriptors from {}", cli.migrations.display())
        })?;
        log::debug!("Loaded {} descriptor(s)", descriptors.len());
        descriptors
    };

    let config = cli.config();
    let backend = SqlxBackend::connect(url, config.ledger_tables())
        .await
        .context("cannot connect to the database")?;
    let migrator = Migrator::new(backend, descriptors, config);

    match &cli.command {
        Command::Migrate { step, dry_run } => {
            commands::migrate(&migrator, *step, *dry_run, cancel, out).await
        }
        Command::Rollback { batches } => {
            commands::rollback(&migrator, Some(*batches), cancel, out).await
        }
        Command::Reset => commands::rollback(&migrator, None, cancel, out).await,
        Command::Status => commands::status(&migrator, out).await,
        Command::Schema => commands::schema(&migrator, out).await,
    }
}

/// Cancels `cancel` on the first interrupt so the run stops between
/// descriptors. Returns `true` when a second interrupt arrives and the
/// process should abort, `false` when interrupts can no longer be received.
pub async fn watch_interrupts<F, Fut>(cancel: &CancellationToken, mut interrupted: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    if !interrupted().await {
        return false;
    }
    log::warn!("Interrupted, stopping after the current descriptor (interrupt again to abort)");
    cancel.cancel();
    interrupted().await
}

/// Process exit code for a failed run.
pub fn exit_code(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<MigrationError>() {
        Some(MigrationError::LockContention { .. } | MigrationError::LockLost { .. }) => {
            EXIT_LOCKED
        }
        Some(MigrationError::Cancelled { .. }) => EXIT_CANCELLED,
        _ => 1,
    }
}
