//! CLI entry point for the tidemark migration tool.
//! Provides clap-based command routing for the engine's subcommands and
//! exit code mapping based on error type.

mod output;

use std::path::PathBuf;
use std::process;

use clap::{Args, Parser, Subcommand};
use colored::Colorize;

use tidemark_core::config::{split_list, CliOverrides, TidemarkConfig};
use tidemark_core::error::TidemarkError;
use tidemark_core::{RollbackTarget, Tidemark};

/// Print any serializable report as pretty JSON on stdout.
macro_rules! print_json {
    ($value:expr) => {
        match serde_json::to_string_pretty(&$value) {
            Ok(text) => println!("{}", text),
            Err(e) => log::error!("Failed to serialize output; error={}", e),
        }
    };
}

/// Top-level CLI definition with global flags and subcommand dispatch.
#[derive(Parser)]
#[command(
    name = "tidemark",
    about = "Changeset-based database migration tool",
    version,
    propagate_version = true
)]
struct Cli {
    /// Config file path (default: tidemark.toml)
    #[arg(short, long, value_name = "PATH")]
    config: Option<String>,

    /// Database URL (overrides config)
    #[arg(long, value_name = "URL")]
    url: Option<String>,

    /// Root changelog file (overrides config)
    #[arg(long, value_name = "FILE")]
    changelog: Option<PathBuf>,

    /// Schema holding the ledger and lock tables (overrides config)
    #[arg(long, value_name = "SCHEMA")]
    schema: Option<String>,

    /// Ledger table name (overrides config)
    #[arg(long, value_name = "TABLE")]
    table: Option<String>,

    /// Lock table name (overrides config)
    #[arg(long, value_name = "TABLE")]
    lock_table: Option<String>,

    /// Contexts to run, comma-separated (overrides config)
    #[arg(long, value_name = "LIST", global = true)]
    contexts: Option<String>,

    /// Labels to run, comma-separated (overrides config)
    #[arg(long, value_name = "LIST", global = true)]
    labels: Option<String>,

    /// Number of retries when connecting to the database
    #[arg(long, value_name = "N")]
    connect_retries: Option<u32>,

    /// SSL/TLS mode: disable, prefer, require
    #[arg(long, value_name = "MODE")]
    ssl_mode: Option<String>,

    /// Connection timeout in seconds (default: 30, 0 = no timeout)
    #[arg(long, value_name = "SECS")]
    connect_timeout: Option<u32>,

    /// Statement timeout in seconds (default: 0 = no limit)
    #[arg(long, value_name = "SECS")]
    statement_timeout: Option<u32>,

    /// TCP keepalive interval in seconds (default: 120, 0 = disabled)
    #[arg(long, value_name = "SECS")]
    keepalive: Option<u32>,

    /// Run the whole migrate pass in one transaction
    #[arg(long)]
    batch_transaction: bool,

    /// Seconds to wait for the changelog lock (default: 300)
    #[arg(long, value_name = "SECS")]
    lock_wait_timeout: Option<u64>,

    /// Reclaim a lock older than this many seconds
    #[arg(long, value_name = "SECS")]
    lock_stale_after: Option<u64>,

    /// Output results as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Enable verbose/debug output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// All available tidemark subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Apply pending change sets
    Migrate,

    /// Undo change sets back to a tag, a date or a count
    Rollback(RollbackArgs),

    /// Show pending change sets and per-change-set status
    Status,

    /// Validate the changelog against itself and the ledger
    Validate,

    /// List every ledger row
    History,

    /// Tag the current ledger position
    Tag {
        /// Tag name
        #[arg(value_name = "NAME")]
        name: String,
    },

    /// Null every stored checksum so the next migrate recomputes them
    ClearChecksums,

    /// Force-release the changelog lock
    ReleaseLocks,

    /// Show who holds the changelog lock
    ListLocks,

    /// Mark pending change sets as run without executing them
    Sync,
}

#[derive(Args)]
#[group(required = true, multiple = false)]
struct RollbackArgs {
    /// Undo everything applied after this tag
    #[arg(long, value_name = "TAG")]
    tag: Option<String>,

    /// Undo everything applied after this date (RFC 3339 or YYYY-MM-DD[ HH:MM:SS], UTC)
    #[arg(long, value_name = "DATE")]
    date: Option<String>,

    /// Undo the most recent N change sets
    #[arg(long, value_name = "N")]
    count: Option<usize>,
}

impl RollbackArgs {
    fn target(&self) -> Result<RollbackTarget, TidemarkError> {
        if let Some(tag) = &self.tag {
            return Ok(RollbackTarget::Tag(tag.clone()));
        }
        if let Some(date) = &self.date {
            return RollbackTarget::parse_date(date);
        }
        match self.count {
            Some(n) => Ok(RollbackTarget::Count(n)),
            None => Err(TidemarkError::RollbackTargetInvalid(
                "one of --tag, --date or --count is required".to_string(),
            )),
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Set up logging (suppress when JSON output is requested)
    let filter = if cli.json {
        "error"
    } else if cli.verbose {
        "debug"
    } else if cli.quiet {
        "error"
    } else {
        "info"
    };

    env_logger::Builder::new()
        .parse_env(env_logger::Env::default().default_filter_or(filter))
        .format_target(false)
        .format_timestamp(None)
        .init();

    if let Err(e) = run(cli).await {
        print_error(&e);
        process::exit(exit_code(&e));
    }
}

/// Map error types to differentiated exit codes.
fn exit_code(error: &TidemarkError) -> i32 {
    match error {
        TidemarkError::ConfigError(_)
        | TidemarkError::ChangelogParseError(_)
        | TidemarkError::UnknownChangeType { .. }
        | TidemarkError::IoError(_) => 2,
        TidemarkError::ValidationFailed(_) => 3,
        TidemarkError::DatabaseError(_)
        | TidemarkError::StatementFailed(_)
        | TidemarkError::ConnectionLost { .. } => 4,
        TidemarkError::ExecutionFailed { .. } => 5,
        TidemarkError::LockTimeout { .. } | TidemarkError::LockError(_) => 6,
        TidemarkError::PreconditionFailed { .. } | TidemarkError::PreconditionError { .. } => 7,
        TidemarkError::RollbackUnsupported { .. }
        | TidemarkError::RollbackFailed { .. }
        | TidemarkError::RollbackTargetInvalid(_) => 8,
    }
}

/// Build configuration, connect, and dispatch the chosen subcommand.
async fn run(cli: Cli) -> Result<(), TidemarkError> {
    let json_output = cli.json;

    let overrides = CliOverrides {
        url: cli.url,
        changelog_file: cli.changelog,
        schema: cli.schema,
        table: cli.table,
        lock_table: cli.lock_table,
        contexts: cli.contexts.as_deref().map(split_list),
        labels: cli.labels.as_deref().map(split_list),
        connect_retries: cli.connect_retries,
        ssl_mode: cli.ssl_mode,
        connect_timeout: cli.connect_timeout,
        statement_timeout: cli.statement_timeout,
        keepalive: cli.keepalive,
        batch_transaction: if cli.batch_transaction {
            Some(true)
        } else {
            None
        },
        lock_wait_timeout: cli.lock_wait_timeout,
        lock_stale_after: cli.lock_stale_after,
    };

    let config = TidemarkConfig::load(cli.config.as_deref(), &overrides)?;
    let tm = Tidemark::new(config).await?;

    match &cli.command {
        Commands::Migrate => {
            let changelog = tm.load_changelog()?;
            let report = tm.migrate(&changelog).await?;
            if json_output {
                print_json!(report);
            } else {
                output::print_migrate_summary(&report);
            }
        }
        Commands::Rollback(args) => {
            let target = args.target()?;
            let changelog = tm.load_changelog()?;
            let report = tm.rollback(&changelog, &target).await?;
            if json_output {
                print_json!(report);
            } else {
                output::print_rollback_summary(&report);
            }
        }
        Commands::Status => {
            let changelog = tm.load_changelog()?;
            let report = tm.status(&changelog).await?;
            if json_output {
                print_json!(report);
            } else {
                output::print_status(&report);
            }
        }
        Commands::Validate => {
            let changelog = tm.load_changelog()?;
            let report = tm.validate(&changelog).await?;
            if json_output {
                print_json!(report);
            } else {
                output::print_validate_result(&report);
            }
            if !report.valid {
                return Err(TidemarkError::ValidationFailed(report.issues));
            }
        }
        Commands::History => {
            let rows = tm.history().await?;
            if json_output {
                print_json!(rows);
            } else {
                output::print_history_table(&rows);
            }
        }
        Commands::Tag { name } => {
            let row = tm.tag(name).await?;
            if json_output {
                print_json!(row);
            } else {
                println!(
                    "{}",
                    format!("Tagged {} as '{}'", row.identity, name).green().bold()
                );
            }
        }
        Commands::ClearChecksums => {
            let cleared = tm.clear_checksums().await?;
            if json_output {
                println!("{}", serde_json::json!({ "cleared": cleared }));
            } else {
                println!(
                    "{}",
                    format!("Cleared {} stored checksum(s).", cleared).green()
                );
            }
        }
        Commands::ReleaseLocks => {
            let released = tm.release_locks().await?;
            if json_output {
                println!("{}", serde_json::json!({ "released": released }));
            } else if released {
                println!("{}", "Released the changelog lock.".green());
            } else {
                println!("{}", "The changelog lock was not held.".dimmed());
            }
        }
        Commands::ListLocks => {
            let record = tm.list_locks().await?;
            if json_output {
                print_json!(record);
            } else {
                output::print_lock(&record);
            }
        }
        Commands::Sync => {
            let changelog = tm.load_changelog()?;
            let report = tm.sync(&changelog).await?;
            if json_output {
                print_json!(report);
            } else {
                output::print_sync_summary(&report);
            }
        }
    }

    Ok(())
}

/// Print a formatted error message with actionable hints to stderr.
fn print_error(error: &TidemarkError) {
    eprintln!("{} {}", "ERROR:".red().bold(), error);

    // Provide actionable guidance
    match error {
        TidemarkError::ConfigError(_) => {
            eprintln!(
                "{}",
                "Hint: Check your tidemark.toml or set TIDEMARK_DATABASE_URL environment variable."
                    .dimmed()
            );
        }
        TidemarkError::DatabaseError(_) | TidemarkError::ConnectionLost { .. } => {
            eprintln!(
                "{}",
                "Hint: Verify database is running and connection details are correct.".dimmed()
            );
        }
        TidemarkError::ChangelogParseError(_) | TidemarkError::UnknownChangeType { .. } => {
            eprintln!(
                "{}",
                "Hint: Check the changelog file named by [changelog] file or --changelog.".dimmed()
            );
        }
        TidemarkError::ValidationFailed(issues) => {
            let drift = issues
                .iter()
                .any(|i| matches!(i, tidemark_core::error::ValidationIssue::ChecksumDrift { .. }));
            if drift {
                eprintln!(
                    "{}",
                    "Hint: Restore the original change set, add the stored checksum to valid_checksums, or run 'tidemark clear-checksums' if the edit was intended."
                        .dimmed()
                );
            }
        }
        TidemarkError::LockTimeout { .. } => {
            eprintln!(
                "{}",
                "Hint: If the holder is no longer running, run 'tidemark release-locks'.".dimmed()
            );
        }
        TidemarkError::ExecutionFailed { .. } => {
            eprintln!(
                "{}",
                "Hint: Change sets before the failing one were kept. Fix it and run 'tidemark migrate' again."
                    .dimmed()
            );
        }
        TidemarkError::RollbackUnsupported { .. } => {
            eprintln!(
                "{}",
                "Hint: Add an explicit rollback to the change set, or use rollback = \"empty\" if nothing needs undoing."
                    .dimmed()
            );
        }
        TidemarkError::PreconditionFailed { .. } | TidemarkError::PreconditionError { .. } => {
            eprintln!(
                "{}",
                "Hint: Set on_fail / on_error to CONTINUE, MARK_RAN or WARN if this should not halt the run."
                    .dimmed()
            );
        }
        _ => {}
    }
}
