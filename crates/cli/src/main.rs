mod commands;
mod logging;

use clap::{Parser, Subcommand};
use commands::migrate;
use elif_migrate::{MigrateError, MigratorConfig};
use logging::{init_logging, LoggingConfig};
use std::path::PathBuf;
use std::process::ExitCode;

/// Exit status when an applied script no longer matches its recorded checksum
const EXIT_CHECKSUM_MISMATCH: u8 = 2;

#[derive(Parser)]
#[command(name = "elif-migrate")]
#[command(about = "Apply versioned SQL migrations to PostgreSQL exactly once")]
#[command(version)]
struct Cli {
    /// PostgreSQL connection URL (overrides DATABASE_URL)
    #[arg(long, global = true)]
    database_url: Option<String>,

    /// Directory holding V<version>__<description>.sql scripts (overrides MIGRATIONS_DIR)
    #[arg(long, global = true)]
    dir: Option<PathBuf>,

    /// Ledger table name (overrides MIGRATION_LEDGER_TABLE)
    #[arg(long, global = true)]
    ledger_table: Option<String>,

    /// Lock table name (overrides MIGRATION_LOCK_TABLE)
    #[arg(long, global = true)]
    lock_table: Option<String>,

    /// Log level (overrides LOG_LEVEL)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply all pending migrations in one transaction
    Migrate,

    /// Show which migrations are applied, pending or changed since applied
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Create the next migration script
    New {
        /// Migration description, e.g. "add users email"
        description: String,
    },
}

impl Cli {
    fn apply_overrides(&self, config: &mut MigratorConfig) {
        if let Some(url) = &self.database_url {
            config.database_url = Some(url.clone());
        }
        if let Some(dir) = &self.dir {
            config.migrations_dir = dir.clone();
        }
        if let Some(table) = &self.ledger_table {
            config.ledger_table = table.clone();
        }
        if let Some(table) = &self.lock_table {
            config.lock_table = table.clone();
        }
        if let Some(level) = &self.log_level {
            config.log_level = level.to_lowercase();
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {:#}", err);
            exit_code_for(&err)
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = MigratorConfig::from_env()?;
    cli.apply_overrides(&mut config);
    config.validate()?;

    init_logging(&LoggingConfig::new(config.log_level.clone(), cli.json_logs))?;

    match cli.command {
        Commands::Migrate => migrate::run(&config).await,
        Commands::Status { json } => migrate::status(&config, json).await,
        Commands::New { description } => migrate::create(&config, &description),
    }
}

fn exit_code_for(err: &anyhow::Error) -> ExitCode {
    match err.downcast_ref::<MigrateError>() {
        Some(e) if e.is_checksum_mismatch() => ExitCode::from(EXIT_CHECKSUM_MISMATCH),
        _ => ExitCode::FAILURE,
    }
}
