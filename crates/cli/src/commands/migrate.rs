use anyhow::Context;
use elif_migrate::{
    create_migration, Migration, MigrationExecutor, MigrationLoader, MigrationRepository,
    MigrationState, MigratorConfig, PostgresSource,
};
use serde_json::json;
use tracing::info;

/// Apply all pending migrations from the configured directory
pub async fn run(config: &MigratorConfig) -> anyhow::Result<()> {
    let migrations = discover(config);
    let executor = connect(config).await?;

    let outcome = executor.migrate(&migrations).await;
    executor.source().close().await;
    let result = outcome?;

    if result.applied_count == 0 {
        println!("Database is up to date ({} migration(s) already applied)", result.skipped_count);
    } else {
        let versions: Vec<String> = result.applied_versions.iter().map(|v| format!("V{}", v)).collect();
        println!(
            "Applied {} migration(s) in {}ms: {}",
            result.applied_count,
            result.execution_time_ms,
            versions.join(", ")
        );
    }
    Ok(())
}

/// Print each discovered migration with its state against the ledger
pub async fn status(config: &MigratorConfig, as_json: bool) -> anyhow::Result<()> {
    let migrations = discover(config);
    let executor = connect(config).await?;

    let outcome = executor.status(&migrations).await;
    executor.source().close().await;
    let report = outcome?;

    if as_json {
        let rows: Vec<_> = report
            .iter()
            .map(|(migration, state)| json!({ "migration": migration, "status": state }))
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    if report.is_empty() {
        println!("No migrations found in {}", config.migrations_dir.display());
        return Ok(());
    }

    println!("Migration Status:");
    println!("================");
    for (migration, state) in &report {
        println!("  {:<16} {}", state_label(state), migration.script_name());
    }

    let pending = report
        .iter()
        .filter(|(_, state)| *state == MigrationState::Pending)
        .count();
    println!("\n{} of {} migration(s) pending", pending, report.len());
    Ok(())
}

/// Create the next versioned script in the migrations directory
pub fn create(config: &MigratorConfig, description: &str) -> anyhow::Result<()> {
    let path = create_migration(&config.migrations_dir, description)
        .with_context(|| format!("Failed to create migration in {}", config.migrations_dir.display()))?;
    println!("Created migration: {}", path.display());
    Ok(())
}

fn state_label(state: &MigrationState) -> &'static str {
    match state {
        MigrationState::Pending => "pending",
        MigrationState::Applied => "applied",
        MigrationState::ChecksumMismatch { .. } => "CHECKSUM MISMATCH",
    }
}

fn discover(config: &MigratorConfig) -> Vec<Migration> {
    let discovery = MigrationLoader::new().load_dir(&config.migrations_dir);
    if !discovery.warnings.is_empty() {
        info!("{} file(s) skipped during discovery", discovery.warnings.len());
    }
    discovery.into_migrations()
}

async fn connect(config: &MigratorConfig) -> anyhow::Result<MigrationExecutor<PostgresSource>> {
    let url = config.require_database_url()?;
    let repository = MigrationRepository::new(config.ledger_config())?;

    info!("Connecting to {}", elif_migrate::backends::postgres::redact_database_url(url));
    let source = PostgresSource::connect(url, config.pool_config()).await?;
    Ok(MigrationExecutor::with_repository(source, repository))
}
