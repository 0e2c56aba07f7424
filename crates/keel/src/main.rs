//! `keel`: boot, check and migrate a PostgreSQL database layer.
//!
//! Configuration comes from `DB_*` environment variables; see
//! [`keel::config`].
//!
//! ```text
//! keel migrate ./migrations           # connect, apply, drain
//! keel check                          # connect, probe once, drain
//! keel run --migrations ./migrations  # boot, then hold until SIGINT/SIGTERM
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use keel::migrate::MigrationSet;
use keel::pool::{PgLifecycle, ProbeOutcome, ShutdownSignal};
use keel::signal::wait_for_signal;
use keel::telemetry::{TracingConfig, init_tracing};
use keel::{Database, DatabaseConfig};

#[derive(Parser)]
#[command(name = "keel", version, about = "Database connectivity and resilience layer")]
struct Cli {
    /// Log at debug level unless RUST_LOG is set
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Apply pending migrations from a directory of .sql files
    Migrate {
        /// Directory containing NNNN_name.sql files
        dir: PathBuf,
    },
    /// Connect, run one health probe and print pool status
    Check,
    /// Boot the database layer and hold it until a shutdown signal
    Run {
        /// Apply migrations from this directory before reporting ready
        #[arg(long)]
        migrations: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&TracingConfig { debug: cli.debug }).map_err(|e| anyhow!(e))?;

    let config = DatabaseConfig::from_env().context("invalid database configuration")?;

    match cli.command {
        Command::Migrate { dir } => migrate(config, &dir).await,
        Command::Check => check(config).await,
        Command::Run { migrations } => run(config, migrations.as_deref()).await,
    }
}

async fn migrate(config: DatabaseConfig, dir: &Path) -> Result<()> {
    let set = load_migrations(dir)?;
    let db = connect(config).await?;

    let result = db.run_migrations(&set).await;
    db.begin_shutdown(ShutdownSignal::Manual).await;

    let report = result.context("migration failed")?;
    println!(
        "applied {} migration(s), {} already up to date",
        report.applied.len(),
        report.skipped.len()
    );
    for record in &report.applied {
        let short = record.checksum.get(..12).unwrap_or(&record.checksum);
        println!("  {} ({short})", record.name);
    }
    Ok(())
}

async fn check(config: DatabaseConfig) -> Result<()> {
    let db = connect(config).await?;

    let outcome = db.probe().await;
    let status = db.status();
    println!(
        "pool: {} total, {} idle, {} in use, max {}",
        status.total, status.available, status.in_use, status.max
    );
    db.begin_shutdown(ShutdownSignal::Manual).await;

    match outcome {
        ProbeOutcome::Healthy(result) => {
            println!("database healthy ({} ms)", result.latency.as_millis());
            Ok(())
        }
        ProbeOutcome::Failed(result) => bail!(
            "database unhealthy: {}",
            result.error.unwrap_or_else(|| "unknown error".to_string())
        ),
        ProbeOutcome::Skipped => bail!("no connection available for a health probe"),
    }
}

async fn run(config: DatabaseConfig, migrations: Option<&Path>) -> Result<()> {
    let set = migrations.map(load_migrations).transpose()?;
    let db = connect(config).await?;

    if let Some(set) = set {
        if let Err(e) = db.run_migrations(&set).await {
            db.begin_shutdown(ShutdownSignal::Manual).await;
            return Err(e).context("migration failed, refusing to start");
        }
    }

    tracing::info!("database layer ready");

    let signal = wait_for_signal().await;
    let report = db.begin_shutdown(signal).await;
    if let Some(err) = report.timeout_error() {
        tracing::warn!(error = %err, "shutdown forced");
    }
    Ok(())
}

async fn connect(config: DatabaseConfig) -> Result<Database<PgLifecycle>> {
    Database::connect_postgres(config)
        .await
        .context("failed to bring up the database connection pool")
}

fn load_migrations(dir: &Path) -> Result<MigrationSet> {
    MigrationSet::from_dir(dir)
        .with_context(|| format!("failed to load migrations from {}", dir.display()))
}
