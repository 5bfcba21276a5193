//! warehouse-upsert CLI - load SAP report extracts into SQL Server.

mod job;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;
use warehouse_upsert::{Config, LoadError, MergeOutcome, MssqlProvider, UpsertEngine};

use crate::job::JobSpec;

#[derive(Parser)]
#[command(name = "warehouse-upsert")]
#[command(about = "Idempotent staging-table upserts into a SQL Server warehouse")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file (default: read SQL_* / ETL_* environment variables)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Output JSON result to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Merge an extract into its target table (update matches, insert new rows)
    Upsert {
        #[command(flatten)]
        load: LoadArgs,
    },

    /// Append an extract to its target table without matching
    Append {
        #[command(flatten)]
        load: LoadArgs,
    },

    /// Test the database connection
    HealthCheck,
}

#[derive(clap::Args)]
struct LoadArgs {
    /// Job file describing the target table, keys and columns
    #[arg(long)]
    job: PathBuf,

    /// Delimited extract to load
    #[arg(long)]
    input: PathBuf,

    /// Move the extract here after a successful load
    #[arg(long)]
    archive_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<(), LoadError> {
    let cli = Cli::parse();

    setup_logging(&cli.verbosity, &cli.log_format).map_err(LoadError::Config)?;

    let config = match &cli.config {
        Some(path) => {
            let config = Config::load(path)?;
            info!("Loaded configuration from {:?}", path);
            config
        }
        None => Config::from_env()?,
    };

    match &cli.command {
        Commands::Upsert { load } => {
            let job = JobSpec::load(&load.job)?;
            let dataset = job.read_input(&load.input)?;
            let request = job.upsert_request();

            let engine = connect(&config).await?;
            let outcome = engine.upsert(&dataset, &request).await?;
            report(&cli, "Upsert", &outcome)?;
            finish(load)?;
        }

        Commands::Append { load } => {
            let job = JobSpec::load(&load.job)?;
            let dataset = job.read_input(&load.input)?;
            let request = job.append_request();

            let engine = connect(&config).await?;
            let outcome = engine.append(&dataset, &request).await?;
            report(&cli, "Append", &outcome)?;
            finish(load)?;
        }

        Commands::HealthCheck => {
            let provider = MssqlProvider::lazy(&config.target);
            let result = provider.health_check().await;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("Health Check Results:");
                println!(
                    "  SQL Server {}: {} ({}ms)",
                    config.target.describe(),
                    if result.connected { "OK" } else { "FAILED" },
                    result.latency_ms
                );
                if let Some(ref version) = result.server_version {
                    println!("    Version: {}", version);
                }
                if let Some(ref err) = result.error {
                    println!("    Error: {}", err);
                }
            }

            if !result.connected {
                return Err(LoadError::pool(
                    "health check failed",
                    config.target.describe(),
                ));
            }
        }
    }

    Ok(())
}

async fn connect(config: &Config) -> Result<UpsertEngine, LoadError> {
    let provider = MssqlProvider::connect(&config.target).await?;
    Ok(UpsertEngine::new(Arc::new(provider), config.upsert.clone()))
}

fn report(cli: &Cli, action: &str, outcome: &MergeOutcome) -> Result<(), LoadError> {
    if cli.output_json {
        println!("{}", serde_json::to_string_pretty(outcome)?);
    } else {
        println!("\n{} completed!", action);
        println!("  Table: {}", outcome.table);
        println!("  Rows before: {}", outcome.rows_before);
        println!("  Rows after: {}", outcome.rows_after);
        println!("  Rows inserted: {}", outcome.rows_inserted);
        println!("  Rows staged: {}", outcome.rows_staged);
        println!("  Attempts: {}", outcome.attempts);
    }
    Ok(())
}

fn finish(load: &LoadArgs) -> Result<(), LoadError> {
    if let Some(dir) = &load.archive_dir {
        job::archive(&load.input, Path::new(dir))?;
    }
    Ok(())
}

fn setup_logging(verbosity: &str, format: &str) -> Result<(), String> {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => "debug",
        "info" => "info",
        "warn" => "warn",
        "error" => "error",
        other => return Err(format!("unknown verbosity '{}'", other)),
    };

    // RUST_LOG takes precedence over --verbosity
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        "json" => subscriber.json().init(),
        "text" => subscriber.init(),
        other => return Err(format!("unknown log format '{}'", other)),
    }

    Ok(())
}
