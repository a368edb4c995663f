//! Enerdata Ingest - registry and indicator loader

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use enerdata_common::logging::{init_logging, LogConfig, LogLevel};
use enerdata_ingest::config::IngestConfig;
use enerdata_ingest::export::export_database;
use enerdata_ingest::pipeline::{Pipeline, PipelineOptions, RunSummary, SourceStatus};
use enerdata_ingest::source::ColumnSelector;
use enerdata_ingest::{MemoryRepository, MetricKind, PgRepository, StepStatus};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "enerdata-ingest")]
#[command(author, version, about = "Energy registry and indicator loader")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load every configured source
    Load {
        /// Run against an in-memory store instead of PostgreSQL
        #[arg(long)]
        dry_run: bool,

        /// Skip the generation-capacity registry
        #[arg(long)]
        skip_registry: bool,

        /// Only load these indicators (repeatable)
        #[arg(long = "metric", value_enum)]
        metrics: Vec<MetricKind>,

        /// Print the run summary as JSON
        #[arg(long)]
        json: bool,
    },

    /// Export the whole database as one CSV file
    Export {
        /// Output file (defaults to ENERDATA_EXPORT_PATH)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// List configured sources
    Sources,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("enerdata-ingest")
        .filter_directives("sqlx=warn")
        .build();

    // Environment variables take precedence
    let log_config = LogConfig::from_env_or(log_config)?;
    init_logging(&log_config)?;

    let config = IngestConfig::from_env().context("Invalid configuration")?;

    match cli.command {
        Command::Load {
            dry_run,
            skip_registry,
            metrics,
            json,
        } => {
            let options = PipelineOptions { skip_registry, metrics };

            let summary = if dry_run {
                info!("Dry run against an in-memory store");
                let repo = MemoryRepository::new();
                let summary = Pipeline::new(&config, &repo).run(&options).await;
                for (table, rows) in repo.table_counts() {
                    info!(table, rows, "Dry-run table size");
                }
                summary
            } else {
                let db = config
                    .database
                    .as_ref()
                    .context("DATABASE_URL must be set unless --dry-run is given")?;
                let repo = PgRepository::connect(db).await?;
                repo.migrate().await?;
                Pipeline::new(&config, &repo).run(&options).await
            };

            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                print_summary(&summary);
            }

            if summary.has_failures() {
                return Ok(ExitCode::FAILURE);
            }
        },
        Command::Export { output } => {
            let db = config.database.as_ref().context("DATABASE_URL must be set")?;
            let repo = PgRepository::connect(db).await?;
            let output = output.unwrap_or_else(|| config.export_path.clone());
            let exported = export_database(repo.pool(), &output).await?;
            println!(
                "Exported {} rows x {} columns to {}",
                exported.rows,
                exported.columns,
                exported.path.display()
            );
        },
        Command::Sources => print_sources(&config),
    }

    Ok(ExitCode::SUCCESS)
}

fn print_summary(summary: &RunSummary) {
    println!(
        "{:<24} {:<34} {:>9} {:>9} {:>8} {:>8}  STATUS",
        "SOURCE", "STEP", "INSERTED", "EXISTING", "UPDATED", "SKIPPED"
    );
    for source in &summary.sources {
        if let SourceStatus::Unreadable(reason) = &source.status {
            println!("{:<24} {:<34} {:>9} {:>9} {:>8} {:>8}  unreadable: {}", source.source, "-", "-", "-", "-", "-", reason);
            continue;
        }
        for step in &source.steps {
            let status = match &step.status {
                StepStatus::Committed => "ok".to_string(),
                StepStatus::Failed(e) => format!("failed: {}", e),
            };
            println!(
                "{:<24} {:<34} {:>9} {:>9} {:>8} {:>8}  {}",
                source.source,
                step.step.to_string(),
                step.counts.inserted,
                step.counts.existing,
                step.counts.updated,
                step.counts.skipped(),
                status
            );
        }
    }
    println!(
        "\n{} inserted, {} skipped{}",
        summary.total_inserted(),
        summary.total_skipped(),
        if summary.has_failures() { ", with failures" } else { "" }
    );
}

fn print_sources(config: &IngestConfig) {
    let marker = |path: &std::path::Path| if path.exists() { "" } else { "  (missing)" };

    println!("registry");
    println!("  file:      {}{}", config.registry.file.display(), marker(&config.registry.file));
    println!("  country:   {} ({})", config.registry.country.code, config.registry.country.name);
    for source in &config.indicators {
        let column = match &source.value_column {
            ColumnSelector::Name(name) => name.clone(),
            ColumnSelector::Position(i) => format!("column #{}", i),
        };
        println!("{}", source.metric);
        println!("  file:      {}{}", source.file.display(), marker(&source.file));
        println!("  value:     {}", column);
    }
}
