mod logging;

use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use cine_sync::{check_store, run_etl_from_env, EtlConfig};
use tracing::{debug, error};

#[derive(Debug, Parser)]
#[command(name = "cine-cli")]
#[command(about = "Catalog ETL: genres, films and reviews into Postgres")]
struct Cli {
    /// Log verbosity; `RUST_LOG` takes precedence when set.
    #[arg(long, env = "LOG_LEVEL", default_value = "INFO", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Extract, transform and upsert the whole catalog once.
    Sync {
        /// Load into memory instead of the database.
        #[arg(long)]
        dry_run: bool,
    },
    /// Validate configuration and the declared collections in the database.
    Check,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    logging::init(&cli.log_level);

    match run(cli.command.unwrap_or(Commands::Sync { dry_run: false })).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Commands) -> Result<()> {
    match command {
        Commands::Sync { dry_run } => {
            let summary = run_etl_from_env(dry_run).await?;
            println!(
                "etl complete: run_id={} genres={} films={} links={} reviews={} skipped_refs={}{}",
                summary.run_id,
                summary.genres,
                summary.films,
                summary.film_genre_links,
                summary.reviews,
                summary.skipped_film_refs,
                if dry_run { " (dry run)" } else { "" }
            );
        }
        Commands::Check => {
            let config = EtlConfig::from_env().context("loading configuration")?;
            debug!(?config, "configuration loaded");
            check_store(&config).await?;
            println!("check ok: configuration valid, declared collections present");
        }
    }

    Ok(())
}
