mod catalog;
mod cli;
mod config;
mod error;
mod lock;
mod orchestrator;
mod prompter;
mod provider;
mod store;
mod ui;

use std::path::Path;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{bail, Result};
use chrono::Utc;
use clap::Parser;
use console::Style;

use catalog::MediaCatalog;
use cli::{Cli, Command};
use config::StocksmithConfig;
use error::StocksmithError;
use lock::{LockError, RunLock};
use orchestrator::{BatchOrchestrator, RunOptions};
use prompter::MetadataPrompter;
use provider::AnthropicClient;
use store::BatchRegistry;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{} {err:#}", Style::new().red().bold().apply_to("error:"));
            match err.downcast_ref::<StocksmithError>() {
                Some(StocksmithError::Lock(
                    LockError::AlreadyRunning { .. } | LockError::AlreadyRunningUnknown { .. },
                )) => ExitCode::from(2),
                _ => ExitCode::FAILURE,
            }
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = StocksmithConfig::load()?;

    match cli.command {
        Command::Run {
            paths,
            batch_size,
            wait_timeout,
            poll_interval,
            flush,
            effect,
        } => {
            if config.api_key.is_empty() {
                bail!("no API key configured; set ANTHROPIC_API_KEY or api_key in stocksmith.toml");
            }
            if effect.is_some() && paths.is_empty() {
                bail!("an effect run needs explicit file paths");
            }

            let (lock, mut registry, mut catalog) = open_workspace(&config)?;

            let mut options = RunOptions::from_config(&config);
            options.verbose = cli.verbose;
            options.flush = flush;
            options.effect = effect;
            if let Some(size) = batch_size {
                options.batch_size = size;
            }
            if let Some(secs) = wait_timeout {
                options.wait_timeout = orchestrator::wait_timeout_from_secs(secs);
            }
            if let Some(secs) = poll_interval {
                options.poll_interval = Duration::from_secs(secs);
            }

            let provider = AnthropicClient::new(config.api_key.clone());
            let builder = MetadataPrompter {
                model: config.model.clone(),
                max_tokens: config.max_tokens,
                marketplaces: catalog.marketplaces().to_vec(),
            };

            let mut orchestrator =
                BatchOrchestrator::new(&provider, &builder, &mut registry, &mut catalog, options);
            let summary = orchestrator.run(&paths).await?;

            ui::print_summary(&summary);
            lock.release().map_err(StocksmithError::from)?;
        }
        Command::Status => {
            let registry = BatchRegistry::load(Path::new(&config.data_dir))
                .map_err(StocksmithError::from)?;
            let active = registry.active_batches(None);
            let submitted_today = registry.daily_count(&config.provider, Utc::now().date_naive());
            ui::print_status(&active, submitted_today, config.daily_cap);
        }
        Command::Cancel { batch_id } => {
            if config.api_key.is_empty() {
                bail!("no API key configured; set ANTHROPIC_API_KEY or api_key in stocksmith.toml");
            }

            let lock = acquire_lock(&config)?;
            let mut registry = BatchRegistry::load(Path::new(&config.data_dir))
                .map_err(StocksmithError::from)?;
            let provider = AnthropicClient::new(config.api_key.clone());

            let released = orchestrator::cancel_batch(&provider, &mut registry, &batch_id).await?;
            println!("batch {batch_id} cancelled; released {released} file claims");
            lock.release().map_err(StocksmithError::from)?;
        }
        Command::Cleanup { retention_days } => {
            let lock = acquire_lock(&config)?;
            let mut registry = BatchRegistry::load(Path::new(&config.data_dir))
                .map_err(StocksmithError::from)?;

            let days = retention_days.unwrap_or(config.retention_days);
            let purged = registry
                .cleanup_completed(days)
                .map_err(StocksmithError::from)?;
            println!("purged {purged} completed batches older than {days} days");
            lock.release().map_err(StocksmithError::from)?;
        }
    }

    Ok(())
}

fn acquire_lock(config: &StocksmithConfig) -> Result<RunLock, StocksmithError> {
    Ok(RunLock::acquire(&config.lock_path(), &config.lock_policy())?)
}

fn open_workspace(
    config: &StocksmithConfig,
) -> Result<(RunLock, BatchRegistry, MediaCatalog), StocksmithError> {
    let lock = acquire_lock(config)?;
    let registry = BatchRegistry::load(Path::new(&config.data_dir))?;

    let catalog_path = Path::new(&config.catalog);
    if !catalog_path.exists() {
        return Err(StocksmithError::Config(format!(
            "catalog {} not found; create it with file, title, description and keywords columns",
            config.catalog
        )));
    }
    let catalog = MediaCatalog::load(catalog_path)?;

    Ok((lock, registry, catalog))
}
