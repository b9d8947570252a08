use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};
use clap::{Parser, Subcommand};
use inquire::Confirm;
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::info;

use wxenergy_core::{
    Config, Credentials, DateWindow, OutputWriter, Pipeline, assess, dataset, emit,
    report::TextReport,
};

/// Top-level CLI struct.
#[derive(Debug, Parser)]
#[command(name = "wxenergy", version, about = "Weather/energy ingestion with data-quality scoring")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Fetch, merge and assess one date window.
    Run {
        /// First day to fetch (YYYY-MM-DD); defaults to yesterday.
        #[arg(long)]
        start: Option<NaiveDate>,

        /// Last day to fetch (YYYY-MM-DD); defaults to today.
        #[arg(long)]
        end: Option<NaiveDate>,

        /// Config file; defaults to the platform config location.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Overrides `output_dir` from the config.
        #[arg(long)]
        output_dir: Option<PathBuf>,
    },

    /// Re-assess an existing merged dataset without fetching.
    Assess {
        /// Merged dataset CSV written by a previous run.
        #[arg(long)]
        input: PathBuf,

        #[arg(long)]
        config: Option<PathBuf>,

        /// Date freshness is measured against; defaults to today.
        #[arg(long)]
        run_date: Option<NaiveDate>,

        #[arg(long)]
        output_dir: Option<PathBuf>,
    },

    /// Manage the config file.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Debug, Subcommand)]
pub enum ConfigAction {
    /// Write the default config file.
    Init {
        /// Overwrite an existing file without asking.
        #[arg(long)]
        force: bool,

        /// Where to write; defaults to the platform config location.
        #[arg(long)]
        path: Option<PathBuf>,
    },

    /// Print the platform config file location.
    Path,
}

fn load_config(path: Option<&Path>, output_dir: Option<PathBuf>) -> Result<Config> {
    let mut config = Config::load(path)?;
    if let Some(dir) = output_dir {
        config.output_dir = dir;
    }
    Ok(config)
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        match self.command {
            Command::Run { start, end, config, output_dir } => {
                let config = load_config(config.as_deref(), output_dir)?;
                let today = Local::now().date_naive();
                let default = DateWindow::default_for(today);
                let window =
                    DateWindow::new(start.unwrap_or(default.start), end.unwrap_or(default.end), today)?;

                let pipeline = Pipeline::from_config(config, &Credentials::from_env())?;
                let outcome = pipeline.run(window, today).await?;

                println!("Quality score: {:.2} / 100", outcome.report.quality_score());
                println!("Records:       {}", outcome.records.len());
                println!("Fallbacks:     {}", outcome.fallback_usage.len());
                println!("Failed:        {}", outcome.failures.len());
                println!("Dataset:       {}", outcome.outputs.dataset.display());
                println!("Report (json): {}", outcome.outputs.report_json.display());
                println!("Report (text): {}", outcome.outputs.report_text.display());
            }

            Command::Assess { input, config, run_date, output_dir } => {
                let config = load_config(config.as_deref(), output_dir)?;
                let run_date = run_date.unwrap_or_else(|| Local::now().date_naive());

                let file = File::open(&input)
                    .with_context(|| format!("Failed to open dataset: {}", input.display()))?;
                let records = dataset::read_records(file)
                    .with_context(|| format!("Failed to read dataset: {}", input.display()))?;
                info!(path = %input.display(), rows = records.len(), "dataset loaded");

                let report = assess(&records, &config.thresholds, &config.city_ids(), run_date);
                let paths = OutputWriter::new(&config.output_dir).write_report(&emit(&report)?, run_date)?;

                print!("{}", TextReport(&report));
                println!();
                println!("Report (json): {}", paths.json.display());
                println!("Report (text): {}", paths.text.display());
            }

            Command::Config { action: ConfigAction::Init { force, path } } => {
                let path = match path {
                    Some(p) => p,
                    None => Config::config_file_path()?,
                };

                if path.exists() && !force {
                    let overwrite = Confirm::new(&format!("{} exists. Overwrite?", path.display()))
                        .with_default(false)
                        .prompt()
                        .context("Failed to read confirmation")?;
                    if !overwrite {
                        println!("Keeping existing config at {}", path.display());
                        return Ok(());
                    }
                }

                Config::default().save(&path)?;
                println!("Default config written to {}", path.display());
            }

            Command::Config { action: ConfigAction::Path } => {
                println!("{}", Config::config_file_path()?.display());
            }
        }

        Ok(())
    }
}
