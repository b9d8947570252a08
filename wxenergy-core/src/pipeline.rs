//! One ingestion run: fetch every (city, domain) concurrently, merge,
//! assess, persist.

use anyhow::Result;
use chrono::NaiveDate;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::{
    client::{FailedFetch, FallbackUse, FetchOutcome, SourceClient},
    config::{CityConfig, Config, Credentials},
    error::{PipelineError, SourceUnavailable},
    merge::Merger,
    model::{DateWindow, Domain, RawObservation, UnifiedRecord},
    provider::providers_from_config,
    quality::{QualityReport, assess},
    report::{OutputWriter, emit},
};

/// Everything a run produced.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub records: Vec<UnifiedRecord>,
    pub report: QualityReport,
    pub fallback_usage: Vec<FallbackUse>,
    pub failures: Vec<FailedFetch>,
    pub outputs: RunOutputs,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutputs {
    pub dataset: PathBuf,
    pub report_json: PathBuf,
    pub report_text: PathBuf,
}

/// Fetch results gathered across all tasks.
#[derive(Debug, Default)]
struct Collected {
    weather: Vec<RawObservation>,
    energy: Vec<RawObservation>,
    fallback_usage: Vec<FallbackUse>,
    failures: Vec<FailedFetch>,
}

type TaskResult = (String, Domain, Result<FetchOutcome, SourceUnavailable>);

#[derive(Debug, Clone)]
pub struct Pipeline {
    config: Config,
    weather: Arc<SourceClient>,
    energy: Arc<SourceClient>,
}

impl Pipeline {
    pub fn new(config: Config, weather: SourceClient, energy: SourceClient) -> Self {
        Self { config, weather: Arc::new(weather), energy: Arc::new(energy) }
    }

    /// Wire the configured HTTP providers for both domains.
    pub fn from_config(config: Config, credentials: &Credentials) -> Result<Self> {
        let weather = SourceClient::new(
            Domain::Weather,
            providers_from_config(Domain::Weather, &config, credentials)?,
            &config.retry,
        );
        let energy = SourceClient::new(
            Domain::Energy,
            providers_from_config(Domain::Energy, &config, credentials)?,
            &config.retry,
        );
        Ok(Self::new(config, weather, energy))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn client(&self, domain: Domain) -> Arc<SourceClient> {
        match domain {
            Domain::Weather => Arc::clone(&self.weather),
            Domain::Energy => Arc::clone(&self.energy),
        }
    }

    /// Run the whole pipeline for `window`. Source failures are recorded in
    /// the report; only merge or output failures abort the run.
    pub async fn run(&self, window: DateWindow, run_date: NaiveDate) -> Result<RunOutcome, PipelineError> {
        info!(%window, %run_date, cities = self.config.cities.len(), "pipeline run started");

        let collected = self.collect(window).await;

        let city_order = self.config.city_ids();
        let records = Merger::new(&self.config.thresholds, &city_order)
            .merge(collected.weather, collected.energy)?;

        let report = assess(&records, &self.config.thresholds, &city_order, run_date)
            .with_run_context(collected.fallback_usage.clone(), collected.failures.clone());

        let writer = OutputWriter::new(&self.config.output_dir);
        let dataset = writer.write_dataset(&records, run_date, &window)?;
        let paths = writer.write_report(&emit(&report)?, run_date)?;

        info!(
            records = records.len(),
            score = report.quality_score(),
            fallbacks = collected.fallback_usage.len(),
            failures = collected.failures.len(),
            "pipeline run finished"
        );

        Ok(RunOutcome {
            records,
            report,
            fallback_usage: collected.fallback_usage,
            failures: collected.failures,
            outputs: RunOutputs { dataset, report_json: paths.json, report_text: paths.text },
        })
    }

    /// Fan out one task per (city, domain) and gather until all finish or
    /// the run deadline passes. Unfinished tasks become failed fetches.
    async fn collect(&self, window: DateWindow) -> Collected {
        let mut set: JoinSet<TaskResult> = JoinSet::new();
        let mut pending: BTreeSet<(String, Domain)> = BTreeSet::new();

        for city in &self.config.cities {
            for domain in Domain::all() {
                let client = self.client(*domain);
                let city: CityConfig = city.clone();
                pending.insert((city.id.clone(), *domain));
                set.spawn(async move {
                    let result = client.fetch(&city, &window).await;
                    (city.id, client.domain(), result)
                });
            }
        }

        let deadline = Instant::now() + Duration::from_secs(self.config.run_timeout_secs);
        let mut collected = Collected::default();
        let mut timed_out = false;

        loop {
            match tokio::time::timeout_at(deadline, set.join_next()).await {
                Ok(None) => break,
                Ok(Some(Ok((city, domain, result)))) => {
                    pending.remove(&(city, domain));
                    match result {
                        Ok(outcome) => {
                            let rows = match domain {
                                Domain::Weather => &mut collected.weather,
                                Domain::Energy => &mut collected.energy,
                            };
                            rows.extend(outcome.observations);
                            collected.fallback_usage.extend(outcome.fallback);
                        }
                        Err(unavailable) => {
                            warn!("{unavailable}");
                            collected.failures.push(FailedFetch::from(&unavailable));
                        }
                    }
                }
                Ok(Some(Err(join_err))) => {
                    error!("fetch task did not complete: {join_err}");
                }
                Err(_) => {
                    warn!(remaining = pending.len(), "run deadline reached; aborting outstanding fetches");
                    set.abort_all();
                    timed_out = true;
                    break;
                }
            }
        }

        let reason = if timed_out {
            "fetch did not finish before the run deadline"
        } else {
            "fetch task aborted"
        };
        for (city, domain) in pending {
            collected.failures.push(FailedFetch { city, domain, window, reason: reason.to_string() });
        }

        let rank = |city: &str| self.config.cities.iter().position(|c| c.id == city);
        collected.fallback_usage.sort_by_key(|u| (rank(&u.city), u.domain));
        collected.failures.sort_by_key(|f| (rank(&f.city), f.domain));

        collected
    }
}
