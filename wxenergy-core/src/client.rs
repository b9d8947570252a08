//! Per-domain source client: primary provider under retry, then fallback.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::{
    config::{CityConfig, RetryConfig},
    error::{SourceError, SourceUnavailable},
    model::{DateWindow, Domain, Observation, RawObservation, SourceTag},
    provider::{ObservationProvider, ProviderId, ProviderPair},
    retry::{RetryPolicy, execute_with_retry},
};

/// Record of a city/window served by the fallback source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackUse {
    pub city: String,
    pub domain: Domain,
    pub window: DateWindow,
    pub provider: ProviderId,
    pub primary_attempts: u32,
    pub reason: String,
}

/// A city/window/domain that produced no data this run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedFetch {
    pub city: String,
    pub domain: Domain,
    pub window: DateWindow,
    pub reason: String,
}

impl From<&SourceUnavailable> for FailedFetch {
    fn from(err: &SourceUnavailable) -> Self {
        Self {
            city: err.city.clone(),
            domain: err.domain,
            window: err.window,
            reason: format!("primary: {}; fallback: {}", err.primary, err.fallback),
        }
    }
}

/// Observations for one city/window/domain, plus fallback bookkeeping.
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    pub observations: Vec<RawObservation>,
    pub fallback: Option<FallbackUse>,
}

#[derive(Debug, Clone)]
pub struct SourceClient {
    domain: Domain,
    primary: Arc<dyn ObservationProvider>,
    fallback: Arc<dyn ObservationProvider>,
    primary_policy: RetryPolicy,
    fallback_policy: RetryPolicy,
}

impl SourceClient {
    pub fn new(domain: Domain, providers: ProviderPair, retry: &RetryConfig) -> Self {
        Self::with_policies(
            domain,
            providers,
            RetryPolicy::primary(retry),
            RetryPolicy::fallback(retry),
        )
    }

    pub fn with_policies(
        domain: Domain,
        providers: ProviderPair,
        primary_policy: RetryPolicy,
        fallback_policy: RetryPolicy,
    ) -> Self {
        Self {
            domain,
            primary: providers.primary,
            fallback: providers.fallback,
            primary_policy,
            fallback_policy,
        }
    }

    pub fn domain(&self) -> Domain {
        self.domain
    }

    /// Fetch one city's window, falling back to the secondary source once
    /// the primary is exhausted or fails permanently.
    pub async fn fetch(
        &self,
        city: &CityConfig,
        window: &DateWindow,
    ) -> Result<FetchOutcome, SourceUnavailable> {
        let primary_label = self.primary.id().as_str();
        let primary = execute_with_retry(&self.primary_policy, primary_label, |_| async move {
            self.checked(self.primary.fetch(city, window).await)
        })
        .await;

        let primary_failure = match primary {
            Ok(done) => {
                info!(
                    city = %city.id,
                    domain = %self.domain,
                    source = primary_label,
                    attempts = done.attempts,
                    rows = done.value.len(),
                    "primary source used"
                );
                return Ok(FetchOutcome {
                    observations: tag(city, done.value, SourceTag::Primary),
                    fallback: None,
                });
            }
            Err(failure) => failure,
        };

        let fallback_label = self.fallback.id().as_str();
        warn!(
            city = %city.id,
            domain = %self.domain,
            attempts = primary_failure.attempts,
            "primary source failed ({}); falling back to {fallback_label}",
            primary_failure.error
        );

        let fallback = execute_with_retry(&self.fallback_policy, fallback_label, |_| async move {
            self.checked(self.fallback.fetch(city, window).await)
        })
        .await;

        match fallback {
            Ok(done) => {
                info!(
                    city = %city.id,
                    domain = %self.domain,
                    source = fallback_label,
                    rows = done.value.len(),
                    "fallback source used"
                );
                Ok(FetchOutcome {
                    observations: tag(city, done.value, SourceTag::Fallback),
                    fallback: Some(FallbackUse {
                        city: city.id.clone(),
                        domain: self.domain,
                        window: *window,
                        provider: self.fallback.id(),
                        primary_attempts: primary_failure.attempts,
                        reason: primary_failure.error.to_string(),
                    }),
                })
            }
            Err(failure) => {
                error!(
                    city = %city.id,
                    domain = %self.domain,
                    "both sources failed; fallback: {}",
                    failure.error
                );
                Err(SourceUnavailable {
                    city: city.id.clone(),
                    domain: self.domain,
                    window: *window,
                    primary: primary_failure.error,
                    fallback: failure.error,
                })
            }
        }
    }

    /// A provider handing back the other domain's rows breaks its contract;
    /// that counts as a malformed response from that provider.
    fn checked(&self, rows: Result<Vec<Observation>, SourceError>) -> Result<Vec<Observation>, SourceError> {
        let rows = rows?;
        if let Some(bad) = rows.iter().find(|o| o.reading.domain() != self.domain) {
            return Err(SourceError::Malformed(format!(
                "{} provider returned a {} reading for {}",
                self.domain,
                bad.reading.domain(),
                bad.date
            )));
        }
        Ok(rows)
    }
}

/// Attach city and provenance.
fn tag(city: &CityConfig, rows: Vec<Observation>, source: SourceTag) -> Vec<RawObservation> {
    rows.into_iter().map(|o| RawObservation::new(&city.id, o, source)).collect()
}
