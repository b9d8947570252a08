use crate::{
    config::{CityConfig, Config, Credentials},
    error::SourceError,
    model::{DateWindow, Domain, Observation},
    provider::{
        eia::{EiaApiProvider, EiaBulkProvider},
        noaa::{GhcndArchiveProvider, NoaaCdoProvider},
    },
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{fmt::Debug, sync::Arc, time::Duration};

pub mod eia;
pub mod http;
pub mod noaa;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderId {
    NoaaCdo,
    GhcndArchive,
    EiaApi,
    EiaBulk,
}

impl ProviderId {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderId::NoaaCdo => "noaa_cdo",
            ProviderId::GhcndArchive => "ghcnd_archive",
            ProviderId::EiaApi => "eia_api",
            ProviderId::EiaBulk => "eia_bulk",
        }
    }

    pub fn domain(&self) -> Domain {
        match self {
            ProviderId::NoaaCdo | ProviderId::GhcndArchive => Domain::Weather,
            ProviderId::EiaApi | ProviderId::EiaBulk => Domain::Energy,
        }
    }
}

impl std::fmt::Display for ProviderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One upstream endpoint able to return a city's daily rows for a window.
#[async_trait]
pub trait ObservationProvider: Send + Sync + Debug {
    fn id(&self) -> ProviderId;

    async fn fetch(
        &self,
        city: &CityConfig,
        window: &DateWindow,
    ) -> Result<Vec<Observation>, SourceError>;
}

/// Primary and fallback providers for one domain.
#[derive(Debug, Clone)]
pub struct ProviderPair {
    pub primary: Arc<dyn ObservationProvider>,
    pub fallback: Arc<dyn ObservationProvider>,
}

/// Construct the provider pair for `domain` from config and credentials.
///
/// A missing credential does not fail construction: the primary provider
/// then rejects every call with a permanent error and the fallback takes over.
pub fn providers_from_config(
    domain: Domain,
    config: &Config,
    credentials: &Credentials,
) -> anyhow::Result<ProviderPair> {
    let http = http::build_client(Duration::from_secs(config.request_timeout_secs))?;
    let endpoints = &config.endpoints;

    let pair = match domain {
        Domain::Weather => ProviderPair {
            primary: Arc::new(NoaaCdoProvider::new(
                http.clone(),
                endpoints.noaa_cdo.clone(),
                credentials.noaa_token.clone(),
            )),
            fallback: Arc::new(GhcndArchiveProvider::new(http, endpoints.ghcnd_archive.clone())),
        },
        Domain::Energy => ProviderPair {
            primary: Arc::new(EiaApiProvider::new(
                http.clone(),
                endpoints.eia_api.clone(),
                credentials.eia_api_key.clone(),
            )),
            fallback: Arc::new(EiaBulkProvider::new(http, endpoints.eia_bulk.clone())),
        },
    };

    Ok(pair)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pairs_match_their_domain() {
        let cfg = Config::default();
        let creds = Credentials::default();

        for domain in Domain::all() {
            let pair = providers_from_config(*domain, &cfg, &creds).expect("pair builds");
            assert_eq!(pair.primary.id().domain(), *domain);
            assert_eq!(pair.fallback.id().domain(), *domain);
            assert_ne!(pair.primary.id(), pair.fallback.id());
        }
    }
}
