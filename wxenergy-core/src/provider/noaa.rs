use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::Client;
use serde::Deserialize;
use std::collections::BTreeMap;
use tracing::debug;

use crate::{
    config::CityConfig,
    error::SourceError,
    model::{DateWindow, Observation},
    provider::http::{get_text, parse_day},
};

use super::{ObservationProvider, ProviderId};

/// GHCN-Daily marks missing values with this sentinel.
const GHCND_MISSING: i32 = -9999;

/// NOAA Climate Data Online v2 `data` endpoint (GHCND dataset).
#[derive(Debug, Clone)]
pub struct NoaaCdoProvider {
    http: Client,
    base_url: String,
    token: Option<String>,
}

impl NoaaCdoProvider {
    pub fn new(http: Client, base_url: String, token: Option<String>) -> Self {
        Self { http, base_url, token }
    }
}

#[derive(Debug, Deserialize)]
struct CdoResponse {
    // CDO answers `{}` when the station has nothing for the window.
    #[serde(default)]
    results: Vec<CdoResult>,
}

#[derive(Debug, Deserialize)]
struct CdoResult {
    date: String,
    datatype: String,
    value: Option<f64>,
}

/// Group CDO rows into one weather observation per day.
fn parse_cdo(body: &str, window: &DateWindow) -> Result<Vec<Observation>, SourceError> {
    let parsed: CdoResponse = serde_json::from_str(body)
        .map_err(|e| SourceError::Malformed(format!("NOAA CDO JSON: {e}")))?;

    let mut daily: BTreeMap<NaiveDate, (Option<f64>, Option<f64>)> = BTreeMap::new();
    for row in parsed.results {
        let Some(date) = parse_day(&row.date) else {
            debug!(date = %row.date, "skipping CDO row with unparseable date");
            continue;
        };
        if !window.contains(date) {
            continue;
        }

        let value = row.value.filter(|v| v.is_finite() && *v > GHCND_MISSING as f64);
        let entry = daily.entry(date).or_default();
        match row.datatype.as_str() {
            "TMAX" => entry.0 = value,
            "TMIN" => entry.1 = value,
            _ => {}
        }
    }

    Ok(daily
        .into_iter()
        .map(|(date, (tmax, tmin))| Observation::weather(date, tmax, tmin))
        .collect())
}

#[async_trait]
impl ObservationProvider for NoaaCdoProvider {
    fn id(&self) -> ProviderId {
        ProviderId::NoaaCdo
    }

    async fn fetch(
        &self,
        city: &CityConfig,
        window: &DateWindow,
    ) -> Result<Vec<Observation>, SourceError> {
        let token = self
            .token
            .as_deref()
            .ok_or_else(|| SourceError::InvalidRequest("NOAA_API_TOKEN is not set".to_string()))?;

        let start = window.start.to_string();
        let end = window.end.to_string();

        let body = get_text(self.http.get(&self.base_url).header("token", token).query(&[
            ("datasetid", "GHCND"),
            ("stationid", city.noaa_station.as_str()),
            ("startdate", start.as_str()),
            ("enddate", end.as_str()),
            ("datatypeid", "TMAX,TMIN"),
            // standard units: temperatures come back in °F
            ("units", "standard"),
            ("limit", "1000"),
        ]))
        .await?;

        parse_cdo(&body, window)
    }
}

/// Per-station GHCN-Daily `.dly` file from the NOAA archive.
#[derive(Debug, Clone)]
pub struct GhcndArchiveProvider {
    http: Client,
    base_url: String,
}

impl GhcndArchiveProvider {
    pub fn new(http: Client, base_url: String) -> Self {
        Self { http, base_url }
    }

    fn station_url(&self, station: &str) -> String {
        let id = station.strip_prefix("GHCND:").unwrap_or(station);
        format!("{}/{}.dly", self.base_url.trim_end_matches('/'), id)
    }
}

fn tenths_c_to_f(raw: i32) -> f64 {
    let f = (raw as f64 / 10.0) * 9.0 / 5.0 + 32.0;
    (f * 10.0).round() / 10.0
}

/// Parse the fixed-width `.dly` layout: station(11) year(4) month(2)
/// element(4), then 31 day groups of value(5) + three flag chars.
pub fn parse_dly(body: &str, window: &DateWindow) -> Vec<Observation> {
    let mut daily: BTreeMap<NaiveDate, (Option<f64>, Option<f64>)> = BTreeMap::new();

    for line in body.lines() {
        let (Some(year), Some(month), Some(element)) =
            (line.get(11..15), line.get(15..17), line.get(17..21))
        else {
            continue;
        };
        let is_tmax = match element {
            "TMAX" => true,
            "TMIN" => false,
            _ => continue,
        };
        let (Ok(year), Ok(month)) = (year.trim().parse::<i32>(), month.trim().parse::<u32>())
        else {
            continue;
        };

        for day in 1..=31u32 {
            let offset = 21 + (day as usize - 1) * 8;
            let Some(raw) = line.get(offset..offset + 5) else {
                break;
            };
            let Ok(value) = raw.trim().parse::<i32>() else {
                continue;
            };
            if value == GHCND_MISSING {
                continue;
            }
            // Day 31 of a 30-day month and friends.
            let Some(date) = NaiveDate::from_ymd_opt(year, month, day) else {
                continue;
            };
            if !window.contains(date) {
                continue;
            }

            let entry = daily.entry(date).or_default();
            if is_tmax {
                entry.0 = Some(tenths_c_to_f(value));
            } else {
                entry.1 = Some(tenths_c_to_f(value));
            }
        }
    }

    daily
        .into_iter()
        .map(|(date, (tmax, tmin))| Observation::weather(date, tmax, tmin))
        .collect()
}

#[async_trait]
impl ObservationProvider for GhcndArchiveProvider {
    fn id(&self) -> ProviderId {
        ProviderId::GhcndArchive
    }

    async fn fetch(
        &self,
        city: &CityConfig,
        window: &DateWindow,
    ) -> Result<Vec<Observation>, SourceError> {
        let body = get_text(self.http.get(self.station_url(&city.noaa_station))).await?;
        Ok(parse_dly(&body, window))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window(start: &str, end: &str) -> DateWindow {
        DateWindow {
            start: NaiveDate::parse_from_str(start, "%Y-%m-%d").unwrap(),
            end: NaiveDate::parse_from_str(end, "%Y-%m-%d").unwrap(),
        }
    }

    fn dly_line(element: &str, values: &[i32]) -> String {
        let mut line = format!("USW00094728202407{element}");
        for day in 0..31 {
            let v = values.get(day).copied().unwrap_or(GHCND_MISSING);
            line.push_str(&format!("{v:>5}   "));
        }
        line
    }

    #[test]
    fn cdo_rows_group_per_day() {
        let body = r#"{"results": [
            {"date": "2024-07-01T00:00:00", "datatype": "TMAX", "value": 86},
            {"date": "2024-07-01T00:00:00", "datatype": "TMIN", "value": 68},
            {"date": "2024-07-02T00:00:00", "datatype": "TMAX", "value": 88},
            {"date": "2024-07-02T00:00:00", "datatype": "PRCP", "value": 0.1}
        ]}"#;

        let obs = parse_cdo(body, &window("2024-07-01", "2024-07-02")).unwrap();

        assert_eq!(obs.len(), 2);
        assert_eq!(obs[0], Observation::weather(obs[0].date, Some(86.0), Some(68.0)));
        // TMIN absent for the second day: missing, not zero.
        assert_eq!(obs[1].reading.value(crate::model::Field::TminF), None);
    }

    #[test]
    fn empty_cdo_body_is_no_rows() {
        let obs = parse_cdo("{}", &window("2024-07-01", "2024-07-02")).unwrap();
        assert!(obs.is_empty());
    }

    #[test]
    fn garbage_cdo_body_is_malformed() {
        let err = parse_cdo("<html>", &window("2024-07-01", "2024-07-02")).unwrap_err();
        assert!(matches!(err, SourceError::Malformed(_)));
        assert!(!err.is_transient());
    }

    #[test]
    fn dly_values_convert_and_skip_sentinels() {
        let body = format!(
            "{}\n{}\n{}\n",
            dly_line("TMAX", &[300, 310, GHCND_MISSING]),
            dly_line("TMIN", &[200, GHCND_MISSING, 150]),
            dly_line("PRCP", &[5, 5, 5]),
        );

        let obs = parse_dly(&body, &window("2024-07-01", "2024-07-03"));

        assert_eq!(obs.len(), 3);
        assert_eq!(obs[0], Observation::weather(obs[0].date, Some(86.0), Some(68.0)));
        assert_eq!(obs[1], Observation::weather(obs[1].date, Some(87.8), None));
        assert_eq!(obs[2], Observation::weather(obs[2].date, None, Some(59.0)));
    }

    #[test]
    fn dly_respects_window() {
        let body = dly_line("TMAX", &[300, 310, 320]);
        let obs = parse_dly(&body, &window("2024-07-02", "2024-07-02"));
        assert_eq!(obs.len(), 1);
        assert_eq!(obs[0].reading.value(crate::model::Field::TmaxF), Some(87.8));
    }

    #[test]
    fn station_prefix_is_stripped() {
        let p = GhcndArchiveProvider::new(Client::new(), "https://example.test/all/".into());
        assert_eq!(p.station_url("GHCND:USW00094728"), "https://example.test/all/USW00094728.dly");
    }
}
