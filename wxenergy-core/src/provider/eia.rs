use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::Client;
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

use crate::{
    config::CityConfig,
    error::SourceError,
    model::{DateWindow, Observation},
    provider::http::{get_text, parse_day},
};

use super::{ObservationProvider, ProviderId};

const PAGE_LENGTH: usize = 500;
const MAX_PAGES: usize = 50;

/// EIA v2 daily region data (demand by balancing authority).
#[derive(Debug, Clone)]
pub struct EiaApiProvider {
    http: Client,
    base_url: String,
    api_key: Option<String>,
}

impl EiaApiProvider {
    pub fn new(http: Client, base_url: String, api_key: Option<String>) -> Self {
        Self { http, base_url, api_key }
    }

    async fn fetch_page(
        &self,
        api_key: &str,
        city: &CityConfig,
        window: &DateWindow,
        offset: usize,
    ) -> Result<EiaPage, SourceError> {
        let start = window.start.to_string();
        let end = window.end.to_string();
        let offset = offset.to_string();
        let length = PAGE_LENGTH.to_string();

        let body = get_text(self.http.get(&self.base_url).query(&[
            ("api_key", api_key),
            ("frequency", "daily"),
            ("data[0]", "value"),
            ("facets[respondent][]", city.eia_region.as_str()),
            ("start", start.as_str()),
            ("end", end.as_str()),
            ("sort[0][column]", "period"),
            ("sort[0][direction]", "asc"),
            ("offset", offset.as_str()),
            ("length", length.as_str()),
        ]))
        .await?;

        parse_page(&body)
    }
}

/// EIA sends numbers both as JSON numbers and as strings.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum Numeric {
    Number(f64),
    Text(String),
}

impl Numeric {
    fn as_f64(&self) -> Option<f64> {
        let value = match self {
            Numeric::Number(n) => Some(*n),
            Numeric::Text(s) => s.trim().parse::<f64>().ok(),
        };
        value.filter(|v| v.is_finite())
    }
}

#[derive(Debug, Deserialize)]
struct EiaEnvelope {
    response: EiaPage,
}

#[derive(Debug, Deserialize)]
struct EiaPage {
    total: Option<Numeric>,
    #[serde(default)]
    data: Vec<EiaRow>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct EiaRow {
    period: String,
    #[serde(default)]
    respondent: Option<String>,
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    timezone: Option<String>,
    #[serde(default, rename = "timezone-description")]
    timezone_description: Option<String>,
    #[serde(default)]
    value: Option<Numeric>,
}

fn parse_page(body: &str) -> Result<EiaPage, SourceError> {
    serde_json::from_str::<EiaEnvelope>(body)
        .map(|env| env.response)
        .map_err(|e| SourceError::Malformed(format!("EIA JSON: {e}")))
}

impl EiaRow {
    fn in_timezone(&self, zone: &str) -> bool {
        [&self.timezone, &self.timezone_description]
            .into_iter()
            .any(|tz| tz.as_deref().is_some_and(|tz| tz.eq_ignore_ascii_case(zone)))
    }
}

/// Sanity check over a city's raw rows. An empty batch, or one where no
/// row belongs to the city's region, is unusable; stray foreign rows and
/// mixed timezones only warn.
pub(crate) fn validate_energy_batch(rows: &[EiaRow], city: &CityConfig) -> Result<(), SourceError> {
    if rows.is_empty() {
        warn!(city = %city.id, "EIA returned no rows");
        return Err(SourceError::Malformed(format!("EIA returned no rows for {}", city.eia_region)));
    }

    let foreign = rows
        .iter()
        .filter(|r| r.respondent.as_deref().is_some_and(|resp| resp != city.eia_region))
        .count();
    if foreign == rows.len() {
        warn!(city = %city.id, region = %city.eia_region, "EIA rows all reference another region");
        return Err(SourceError::Malformed(format!(
            "EIA returned {foreign} rows, none for {}",
            city.eia_region
        )));
    }
    if foreign > 0 {
        warn!(city = %city.id, foreign, region = %city.eia_region, "dropping EIA rows for another region");
    }

    let zones: BTreeSet<&str> = rows.iter().filter_map(|r| r.timezone.as_deref()).collect();
    if zones.len() > 1 {
        warn!(city = %city.id, zones = ?zones, "EIA rows span several timezones; preferring {}", city.timezone);
    }
    Ok(())
}

/// Keep daily demand rows for the city's region and pick one per day,
/// preferring the city's configured timezone.
pub(crate) fn select_rows(rows: Vec<EiaRow>, city: &CityConfig, window: &DateWindow) -> Vec<Observation> {
    let mut by_day: BTreeMap<NaiveDate, Vec<EiaRow>> = BTreeMap::new();

    for row in rows {
        if row.respondent.as_deref().is_some_and(|r| r != city.eia_region) {
            continue;
        }
        if row.kind.as_deref().is_some_and(|k| k != "D") {
            continue;
        }
        let Some(date) = parse_day(&row.period) else {
            debug!(period = %row.period, "skipping EIA row with unparseable period");
            continue;
        };
        if window.contains(date) {
            by_day.entry(date).or_default().push(row);
        }
    }

    by_day
        .into_iter()
        .map(|(date, candidates)| {
            let chosen = candidates
                .iter()
                .find(|r| r.in_timezone(&city.timezone))
                .or_else(|| candidates.first());
            let value = chosen.and_then(|r| r.value.as_ref()).and_then(Numeric::as_f64);
            Observation::energy(date, value)
        })
        .collect()
}

#[async_trait]
impl ObservationProvider for EiaApiProvider {
    fn id(&self) -> ProviderId {
        ProviderId::EiaApi
    }

    async fn fetch(
        &self,
        city: &CityConfig,
        window: &DateWindow,
    ) -> Result<Vec<Observation>, SourceError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| SourceError::InvalidRequest("EIA_API_KEY is not set".to_string()))?;

        let mut rows = Vec::new();
        let mut offset = 0;

        for _ in 0..MAX_PAGES {
            let page = self.fetch_page(api_key, city, window, offset).await?;
            let received = page.data.len();
            let total = page.total.as_ref().and_then(Numeric::as_f64).map(|t| t as usize);
            rows.extend(page.data);
            offset += received;

            match total {
                Some(total) if received > 0 && offset < total => continue,
                None if received == PAGE_LENGTH => continue,
                _ => break,
            }
        }

        validate_energy_batch(&rows, city)?;
        Ok(select_rows(rows, city, window))
    }
}

/// Bulk CSV export used when the API is unavailable.
#[derive(Debug, Clone)]
pub struct EiaBulkProvider {
    http: Client,
    base_url: String,
}

impl EiaBulkProvider {
    pub fn new(http: Client, base_url: String) -> Self {
        Self { http, base_url }
    }
}

/// Locate the date and value columns by header name and read one value per day.
pub fn parse_bulk_csv(body: &str, window: &DateWindow) -> Result<Vec<Observation>, SourceError> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(body.as_bytes());

    let headers = reader
        .headers()
        .map_err(|e| SourceError::Malformed(format!("EIA CSV header: {e}")))?
        .clone();
    let lower: Vec<String> = headers.iter().map(|h| h.to_lowercase()).collect();

    let date_col = lower.iter().position(|h| h.contains("date") || h.contains("period"));
    let value_col = lower
        .iter()
        .position(|h| h.contains("consumption") || h.contains("value") || h.contains("mwh"));
    let (Some(date_col), Some(value_col)) = (date_col, value_col) else {
        return Err(SourceError::Malformed(
            "could not find date or value columns in EIA CSV".to_string(),
        ));
    };

    let mut by_day: BTreeMap<NaiveDate, Option<f64>> = BTreeMap::new();
    for record in reader.records() {
        let record = record.map_err(|e| SourceError::Malformed(format!("EIA CSV row: {e}")))?;
        let Some(date) = record.get(date_col).and_then(parse_day) else {
            continue;
        };
        if !window.contains(date) {
            continue;
        }
        let value = record
            .get(value_col)
            .and_then(|v| v.replace(',', "").parse::<f64>().ok())
            .filter(|v| v.is_finite());
        by_day.entry(date).or_insert(value);
    }

    Ok(by_day.into_iter().map(|(date, value)| Observation::energy(date, value)).collect())
}

#[async_trait]
impl ObservationProvider for EiaBulkProvider {
    fn id(&self) -> ProviderId {
        ProviderId::EiaBulk
    }

    async fn fetch(
        &self,
        city: &CityConfig,
        window: &DateWindow,
    ) -> Result<Vec<Observation>, SourceError> {
        let body = get_text(
            self.http
                .get(&self.base_url)
                .query(&[("region", city.eia_region.as_str()), ("type", "consumption")]),
        )
        .await?;

        parse_bulk_csv(&body, window)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Field;

    fn city() -> CityConfig {
        CityConfig::new("new_york", "New York", "GHCND:USW00094728", "NYIS", "Eastern")
    }

    fn window(start: &str, end: &str) -> DateWindow {
        DateWindow {
            start: NaiveDate::parse_from_str(start, "%Y-%m-%d").unwrap(),
            end: NaiveDate::parse_from_str(end, "%Y-%m-%d").unwrap(),
        }
    }

    fn rows(body: &str) -> Vec<EiaRow> {
        parse_page(body).expect("page parses").data
    }

    #[test]
    fn prefers_city_timezone_when_day_is_duplicated() {
        let data = rows(
            r#"{"response": {"total": 2, "data": [
                {"period": "2024-07-01", "respondent": "NYIS", "type": "D", "timezone": "Central", "value": 200.0},
                {"period": "2024-07-01", "respondent": "NYIS", "type": "D", "timezone": "Eastern", "value": "100"}
            ]}}"#,
        );

        let obs = select_rows(data, &city(), &window("2024-07-01", "2024-07-01"));

        assert_eq!(obs.len(), 1);
        assert_eq!(obs[0].reading.value(Field::EnergyMwh), Some(100.0));
    }

    #[test]
    fn drops_foreign_regions_and_non_demand_rows() {
        let data = rows(
            r#"{"response": {"total": "3", "data": [
                {"period": "2024-07-01", "respondent": "WRONG", "type": "D", "value": 1},
                {"period": "2024-07-01", "respondent": "NYIS", "type": "NG", "value": 2},
                {"period": "2024-07-02", "respondent": "NYIS", "type": "D", "value": null}
            ]}}"#,
        );

        let obs = select_rows(data, &city(), &window("2024-07-01", "2024-07-02"));

        assert_eq!(obs.len(), 1);
        assert_eq!(obs[0].date, NaiveDate::from_ymd_opt(2024, 7, 2).unwrap());
        assert_eq!(obs[0].reading.value(Field::EnergyMwh), None, "null is missing, not zero");
    }

    #[test]
    fn empty_or_foreign_only_batches_are_unusable() {
        assert!(matches!(validate_energy_batch(&[], &city()), Err(SourceError::Malformed(_))));

        let foreign = rows(
            r#"{"response": {"data": [{"period": "2024-07-01", "respondent": "PJM", "value": 1}]}}"#,
        );
        assert!(validate_energy_batch(&foreign, &city()).is_err());

        let partly_foreign = rows(
            r#"{"response": {"data": [
                {"period": "2024-07-01", "respondent": "PJM", "value": 1},
                {"period": "2024-07-01", "respondent": "NYIS", "value": 2}
            ]}}"#,
        );
        assert!(validate_energy_batch(&partly_foreign, &city()).is_ok());

        let mixed = rows(
            r#"{"response": {"data": [
                {"period": "2024-07-01", "respondent": "NYIS", "timezone": "Eastern", "value": 1},
                {"period": "2024-07-01", "respondent": "NYIS", "timezone": "Central", "value": 2}
            ]}}"#,
        );
        assert!(validate_energy_batch(&mixed, &city()).is_ok());
    }

    #[test]
    fn parses_full_daily_region_rows() {
        let data = rows(
            r#"{"response": {"total": "2", "dateFormat": "YYYY-MM-DD", "frequency": "daily", "data": [
                {"period": "2024-07-01", "respondent": "NYIS", "respondent-name": "New York Independent System Operator",
                 "type": "D", "type-name": "Demand", "timezone": "Central", "timezone-description": "Central",
                 "value": "430000", "value-units": "megawatthours"},
                {"period": "2024-07-01", "respondent": "NYIS", "respondent-name": "New York Independent System Operator",
                 "type": "D", "type-name": "Demand", "timezone": "Eastern", "timezone-description": "Eastern",
                 "value": "415000", "value-units": "megawatthours"}
            ]}}"#,
        );
        assert_eq!(data.len(), 2);
        assert!(validate_energy_batch(&data, &city()).is_ok());

        let obs = select_rows(data, &city(), &window("2024-07-01", "2024-07-01"));

        assert_eq!(obs.len(), 1);
        assert_eq!(obs[0].reading.value(Field::EnergyMwh), Some(415_000.0));
    }

    #[test]
    fn timezone_description_alone_selects_the_row() {
        let data = rows(
            r#"{"response": {"data": [
                {"period": "2024-07-01", "respondent": "NYIS", "type": "D", "timezone-description": "Central", "value": 1},
                {"period": "2024-07-01", "respondent": "NYIS", "type": "D", "timezone-description": "Eastern", "value": 2}
            ]}}"#,
        );

        let obs = select_rows(data, &city(), &window("2024-07-01", "2024-07-01"));
        assert_eq!(obs[0].reading.value(Field::EnergyMwh), Some(2.0));
    }

    #[test]
    fn bulk_csv_finds_columns_by_name() {
        let body = "Region,Period,Consumption (MWh)\n\
                    NYIS,2024-07-01,\"412,000\"\n\
                    NYIS,2024-07-02,n/a\n\
                    NYIS,2024-07-09,1\n";

        let obs = parse_bulk_csv(body, &window("2024-07-01", "2024-07-03")).unwrap();

        assert_eq!(obs.len(), 2);
        assert_eq!(obs[0].reading.value(Field::EnergyMwh), Some(412_000.0));
        assert_eq!(obs[1].reading.value(Field::EnergyMwh), None);
    }

    #[test]
    fn bulk_csv_without_value_column_is_malformed() {
        let err = parse_bulk_csv("date,region\n2024-07-01,NYIS\n", &window("2024-07-01", "2024-07-01"))
            .unwrap_err();
        assert!(matches!(err, SourceError::Malformed(_)));
    }
}
