use chrono::{Days, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::PipelineError;

/// Upstream dataset an observation belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Weather,
    Energy,
}

impl Domain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Weather => "weather",
            Domain::Energy => "energy",
        }
    }

    pub const fn all() -> &'static [Domain] {
        &[Domain::Weather, Domain::Energy]
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which source supplied a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceTag {
    Primary,
    Fallback,
}

impl SourceTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceTag::Primary => "primary",
            SourceTag::Fallback => "fallback",
        }
    }
}

impl fmt::Display for SourceTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `(date, city)` pair identifying one unified record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MeasurementKey {
    pub date: NaiveDate,
    pub city: String,
}

impl MeasurementKey {
    pub fn new(date: NaiveDate, city: impl Into<String>) -> Self {
        Self { date, city: city.into() }
    }
}

impl fmt::Display for MeasurementKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} | {}", self.date, self.city)
    }
}

/// Numeric fields carried by unified records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Field {
    #[serde(rename = "tmax_f")]
    TmaxF,
    #[serde(rename = "tmin_f")]
    TminF,
    #[serde(rename = "energy_mwh")]
    EnergyMwh,
}

impl Field {
    pub fn as_str(&self) -> &'static str {
        match self {
            Field::TmaxF => "tmax_f",
            Field::TminF => "tmin_f",
            Field::EnergyMwh => "energy_mwh",
        }
    }

    pub fn domain(&self) -> Domain {
        match self {
            Field::TmaxF | Field::TminF => Domain::Weather,
            Field::EnergyMwh => Domain::Energy,
        }
    }

    pub const fn all() -> &'static [Field] {
        &[Field::TmaxF, Field::TminF, Field::EnergyMwh]
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One domain's reading for a day. `None` means the source reported the
/// value as absent (null or sentinel), never zero.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "domain", rename_all = "snake_case")]
pub enum Reading {
    Weather { tmax_f: Option<f64>, tmin_f: Option<f64> },
    Energy { energy_mwh: Option<f64> },
}

impl Reading {
    pub fn domain(&self) -> Domain {
        match self {
            Reading::Weather { .. } => Domain::Weather,
            Reading::Energy { .. } => Domain::Energy,
        }
    }

    pub fn value(&self, field: Field) -> Option<f64> {
        match (self, field) {
            (Reading::Weather { tmax_f, .. }, Field::TmaxF) => *tmax_f,
            (Reading::Weather { tmin_f, .. }, Field::TminF) => *tmin_f,
            (Reading::Energy { energy_mwh }, Field::EnergyMwh) => *energy_mwh,
            _ => None,
        }
    }

    /// Fields this reading can populate, paired with their values.
    pub fn fields(&self) -> Vec<(Field, Option<f64>)> {
        match self {
            Reading::Weather { tmax_f, tmin_f } => {
                vec![(Field::TmaxF, *tmax_f), (Field::TminF, *tmin_f)]
            }
            Reading::Energy { energy_mwh } => vec![(Field::EnergyMwh, *energy_mwh)],
        }
    }
}

/// A row as a provider parses it, before the city and provenance are attached.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub date: NaiveDate,
    pub reading: Reading,
}

impl Observation {
    pub fn weather(date: NaiveDate, tmax_f: Option<f64>, tmin_f: Option<f64>) -> Self {
        Self { date, reading: Reading::Weather { tmax_f, tmin_f } }
    }

    pub fn energy(date: NaiveDate, energy_mwh: Option<f64>) -> Self {
        Self { date, reading: Reading::Energy { energy_mwh } }
    }
}

/// One domain's reading for a measurement key, tagged with the source that
/// produced it. Immutable once fetched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawObservation {
    pub key: MeasurementKey,
    pub reading: Reading,
    pub source: SourceTag,
}

impl RawObservation {
    pub fn new(city: &str, observation: Observation, source: SourceTag) -> Self {
        Self {
            key: MeasurementKey::new(observation.date, city),
            reading: observation.reading,
            source,
        }
    }
}

/// Per-field record of which source supplied the value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub tmax_f: Option<SourceTag>,
    pub tmin_f: Option<SourceTag>,
    pub energy_mwh: Option<SourceTag>,
}

impl Provenance {
    pub fn get(&self, field: Field) -> Option<SourceTag> {
        match field {
            Field::TmaxF => self.tmax_f,
            Field::TminF => self.tmin_f,
            Field::EnergyMwh => self.energy_mwh,
        }
    }

    fn slot(&mut self, field: Field) -> &mut Option<SourceTag> {
        match field {
            Field::TmaxF => &mut self.tmax_f,
            Field::TminF => &mut self.tmin_f,
            Field::EnergyMwh => &mut self.energy_mwh,
        }
    }
}

/// One row of the merged dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnifiedRecord {
    pub date: NaiveDate,
    pub city: String,
    pub tmax_f: Option<f64>,
    pub tmin_f: Option<f64>,
    pub energy_mwh: Option<f64>,
    pub provenance: Provenance,
    pub has_weather: bool,
    pub has_energy: bool,
    pub complete_record: bool,
}

impl UnifiedRecord {
    pub fn empty(key: MeasurementKey) -> Self {
        Self {
            date: key.date,
            city: key.city,
            tmax_f: None,
            tmin_f: None,
            energy_mwh: None,
            provenance: Provenance::default(),
            has_weather: false,
            has_energy: false,
            complete_record: false,
        }
    }

    pub fn key(&self) -> MeasurementKey {
        MeasurementKey::new(self.date, self.city.clone())
    }

    pub fn value(&self, field: Field) -> Option<f64> {
        match field {
            Field::TmaxF => self.tmax_f,
            Field::TminF => self.tmin_f,
            Field::EnergyMwh => self.energy_mwh,
        }
    }

    /// Fill `field` if it is currently missing. Returns whether the value was taken.
    pub(crate) fn fill(&mut self, field: Field, value: f64, source: SourceTag) -> bool {
        let slot = match field {
            Field::TmaxF => &mut self.tmax_f,
            Field::TminF => &mut self.tmin_f,
            Field::EnergyMwh => &mut self.energy_mwh,
        };
        if slot.is_some() {
            return false;
        }
        *slot = Some(value);
        *self.provenance.slot(field) = Some(source);
        true
    }

    /// Recompute the derived booleans. `essential` lists the fields a row
    /// needs to count as complete.
    pub fn refresh_flags(&mut self, essential: &[Field]) {
        self.has_weather = self.tmax_f.is_some() || self.tmin_f.is_some();
        self.has_energy = self.energy_mwh.is_some();
        self.complete_record = self.has_weather
            && self.has_energy
            && essential.iter().all(|f| self.value(*f).is_some());
    }
}

/// Inclusive calendar date range for a fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateWindow {
    /// Validate a window: non-empty and not ending after `today`.
    pub fn new(start: NaiveDate, end: NaiveDate, today: NaiveDate) -> Result<Self, PipelineError> {
        if start > end {
            return Err(PipelineError::InvalidWindow(format!(
                "start date {start} is after end date {end}"
            )));
        }
        if end > today {
            return Err(PipelineError::InvalidWindow(format!(
                "end date {end} is in the future (today is {today})"
            )));
        }
        Ok(Self { start, end })
    }

    /// "Yesterday through today".
    pub fn default_for(today: NaiveDate) -> Self {
        let start = today.checked_sub_days(Days::new(1)).unwrap_or(today);
        Self { start, end: today }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start && date <= self.end
    }

    pub fn days(&self) -> impl Iterator<Item = NaiveDate> + '_ {
        self.start.iter_days().take_while(|d| *d <= self.end)
    }
}

impl fmt::Display for DateWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn fill_never_overwrites_present_value() {
        let mut rec = UnifiedRecord::empty(MeasurementKey::new(date("2024-07-01"), "chicago"));

        assert!(rec.fill(Field::TmaxF, 90.0, SourceTag::Primary));
        assert!(!rec.fill(Field::TmaxF, 10.0, SourceTag::Fallback));

        assert_eq!(rec.tmax_f, Some(90.0));
        assert_eq!(rec.provenance.get(Field::TmaxF), Some(SourceTag::Primary));
    }

    #[test]
    fn complete_record_requires_both_domains() {
        let mut rec = UnifiedRecord::empty(MeasurementKey::new(date("2024-07-01"), "chicago"));
        rec.fill(Field::EnergyMwh, 100.0, SourceTag::Primary);
        rec.refresh_flags(&[Field::EnergyMwh]);

        assert!(rec.has_energy);
        assert!(!rec.has_weather);
        assert!(!rec.complete_record);

        rec.fill(Field::TmaxF, 80.0, SourceTag::Primary);
        rec.refresh_flags(&[Field::EnergyMwh]);
        assert!(rec.complete_record);

        rec.refresh_flags(Field::all());
        assert!(!rec.complete_record, "tmin_f is still missing");
    }

    #[test]
    fn window_rejects_empty_and_future_ranges() {
        let today = date("2024-07-10");

        assert!(DateWindow::new(date("2024-07-05"), date("2024-07-04"), today).is_err());
        assert!(DateWindow::new(date("2024-07-05"), date("2024-07-11"), today).is_err());

        let w = DateWindow::new(date("2024-07-08"), date("2024-07-10"), today).unwrap();
        assert_eq!(w.days().count(), 3);
        assert!(w.contains(date("2024-07-09")));
        assert!(!w.contains(date("2024-07-11")));
    }

    #[test]
    fn default_window_is_yesterday_through_today() {
        let w = DateWindow::default_for(date("2024-03-01"));
        assert_eq!(w.start, date("2024-02-29"));
        assert_eq!(w.end, date("2024-03-01"));
    }
}
