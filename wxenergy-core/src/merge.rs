use chrono::NaiveDate;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

use crate::{
    config::ThresholdConfig,
    error::MergeError,
    model::{MeasurementKey, RawObservation, UnifiedRecord},
};

/// Folds per-domain observations into one record per measurement key.
///
/// Present values are never overwritten: a later observation only fills
/// fields an earlier one left missing.
#[derive(Debug, Clone)]
pub struct Merger<'a> {
    thresholds: &'a ThresholdConfig,
    city_rank: HashMap<String, usize>,
}

type SortKey = (NaiveDate, usize, String);

impl<'a> Merger<'a> {
    /// `city_order` fixes the within-day ordering; unknown cities sort
    /// after configured ones, alphabetically.
    pub fn new(thresholds: &'a ThresholdConfig, city_order: &[String]) -> Self {
        let city_rank = city_order.iter().enumerate().map(|(i, c)| (c.clone(), i)).collect();
        Self { thresholds, city_rank }
    }

    fn sort_key(&self, key: &MeasurementKey) -> SortKey {
        let rank = self.city_rank.get(&key.city).copied().unwrap_or(usize::MAX);
        (key.date, rank, key.city.clone())
    }

    pub fn merge(
        &self,
        weather: Vec<RawObservation>,
        energy: Vec<RawObservation>,
    ) -> Result<Vec<UnifiedRecord>, MergeError> {
        let mut records: BTreeMap<SortKey, UnifiedRecord> = BTreeMap::new();

        for obs in weather.into_iter().chain(energy) {
            let record = records
                .entry(self.sort_key(&obs.key))
                .or_insert_with(|| UnifiedRecord::empty(obs.key.clone()));

            for (field, value) in obs.reading.fields() {
                let Some(value) = value.filter(|v| v.is_finite()) else {
                    continue;
                };
                if !record.fill(field, value, obs.source) && record.value(field) != Some(value) {
                    debug!(
                        key = %obs.key,
                        field = %field,
                        kept = ?record.value(field),
                        ignored = value,
                        "keeping earlier value"
                    );
                }
            }
        }

        let mut out: Vec<UnifiedRecord> = records.into_values().collect();
        for record in &mut out {
            record.refresh_flags(&self.thresholds.essential_fields);
        }

        if let Some(pair) = out.windows(2).find(|w| w[0].date == w[1].date && w[0].city == w[1].city) {
            return Err(MergeError::DuplicateKey { date: pair[1].date, city: pair[1].city.clone() });
        }

        Ok(out)
    }
}
