//! Flat CSV form of the merged dataset.
//!
//! Column set is stable: values, per-field provenance, then the derived
//! booleans. Missing values are empty cells.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

use crate::model::{Provenance, SourceTag, UnifiedRecord};

/// Header row, in `DatasetRow` field order.
pub const COLUMNS: [&str; 11] = [
    "date",
    "city",
    "tmax_f",
    "tmin_f",
    "energy_mwh",
    "tmax_f_source",
    "tmin_f_source",
    "energy_mwh_source",
    "has_weather",
    "has_energy",
    "complete_record",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct DatasetRow {
    date: NaiveDate,
    city: String,
    tmax_f: Option<f64>,
    tmin_f: Option<f64>,
    energy_mwh: Option<f64>,
    tmax_f_source: Option<SourceTag>,
    tmin_f_source: Option<SourceTag>,
    energy_mwh_source: Option<SourceTag>,
    has_weather: bool,
    has_energy: bool,
    complete_record: bool,
}

impl From<&UnifiedRecord> for DatasetRow {
    fn from(r: &UnifiedRecord) -> Self {
        Self {
            date: r.date,
            city: r.city.clone(),
            tmax_f: r.tmax_f,
            tmin_f: r.tmin_f,
            energy_mwh: r.energy_mwh,
            tmax_f_source: r.provenance.tmax_f,
            tmin_f_source: r.provenance.tmin_f,
            energy_mwh_source: r.provenance.energy_mwh,
            has_weather: r.has_weather,
            has_energy: r.has_energy,
            complete_record: r.complete_record,
        }
    }
}

impl From<DatasetRow> for UnifiedRecord {
    fn from(row: DatasetRow) -> Self {
        Self {
            date: row.date,
            city: row.city,
            tmax_f: row.tmax_f,
            tmin_f: row.tmin_f,
            energy_mwh: row.energy_mwh,
            provenance: Provenance {
                tmax_f: row.tmax_f_source,
                tmin_f: row.tmin_f_source,
                energy_mwh: row.energy_mwh_source,
            },
            has_weather: row.has_weather,
            has_energy: row.has_energy,
            complete_record: row.complete_record,
        }
    }
}

/// Write records as CSV. The header is written even when there are no rows.
pub fn write_records<W: Write>(records: &[UnifiedRecord], out: W) -> Result<(), csv::Error> {
    let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(out);
    writer.write_record(COLUMNS)?;
    for record in records {
        writer.serialize(DatasetRow::from(record))?;
    }
    writer.flush()?;
    Ok(())
}

/// Read a merged dataset back. Rows are returned as stored, duplicates
/// included.
pub fn read_records<R: Read>(input: R) -> Result<Vec<UnifiedRecord>, csv::Error> {
    let mut reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(input);
    reader
        .deserialize::<DatasetRow>()
        .map(|row| row.map(UnifiedRecord::from))
        .collect()
}
