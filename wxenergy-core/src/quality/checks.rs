use chrono::NaiveDate;
use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};

use crate::{
    config::ThresholdConfig,
    model::{Field, MeasurementKey, UnifiedRecord},
    stats::{mean, percentage, sample_stddev},
};

use super::{IssueType, QualityIssue, SampleRow, Severity};

/// Inputs shared by every check.
#[derive(Debug, Clone, Copy)]
pub struct CheckContext<'a> {
    pub records: &'a [UnifiedRecord],
    pub thresholds: &'a ThresholdConfig,
    pub expected_cities: &'a [String],
    pub run_date: NaiveDate,
}

impl CheckContext<'_> {
    fn total(&self) -> usize {
        self.records.len()
    }

    fn bounded(&self, rows: impl IntoIterator<Item = SampleRow>) -> Vec<SampleRow> {
        rows.into_iter().take(self.thresholds.sample_limit).collect()
    }
}

/// Dispatch one check. The match is exhaustive, so adding an issue type
/// without a check does not compile.
pub fn run_check(kind: IssueType, ctx: &CheckContext<'_>) -> QualityIssue {
    match kind {
        IssueType::MissingTmaxF => missing_field(ctx, Field::TmaxF),
        IssueType::MissingTminF => missing_field(ctx, Field::TminF),
        IssueType::MissingEnergyMwh => missing_field(ctx, Field::EnergyMwh),
        IssueType::TemperatureOutliers => temperature_outliers(ctx),
        IssueType::EnergyOutliers => energy_outliers(ctx),
        IssueType::DataFreshness => freshness(ctx),
        IssueType::DuplicateRecords => duplicates(ctx),
        IssueType::MissingCities => missing_cities(ctx),
        IssueType::DateGaps => date_gaps(ctx),
    }
}

fn sample(record: &UnifiedRecord, detail: String) -> SampleRow {
    SampleRow { date: Some(record.date), city: record.city.clone(), detail }
}

fn outlier_severity(count: usize, pct: f64, th: &ThresholdConfig) -> Severity {
    if count == 0 {
        Severity::Low
    } else if count >= th.outlier_high_count || pct >= th.outlier_high_pct {
        Severity::High
    } else {
        Severity::Medium
    }
}

pub fn missing_field(ctx: &CheckContext<'_>, field: Field) -> QualityIssue {
    let th = ctx.thresholds;
    let offending: Vec<&UnifiedRecord> =
        ctx.records.iter().filter(|r| r.value(field).is_none()).collect();
    let count = offending.len();
    let pct = percentage(count, ctx.total());

    let severity = if count == 0 {
        Severity::Low
    } else if pct >= th.missing_critical_pct {
        Severity::High
    } else if pct >= th.missing_warning_pct {
        Severity::Medium
    } else {
        Severity::Low
    };

    QualityIssue::new(
        IssueType::missing(field),
        severity,
        count,
        pct,
        ctx.bounded(offending.iter().map(|r| sample(r, format!("{field} missing")))),
        format!("{count} of {} records are missing {field}", ctx.total()),
    )
}

/// Reasons a record's temperatures are implausible, if any.
fn temperature_problems(r: &UnifiedRecord, th: &ThresholdConfig) -> Vec<String> {
    let mut problems = Vec::new();

    for (field, value) in [(Field::TmaxF, r.tmax_f), (Field::TminF, r.tmin_f)] {
        let Some(v) = value else { continue };
        if v > th.temp_max_f {
            problems.push(format!("{field} {v:.1} above {:.1}", th.temp_max_f));
        } else if v < th.temp_min_f {
            problems.push(format!("{field} {v:.1} below {:.1}", th.temp_min_f));
        }
    }
    if let Some((tmax, tmin)) = r.tmax_f.zip(r.tmin_f).filter(|(hi, lo)| hi < lo) {
        problems.push(format!("tmax_f {tmax:.1} below tmin_f {tmin:.1}"));
    }

    problems
}

pub fn temperature_outliers(ctx: &CheckContext<'_>) -> QualityIssue {
    let th = ctx.thresholds;
    let offending: Vec<SampleRow> = ctx
        .records
        .iter()
        .filter_map(|r| {
            let problems = temperature_problems(r, th);
            (!problems.is_empty()).then(|| sample(r, problems.join("; ")))
        })
        .collect();
    let count = offending.len();
    let pct = percentage(count, ctx.total());

    QualityIssue::new(
        IssueType::TemperatureOutliers,
        outlier_severity(count, pct, th),
        count,
        pct,
        ctx.bounded(offending),
        format!(
            "{count} records with implausible temperatures (outside {:.1}..{:.1} °F or tmax below tmin)",
            th.temp_min_f, th.temp_max_f
        ),
    )
}

/// Energy below the floor, or too far from the city's trailing rolling
/// window (the `rolling_window` preceding values, current excluded). The
/// deviation test only applies once the window is full.
pub fn energy_outliers(ctx: &CheckContext<'_>) -> QualityIssue {
    let th = ctx.thresholds;

    let mut by_city: BTreeMap<&str, Vec<&UnifiedRecord>> = BTreeMap::new();
    for r in ctx.records {
        by_city.entry(r.city.as_str()).or_default().push(r);
    }

    let mut flagged: Vec<(MeasurementKey, SampleRow)> = Vec::new();
    for rows in by_city.values_mut() {
        rows.sort_by_key(|r| r.date);
        let mut window: VecDeque<f64> = VecDeque::with_capacity(th.rolling_window);

        for r in rows.iter() {
            let Some(v) = r.energy_mwh else { continue };

            let detail = if v < th.energy_min_mwh {
                Some(format!("energy_mwh {v:.1} below {:.1}", th.energy_min_mwh))
            } else if th.rolling_window >= 2 && window.len() == th.rolling_window {
                let values: Vec<f64> = window.iter().copied().collect();
                match (mean(&values), sample_stddev(&values)) {
                    (Some(m), Some(sd)) if sd > 0.0 && (v - m).abs() > th.outlier_std_multiplier * sd => {
                        Some(format!(
                            "energy_mwh {v:.1} deviates from rolling mean {m:.1} by more than {:.1} x stddev {sd:.1}",
                            th.outlier_std_multiplier
                        ))
                    }
                    _ => None,
                }
            } else {
                None
            };

            if let Some(detail) = detail {
                flagged.push((r.key(), sample(r, detail)));
            }

            if th.rolling_window > 0 {
                if window.len() == th.rolling_window {
                    window.pop_front();
                }
                window.push_back(v);
            }
        }
    }

    // Report in the dataset's own order.
    let order: BTreeMap<MeasurementKey, usize> =
        ctx.records.iter().enumerate().rev().map(|(i, r)| (r.key(), i)).collect();
    flagged.sort_by_key(|(key, _)| order.get(key).copied().unwrap_or(usize::MAX));

    let count = flagged.len();
    let pct = percentage(count, ctx.total());

    QualityIssue::new(
        IssueType::EnergyOutliers,
        outlier_severity(count, pct, th),
        count,
        pct,
        ctx.bounded(flagged.into_iter().map(|(_, s)| s)),
        format!(
            "{count} records with energy below {:.1} MWh or beyond {:.1} stddev of the {}-value rolling mean",
            th.energy_min_mwh, th.outlier_std_multiplier, th.rolling_window
        ),
    )
}

pub fn freshness(ctx: &CheckContext<'_>) -> QualityIssue {
    let th = ctx.thresholds;
    let Some(latest) = ctx.records.iter().map(|r| r.date).max() else {
        return QualityIssue::new(
            IssueType::DataFreshness,
            Severity::High,
            1,
            100.0,
            Vec::new(),
            "no records available; freshness cannot be established".to_string(),
        );
    };

    let age = (ctx.run_date - latest).num_days();
    if age <= th.freshness_days {
        return QualityIssue::new(
            IssueType::DataFreshness,
            Severity::Low,
            0,
            0.0,
            Vec::new(),
            format!(
                "latest record {latest} is {age} day(s) old, within the {}-day threshold",
                th.freshness_days
            ),
        );
    }

    let mut latest_per_city: BTreeMap<&str, NaiveDate> = BTreeMap::new();
    for r in ctx.records {
        let e = latest_per_city.entry(r.city.as_str()).or_insert(r.date);
        if r.date > *e {
            *e = r.date;
        }
    }
    let samples = latest_per_city.into_iter().map(|(city, date)| SampleRow {
        date: Some(date),
        city: city.to_string(),
        detail: format!("latest record {} day(s) old", (ctx.run_date - date).num_days()),
    });

    QualityIssue::new(
        IssueType::DataFreshness,
        Severity::High,
        1,
        100.0,
        ctx.bounded(samples),
        format!(
            "latest record {latest} is {age} day(s) old, beyond the {}-day threshold",
            th.freshness_days
        ),
    )
}

pub fn duplicates(ctx: &CheckContext<'_>) -> QualityIssue {
    let th = ctx.thresholds;
    let mut seen: HashSet<MeasurementKey> = HashSet::new();
    let repeated: Vec<&UnifiedRecord> =
        ctx.records.iter().filter(|r| !seen.insert(r.key())).collect();

    let count = repeated.len();
    let pct = percentage(count, ctx.total());
    let severity = if count > 0 && pct >= th.duplicate_critical_pct {
        Severity::Critical
    } else {
        Severity::Low
    };

    QualityIssue::new(
        IssueType::DuplicateRecords,
        severity,
        count,
        pct,
        ctx.bounded(repeated.iter().map(|r| sample(r, "repeated measurement key".to_string()))),
        format!("{count} repeated (date, city) keys among {} records", ctx.total()),
    )
}

pub fn missing_cities(ctx: &CheckContext<'_>) -> QualityIssue {
    let present: HashSet<&str> = ctx.records.iter().map(|r| r.city.as_str()).collect();
    let missing: Vec<&String> =
        ctx.expected_cities.iter().filter(|c| !present.contains(c.as_str())).collect();

    let count = missing.len();
    let expected = ctx.expected_cities.len();
    let pct = percentage(count, expected);
    let fraction = pct / 100.0;

    let severity = if count == 0 {
        Severity::Low
    } else if fraction < 0.25 {
        Severity::Medium
    } else if fraction < 0.5 {
        Severity::High
    } else {
        Severity::Critical
    };

    QualityIssue::new(
        IssueType::MissingCities,
        severity,
        count,
        pct,
        ctx.bounded(missing.iter().map(|c| SampleRow {
            date: None,
            city: c.to_string(),
            detail: "no records in dataset".to_string(),
        })),
        format!("{count} of {expected} expected cities have no records"),
    )
}

/// Calendar days missing between each city's first and last record.
pub fn date_gaps(ctx: &CheckContext<'_>) -> QualityIssue {
    let th = ctx.thresholds;
    let mut by_city: BTreeMap<&str, BTreeSet<NaiveDate>> = BTreeMap::new();
    for r in ctx.records {
        by_city.entry(r.city.as_str()).or_default().insert(r.date);
    }

    let mut gaps: Vec<SampleRow> = Vec::new();
    let mut span_days = 0usize;
    for (city, dates) in &by_city {
        let (Some(first), Some(last)) = (dates.first(), dates.last()) else {
            continue;
        };
        for day in first.iter_days().take_while(|d| d <= last) {
            span_days += 1;
            if !dates.contains(&day) {
                gaps.push(SampleRow {
                    date: Some(day),
                    city: city.to_string(),
                    detail: "no record for this date".to_string(),
                });
            }
        }
    }

    let count = gaps.len();
    let pct = percentage(count, span_days);
    let severity = if count == 0 {
        Severity::Low
    } else if count >= th.gap_high_count {
        Severity::High
    } else {
        Severity::Medium
    };

    QualityIssue::new(
        IssueType::DateGaps,
        severity,
        count,
        pct,
        ctx.bounded(gaps),
        format!("{count} missing calendar dates across {} cities", by_city.len()),
    )
}
