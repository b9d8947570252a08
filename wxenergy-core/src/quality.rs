//! Data-quality assessment over the merged dataset.
//!
//! A fixed battery of checks runs over the unified records; each check
//! emits exactly one [`QualityIssue`] (zero-count findings included), and
//! the summary is recomputed from that issue set alone.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;

use crate::{
    client::{FailedFetch, FallbackUse},
    config::{SeverityWeights, ThresholdConfig},
    model::{Field, UnifiedRecord},
    stats::{self, round2},
};

pub mod checks;

use checks::CheckContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Most severe first.
    pub const fn all() -> &'static [Severity] {
        &[Severity::Critical, Severity::High, Severity::Medium, Severity::Low]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "Low",
            Severity::Medium => "Medium",
            Severity::High => "High",
            Severity::Critical => "Critical",
        }
    }

    pub fn weight(&self, weights: &SeverityWeights) -> f64 {
        match self {
            Severity::Low => weights.low,
            Severity::Medium => weights.medium,
            Severity::High => weights.high,
            Severity::Critical => weights.critical,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Closed set of findings, in the order the battery runs them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueType {
    MissingTmaxF,
    MissingTminF,
    MissingEnergyMwh,
    TemperatureOutliers,
    EnergyOutliers,
    DataFreshness,
    DuplicateRecords,
    MissingCities,
    DateGaps,
}

impl IssueType {
    pub const fn all() -> &'static [IssueType] {
        &[
            IssueType::MissingTmaxF,
            IssueType::MissingTminF,
            IssueType::MissingEnergyMwh,
            IssueType::TemperatureOutliers,
            IssueType::EnergyOutliers,
            IssueType::DataFreshness,
            IssueType::DuplicateRecords,
            IssueType::MissingCities,
            IssueType::DateGaps,
        ]
    }

    pub fn missing(field: Field) -> Self {
        match field {
            Field::TmaxF => IssueType::MissingTmaxF,
            Field::TminF => IssueType::MissingTminF,
            Field::EnergyMwh => IssueType::MissingEnergyMwh,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            IssueType::MissingTmaxF => "missing_tmax_f",
            IssueType::MissingTminF => "missing_tmin_f",
            IssueType::MissingEnergyMwh => "missing_energy_mwh",
            IssueType::TemperatureOutliers => "temperature_outliers",
            IssueType::EnergyOutliers => "energy_outliers",
            IssueType::DataFreshness => "data_freshness",
            IssueType::DuplicateRecords => "duplicate_records",
            IssueType::MissingCities => "missing_cities",
            IssueType::DateGaps => "date_gaps",
        }
    }

    fn action(&self) -> &'static str {
        match self {
            IssueType::MissingTmaxF | IssueType::MissingTminF => {
                "check NOAA station availability and backfill the affected days"
            }
            IssueType::MissingEnergyMwh => "check EIA region availability and backfill the affected days",
            IssueType::TemperatureOutliers => "verify station readings and unit conversion",
            IssueType::EnergyOutliers => "verify region demand figures against the EIA bulk export",
            IssueType::DataFreshness => {
                "confirm the scheduled run happened and upstream sources published recent data"
            }
            IssueType::DuplicateRecords => "deduplicate the merged files by (date, city)",
            IssueType::MissingCities => "check source configuration and the fallback log for these cities",
            IssueType::DateGaps => "backfill the missing dates with a historical run",
        }
    }

    /// Recommendation text keyed off severity.
    pub fn recommendation(&self, severity: Severity) -> String {
        match severity {
            Severity::Low => "No action needed.".to_string(),
            Severity::Medium => format!("Review when convenient: {}.", self.action()),
            Severity::High => format!("Investigate before the next run: {}.", self.action()),
            Severity::Critical => format!("Hold downstream use until resolved: {}.", self.action()),
        }
    }
}

impl fmt::Display for IssueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One offending row (or city) kept as evidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleRow {
    pub date: Option<NaiveDate>,
    pub city: String,
    pub detail: String,
}

fn two_decimals<S: Serializer>(value: &f64, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(round2(*value))
}

fn two_decimals_opt<S: Serializer>(value: &Option<f64>, s: S) -> Result<S::Ok, S::Error> {
    match value {
        Some(v) => s.serialize_some(&round2(*v)),
        None => s.serialize_none(),
    }
}

/// One finding of the quality battery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityIssue {
    pub issue_type: IssueType,
    pub severity: Severity,
    pub count: usize,
    #[serde(serialize_with = "two_decimals")]
    pub percentage: f64,
    pub samples: Vec<SampleRow>,
    pub description: String,
    pub recommendation: String,
}

impl QualityIssue {
    pub fn new(
        issue_type: IssueType,
        severity: Severity,
        count: usize,
        percentage: f64,
        samples: Vec<SampleRow>,
        description: String,
    ) -> Self {
        Self {
            issue_type,
            severity,
            count,
            percentage,
            samples,
            description,
            recommendation: issue_type.recommendation(severity),
        }
    }

    pub fn is_finding(&self) -> bool {
        self.count > 0
    }
}

/// Counts per severity and the aggregate score, derived from the issues.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub total_issues: usize,
    pub by_severity: BTreeMap<Severity, usize>,
    #[serde(serialize_with = "two_decimals")]
    pub penalty: f64,
    #[serde(serialize_with = "two_decimals")]
    pub quality_score: f64,
}

impl Summary {
    /// Issues with a zero count are listed but carry no penalty.
    pub fn from_issues<'a>(
        issues: impl IntoIterator<Item = &'a QualityIssue>,
        weights: &SeverityWeights,
    ) -> Self {
        let mut by_severity: BTreeMap<Severity, usize> =
            Severity::all().iter().map(|s| (*s, 0)).collect();
        let mut total_issues = 0;
        let mut penalty = 0.0;

        for issue in issues {
            total_issues += 1;
            *by_severity.entry(issue.severity).or_insert(0) += 1;
            if issue.is_finding() {
                penalty += issue.severity.weight(weights);
            }
        }

        Self {
            total_issues,
            by_severity,
            penalty,
            quality_score: (100.0 - penalty).clamp(0.0, 100.0),
        }
    }

    pub fn count(&self, severity: Severity) -> usize {
        self.by_severity.get(&severity).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportMetadata {
    pub run_date: NaiveDate,
    pub total_records: usize,
    pub date_range: Option<DateRange>,
    pub cities_analyzed: Vec<String>,
    pub expected_cities: Vec<String>,
    pub thresholds: ThresholdConfig,
}

/// Descriptive temperature/energy correlation for one city.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CityCorrelation {
    pub city: String,
    pub pairs: usize,
    #[serde(serialize_with = "two_decimals_opt")]
    pub tmax_energy_r: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityReport {
    pub metadata: ReportMetadata,
    pub issues: BTreeMap<IssueType, QualityIssue>,
    pub summary: Summary,
    pub correlations: Vec<CityCorrelation>,
    #[serde(default)]
    pub fallback_usage: Vec<FallbackUse>,
    #[serde(default)]
    pub source_failures: Vec<FailedFetch>,
}

impl QualityReport {
    /// Attach what happened during fetching, for operator visibility.
    pub fn with_run_context(mut self, fallback_usage: Vec<FallbackUse>, source_failures: Vec<FailedFetch>) -> Self {
        self.fallback_usage = fallback_usage;
        self.source_failures = source_failures;
        self
    }

    pub fn issue(&self, issue_type: IssueType) -> Option<&QualityIssue> {
        self.issues.get(&issue_type)
    }

    pub fn quality_score(&self) -> f64 {
        self.summary.quality_score
    }
}

/// Run the full battery and build the report.
pub fn assess(
    records: &[UnifiedRecord],
    thresholds: &ThresholdConfig,
    expected_cities: &[String],
    run_date: NaiveDate,
) -> QualityReport {
    let ctx = CheckContext { records, thresholds, expected_cities, run_date };

    let issues: BTreeMap<IssueType, QualityIssue> = IssueType::all()
        .iter()
        .map(|kind| (*kind, checks::run_check(*kind, &ctx)))
        .collect();

    let summary = Summary::from_issues(issues.values(), &thresholds.score_weights);

    QualityReport {
        metadata: metadata(records, thresholds, expected_cities, run_date),
        issues,
        summary,
        correlations: correlations(records, expected_cities),
        fallback_usage: Vec::new(),
        source_failures: Vec::new(),
    }
}

fn metadata(
    records: &[UnifiedRecord],
    thresholds: &ThresholdConfig,
    expected_cities: &[String],
    run_date: NaiveDate,
) -> ReportMetadata {
    let start = records.iter().map(|r| r.date).min();
    let end = records.iter().map(|r| r.date).max();

    ReportMetadata {
        run_date,
        total_records: records.len(),
        date_range: start.zip(end).map(|(start, end)| DateRange { start, end }),
        cities_analyzed: cities_in_order(records, expected_cities),
        expected_cities: expected_cities.to_vec(),
        thresholds: thresholds.clone(),
    }
}

/// Cities present in `records`: expected ones in configured order, then the rest alphabetically.
pub(crate) fn cities_in_order(records: &[UnifiedRecord], expected_cities: &[String]) -> Vec<String> {
    let present: std::collections::BTreeSet<&str> = records.iter().map(|r| r.city.as_str()).collect();

    let mut out: Vec<String> =
        expected_cities.iter().filter(|c| present.contains(c.as_str())).cloned().collect();
    out.extend(
        present
            .iter()
            .filter(|c| !expected_cities.iter().any(|e| e == *c))
            .map(|c| c.to_string()),
    );
    out
}

fn correlations(records: &[UnifiedRecord], expected_cities: &[String]) -> Vec<CityCorrelation> {
    cities_in_order(records, expected_cities)
        .into_iter()
        .map(|city| {
            let pairs: Vec<(f64, f64)> = records
                .iter()
                .filter(|r| r.city == city)
                .filter_map(|r| r.tmax_f.zip(r.energy_mwh))
                .collect();
            CityCorrelation { pairs: pairs.len(), tmax_energy_r: stats::pearson(&pairs), city }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MeasurementKey, SourceTag};

    pub(crate) fn record(date: NaiveDate, city: &str, tmax: Option<f64>, tmin: Option<f64>, mwh: Option<f64>) -> UnifiedRecord {
        let mut r = UnifiedRecord::empty(MeasurementKey::new(date, city));
        for (field, value) in [(Field::TmaxF, tmax), (Field::TminF, tmin), (Field::EnergyMwh, mwh)] {
            if let Some(v) = value {
                r.fill(field, v, SourceTag::Primary);
            }
        }
        r.refresh_flags(Field::all());
        r
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 7, d).unwrap()
    }

    fn cities() -> Vec<String> {
        ["new_york", "chicago", "houston", "phoenix", "seattle"].iter().map(|s| s.to_string()).collect()
    }

    fn sample_dataset() -> Vec<UnifiedRecord> {
        vec![
            record(day(1), "new_york", Some(85.0), Some(70.0), Some(100.0)),
            record(day(1), "chicago", Some(95.0), Some(80.0), Some(-10.0)),
            record(day(1), "houston", Some(140.0), Some(90.0), Some(120.0)),
            record(day(1), "phoenix", None, Some(75.0), Some(110.0)),
            record(day(1), "seattle", Some(80.0), None, Some(90.0)),
            record(day(1), "new_york", Some(85.0), Some(70.0), Some(100.0)),
        ]
    }

    #[test]
    fn every_issue_type_is_always_present() {
        let report = assess(&[], &ThresholdConfig::default(), &cities(), day(2));
        assert_eq!(report.issues.len(), IssueType::all().len());
        for kind in IssueType::all() {
            assert!(report.issue(*kind).is_some(), "{kind} missing");
        }
    }

    #[test]
    fn reference_dataset_findings() {
        let report = assess(&sample_dataset(), &ThresholdConfig::default(), &cities(), day(1));

        assert_eq!(report.issue(IssueType::MissingTmaxF).unwrap().count, 1);
        assert_eq!(report.issue(IssueType::MissingTminF).unwrap().count, 1);
        assert_eq!(report.issue(IssueType::TemperatureOutliers).unwrap().count, 1);
        assert_eq!(report.issue(IssueType::EnergyOutliers).unwrap().count, 1);
        assert_eq!(report.issue(IssueType::DuplicateRecords).unwrap().count, 1);
        assert_eq!(report.issue(IssueType::MissingCities).unwrap().count, 0);
        assert_eq!(report.metadata.total_records, 6);
        assert_eq!(report.metadata.cities_analyzed, cities());
    }

    #[test]
    fn summary_is_consistent_with_issue_set() {
        let report = assess(&sample_dataset(), &ThresholdConfig::default(), &cities(), day(1));

        let per_severity: usize = report.summary.by_severity.values().sum();
        assert_eq!(report.summary.total_issues, per_severity);
        assert_eq!(report.summary.total_issues, report.issues.len());
        for sev in Severity::all() {
            let n = report.issues.values().filter(|i| i.severity == *sev).count();
            assert_eq!(report.summary.count(*sev), n);
        }
    }

    #[test]
    fn clean_dataset_scores_100() {
        let records: Vec<UnifiedRecord> = cities()
            .iter()
            .flat_map(|c| (1..=3).map(move |d| record(day(d), c, Some(80.0), Some(60.0), Some(100.0))))
            .collect();

        let report = assess(&records, &ThresholdConfig::default(), &cities(), day(3));

        assert!(report.issues.values().all(|i| i.count == 0 && i.severity == Severity::Low));
        assert_eq!(report.quality_score(), 100.0);
    }

    #[test]
    fn score_never_increases_as_problems_grow() {
        let th = ThresholdConfig::default();
        let mut previous = f64::INFINITY;

        for bad in 0..=12 {
            let records: Vec<UnifiedRecord> = (1..=12)
                .map(|d| {
                    let tmax = if d <= bad { 150.0 } else { 80.0 };
                    record(day(d), "chicago", Some(tmax), Some(60.0), Some(100.0))
                })
                .collect();
            let score = assess(&records, &th, &["chicago".to_string()], day(12)).quality_score();

            assert!((0.0..=100.0).contains(&score));
            assert!(score <= previous, "bad={bad}: {score} > {previous}");
            previous = score;
        }
    }

    #[test]
    fn score_is_monotone_for_other_weight_sets() {
        let weight_sets = [
            SeverityWeights { critical: 25.0, high: 15.0, medium: 5.0, low: 0.0 },
            SeverityWeights { critical: 50.0, high: 50.0, medium: 10.0, low: 10.0 },
            SeverityWeights { critical: 90.0, high: 70.0, medium: 45.0, low: 2.5 },
            SeverityWeights { critical: 0.0, high: 0.0, medium: 0.0, low: 0.0 },
        ];

        for weights in weight_sets {
            let mut th = ThresholdConfig::default();
            th.score_weights = weights;
            assert!(th.validate().is_ok());
            let mut previous = f64::INFINITY;

            for bad in 0..=12 {
                // Both temperature outliers and missing energy grow with `bad`.
                let records: Vec<UnifiedRecord> = (1..=12)
                    .map(|d| {
                        let tmax = if d <= bad { 150.0 } else { 80.0 };
                        let mwh = if d <= bad { None } else { Some(100.0) };
                        record(day(d), "chicago", Some(tmax), Some(60.0), mwh)
                    })
                    .collect();
                let score = assess(&records, &th, &["chicago".to_string()], day(12)).quality_score();

                assert!((0.0..=100.0).contains(&score), "{weights:?}: {score}");
                assert!(score <= previous, "{weights:?} bad={bad}: {score} > {previous}");
                previous = score;
            }
        }
    }

    #[test]
    fn zero_weights_keep_a_perfect_score() {
        let mut th = ThresholdConfig::default();
        th.score_weights = SeverityWeights { critical: 0.0, high: 0.0, medium: 0.0, low: 0.0 };

        let report = assess(&sample_dataset(), &th, &cities(), day(30));

        assert!(report.issues.values().any(|i| i.is_finding()));
        assert_eq!(report.quality_score(), 100.0);
    }

    #[test]
    fn score_is_clamped_at_zero() {
        let mut th = ThresholdConfig::default();
        th.score_weights = SeverityWeights { critical: 80.0, high: 60.0, medium: 40.0, low: 20.0 };

        let report = assess(&sample_dataset(), &th, &cities(), day(30));
        assert_eq!(report.quality_score(), 0.0);
    }

    #[test]
    fn correlation_needs_three_pairs() {
        let records: Vec<UnifiedRecord> = (1..=4)
            .map(|d| record(day(d), "houston", Some(80.0 + d as f64), Some(60.0), Some(100.0 + 10.0 * d as f64)))
            .chain([record(day(1), "seattle", Some(70.0), Some(50.0), Some(90.0))])
            .collect();

        let report = assess(&records, &ThresholdConfig::default(), &cities(), day(4));

        let houston = report.correlations.iter().find(|c| c.city == "houston").unwrap();
        assert_eq!(houston.pairs, 4);
        assert!((houston.tmax_energy_r.unwrap() - 1.0).abs() < 1e-9);
        let seattle = report.correlations.iter().find(|c| c.city == "seattle").unwrap();
        assert_eq!(seattle.tmax_energy_r, None);
    }

    #[test]
    fn recommendations_follow_severity() {
        assert_eq!(IssueType::DateGaps.recommendation(Severity::Low), "No action needed.");
        assert!(IssueType::DateGaps.recommendation(Severity::High).starts_with("Investigate"));
        assert!(IssueType::DuplicateRecords.recommendation(Severity::Critical).contains("deduplicate"));
    }
}
