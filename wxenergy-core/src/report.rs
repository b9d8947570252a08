//! Report rendering and run output persistence.
//!
//! [`emit`] is pure: it turns a [`QualityReport`] into a JSON document and a
//! plain-text rendering. [`OutputWriter`] puts files on disk without ever
//! replacing an earlier run's output.

use chrono::NaiveDate;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::{
    dataset,
    error::ReportError,
    model::{DateWindow, UnifiedRecord},
    quality::{IssueType, QualityIssue, QualityReport, Severity},
};

/// The two renderings of one report.
#[derive(Debug, Clone, PartialEq)]
pub struct EmittedReport {
    pub json: String,
    pub text: String,
}

pub fn emit(report: &QualityReport) -> Result<EmittedReport, ReportError> {
    Ok(EmittedReport {
        json: serde_json::to_string_pretty(report)?,
        text: TextReport(report).to_string(),
    })
}

/// Human-readable rendering. Every issue type gets a section, found or not.
pub struct TextReport<'a>(pub &'a QualityReport);

fn heading(f: &mut fmt::Formatter<'_>, title: &str) -> fmt::Result {
    writeln!(f)?;
    writeln!(f, "{title}")?;
    writeln!(f, "{}", "-".repeat(title.chars().count()))
}

fn write_issue(f: &mut fmt::Formatter<'_>, issue: &QualityIssue) -> fmt::Result {
    writeln!(
        f,
        "[{}] {}: {} ({:.2}%)",
        issue.severity, issue.issue_type, issue.count, issue.percentage
    )?;
    writeln!(f, "    {}", issue.description)?;
    writeln!(f, "    {}", issue.recommendation)?;
    for s in &issue.samples {
        match s.date {
            Some(date) => writeln!(f, "    - {date} {}: {}", s.city, s.detail)?,
            None => writeln!(f, "    - {}: {}", s.city, s.detail)?,
        }
    }
    Ok(())
}

impl fmt::Display for TextReport<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let report = self.0;
        let meta = &report.metadata;
        let summary = &report.summary;

        writeln!(f, "Data Quality Report")?;
        writeln!(f, "===================")?;
        writeln!(f, "Run date:        {}", meta.run_date)?;
        writeln!(f, "Records:         {}", meta.total_records)?;
        match &meta.date_range {
            Some(range) => writeln!(f, "Date range:      {} to {}", range.start, range.end)?,
            None => writeln!(f, "Date range:      none")?,
        }
        writeln!(f, "Cities analyzed: {}", meta.cities_analyzed.join(", "))?;
        writeln!(f, "Expected cities: {}", meta.expected_cities.join(", "))?;

        heading(f, "Summary")?;
        writeln!(f, "Quality score:   {:.2} / 100", summary.quality_score)?;
        let per_severity: Vec<String> = Severity::all()
            .iter()
            .map(|s| format!("{s} {}", summary.count(*s)))
            .collect();
        writeln!(f, "Issues:          {} ({})", summary.total_issues, per_severity.join(", "))?;

        heading(f, "Findings")?;
        for kind in IssueType::all() {
            match report.issue(*kind) {
                Some(issue) => write_issue(f, issue)?,
                None => writeln!(f, "[-] {kind}: not assessed")?,
            }
        }

        heading(f, "Fallback usage")?;
        if report.fallback_usage.is_empty() {
            writeln!(f, "none")?;
        }
        for used in &report.fallback_usage {
            writeln!(
                f,
                "{} {} ({}): served by {} after {} primary attempt(s): {}",
                used.city, used.domain, used.window, used.provider, used.primary_attempts, used.reason
            )?;
        }

        heading(f, "Source failures")?;
        if report.source_failures.is_empty() {
            writeln!(f, "none")?;
        }
        for failed in &report.source_failures {
            writeln!(f, "{} {} ({}): {}", failed.city, failed.domain, failed.window, failed.reason)?;
        }

        heading(f, "Temperature/energy correlation")?;
        if report.correlations.is_empty() {
            writeln!(f, "none")?;
        }
        for c in &report.correlations {
            match c.tmax_energy_r {
                Some(r) => writeln!(f, "{}: r = {r:.2} over {} days", c.city, c.pairs)?,
                None => writeln!(f, "{}: n/a ({} paired days)", c.city, c.pairs)?,
            }
        }

        Ok(())
    }
}

/// Upper bound on `-N` suffixes tried for one output name.
const MAX_SUFFIX: u32 = 1000;

/// Paths written for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportPaths {
    pub json: PathBuf,
    pub text: PathBuf,
}

/// Writes run outputs into one directory, append-only across runs.
#[derive(Debug, Clone)]
pub struct OutputWriter {
    dir: PathBuf,
}

impl OutputWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn io_err(path: &Path, source: io::Error) -> ReportError {
        ReportError::Io { path: path.to_path_buf(), source }
    }

    /// Open `<stem>.<ext>`, or the first free `<stem>-N.<ext>`, with
    /// create-new semantics.
    fn create_unique(&self, stem: &str, ext: &str) -> Result<(PathBuf, File), ReportError> {
        fs::create_dir_all(&self.dir).map_err(|e| Self::io_err(&self.dir, e))?;

        for n in 1..=MAX_SUFFIX {
            let name = if n == 1 { format!("{stem}.{ext}") } else { format!("{stem}-{n}.{ext}") };
            let path = self.dir.join(name);
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => return Ok((path, file)),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(Self::io_err(&path, e)),
            }
        }

        Err(ReportError::NameExhausted(format!("{stem}.{ext}"), MAX_SUFFIX))
    }

    fn write_text(&self, stem: &str, ext: &str, contents: &str) -> Result<PathBuf, ReportError> {
        let (path, mut file) = self.create_unique(stem, ext)?;
        file.write_all(contents.as_bytes()).map_err(|e| Self::io_err(&path, e))?;
        Ok(path)
    }

    pub fn write_dataset(
        &self,
        records: &[UnifiedRecord],
        run_date: NaiveDate,
        window: &DateWindow,
    ) -> Result<PathBuf, ReportError> {
        let stem = format!("merged_{run_date}_{}_to_{}", window.start, window.end);
        let (path, file) = self.create_unique(&stem, "csv")?;
        dataset::write_records(records, file)?;
        info!(path = %path.display(), rows = records.len(), "merged dataset written");
        Ok(path)
    }

    pub fn write_report(&self, emitted: &EmittedReport, run_date: NaiveDate) -> Result<ReportPaths, ReportError> {
        let json = self.write_text(&format!("quality_{run_date}"), "json", &emitted.json)?;
        let text = self.write_text(&format!("quality_report_{run_date}"), "txt", &emitted.text)?;
        info!(json = %json.display(), text = %text.display(), "quality report written");
        Ok(ReportPaths { json, text })
    }
}
