use std::path::PathBuf;
use thiserror::Error;

use crate::model::{DateWindow, Domain};

/// Whether a failed call is worth repeating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Timeouts, connection resets, HTTP 408/429/5xx.
    Transient,
    /// Other 4xx, malformed requests or responses.
    Permanent,
}

/// Failure of a single call against one upstream source.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("rate limited by upstream (HTTP 429)")]
    RateLimited,
    #[error("HTTP error {status}: {body}")]
    Http { status: u16, body: String },
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl SourceError {
    /// Map a non-success HTTP status to an error.
    pub fn from_status(status: u16, body: &str) -> Self {
        if status == 429 {
            SourceError::RateLimited
        } else {
            SourceError::Http { status, body: truncate_body(body) }
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            SourceError::Timeout(_)
            | SourceError::Connect(_)
            | SourceError::Transport(_)
            | SourceError::RateLimited => ErrorClass::Transient,
            SourceError::Http { status, .. } if *status == 408 || *status >= 500 => {
                ErrorClass::Transient
            }
            SourceError::Http { .. }
            | SourceError::Malformed(_)
            | SourceError::InvalidRequest(_) => ErrorClass::Permanent,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

impl From<reqwest::Error> for SourceError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            SourceError::Timeout(err.to_string())
        } else if err.is_connect() {
            SourceError::Connect(err.to_string())
        } else if err.is_decode() {
            SourceError::Malformed(err.to_string())
        } else if err.is_builder() {
            SourceError::InvalidRequest(err.to_string())
        } else if let Some(status) = err.status() {
            SourceError::from_status(status.as_u16(), "")
        } else {
            SourceError::Transport(err.to_string())
        }
    }
}

/// Both the primary and the fallback source failed for one city/window.
#[derive(Debug, Clone, Error)]
#[error("{domain} data unavailable for {city} ({window}): primary: {primary}; fallback: {fallback}")]
pub struct SourceUnavailable {
    pub city: String,
    pub domain: Domain,
    pub window: DateWindow,
    pub primary: SourceError,
    pub fallback: SourceError,
}

/// The merger produced output that breaks its own key invariant.
#[derive(Debug, Error)]
pub enum MergeError {
    #[error("measurement key {date} / {city} appears more than once after merge")]
    DuplicateKey { date: chrono::NaiveDate, city: String },
}

/// Failure while persisting run outputs.
#[derive(Debug, Error)]
pub enum ReportError {
    #[error("failed to write {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize report: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to encode dataset: {0}")]
    Csv(#[from] csv::Error),
    #[error("no free output name for {0} after {1} attempts")]
    NameExhausted(String, u32),
}

/// Errors that abort a run before a report can be produced.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid date window: {0}")]
    InvalidWindow(String),
    #[error(transparent)]
    Merge(#[from] MergeError),
    #[error(transparent)]
    Report(#[from] ReportError),
}

pub(crate) fn truncate_body(body: &str) -> String {
    const MAX: usize = 200;
    if body.len() > MAX {
        let cut = (0..=MAX).rev().find(|i| body.is_char_boundary(*i)).unwrap_or(0);
        format!("{}...", &body[..cut])
    } else {
        body.to_string()
    }
}
