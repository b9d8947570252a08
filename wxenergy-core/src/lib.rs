//! Core library for the `wxenergy` pipeline.
//!
//! This crate defines:
//! - Configuration, thresholds and credentials handling
//! - Weather and energy sources behind one provider trait, with retry and fallback
//! - The merger producing one unified record per (date, city)
//! - The data-quality battery and report rendering
//!
//! It is used by `wxenergy-cli`, but can also be driven directly by a scheduler.

pub mod client;
pub mod config;
pub mod dataset;
pub mod error;
pub mod merge;
pub mod model;
pub mod pipeline;
pub mod provider;
pub mod quality;
pub mod report;
pub mod retry;
pub mod stats;

pub use client::{FailedFetch, FallbackUse, SourceClient};
pub use config::{Config, Credentials, ThresholdConfig};
pub use error::{PipelineError, SourceError};
pub use model::{DateWindow, Domain, UnifiedRecord};
pub use pipeline::{Pipeline, RunOutcome};
pub use provider::{ObservationProvider, ProviderId};
pub use quality::{QualityReport, assess};
pub use report::{OutputWriter, emit};
