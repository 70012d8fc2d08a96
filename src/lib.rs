//! Stroke-risk triage: a deterministic rule scorer for single patient records
//! and a batch pipeline that trains and evaluates candidate classifiers on
//! historical outcomes.

pub mod config;
pub mod dataset;
pub mod error;
pub mod evaluate;
pub mod models;
pub mod pipeline;
pub mod postgres;
pub mod preprocess;
pub mod records;
pub mod scorer;
pub mod snapshot;
pub mod source;
pub mod split;
pub mod train;

pub use config::PipelineConfig;
pub use error::{PipelineError, Stage};
pub use pipeline::{run_configured, run_pipeline, CandidateOutcome, PipelineReport};
pub use records::{PatientFeatureSet, PatientInput};
pub use scorer::{RiskScorer, ScoringResponse, TierPolicy};
