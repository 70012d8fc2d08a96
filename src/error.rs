use std::fmt;
use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

/// Pipeline stages, executed strictly in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Build,
    Preprocess,
    Split,
    Train,
    Evaluate,
    Report,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Build => "build",
            Stage::Preprocess => "preprocess",
            Stage::Split => "split",
            Stage::Train => "train",
            Stage::Evaluate => "evaluate",
            Stage::Report => "report",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("missing required field {0:?}")]
    MissingField(&'static str),
    #[error("invalid value {value:?} for field {field:?}")]
    InvalidValue { field: &'static str, value: String },
}

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("cannot read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed delimited file: {0}")]
    Csv(#[from] csv::Error),
    #[error("record store query failed: {0}")]
    Postgres(#[from] tokio_postgres::Error),
    #[error("missing required columns {0:?}")]
    MissingColumns(Vec<String>),
}

#[derive(Error, Debug)]
pub enum BuildError {
    #[error("no usable labeled records: {reason}")]
    DataUnavailable { reason: String },
}

#[derive(Error, Debug, PartialEq)]
pub enum PreprocessError {
    #[error("cannot impute column {column:?}: no observed values at fit time")]
    Imputation { column: &'static str },
    #[error("cannot fit on an empty dataset")]
    EmptyInput,
    #[error("column statistics failed: {0}")]
    Frame(String),
}

impl From<polars::prelude::PolarsError> for PreprocessError {
    fn from(err: polars::prelude::PolarsError) -> Self {
        PreprocessError::Frame(err.to_string())
    }
}

#[derive(Error, Debug, PartialEq)]
pub enum SplitError {
    #[error("insufficient class diversity: {reason}")]
    InsufficientDiversity { reason: String },
    #[error("test fraction {0} must lie strictly between 0 and 1")]
    InvalidFraction(f64),
}

#[derive(Error, Debug)]
pub enum TrainError {
    #[error("model fit failed: {0}")]
    Model(#[from] smartcore::error::Failed),
    #[error("model did not converge: {0}")]
    NonConvergence(String),
    #[error("cannot fit on empty training data")]
    EmptyInput,
    #[error("{0}")]
    Other(String),
}

#[derive(Error, Debug)]
pub enum EvaluateError {
    #[error(transparent)]
    Model(#[from] TrainError),
    #[error("{folds}-fold cross-validation needs at least {folds} training rows, got {rows}")]
    TooFewRows { folds: usize, rows: usize },
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Cause of a fatal pipeline failure.
#[derive(Error, Debug)]
pub enum StageError {
    #[error(transparent)]
    Build(#[from] BuildError),
    #[error(transparent)]
    Preprocess(#[from] PreprocessError),
    #[error(transparent)]
    Split(#[from] SplitError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("cannot write report: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot serialize report: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("cannot write feature snapshot: {0}")]
    Snapshot(#[from] polars::prelude::PolarsError),
}

#[derive(Error, Debug)]
#[error("pipeline failed at stage {stage}: {cause}")]
pub struct PipelineError {
    pub stage: Stage,
    #[source]
    pub cause: StageError,
}

impl PipelineError {
    pub fn new(stage: Stage, cause: impl Into<StageError>) -> Self {
        PipelineError {
            stage,
            cause: cause.into(),
        }
    }
}
