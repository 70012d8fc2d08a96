use std::path::{Path, PathBuf};

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::dataset::DatasetBuilder;
use crate::error::ConfigError;
use crate::evaluate::Evaluator;
use crate::models::{default_candidates, CandidateConfig};
use crate::scorer::TierPolicy;
use crate::split::Splitter;
use crate::train::Trainer;

pub const DEFAULT_FALLBACK_CSV: &str = "brain_stroke.csv";

/// Settings for one training/evaluation run. Every field has a default, so a
/// JSON file only needs to name what it overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub test_fraction: f64,
    pub random_seed: u64,
    pub cv_folds: usize,
    pub split_tolerance: f64,
    pub max_split_attempts: usize,
    pub min_outcome_classes: usize,
    pub populated_threshold: usize,
    pub candidates: Vec<CandidateConfig>,
    /// Tier policy for auditing the rule scorer against held-out outcomes.
    pub labeling_policy: Option<TierPolicy>,
    pub fallback_csv: PathBuf,
    pub database_url: Option<String>,
    pub report_path: Option<PathBuf>,
    pub snapshot_path: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            test_fraction: 0.2,
            random_seed: 42,
            cv_folds: 5,
            split_tolerance: 0.05,
            max_split_attempts: 10,
            min_outcome_classes: 2,
            populated_threshold: 10,
            candidates: default_candidates(),
            labeling_policy: None,
            fallback_csv: PathBuf::from(DEFAULT_FALLBACK_CSV),
            database_url: None,
            report_path: None,
            snapshot_path: None,
        }
    }
}

impl PipelineConfig {
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        info!("loaded pipeline config from {:?}", path);
        Self::from_json(&text)
    }

    /// Defaults or the given file, then process environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("DATABASE_URL").filter(|u| !u.trim().is_empty()) {
            debug!("record store url taken from environment");
            self.database_url = Some(url);
        }
        if let Some(csv) = lookup("STROKE_FALLBACK_CSV") {
            self.fallback_csv = PathBuf::from(csv);
        }
        if let Some(seed) = lookup("STROKE_RANDOM_SEED") {
            self.random_seed = seed
                .trim()
                .parse()
                .map_err(|_| ConfigError::Invalid(format!("STROKE_RANDOM_SEED={seed:?} is not an integer")))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.test_fraction > 0.0 && self.test_fraction < 1.0) {
            return Err(ConfigError::Invalid(format!(
                "test_fraction {} must lie strictly between 0 and 1",
                self.test_fraction
            )));
        }
        if self.cv_folds < 2 {
            return Err(ConfigError::Invalid(format!(
                "cv_folds {} must be at least 2",
                self.cv_folds
            )));
        }
        if self.candidates.is_empty() {
            return Err(ConfigError::Invalid("candidate list is empty".to_string()));
        }
        let mut names: Vec<String> = self.candidates.iter().map(CandidateConfig::name).collect();
        names.sort();
        if let Some(pair) = names.windows(2).find(|w| w[0] == w[1]) {
            return Err(ConfigError::Invalid(format!("duplicate candidate name {:?}", pair[0])));
        }
        Ok(())
    }

    pub fn dataset_builder(&self) -> DatasetBuilder {
        DatasetBuilder::new(self.min_outcome_classes)
    }

    pub fn splitter(&self) -> Splitter {
        Splitter::new(self.test_fraction, self.split_tolerance, self.max_split_attempts)
    }

    pub fn trainer(&self) -> Trainer {
        Trainer::new(self.random_seed)
    }

    pub fn evaluator(&self) -> Evaluator {
        Evaluator::new(self.cv_folds, self.random_seed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CandidateSpec;

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.test_fraction, 0.2);
        assert_eq!(config.cv_folds, 5);
        assert_eq!(config.candidates.len(), 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = PipelineConfig::from_json(
            r#"{"test_fraction": 0.3, "labeling_policy": "two_tier",
                "candidates": [{"kind": "decision_tree", "max_depth": 4}]}"#,
        )
        .unwrap();
        assert_eq!(config.test_fraction, 0.3);
        assert_eq!(config.random_seed, 42);
        assert_eq!(config.labeling_policy, Some(TierPolicy::TwoTier));
        assert_eq!(
            config.candidates,
            vec![CandidateConfig::new(CandidateSpec::DecisionTree { max_depth: Some(4) })]
        );
    }

    #[test]
    fn test_env_overrides() {
        let mut config = PipelineConfig::default();
        config
            .apply_env(|key| match key {
                "DATABASE_URL" => Some("postgres://localhost/stroke".to_string()),
                "STROKE_RANDOM_SEED" => Some("7".to_string()),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.random_seed, 7);
        assert_eq!(config.database_url.as_deref(), Some("postgres://localhost/stroke"));
        assert_eq!(config.fallback_csv, PathBuf::from(DEFAULT_FALLBACK_CSV));

        let bad = config.apply_env(|key| (key == "STROKE_RANDOM_SEED").then(|| "seven".to_string()));
        assert!(matches!(bad, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validation_rejects() {
        let mut config = PipelineConfig {
            test_fraction: 1.0,
            ..PipelineConfig::default()
        };
        assert!(config.validate().is_err());
        config.test_fraction = 0.2;
        config.cv_folds = 1;
        assert!(config.validate().is_err());
        config.cv_folds = 5;
        config.candidates.clear();
        assert!(config.validate().is_err());
        config.candidates = vec![
            CandidateConfig::new(CandidateSpec::Knn { k: 5 }),
            CandidateConfig::new(CandidateSpec::Knn { k: 3 }),
        ];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_file() {
        let err = PipelineConfig::from_file("/nonexistent/pipeline.json").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
