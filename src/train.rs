use std::time::Instant;

use log::{info, warn};

use crate::error::TrainError;
use crate::models::{CandidateModel, FittedModel};
use crate::preprocess::FeatureMatrix;

pub struct TrainedCandidate {
    pub name: String,
    pub model: Box<dyn FittedModel>,
}

#[derive(Debug)]
pub struct CandidateFailure {
    pub name: String,
    pub cause: TrainError,
}

/// Fitted candidates and captured failures, both in candidate-list order.
#[derive(Default)]
pub struct TrainingOutcome {
    pub trained: Vec<TrainedCandidate>,
    pub failures: Vec<CandidateFailure>,
}

/// Fits every candidate against the same training partition with one seed.
/// A failing candidate is recorded and does not stop the others.
#[derive(Debug, Clone, Copy)]
pub struct Trainer {
    pub seed: u64,
}

impl Trainer {
    pub fn new(seed: u64) -> Self {
        Trainer { seed }
    }

    pub fn fit_one(
        &self,
        candidate: &dyn CandidateModel,
        x: &FeatureMatrix,
        y: &[i32],
    ) -> Result<Box<dyn FittedModel>, TrainError> {
        candidate.fit(x, y, self.seed)
    }

    pub fn train(&self, candidates: &[Box<dyn CandidateModel>], x: &FeatureMatrix, y: &[i32]) -> TrainingOutcome {
        let mut outcome = TrainingOutcome::default();
        for candidate in candidates {
            let started = Instant::now();
            match self.fit_one(candidate.as_ref(), x, y) {
                Ok(model) => {
                    info!(
                        "fitted {} on {} rows in {:.2?}",
                        candidate.name(),
                        x.n_rows(),
                        started.elapsed()
                    );
                    outcome.trained.push(TrainedCandidate {
                        name: candidate.name().to_string(),
                        model,
                    });
                }
                Err(cause) => {
                    warn!("candidate {} failed to fit: {}", candidate.name(), cause);
                    outcome.failures.push(CandidateFailure {
                        name: candidate.name().to_string(),
                        cause,
                    });
                }
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::tests::separable;
    use crate::models::{CandidateConfig, CandidateSpec};

    struct Diverging;

    impl CandidateModel for Diverging {
        fn name(&self) -> &str {
            "diverging"
        }

        fn fit(&self, _x: &FeatureMatrix, _y: &[i32], _seed: u64) -> Result<Box<dyn FittedModel>, TrainError> {
            Err(TrainError::NonConvergence("loss is NaN".into()))
        }
    }

    #[test]
    fn test_failure_is_captured_per_candidate() {
        let (x, y) = separable(10);
        let candidates: Vec<Box<dyn CandidateModel>> = vec![
            CandidateConfig::new(CandidateSpec::DecisionTree { max_depth: Some(3) }).build(),
            Box::new(Diverging),
            CandidateConfig::new(CandidateSpec::Knn { k: 3 }).build(),
        ];
        let outcome = Trainer::new(42).train(&candidates, &x, &y);

        let names: Vec<&str> = outcome.trained.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["decision_tree", "knn"]);
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].name, "diverging");
        assert!(matches!(outcome.failures[0].cause, TrainError::NonConvergence(_)));
    }

    #[test]
    fn test_knn_with_too_few_rows_fails_alone() {
        let (x, y) = separable(2);
        let candidates = vec![
            CandidateConfig::new(CandidateSpec::Knn { k: 5 }).build(),
            CandidateConfig::new(CandidateSpec::DecisionTree { max_depth: None }).build(),
        ];
        let outcome = Trainer::new(1).train(&candidates, &x, &y);
        assert_eq!(outcome.trained.len(), 1);
        assert_eq!(outcome.failures[0].name, "knn");
    }
}
