//! Candidate classifiers behind a common fit/predict seam.
//!
//! Each candidate is an unfitted configuration ([`CandidateModel`]) that fits into a
//! [`FittedModel`]. Probability estimates and feature importances are optional
//! capabilities: a model that cannot provide them returns `None`.

use std::fmt;

use log::debug;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use smartcore::linalg::basic::arrays::Array;
use smartcore::linalg::basic::matrix::DenseMatrix;
use smartcore::linear::logistic_regression::{LogisticRegression, LogisticRegressionParameters};
use smartcore::metrics::distance::euclidian::Euclidian;
use smartcore::neighbors::knn_classifier::{KNNClassifier, KNNClassifierParameters};
use smartcore::tree::decision_tree_classifier::{
    DecisionTreeClassifier, DecisionTreeClassifierParameters,
};

use crate::error::TrainError;
use crate::preprocess::FeatureMatrix;
use crate::split::group_by_class;

type Tree = DecisionTreeClassifier<f64, i32, DenseMatrix<f64>, Vec<i32>>;
type Logit = LogisticRegression<f64, i32, DenseMatrix<f64>, Vec<i32>>;
type Knn = KNNClassifier<f64, i32, DenseMatrix<f64>, Vec<i32>, Euclidian<f64>>;

pub trait FittedModel: Send + Sync {
    fn predict(&self, x: &FeatureMatrix) -> Result<Vec<i32>, TrainError>;

    /// Probability of the positive class per row, when the model can estimate it.
    fn predict_proba(&self, _x: &FeatureMatrix) -> Option<Result<Vec<f64>, TrainError>> {
        None
    }

    /// One non-negative weight per feature column, when the model exposes them.
    fn feature_importances(&self) -> Option<Vec<f64>> {
        None
    }
}

pub trait CandidateModel: Send + Sync {
    fn name(&self) -> &str;

    fn fit(&self, x: &FeatureMatrix, y: &[i32], seed: u64) -> Result<Box<dyn FittedModel>, TrainError>;

    /// Fit used by cross-validation, where only predictions are scored. Models
    /// may skip work that feeds nothing but `feature_importances`.
    fn fit_for_validation(
        &self,
        x: &FeatureMatrix,
        y: &[i32],
        seed: u64,
    ) -> Result<Box<dyn FittedModel>, TrainError> {
        self.fit(x, y, seed)
    }
}

fn check_input(x: &FeatureMatrix, y: &[i32]) -> Result<(), TrainError> {
    if x.is_empty() || y.is_empty() {
        return Err(TrainError::EmptyInput);
    }
    if x.n_rows() != y.len() {
        return Err(TrainError::Other(format!(
            "{} feature rows but {} labels",
            x.n_rows(),
            y.len()
        )));
    }
    Ok(())
}

fn accuracy(y_true: &[i32], y_pred: &[i32]) -> f64 {
    if y_true.is_empty() {
        return 0.0;
    }
    let correct = y_true.iter().zip(y_pred).filter(|(t, p)| t == p).count();
    correct as f64 / y_true.len() as f64
}

fn normalize(weights: &mut [f64]) {
    let sum: f64 = weights.iter().sum();
    if sum > 0.0 {
        for w in weights.iter_mut() {
            *w /= sum;
        }
    }
}

/// Bagged smartcore decision trees with seeded stratified bootstraps.
///
/// With `balanced` set, every bootstrap draws the same number of rows from each
/// class, which counteracts the heavy class imbalance of stroke outcomes.
/// Importances are out-of-bag permutation importances (mean accuracy drop).
#[derive(Debug, Clone)]
pub struct ForestModel {
    name: String,
    pub n_trees: usize,
    pub max_depth: Option<u16>,
    pub min_samples_leaf: usize,
    pub balanced: bool,
}

struct FittedForest {
    trees: Vec<Tree>,
    importances: Option<Vec<f64>>,
}

impl ForestModel {
    fn tree_parameters(&self) -> DecisionTreeClassifierParameters {
        let mut params = DecisionTreeClassifierParameters::default()
            .with_min_samples_leaf(self.min_samples_leaf.max(1));
        if let Some(depth) = self.max_depth {
            params = params.with_max_depth(depth);
        }
        params
    }

    fn bootstrap(&self, y: &[i32], rng: &mut StdRng) -> Vec<usize> {
        let groups = group_by_class(y);
        let per_class = y.len() / groups.len().max(1);
        let mut sample = Vec::with_capacity(y.len());
        for members in groups.values() {
            let draws = if self.balanced { per_class.max(1) } else { members.len() };
            for _ in 0..draws {
                sample.push(members[rng.gen_range(0..members.len())]);
            }
        }
        sample
    }
}

fn permute_column(x: &FeatureMatrix, column: usize, rng: &mut StdRng) -> FeatureMatrix {
    let mut values = x.column(column);
    values.shuffle(rng);
    let rows = x
        .rows()
        .iter()
        .zip(values)
        .map(|(row, v)| {
            let mut row = row.clone();
            row[column] = v;
            row
        })
        .collect();
    FeatureMatrix::new(x.feature_names().to_vec(), rows)
}

impl ForestModel {
    /// Fits the trees; with `importances` set, also scores each tree's
    /// out-of-bag rows under column permutation.
    fn fit_forest(
        &self,
        x: &FeatureMatrix,
        y: &[i32],
        seed: u64,
        importances: bool,
    ) -> Result<FittedForest, TrainError> {
        check_input(x, y)?;
        let mut rng = StdRng::seed_from_u64(seed);
        // Separate stream so the bootstraps do not depend on `importances`.
        let mut shuffle_rng = StdRng::seed_from_u64(seed.wrapping_add(1));
        let mut drops = vec![0.0; x.n_features()];
        let mut scored_trees = 0usize;
        let mut trees = Vec::with_capacity(self.n_trees);

        for _ in 0..self.n_trees.max(1) {
            let sample = self.bootstrap(y, &mut rng);
            let y_bag: Vec<i32> = sample.iter().map(|&i| y[i]).collect();
            let tree = Tree::fit(&x.select(&sample).to_dense(), &y_bag, self.tree_parameters())?;

            if importances {
                let mut in_bag = vec![false; y.len()];
                for &i in &sample {
                    in_bag[i] = true;
                }
                let oob: Vec<usize> = (0..y.len()).filter(|&i| !in_bag[i]).collect();
                if !oob.is_empty() {
                    let x_oob = x.select(&oob);
                    let y_oob: Vec<i32> = oob.iter().map(|&i| y[i]).collect();
                    let baseline = accuracy(&y_oob, &tree.predict(&x_oob.to_dense())?);
                    for (j, drop) in drops.iter_mut().enumerate() {
                        let permuted = permute_column(&x_oob, j, &mut shuffle_rng);
                        *drop += baseline - accuracy(&y_oob, &tree.predict(&permuted.to_dense())?);
                    }
                    scored_trees += 1;
                }
            }
            trees.push(tree);
        }

        let importances = importances.then(|| {
            let mut weights: Vec<f64> = drops
                .iter()
                .map(|d| (d / scored_trees.max(1) as f64).max(0.0))
                .collect();
            normalize(&mut weights);
            weights
        });
        debug!("{}: fitted {} trees", self.name, trees.len());
        Ok(FittedForest { trees, importances })
    }
}

impl CandidateModel for ForestModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn fit(&self, x: &FeatureMatrix, y: &[i32], seed: u64) -> Result<Box<dyn FittedModel>, TrainError> {
        Ok(Box::new(self.fit_forest(x, y, seed, true)?))
    }

    fn fit_for_validation(
        &self,
        x: &FeatureMatrix,
        y: &[i32],
        seed: u64,
    ) -> Result<Box<dyn FittedModel>, TrainError> {
        Ok(Box::new(self.fit_forest(x, y, seed, false)?))
    }
}

impl FittedForest {
    fn positive_share(&self, x: &FeatureMatrix) -> Result<Vec<f64>, TrainError> {
        let dense = x.to_dense();
        let mut votes = vec![0usize; x.n_rows()];
        for tree in &self.trees {
            for (v, label) in votes.iter_mut().zip(tree.predict(&dense)?) {
                if label == 1 {
                    *v += 1;
                }
            }
        }
        let n = self.trees.len().max(1) as f64;
        Ok(votes.into_iter().map(|v| v as f64 / n).collect())
    }
}

impl FittedModel for FittedForest {
    fn predict(&self, x: &FeatureMatrix) -> Result<Vec<i32>, TrainError> {
        Ok(self
            .positive_share(x)?
            .into_iter()
            .map(|p| i32::from(p > 0.5))
            .collect())
    }

    fn predict_proba(&self, x: &FeatureMatrix) -> Option<Result<Vec<f64>, TrainError>> {
        Some(self.positive_share(x))
    }

    fn feature_importances(&self) -> Option<Vec<f64>> {
        self.importances.clone()
    }
}

#[derive(Debug, Clone)]
pub struct LogisticModel {
    name: String,
    pub alpha: f64,
}

struct FittedLogistic {
    model: Logit,
    weights: Vec<f64>,
    intercept: f64,
}

fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}

impl CandidateModel for LogisticModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn fit(&self, x: &FeatureMatrix, y: &[i32], _seed: u64) -> Result<Box<dyn FittedModel>, TrainError> {
        check_input(x, y)?;
        let params = LogisticRegressionParameters::default().with_alpha(self.alpha);
        let model = Logit::fit(&x.to_dense(), &y.to_vec(), params)?;

        // Binary fits store a single coefficient row (or column, by version).
        let coefficients = model.coefficients();
        let (rows, _) = coefficients.shape();
        let weights: Vec<f64> = (0..x.n_features())
            .map(|j| {
                if rows == 1 {
                    *coefficients.get((0, j))
                } else {
                    *coefficients.get((j, 0))
                }
            })
            .collect();
        let intercept = *model.intercept().get((0, 0));

        if !intercept.is_finite() || weights.iter().any(|w| !w.is_finite()) {
            return Err(TrainError::NonConvergence(format!(
                "{} produced non-finite coefficients",
                self.name
            )));
        }
        Ok(Box::new(FittedLogistic {
            model,
            weights,
            intercept,
        }))
    }
}

impl FittedModel for FittedLogistic {
    fn predict(&self, x: &FeatureMatrix) -> Result<Vec<i32>, TrainError> {
        Ok(self.model.predict(&x.to_dense())?)
    }

    fn predict_proba(&self, x: &FeatureMatrix) -> Option<Result<Vec<f64>, TrainError>> {
        let probabilities = x
            .rows()
            .iter()
            .map(|row| {
                let z = self.intercept
                    + row.iter().zip(&self.weights).map(|(v, w)| v * w).sum::<f64>();
                sigmoid(z)
            })
            .collect();
        Some(Ok(probabilities))
    }

    /// Absolute coefficients on standardized inputs, normalized to sum to one.
    fn feature_importances(&self) -> Option<Vec<f64>> {
        let mut importances: Vec<f64> = self.weights.iter().map(|w| w.abs()).collect();
        normalize(&mut importances);
        Some(importances)
    }
}

#[derive(Debug, Clone)]
pub struct TreeModel {
    name: String,
    pub max_depth: Option<u16>,
}

struct FittedTree(Tree);

impl CandidateModel for TreeModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn fit(&self, x: &FeatureMatrix, y: &[i32], _seed: u64) -> Result<Box<dyn FittedModel>, TrainError> {
        check_input(x, y)?;
        let mut params = DecisionTreeClassifierParameters::default();
        if let Some(depth) = self.max_depth {
            params = params.with_max_depth(depth);
        }
        let tree = Tree::fit(&x.to_dense(), &y.to_vec(), params)?;
        Ok(Box::new(FittedTree(tree)))
    }
}

impl FittedModel for FittedTree {
    fn predict(&self, x: &FeatureMatrix) -> Result<Vec<i32>, TrainError> {
        Ok(self.0.predict(&x.to_dense())?)
    }
}

#[derive(Debug, Clone)]
pub struct KnnModel {
    name: String,
    pub k: usize,
}

struct FittedKnn(Knn);

impl CandidateModel for KnnModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn fit(&self, x: &FeatureMatrix, y: &[i32], _seed: u64) -> Result<Box<dyn FittedModel>, TrainError> {
        check_input(x, y)?;
        if x.n_rows() < self.k {
            return Err(TrainError::Other(format!(
                "k={} exceeds {} training rows",
                self.k,
                x.n_rows()
            )));
        }
        let params = KNNClassifierParameters::default().with_k(self.k);
        let knn = Knn::fit(&x.to_dense(), &y.to_vec(), params)?;
        Ok(Box::new(FittedKnn(knn)))
    }
}

impl FittedModel for FittedKnn {
    fn predict(&self, x: &FeatureMatrix) -> Result<Vec<i32>, TrainError> {
        Ok(self.0.predict(&x.to_dense())?)
    }
}

fn default_n_trees() -> usize {
    200
}

fn default_min_samples_leaf() -> usize {
    1
}

fn default_k() -> usize {
    5
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CandidateSpec {
    RandomForest {
        #[serde(default = "default_n_trees")]
        n_trees: usize,
        #[serde(default)]
        max_depth: Option<u16>,
        #[serde(default = "default_min_samples_leaf")]
        min_samples_leaf: usize,
        #[serde(default)]
        balanced: bool,
    },
    LogisticRegression {
        #[serde(default)]
        alpha: f64,
    },
    DecisionTree {
        #[serde(default)]
        max_depth: Option<u16>,
    },
    Knn {
        #[serde(default = "default_k")]
        k: usize,
    },
}

impl fmt::Display for CandidateSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            CandidateSpec::RandomForest { .. } => "random_forest",
            CandidateSpec::LogisticRegression { .. } => "logistic_regression",
            CandidateSpec::DecisionTree { .. } => "decision_tree",
            CandidateSpec::Knn { .. } => "knn",
        };
        f.write_str(kind)
    }
}

/// A named entry of the candidate list; the name defaults to the model kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(flatten)]
    pub spec: CandidateSpec,
}

impl CandidateConfig {
    pub fn new(spec: CandidateSpec) -> Self {
        CandidateConfig { name: None, spec }
    }

    pub fn named(name: &str, spec: CandidateSpec) -> Self {
        CandidateConfig {
            name: Some(name.to_string()),
            spec,
        }
    }

    pub fn name(&self) -> String {
        self.name.clone().unwrap_or_else(|| self.spec.to_string())
    }

    pub fn build(&self) -> Box<dyn CandidateModel> {
        let name = self.name();
        match self.spec.clone() {
            CandidateSpec::RandomForest {
                n_trees,
                max_depth,
                min_samples_leaf,
                balanced,
            } => Box::new(ForestModel {
                name,
                n_trees,
                max_depth,
                min_samples_leaf,
                balanced,
            }),
            CandidateSpec::LogisticRegression { alpha } => Box::new(LogisticModel { name, alpha }),
            CandidateSpec::DecisionTree { max_depth } => Box::new(TreeModel { name, max_depth }),
            CandidateSpec::Knn { k } => Box::new(KnnModel { name, k }),
        }
    }
}

pub fn default_candidates() -> Vec<CandidateConfig> {
    vec![
        CandidateConfig::new(CandidateSpec::RandomForest {
            n_trees: default_n_trees(),
            max_depth: None,
            min_samples_leaf: default_min_samples_leaf(),
            balanced: true,
        }),
        CandidateConfig::new(CandidateSpec::LogisticRegression { alpha: 0.0 }),
        CandidateConfig::new(CandidateSpec::Knn { k: default_k() }),
    ]
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Two well-separated clusters on the first two features.
    pub(crate) fn separable(n_per_class: usize) -> (FeatureMatrix, Vec<i32>) {
        let mut rows = Vec::new();
        let mut y = Vec::new();
        for i in 0..n_per_class {
            let jitter = (i % 7) as f64 * 0.05;
            rows.push(vec![-2.0 + jitter, -1.5 - jitter, 0.0]);
            y.push(0);
            rows.push(vec![2.0 - jitter, 1.5 + jitter, 0.0]);
            y.push(1);
        }
        let names = vec!["signal_a".to_string(), "signal_b".to_string(), "noise".to_string()];
        (FeatureMatrix::new(names, rows), y)
    }

    fn forest(n_trees: usize, balanced: bool) -> Box<dyn CandidateModel> {
        CandidateConfig::new(CandidateSpec::RandomForest {
            n_trees,
            max_depth: Some(4),
            min_samples_leaf: 1,
            balanced,
        })
        .build()
    }

    #[test]
    fn test_forest_learns_and_exposes_capabilities() {
        let (x, y) = separable(30);
        let model = forest(15, true).fit(&x, &y, 42).unwrap();
        assert_eq!(model.predict(&x).unwrap(), y);

        let proba = model.predict_proba(&x).unwrap().unwrap();
        assert!(proba.iter().all(|p| (0.0..=1.0).contains(p)));

        let importances = model.feature_importances().unwrap();
        assert_eq!(importances.len(), 3);
        assert_eq!(importances[2], 0.0);
    }

    #[test]
    fn test_forest_is_seed_deterministic() {
        let (x, y) = separable(20);
        let a = forest(10, false).fit(&x, &y, 7).unwrap();
        let b = forest(10, false).fit(&x, &y, 7).unwrap();
        assert_eq!(a.feature_importances(), b.feature_importances());
        assert_eq!(
            a.predict_proba(&x).unwrap().unwrap(),
            b.predict_proba(&x).unwrap().unwrap()
        );
    }

    #[test]
    fn test_validation_fit_skips_importances_only() {
        let (x, y) = separable(20);
        let model = forest(8, true);
        let full = model.fit(&x, &y, 11).unwrap();
        let validation = model.fit_for_validation(&x, &y, 11).unwrap();
        assert!(full.feature_importances().is_some());
        assert!(validation.feature_importances().is_none());
        assert_eq!(
            full.predict_proba(&x).unwrap().unwrap(),
            validation.predict_proba(&x).unwrap().unwrap()
        );
    }

    #[test]
    fn test_balanced_bootstrap_draws_equally() {
        let spec = ForestModel {
            name: "f".into(),
            n_trees: 1,
            max_depth: None,
            min_samples_leaf: 1,
            balanced: true,
        };
        let y: Vec<i32> = (0..100).map(|i| i32::from(i < 10)).collect();
        let mut rng = StdRng::seed_from_u64(1);
        let sample = spec.bootstrap(&y, &mut rng);
        let positives = sample.iter().filter(|&&i| y[i] == 1).count();
        assert_eq!(positives, 50);
        assert_eq!(sample.len(), 100);
    }

    #[test]
    fn test_logistic_probabilities_track_predictions() {
        let (x, y) = separable(25);
        let model = CandidateConfig::new(CandidateSpec::LogisticRegression { alpha: 0.1 })
            .build()
            .fit(&x, &y, 0)
            .unwrap();
        let predictions = model.predict(&x).unwrap();
        let proba = model.predict_proba(&x).unwrap().unwrap();
        for (p, label) in proba.iter().zip(&predictions) {
            assert_eq!(i32::from(*p > 0.5), *label);
        }
        let importances = model.feature_importances().unwrap();
        assert!((importances.iter().sum::<f64>() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_knn_and_tree_have_no_optional_capabilities() {
        let (x, y) = separable(10);
        for spec in [CandidateSpec::Knn { k: 3 }, CandidateSpec::DecisionTree { max_depth: None }] {
            let model = CandidateConfig::new(spec).build().fit(&x, &y, 0).unwrap();
            assert_eq!(model.predict(&x).unwrap(), y);
            assert!(model.predict_proba(&x).is_none());
            assert!(model.feature_importances().is_none());
        }
    }

    #[test]
    fn test_empty_input_rejected() {
        let x = FeatureMatrix::new(vec!["a".into()], vec![]);
        let err = CandidateConfig::new(CandidateSpec::Knn { k: 1 })
            .build()
            .fit(&x, &[], 0)
            .err()
            .unwrap();
        assert!(matches!(err, TrainError::EmptyInput));
    }

    #[test]
    fn test_candidate_config_from_json() {
        let parsed: Vec<CandidateConfig> = serde_json::from_str(
            r#"[{"kind": "random_forest", "n_trees": 50, "balanced": true},
                {"kind": "knn", "name": "knn_7", "k": 7},
                {"kind": "logistic_regression"}]"#,
        )
        .unwrap();
        assert_eq!(parsed[0].name(), "random_forest");
        assert_eq!(parsed[1].name(), "knn_7");
        assert_eq!(parsed[2].spec, CandidateSpec::LogisticRegression { alpha: 0.0 });
        assert_eq!(
            parsed[0].spec,
            CandidateSpec::RandomForest {
                n_trees: 50,
                max_depth: None,
                min_samples_leaf: 1,
                balanced: true
            }
        );
    }
}
