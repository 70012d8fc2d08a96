//! Held-out metrics, cross-validation stability and importance ranking for
//! fitted candidates.
//!
//! Every ratio metric follows the same zero-division policy: when its
//! denominator is zero the metric is reported as 0.0 rather than failing.

use std::cmp::Ordering;
use std::fmt;

use log::debug;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::Serialize;

use crate::error::EvaluateError;
use crate::models::{CandidateModel, FittedModel};
use crate::preprocess::FeatureMatrix;
use crate::split::group_by_class;

pub const POSITIVE: i32 = 1;

/// Binary confusion counts with class 1 as the positive class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConfusionMatrix {
    pub tn: usize,
    pub fp: usize,
    #[serde(rename = "fn")]
    pub fn_: usize,
    pub tp: usize,
}

impl ConfusionMatrix {
    pub fn from_predictions(y_true: &[i32], y_pred: &[i32]) -> Self {
        let mut m = ConfusionMatrix::default();
        for (&t, &p) in y_true.iter().zip(y_pred) {
            match (t == POSITIVE, p == POSITIVE) {
                (true, true) => m.tp += 1,
                (false, true) => m.fp += 1,
                (true, false) => m.fn_ += 1,
                (false, false) => m.tn += 1,
            }
        }
        m
    }

    /// Rows are actual classes, columns predicted classes: `[[TN, FP], [FN, TP]]`.
    pub fn as_rows(&self) -> [[usize; 2]; 2] {
        [[self.tn, self.fp], [self.fn_, self.tp]]
    }

    pub fn total(&self) -> usize {
        self.tn + self.fp + self.fn_ + self.tp
    }
}

fn ratio(num: usize, den: usize) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

fn harmonic(precision: f64, recall: f64) -> f64 {
    if precision + recall == 0.0 {
        0.0
    } else {
        2.0 * precision * recall / (precision + recall)
    }
}

pub fn accuracy(y_true: &[i32], y_pred: &[i32]) -> f64 {
    if y_true.is_empty() || y_true.len() != y_pred.len() {
        return 0.0;
    }
    smartcore::metrics::accuracy(&y_true.to_vec(), &y_pred.to_vec())
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassMetrics {
    pub class: i32,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub support: usize,
}

pub fn classification_report(y_true: &[i32], y_pred: &[i32]) -> Vec<ClassMetrics> {
    let mut classes: Vec<i32> = y_true.to_vec();
    classes.sort_unstable();
    classes.dedup();
    classes
        .into_iter()
        .map(|class| {
            let mut tp = 0;
            let mut predicted = 0;
            let mut support = 0;
            for (&t, &p) in y_true.iter().zip(y_pred) {
                if p == class {
                    predicted += 1;
                }
                if t == class {
                    support += 1;
                    if p == class {
                        tp += 1;
                    }
                }
            }
            let precision = ratio(tp, predicted);
            let recall = ratio(tp, support);
            ClassMetrics {
                class,
                precision,
                recall,
                f1: harmonic(precision, recall),
                support,
            }
        })
        .collect()
}

/// Rank-based ROC-AUC (Mann-Whitney U with averaged tie ranks).
/// `None` when either class is absent from `y_true`.
pub fn roc_auc(y_true: &[i32], scores: &[f64]) -> Option<f64> {
    let positives = y_true.iter().filter(|&&y| y == POSITIVE).count();
    let negatives = y_true.len() - positives;
    if positives == 0 || negatives == 0 || scores.len() != y_true.len() {
        return None;
    }

    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[a].total_cmp(&scores[b]));

    let mut ranks = vec![0.0; scores.len()];
    let mut i = 0;
    while i < order.len() {
        let mut j = i;
        while j + 1 < order.len() && scores[order[j + 1]] == scores[order[i]] {
            j += 1;
        }
        // 1-based average rank of the tie block i..=j
        let rank = (i + j) as f64 / 2.0 + 1.0;
        for &idx in &order[i..=j] {
            ranks[idx] = rank;
        }
        i = j + 1;
    }

    let positive_rank_sum: f64 = y_true
        .iter()
        .zip(&ranks)
        .filter(|(&y, _)| y == POSITIVE)
        .map(|(_, r)| r)
        .sum();
    let p = positives as f64;
    let u = positive_rank_sum - p * (p + 1.0) / 2.0;
    Some(u / (p * negatives as f64))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeatureImportance {
    pub feature: String,
    pub importance: f64,
}

/// Pairs names with importances, sorted by importance descending. Ties keep
/// column order.
pub fn rank_importances(feature_names: &[String], importances: &[f64]) -> Vec<FeatureImportance> {
    let mut ranked: Vec<FeatureImportance> = feature_names
        .iter()
        .zip(importances)
        .map(|(name, &importance)| FeatureImportance {
            feature: name.clone(),
            importance,
        })
        .collect();
    ranked.sort_by(|a, b| b.importance.partial_cmp(&a.importance).unwrap_or(Ordering::Equal));
    ranked
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CrossValidationSummary {
    pub folds: usize,
    pub fold_accuracies: Vec<f64>,
    pub mean: f64,
    pub std: f64,
}

impl CrossValidationSummary {
    fn from_scores(fold_accuracies: Vec<f64>) -> Self {
        let n = fold_accuracies.len().max(1) as f64;
        let mean = fold_accuracies.iter().sum::<f64>() / n;
        let std = (fold_accuracies.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / n).sqrt();
        CrossValidationSummary {
            folds: fold_accuracies.len(),
            fold_accuracies,
            mean,
            std,
        }
    }
}

/// Assigns every row to one of `k` folds, dealing each class's shuffled
/// members round-robin so every fold mirrors the class ratio.
pub fn stratified_folds(labels: &[i32], k: usize, seed: u64) -> Vec<Vec<usize>> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut folds = vec![Vec::new(); k.max(1)];
    let n_folds = folds.len();
    let mut next = 0usize;
    for members in group_by_class(labels).values() {
        let mut shuffled = members.clone();
        shuffled.shuffle(&mut rng);
        for idx in shuffled {
            folds[next % n_folds].push(idx);
            next += 1;
        }
    }
    for fold in folds.iter_mut() {
        fold.sort_unstable();
    }
    folds
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvaluationReport {
    pub accuracy: f64,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub confusion_matrix: ConfusionMatrix,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub roc_auc: Option<f64>,
    pub cross_validation: CrossValidationSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feature_importances: Option<Vec<FeatureImportance>>,
    pub per_class: Vec<ClassMetrics>,
}

impl fmt::Display for EvaluationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [[tn, fp], [fn_, tp]] = self.confusion_matrix.as_rows();
        writeln!(f, "  accuracy:  {:.4}", self.accuracy)?;
        writeln!(f, "  precision: {:.4}", self.precision)?;
        writeln!(f, "  recall:    {:.4}", self.recall)?;
        writeln!(f, "  f1:        {:.4}", self.f1)?;
        match self.roc_auc {
            Some(auc) => writeln!(f, "  roc_auc:   {:.4}", auc)?,
            None => writeln!(f, "  roc_auc:   n/a")?,
        }
        writeln!(f, "  confusion: [[TN: {tn}, FP: {fp}], [FN: {fn_}, TP: {tp}]]")?;
        writeln!(
            f,
            "  {}-fold cv accuracy: {:.4} (+/- {:.4})",
            self.cross_validation.folds, self.cross_validation.mean, self.cross_validation.std
        )?;
        for class in &self.per_class {
            writeln!(
                f,
                "  class {}: precision {:.4} recall {:.4} f1 {:.4} support {}",
                class.class, class.precision, class.recall, class.f1, class.support
            )?;
        }
        if let Some(ranked) = &self.feature_importances {
            writeln!(f, "  feature importances:")?;
            for item in ranked {
                writeln!(f, "    {:<20} {:.4}", item.feature, item.importance)?;
            }
        }
        Ok(())
    }
}

/// Held-out split handed to the evaluator.
pub struct EvaluationData<'a> {
    pub x_train: &'a FeatureMatrix,
    pub y_train: &'a [i32],
    pub x_test: &'a FeatureMatrix,
    pub y_test: &'a [i32],
}

#[derive(Debug, Clone, Copy)]
pub struct Evaluator {
    pub folds: usize,
    pub seed: u64,
}

impl Default for Evaluator {
    fn default() -> Self {
        Evaluator { folds: 5, seed: 42 }
    }
}

impl Evaluator {
    pub fn new(folds: usize, seed: u64) -> Self {
        Evaluator { folds, seed }
    }

    /// Refits `candidate` on k-1 stratified folds of the training partition and
    /// scores the remaining fold, for each of the k folds.
    pub fn cross_validate(
        &self,
        candidate: &dyn CandidateModel,
        x: &FeatureMatrix,
        y: &[i32],
    ) -> Result<CrossValidationSummary, EvaluateError> {
        if self.folds < 2 || x.n_rows() < self.folds {
            return Err(EvaluateError::TooFewRows {
                folds: self.folds,
                rows: x.n_rows(),
            });
        }
        let folds = stratified_folds(y, self.folds, self.seed);
        let mut scores = Vec::with_capacity(folds.len());
        for (k, held_out) in folds.iter().enumerate() {
            let train_idx: Vec<usize> = folds
                .iter()
                .enumerate()
                .filter(|(j, _)| *j != k)
                .flat_map(|(_, fold)| fold.iter().copied())
                .collect();
            let y_fit: Vec<i32> = train_idx.iter().map(|&i| y[i]).collect();
            let y_held: Vec<i32> = held_out.iter().map(|&i| y[i]).collect();

            let model = candidate.fit_for_validation(&x.select(&train_idx), &y_fit, self.seed)?;
            let predicted = model.predict(&x.select(held_out))?;
            let score = accuracy(&y_held, &predicted);
            debug!("{} fold {}: accuracy {:.4}", candidate.name(), k + 1, score);
            scores.push(score);
        }
        Ok(CrossValidationSummary::from_scores(scores))
    }

    pub fn evaluate(
        &self,
        candidate: &dyn CandidateModel,
        model: &dyn FittedModel,
        data: &EvaluationData<'_>,
    ) -> Result<EvaluationReport, EvaluateError> {
        let predicted = model.predict(data.x_test)?;
        let confusion = ConfusionMatrix::from_predictions(data.y_test, &predicted);
        let precision = ratio(confusion.tp, confusion.tp + confusion.fp);
        let recall = ratio(confusion.tp, confusion.tp + confusion.fn_);

        let roc_auc = match model.predict_proba(data.x_test) {
            Some(scores) => roc_auc(data.y_test, &scores?),
            None => None,
        };

        let cross_validation = self.cross_validate(candidate, data.x_train, data.y_train)?;
        let feature_importances = model
            .feature_importances()
            .map(|weights| rank_importances(data.x_train.feature_names(), &weights));

        Ok(EvaluationReport {
            accuracy: accuracy(data.y_test, &predicted),
            precision,
            recall,
            f1: harmonic(precision, recall),
            confusion_matrix: confusion,
            roc_auc,
            cross_validation,
            feature_importances,
            per_class: classification_report(data.y_test, &predicted),
        })
    }
}
