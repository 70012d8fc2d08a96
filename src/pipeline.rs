//! One-shot training run: Build, Preprocess, Split, Train, Evaluate, Report.
//!
//! Stages run strictly in that order. A fatal failure aborts the run and is
//! returned as a [`PipelineError`] naming the stage. A candidate that fails to
//! fit or evaluate is recorded in the report instead and does not stop the run.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::Instant;

use log::{error, info, warn};
use serde::Serialize;

use crate::config::PipelineConfig;
use crate::dataset::{Dataset, DatasetSummary};
use crate::error::{PipelineError, Stage, StageError};
use crate::evaluate::{accuracy, ConfusionMatrix, EvaluationData, EvaluationReport};
use crate::models::CandidateModel;
use crate::preprocess::{FeatureMatrix, FittedPreprocessingState, Preprocessor};
use crate::records::PatientFeatureSet;
use crate::scorer::{RiskLabel, RiskScorer, TierPolicy};
use crate::snapshot::write_snapshot;
use crate::source::RecordSource;
use crate::split::Partition;
use crate::train::TrainingOutcome;

/// Run-scoped state threaded through the stages in place of globals.
pub struct RunContext<'a> {
    pub config: &'a PipelineConfig,
    started: Instant,
    stage_started: Instant,
    current: Stage,
}

impl<'a> RunContext<'a> {
    pub fn new(config: &'a PipelineConfig) -> Self {
        let now = Instant::now();
        RunContext {
            config,
            started: now,
            stage_started: now,
            current: Stage::Build,
        }
    }

    pub fn stage(&self) -> Stage {
        self.current
    }

    fn enter(&mut self, stage: Stage) {
        self.current = stage;
        self.stage_started = Instant::now();
        info!("[{}] started", stage);
    }

    fn leave(&self) {
        info!("[{}] finished in {:.2?}", self.current, self.stage_started.elapsed());
    }

    fn fail(&self, cause: impl Into<StageError>) -> PipelineError {
        let err = PipelineError::new(self.current, cause);
        error!("{}", err);
        err
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CandidateOutcome {
    Evaluated(EvaluationReport),
    Failed { stage: Stage, cause: String },
}

impl CandidateOutcome {
    pub fn report(&self) -> Option<&EvaluationReport> {
        match self {
            CandidateOutcome::Evaluated(report) => Some(report),
            CandidateOutcome::Failed { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SplitSummary {
    pub train_rows: usize,
    pub test_rows: usize,
    pub seed: u64,
}

/// Rule scorer labels compared with held-out outcomes; "High Risk" counts as a
/// positive prediction. Kept apart from the candidates and never trained on.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScorerAudit {
    pub policy: TierPolicy,
    pub rows: usize,
    pub label_counts: BTreeMap<String, usize>,
    pub confusion_matrix: ConfusionMatrix,
    pub accuracy: f64,
}

pub fn audit_scorer(policy: TierPolicy, records: &[&PatientFeatureSet], outcomes: &[i32]) -> ScorerAudit {
    let scorer = RiskScorer::new(policy);
    let mut label_counts = BTreeMap::new();
    let predicted: Vec<i32> = records
        .iter()
        .map(|patient| {
            let label = scorer.assess(patient).label;
            *label_counts.entry(label.as_str().to_string()).or_insert(0) += 1;
            i32::from(label == RiskLabel::High)
        })
        .collect();
    ScorerAudit {
        policy,
        rows: records.len(),
        label_counts,
        confusion_matrix: ConfusionMatrix::from_predictions(outcomes, &predicted),
        accuracy: accuracy(outcomes, &predicted),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub dataset: DatasetSummary,
    pub split: SplitSummary,
    pub preprocessing: FittedPreprocessingState,
    pub candidates: BTreeMap<String, CandidateOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scorer_audit: Option<ScorerAudit>,
}

impl PipelineReport {
    pub fn evaluated(&self) -> impl Iterator<Item = (&String, &EvaluationReport)> {
        self.candidates
            .iter()
            .filter_map(|(name, outcome)| outcome.report().map(|r| (name, r)))
    }

    pub fn failed(&self) -> impl Iterator<Item = &String> {
        self.candidates
            .iter()
            .filter(|(_, outcome)| matches!(outcome, CandidateOutcome::Failed { .. }))
            .map(|(name, _)| name)
    }

    /// Writes to a sibling `.tmp` file and renames it over `path`, so readers
    /// never see a partial report.
    pub fn write_json<P: AsRef<Path>>(&self, path: P) -> Result<(), StageError> {
        let path = path.as_ref();
        let staging = path.with_extension("tmp");
        let written = File::create(&staging)
            .map_err(StageError::from)
            .and_then(|file| {
                let mut writer = BufWriter::new(file);
                serde_json::to_writer_pretty(&mut writer, self)?;
                writer.flush()?;
                Ok(())
            })
            .and_then(|()| fs::rename(&staging, path).map_err(StageError::from));
        if let Err(err) = written {
            let _ = fs::remove_file(&staging);
            return Err(err);
        }
        info!("wrote pipeline report to {:?}", path);
        Ok(())
    }
}

impl fmt::Display for PipelineReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "dataset: {} labeled rows from {:?} source, classes {:?}, {} unlabeled",
            self.dataset.rows, self.dataset.origin, self.dataset.class_counts, self.dataset.unlabeled_rows
        )?;
        writeln!(
            f,
            "split: {} train / {} test (seed {})",
            self.split.train_rows, self.split.test_rows, self.split.seed
        )?;
        for (name, outcome) in &self.candidates {
            match outcome {
                CandidateOutcome::Evaluated(report) => write!(f, "{}:\n{}", name, report)?,
                CandidateOutcome::Failed { stage, cause } => {
                    writeln!(f, "{}: FAILED at {}: {}", name, stage, cause)?
                }
            }
        }
        if let Some(audit) = &self.scorer_audit {
            let [[tn, fp], [fn_, tp]] = audit.confusion_matrix.as_rows();
            writeln!(
                f,
                "rule scorer ({:?}) on {} held-out rows: accuracy {:.4}, [[TN: {tn}, FP: {fp}], [FN: {fn_}, TP: {tp}]]",
                audit.policy, audit.rows, audit.accuracy
            )?;
        }
        Ok(())
    }
}

fn labels_at(labels: &[i32], indices: &[usize]) -> Vec<i32> {
    indices.iter().map(|&i| labels[i]).collect()
}

/// Train and test rows of the processed matrix.
struct SplitData {
    x_train: FeatureMatrix,
    y_train: Vec<i32>,
    x_test: FeatureMatrix,
    y_test: Vec<i32>,
}

impl SplitData {
    fn new(matrix: &FeatureMatrix, labels: &[i32], partition: &Partition) -> Self {
        SplitData {
            x_train: matrix.select(&partition.train),
            y_train: labels_at(labels, &partition.train),
            x_test: matrix.select(&partition.test),
            y_test: labels_at(labels, &partition.test),
        }
    }
}

fn evaluate_candidates(
    ctx: &RunContext<'_>,
    candidates: &[Box<dyn CandidateModel>],
    training: TrainingOutcome,
    split: &SplitData,
) -> BTreeMap<String, CandidateOutcome> {
    let mut outcomes = BTreeMap::new();
    for failure in training.failures {
        outcomes.insert(
            failure.name,
            CandidateOutcome::Failed {
                stage: Stage::Train,
                cause: failure.cause.to_string(),
            },
        );
    }

    let evaluator = ctx.config.evaluator();
    let data = EvaluationData {
        x_train: &split.x_train,
        y_train: &split.y_train,
        x_test: &split.x_test,
        y_test: &split.y_test,
    };
    for trained in training.trained {
        let Some(candidate) = candidates.iter().find(|c| c.name() == trained.name) else {
            continue;
        };
        let outcome = match evaluator.evaluate(candidate.as_ref(), trained.model.as_ref(), &data) {
            Ok(report) => {
                info!(
                    "{}: accuracy {:.4}, f1 {:.4}, cv {:.4} (+/- {:.4})",
                    trained.name,
                    report.accuracy,
                    report.f1,
                    report.cross_validation.mean,
                    report.cross_validation.std
                );
                CandidateOutcome::Evaluated(report)
            }
            Err(cause) => {
                warn!("candidate {} failed evaluation: {}", trained.name, cause);
                CandidateOutcome::Failed {
                    stage: Stage::Evaluate,
                    cause: cause.to_string(),
                }
            }
        };
        outcomes.insert(trained.name, outcome);
    }
    outcomes
}

/// Runs every stage against `candidates`. Candidate names must be unique.
pub async fn run_pipeline<P, F>(
    config: &PipelineConfig,
    primary: &P,
    fallback: &F,
    candidates: &[Box<dyn CandidateModel>],
) -> Result<PipelineReport, PipelineError>
where
    P: RecordSource,
    F: RecordSource,
{
    let mut ctx = RunContext::new(config);

    ctx.enter(Stage::Build);
    let dataset: Dataset = config
        .dataset_builder()
        .build(primary, fallback)
        .await
        .map_err(|e| ctx.fail(e))?;
    ctx.leave();

    // Fit and transform run over the whole dataset ahead of the split.
    ctx.enter(Stage::Preprocess);
    let state = Preprocessor::fit(&dataset).map_err(|e| ctx.fail(e))?;
    let features: Vec<&PatientFeatureSet> = dataset.records().iter().map(|r| &r.features).collect();
    let matrix = Preprocessor::transform(&features, &state);
    let labels = dataset.outcomes();
    ctx.leave();

    ctx.enter(Stage::Split);
    let partition = config
        .splitter()
        .split(&labels, config.random_seed)
        .map_err(|e| ctx.fail(e))?;
    ctx.leave();

    ctx.enter(Stage::Train);
    let split = SplitData::new(&matrix, &labels, &partition);
    info!("training {} candidates on {} rows", candidates.len(), split.x_train.n_rows());
    let training = config.trainer().train(candidates, &split.x_train, &split.y_train);
    ctx.leave();

    ctx.enter(Stage::Evaluate);
    let outcomes = evaluate_candidates(&ctx, candidates, training, &split);
    let scorer_audit = config.labeling_policy.map(|policy| {
        let held_out: Vec<&PatientFeatureSet> = partition.test.iter().map(|&i| features[i]).collect();
        audit_scorer(policy, &held_out, &split.y_test)
    });
    ctx.leave();

    ctx.enter(Stage::Report);
    let report = PipelineReport {
        dataset: dataset.summary(),
        split: SplitSummary {
            train_rows: partition.train.len(),
            test_rows: partition.test.len(),
            seed: partition.seed,
        },
        preprocessing: state,
        candidates: outcomes,
        scorer_audit,
    };
    // The report is written last so it only exists for runs whose outputs all landed.
    if let Some(path) = &config.snapshot_path {
        write_snapshot(path, &matrix, &labels).map_err(|e| ctx.fail(e))?;
    }
    if let Some(path) = &config.report_path {
        report.write_json(path).map_err(|e| ctx.fail(e))?;
    }
    ctx.leave();

    info!(
        "pipeline finished in {:.2?}: {} evaluated, {} failed",
        ctx.started.elapsed(),
        report.evaluated().count(),
        report.failed().count()
    );
    Ok(report)
}

/// Builds the candidate list from `config` and runs the pipeline.
pub async fn run_configured<P, F>(
    config: &PipelineConfig,
    primary: &P,
    fallback: &F,
) -> Result<PipelineReport, PipelineError>
where
    P: RecordSource,
    F: RecordSource,
{
    config
        .validate()
        .map_err(|e| PipelineError::new(Stage::Build, e))?;
    let candidates: Vec<Box<dyn CandidateModel>> = config.candidates.iter().map(|c| c.build()).collect();
    run_pipeline(config, primary, fallback, &candidates).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patient(age: f64, hypertension: u8, glucose: f64, smoking: &str) -> PatientFeatureSet {
        PatientFeatureSet {
            age,
            gender: "Male".into(),
            hypertension,
            heart_disease: 0,
            ever_married: "Yes".into(),
            work_type: "Private".into(),
            residence_type: "Urban".into(),
            avg_glucose_level: glucose,
            bmi: Some(27.0),
            smoking_status: smoking.into(),
        }
    }

    #[test]
    fn test_scorer_audit_counts_high_risk_as_positive() {
        let risky = patient(70.0, 1, 210.0, "smokes");
        let calm = patient(25.0, 0, 85.0, "never smoked");
        let middling = patient(50.0, 0, 110.0, "formerly smoked");
        let records = vec![&risky, &calm, &middling];
        let audit = audit_scorer(TierPolicy::ThreeTier, &records, &[1, 0, 1]);

        assert_eq!(audit.rows, 3);
        assert_eq!(audit.label_counts.get("High Risk"), Some(&1));
        assert_eq!(audit.label_counts.get("Medium Risk"), Some(&1));
        assert_eq!(audit.confusion_matrix.as_rows(), [[1, 0], [1, 1]]);
        assert!((audit.accuracy - 2.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_context_tags_failures_with_current_stage() {
        let config = PipelineConfig::default();
        let mut ctx = RunContext::new(&config);
        ctx.enter(Stage::Split);
        let err = ctx.fail(crate::error::SplitError::InvalidFraction(2.0));
        assert_eq!(err.stage, Stage::Split);
        assert!(err.to_string().starts_with("pipeline failed at stage split"));
    }
}
