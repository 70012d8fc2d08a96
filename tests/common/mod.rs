#![allow(dead_code)]

use std::path::PathBuf;

use stroke_triage::error::TrainError;
use stroke_triage::models::{CandidateConfig, CandidateModel, CandidateSpec, FittedModel};
use stroke_triage::preprocess::FeatureMatrix;

pub const HEADER: &str = "id,gender,age,hypertension,heart_disease,ever_married,work_type,Residence_type,avg_glucose_level,bmi,smoking_status,stroke";

const SMOKING: [&str; 4] = ["never smoked", "smokes", "formerly smoked", "Unknown"];
const WORK: [&str; 3] = ["Private", "Self-employed", "Govt_job"];

/// Every `positive_every`-th row has a stroke; positives skew older with higher glucose.
pub fn synthetic_rows(n: usize, positive_every: usize) -> Vec<String> {
    (0..n)
        .map(|i| {
            let positive = i % positive_every == 0;
            let (age, glucose) = if positive {
                (55 + i % 30, 150.0 + (i % 60) as f64)
            } else {
                (20 + (i * 7) % 45, 70.0 + (i % 40) as f64)
            };
            let bmi = if i % 9 == 4 {
                "N/A".to_string()
            } else {
                format!("{:.1}", 21.0 + (i % 15) as f64)
            };
            let outcome = match (positive, i % 2 == 0) {
                (true, true) => "1",
                (true, false) => "yes",
                (false, true) => "0",
                (false, false) => "no",
            };
            format!(
                "{},{},{},{},{},{},{},{},{:.2},{},{},{}",
                1000 + i,
                if i % 2 == 0 { "Male" } else { "Female" },
                age,
                u8::from(positive && i % 3 == 0),
                u8::from(i % 11 == 0),
                if age > 30 { "Yes" } else { "No" },
                WORK[i % WORK.len()],
                if i % 3 == 0 { "Rural" } else { "Urban" },
                glucose,
                bmi,
                SMOKING[i % SMOKING.len()],
                outcome
            )
        })
        .collect()
}

pub fn csv_text(rows: &[String]) -> String {
    let mut text = String::from(HEADER);
    for row in rows {
        text.push('\n');
        text.push_str(row);
    }
    text.push('\n');
    text
}

pub fn write_csv(dir: &tempfile::TempDir, name: &str, rows: &[String]) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, csv_text(rows)).unwrap();
    path
}

pub fn quick_candidates() -> Vec<CandidateConfig> {
    vec![
        CandidateConfig::new(CandidateSpec::RandomForest {
            n_trees: 10,
            max_depth: Some(5),
            min_samples_leaf: 1,
            balanced: true,
        }),
        CandidateConfig::new(CandidateSpec::LogisticRegression { alpha: 1.0 }),
        CandidateConfig::new(CandidateSpec::Knn { k: 5 }),
    ]
}

/// A candidate whose optimiser never converges.
pub struct Diverging;

impl CandidateModel for Diverging {
    fn name(&self) -> &str {
        "diverging"
    }

    fn fit(&self, _x: &FeatureMatrix, _y: &[i32], _seed: u64) -> Result<Box<dyn FittedModel>, TrainError> {
        Err(TrainError::NonConvergence("objective is NaN after 1 iteration".into()))
    }
}
