//! Median imputation, categorical encoding and standard scaling with a fitted,
//! reusable state so training and inference encode rows identically.

use std::collections::{BTreeMap, BTreeSet};

use log::debug;
use polars::prelude::{ChunkAgg, ChunkFillNullValue, ChunkQuantile, ChunkVar, NamedFrom, Series};
use serde::{Deserialize, Serialize};
use smartcore::linalg::basic::matrix::DenseMatrix;

use crate::dataset::Dataset;
use crate::error::PreprocessError;
use crate::records::{Feature, FeatureValue, PatientFeatureSet};

/// Dense row-major feature rows in [`Feature::ALL`] column order.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureMatrix {
    feature_names: Vec<String>,
    rows: Vec<Vec<f64>>,
}

impl FeatureMatrix {
    pub fn new(feature_names: Vec<String>, rows: Vec<Vec<f64>>) -> Self {
        FeatureMatrix {
            feature_names,
            rows,
        }
    }

    pub fn feature_names(&self) -> &[String] {
        &self.feature_names
    }

    pub fn rows(&self) -> &[Vec<f64>] {
        &self.rows
    }

    pub fn n_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn n_features(&self) -> usize {
        self.feature_names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column(&self, idx: usize) -> Vec<f64> {
        self.rows.iter().map(|r| r[idx]).collect()
    }

    /// Rows at `indices`, in that order.
    pub fn select(&self, indices: &[usize]) -> FeatureMatrix {
        FeatureMatrix {
            feature_names: self.feature_names.clone(),
            rows: indices.iter().map(|&i| self.rows[i].clone()).collect(),
        }
    }

    pub fn to_dense(&self) -> DenseMatrix<f64> {
        let values: Vec<f64> = self.rows.iter().flatten().copied().collect();
        DenseMatrix::new(self.n_rows(), self.n_features(), values, false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NumericStats {
    pub median: f64,
    pub mean: f64,
    pub std: f64,
}

/// Sorted category universe; codes follow lexical order, `unknown` is one past the last.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryCodes {
    pub codes: BTreeMap<String, u32>,
    pub unknown: u32,
}

impl CategoryCodes {
    fn fit<'a, I: Iterator<Item = &'a str>>(values: I) -> Self {
        let universe: BTreeSet<&str> = values.collect();
        let codes: BTreeMap<String, u32> = universe
            .into_iter()
            .zip(0u32..)
            .map(|(v, code)| (v.to_string(), code))
            .collect();
        let unknown = codes.len() as u32;
        CategoryCodes { codes, unknown }
    }

    pub fn encode(&self, value: &str) -> u32 {
        self.codes.get(value).copied().unwrap_or(self.unknown)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FittedPreprocessingState {
    pub numeric: BTreeMap<Feature, NumericStats>,
    pub categorical: BTreeMap<Feature, CategoryCodes>,
}

fn numeric(record: &PatientFeatureSet, feature: Feature) -> Option<f64> {
    match record.value(feature) {
        FeatureValue::Numeric(v) => v.filter(|x| x.is_finite()),
        FeatureValue::Categorical(_) => None,
    }
}

fn categorical(record: &PatientFeatureSet, feature: Feature) -> &str {
    match record.value(feature) {
        FeatureValue::Categorical(v) => v,
        FeatureValue::Numeric(_) => "",
    }
}

/// Median of the observed values, then mean and population std of the
/// median-filled column.
fn numeric_stats_of(feature: Feature, column: &Series) -> Result<NumericStats, PreprocessError> {
    let observed = column.f64()?;
    let median = observed.median().ok_or(PreprocessError::Imputation {
        column: feature.name(),
    })?;

    // Scaling statistics are taken after imputation.
    let filled = observed.fill_null_with_values(median)?;
    let mean = filled.mean().unwrap_or(median);
    let std = match filled.std(0) {
        Some(std) if std > 0.0 && std.is_finite() => std,
        _ => 1.0,
    };

    debug!(
        "{}: median={:.4} mean={:.4} std={:.4} nulls={}",
        feature.name(),
        median,
        mean,
        std,
        column.null_count()
    );
    Ok(NumericStats { median, mean, std })
}

pub struct Preprocessor;

impl Preprocessor {
    pub fn fit(dataset: &Dataset) -> Result<FittedPreprocessingState, PreprocessError> {
        let features: Vec<&PatientFeatureSet> = dataset.records().iter().map(|r| &r.features).collect();
        Self::fit_records(&features)
    }

    pub fn fit_records(
        records: &[&PatientFeatureSet],
    ) -> Result<FittedPreprocessingState, PreprocessError> {
        if records.is_empty() {
            return Err(PreprocessError::EmptyInput);
        }

        let mut numeric_stats = BTreeMap::new();
        let mut categorical_codes = BTreeMap::new();
        for feature in Feature::ALL {
            if feature.is_numeric() {
                let column = Series::new(
                    feature.name(),
                    records.iter().map(|r| numeric(r, feature)).collect::<Vec<_>>(),
                );
                numeric_stats.insert(feature, numeric_stats_of(feature, &column)?);
            } else {
                let codes = CategoryCodes::fit(records.iter().map(|r| categorical(r, feature)));
                debug!("{}: {} categories", feature.name(), codes.codes.len());
                categorical_codes.insert(feature, codes);
            }
        }

        Ok(FittedPreprocessingState {
            numeric: numeric_stats,
            categorical: categorical_codes,
        })
    }

    pub fn transform(records: &[&PatientFeatureSet], state: &FittedPreprocessingState) -> FeatureMatrix {
        state.transform(records)
    }
}

impl FittedPreprocessingState {
    pub fn feature_names(&self) -> Vec<String> {
        Feature::ALL.iter().map(|f| f.name().to_string()).collect()
    }

    /// Encodes one record with the fitted statistics; unseen categories map to
    /// the reserved unknown code.
    pub fn transform_one(&self, record: &PatientFeatureSet) -> Vec<f64> {
        Feature::ALL
            .iter()
            .map(|&feature| {
                if let Some(stats) = self.numeric.get(&feature) {
                    let value = numeric(record, feature).unwrap_or(stats.median);
                    (value - stats.mean) / stats.std
                } else if let Some(codes) = self.categorical.get(&feature) {
                    f64::from(codes.encode(categorical(record, feature)))
                } else {
                    0.0
                }
            })
            .collect()
    }

    pub fn transform(&self, records: &[&PatientFeatureSet]) -> FeatureMatrix {
        FeatureMatrix::new(
            self.feature_names(),
            records.iter().map(|r| self.transform_one(r)).collect(),
        )
    }
}
