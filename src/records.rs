//! Patient feature schema and the typed records that flow through scoring and training.

use std::collections::HashMap;

use lazy_static::lazy_static;
use polars::prelude::{DataType, Field, Schema};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

pub const OUTCOME_COLUMN: &str = "stroke";

/// Markers the source files use for an absent numeric value.
const MISSING_MARKERS: [&str; 5] = ["", "n/a", "na", "nan", "null"];

lazy_static! {
    /// Header spellings seen in exported files, keyed by their lowercased form.
    static ref HEADER_ALIASES: HashMap<&'static str, &'static str> = {
        let mut m = HashMap::new();
        m.insert("residence", "residence_type");
        m.insert("glucose", "avg_glucose_level");
        m.insert("avg_glucose", "avg_glucose_level");
        m.insert("smoking", "smoking_status");
        m.insert("married", "ever_married");
        m.insert("stroke_prediction", OUTCOME_COLUMN);
        m.insert("outcome", OUTCOME_COLUMN);
        m
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    Age,
    Gender,
    Hypertension,
    HeartDisease,
    EverMarried,
    WorkType,
    ResidenceType,
    AvgGlucoseLevel,
    Bmi,
    SmokingStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureKind {
    Numeric,
    Categorical,
}

impl Feature {
    /// Canonical column order of the feature matrix.
    pub const ALL: [Feature; 10] = [
        Feature::Age,
        Feature::Gender,
        Feature::Hypertension,
        Feature::HeartDisease,
        Feature::EverMarried,
        Feature::WorkType,
        Feature::ResidenceType,
        Feature::AvgGlucoseLevel,
        Feature::Bmi,
        Feature::SmokingStatus,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Feature::Age => "age",
            Feature::Gender => "gender",
            Feature::Hypertension => "hypertension",
            Feature::HeartDisease => "heart_disease",
            Feature::EverMarried => "ever_married",
            Feature::WorkType => "work_type",
            Feature::ResidenceType => "residence_type",
            Feature::AvgGlucoseLevel => "avg_glucose_level",
            Feature::Bmi => "bmi",
            Feature::SmokingStatus => "smoking_status",
        }
    }

    pub fn kind(self) -> FeatureKind {
        match self {
            Feature::Age
            | Feature::Hypertension
            | Feature::HeartDisease
            | Feature::AvgGlucoseLevel
            | Feature::Bmi => FeatureKind::Numeric,
            _ => FeatureKind::Categorical,
        }
    }

    pub fn is_numeric(self) -> bool {
        self.kind() == FeatureKind::Numeric
    }

    /// Only bmi may be absent on a valid record.
    pub fn is_required(self) -> bool {
        self != Feature::Bmi
    }

    pub fn from_column(column: &str) -> Option<Feature> {
        let column = normalize_header(column);
        Feature::ALL.into_iter().find(|f| f.name() == column)
    }
}

pub struct FeatureSchema {}

impl FeatureSchema {
    pub fn feature_names() -> Vec<&'static str> {
        Feature::ALL.iter().map(|f| f.name()).collect()
    }

    /// Schema of the processed frame: every feature encoded as f64, outcome as i32.
    pub fn processed_schema() -> Schema {
        let mut fields: Vec<Field> = Feature::ALL
            .iter()
            .map(|f| Field::new(f.name(), DataType::Float64))
            .collect();
        fields.push(Field::new(OUTCOME_COLUMN, DataType::Int32));
        Schema::from_iter(fields)
    }
}

/// Lowercase, trim, and resolve known aliases so `Residence_type` and
/// `residence_type` land on the same column.
pub fn normalize_header(raw: &str) -> String {
    let lowered = raw.trim().to_lowercase().replace([' ', '-'], "_");
    match HEADER_ALIASES.get(lowered.as_str()) {
        Some(canonical) => canonical.to_string(),
        None => lowered,
    }
}

/// Normalizes boolean-like cells ("0"/"1", "yes"/"no", "true"/"false", "y"/"n") to 0/1.
pub fn parse_flag(raw: &str) -> Option<u8> {
    let value = raw.trim().to_lowercase();
    match value.as_str() {
        "1" | "yes" | "y" | "true" => Some(1),
        "0" | "no" | "n" | "false" => Some(0),
        other => match other.parse::<f64>() {
            Ok(v) if v == 1.0 => Some(1),
            Ok(v) if v == 0.0 => Some(0),
            _ => None,
        },
    }
}

fn parse_number(field: &'static str, raw: &str) -> Result<Option<f64>, ValidationError> {
    let trimmed = raw.trim();
    if MISSING_MARKERS.contains(&trimmed.to_lowercase().as_str()) {
        return Ok(None);
    }
    trimmed
        .parse::<f64>()
        .map(Some)
        .map_err(|_| ValidationError::InvalidValue {
            field,
            value: raw.to_string(),
        })
}

fn parse_flag_field(field: &'static str, raw: &str) -> Result<Option<u8>, ValidationError> {
    if raw.trim().is_empty() {
        return Ok(None);
    }
    parse_flag(raw).map(Some).ok_or(ValidationError::InvalidValue {
        field,
        value: raw.to_string(),
    })
}

fn non_empty(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// One person's clinical/demographic snapshot with every required field present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatientFeatureSet {
    pub age: f64,
    pub gender: String,
    pub hypertension: u8,
    pub heart_disease: u8,
    pub ever_married: String,
    pub work_type: String,
    pub residence_type: String,
    pub avg_glucose_level: f64,
    pub bmi: Option<f64>,
    pub smoking_status: String,
}

pub enum FeatureValue<'a> {
    Numeric(Option<f64>),
    Categorical(&'a str),
}

impl PatientFeatureSet {
    pub fn value(&self, feature: Feature) -> FeatureValue<'_> {
        match feature {
            Feature::Age => FeatureValue::Numeric(Some(self.age)),
            Feature::Gender => FeatureValue::Categorical(&self.gender),
            Feature::Hypertension => FeatureValue::Numeric(Some(f64::from(self.hypertension))),
            Feature::HeartDisease => FeatureValue::Numeric(Some(f64::from(self.heart_disease))),
            Feature::EverMarried => FeatureValue::Categorical(&self.ever_married),
            Feature::WorkType => FeatureValue::Categorical(&self.work_type),
            Feature::ResidenceType => FeatureValue::Categorical(&self.residence_type),
            Feature::AvgGlucoseLevel => FeatureValue::Numeric(Some(self.avg_glucose_level)),
            Feature::Bmi => FeatureValue::Numeric(self.bmi),
            Feature::SmokingStatus => FeatureValue::Categorical(&self.smoking_status),
        }
    }
}

/// Loosely-populated patient value as it arrives at a boundary (request body,
/// file row, store row). `validate` turns it into a [`PatientFeatureSet`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PatientInput {
    pub age: Option<f64>,
    pub gender: Option<String>,
    pub hypertension: Option<u8>,
    pub heart_disease: Option<u8>,
    pub ever_married: Option<String>,
    pub work_type: Option<String>,
    pub residence_type: Option<String>,
    pub avg_glucose_level: Option<f64>,
    pub bmi: Option<f64>,
    pub smoking_status: Option<String>,
}

impl PatientInput {
    /// Builds an input from named text cells; `cell` is looked up by canonical
    /// feature name. Absent cells stay `None`, malformed ones are rejected.
    pub fn from_cells<'a, F>(cell: F) -> Result<PatientInput, ValidationError>
    where
        F: Fn(&str) -> Option<&'a str>,
    {
        let text = |f: Feature| cell(f.name()).and_then(non_empty);
        let number = |f: Feature| match cell(f.name()) {
            Some(raw) => parse_number(f.name(), raw),
            None => Ok(None),
        };
        let flag = |f: Feature| match cell(f.name()) {
            Some(raw) => parse_flag_field(f.name(), raw),
            None => Ok(None),
        };

        Ok(PatientInput {
            age: number(Feature::Age)?,
            gender: text(Feature::Gender),
            hypertension: flag(Feature::Hypertension)?,
            heart_disease: flag(Feature::HeartDisease)?,
            ever_married: text(Feature::EverMarried),
            work_type: text(Feature::WorkType),
            residence_type: text(Feature::ResidenceType),
            avg_glucose_level: number(Feature::AvgGlucoseLevel)?,
            bmi: number(Feature::Bmi)?,
            smoking_status: text(Feature::SmokingStatus),
        })
    }

    /// Fails on the first missing required field, in schema order. No defaults
    /// are substituted; bmi alone may stay absent.
    pub fn validate(&self) -> Result<PatientFeatureSet, ValidationError> {
        fn required<T: Clone>(value: &Option<T>, feature: Feature) -> Result<T, ValidationError> {
            value
                .clone()
                .ok_or(ValidationError::MissingField(feature.name()))
        }
        fn required_text(value: &Option<String>, feature: Feature) -> Result<String, ValidationError> {
            match value.as_deref().map(str::trim) {
                Some(v) if !v.is_empty() => Ok(v.to_string()),
                _ => Err(ValidationError::MissingField(feature.name())),
            }
        }

        Ok(PatientFeatureSet {
            age: required(&self.age, Feature::Age)?,
            gender: required_text(&self.gender, Feature::Gender)?,
            hypertension: required(&self.hypertension, Feature::Hypertension)?,
            heart_disease: required(&self.heart_disease, Feature::HeartDisease)?,
            ever_married: required_text(&self.ever_married, Feature::EverMarried)?,
            work_type: required_text(&self.work_type, Feature::WorkType)?,
            residence_type: required_text(&self.residence_type, Feature::ResidenceType)?,
            avg_glucose_level: required(&self.avg_glucose_level, Feature::AvgGlucoseLevel)?,
            bmi: self.bmi,
            smoking_status: required_text(&self.smoking_status, Feature::SmokingStatus)?,
        })
    }
}

impl From<&PatientFeatureSet> for PatientInput {
    fn from(p: &PatientFeatureSet) -> Self {
        PatientInput {
            age: Some(p.age),
            gender: Some(p.gender.clone()),
            hypertension: Some(p.hypertension),
            heart_disease: Some(p.heart_disease),
            ever_married: Some(p.ever_married.clone()),
            work_type: Some(p.work_type.clone()),
            residence_type: Some(p.residence_type.clone()),
            avg_glucose_level: Some(p.avg_glucose_level),
            bmi: p.bmi,
            smoking_status: Some(p.smoking_status.clone()),
        }
    }
}

/// A feature set paired with its ground-truth stroke outcome (0/1).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabeledRecord {
    pub features: PatientFeatureSet,
    pub outcome: u8,
}
